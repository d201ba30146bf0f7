use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use fiscal_audit::audit::report::Reporter;
use fiscal_audit::audit::verify::{load_export, IntegrityVerifier};
use fiscal_audit::audit::{verify_entries, SequenceRange, VerificationReport};
use fiscal_audit::database::{SqliteAuditStore, MAX_PAGE_SIZE};

/// Verify fiscal audit trail integrity, either live or from an export.
#[derive(Debug, Parser)]
#[command(name = "verify-audit-log", version)]
struct Cli {
    /// Audit store URL, e.g. sqlite://fiscal-audit.db
    #[arg(short, long, value_name = "URL", conflicts_with = "file")]
    database: Option<String>,

    /// Exported chain (JSONL) to verify offline
    #[arg(short, long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// First sequence to verify (database only)
    #[arg(long, requires = "database")]
    from: Option<i64>,

    /// Last sequence to verify (database only)
    #[arg(long, requires = "database")]
    to: Option<i64>,

    /// Also write the verified range to this JSONL file (database only)
    #[arg(long, value_name = "PATH", requires = "database")]
    export: Option<PathBuf>,

    /// Store call timeout in milliseconds
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,

    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        tracing::Level::ERROR
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let report = match (&cli.database, &cli.file) {
        (Some(url), _) => verify_database(&cli, url).await?,
        (None, Some(path)) => {
            info!("Verifying exported chain: {}", path.display());
            let entries = load_export(path)?;
            verify_entries(&entries)
        }
        (None, None) => return Err(anyhow!("either --database or --file is required")),
    };

    print_report(&report, &cli);
    report.ensure_valid()?;
    Ok(())
}

async fn verify_database(cli: &Cli, url: &str) -> Result<VerificationReport> {
    info!("Verifying audit store: {}", url);
    let store = Arc::new(
        SqliteAuditStore::open_existing(url, 1)
            .await
            .with_context(|| format!("failed to open audit store {}", url))?,
    );
    let timeout = Duration::from_millis(cli.timeout_ms);

    let range = SequenceRange {
        from: cli.from,
        to: cli.to,
    };
    let range = (!range.is_unbounded()).then_some(range);
    let verifier = IntegrityVerifier::new(store.clone(), MAX_PAGE_SIZE, timeout);
    let report = verifier.verify(range).await?;

    if let Some(path) = &cli.export {
        let reporter = Reporter::new(store, timeout, u64::MAX);
        let mut writer = BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        );
        let written = reporter.export_chain(&mut writer, range).await?;
        info!("Exported {} entries to {}", written, path.display());
    }

    Ok(report)
}

fn print_report(report: &VerificationReport, cli: &Cli) {
    if cli.quiet {
        return;
    }

    if report.is_valid {
        println!("✓ {}", report.summary());
    } else {
        println!("✗ {}", report.summary());
        for link in &report.broken_links {
            println!(
                "  #{} {:?} break (entry {}): expected {} got {}",
                link.sequence, link.kind, link.entry_id, link.expected, link.actual
            );
        }
    }

    if cli.verbose {
        if let (Some(first), Some(last)) = (report.first_sequence, report.last_sequence) {
            println!("  Sequences: {}..={}", first, last);
        }
        println!("  Verified at: {}", report.verified_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_export_window_requires_database() {
        let cli = Cli::try_parse_from([
            "verify-audit-log",
            "--database",
            "sqlite://audit.db",
            "--from",
            "10",
            "--to",
            "20",
            "--export",
            "window.jsonl",
        ])
        .unwrap();
        assert_eq!(cli.from, Some(10));
        assert_eq!(cli.export, Some(PathBuf::from("window.jsonl")));

        let offline = ["verify-audit-log", "--file", "a.jsonl", "--export", "b.jsonl"];
        assert!(Cli::try_parse_from(offline).is_err());
    }
}
