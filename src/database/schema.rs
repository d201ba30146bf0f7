// Database schema migrations
// The audit_log table is append-only: triggers abort any UPDATE or DELETE.

use sqlx::migrate::Migrator;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");
