//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS` and are safe to re-run on every
//! server startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table and index definitions to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS container (
    container_id      TEXT PRIMARY KEY NOT NULL,
    image             TEXT NOT NULL,
    unit_id           TEXT,
    status            TEXT NOT NULL CHECK(status IN ('created','running','exited','removed')),
    exit_code         INTEGER,
    created_at        TEXT NOT NULL,
    last_activity_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_container_status ON container(status);
CREATE INDEX IF NOT EXISTS idx_container_unit ON container(unit_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
