use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Schema scripts in order; entry `n` brings `user_version` from `n` to `n + 1`.
const MIGRATIONS: &[&str] = &[include_str!("schemas/schema_v1.sql")];

fn schema_version(conn: &Connection) -> Result<usize> {
    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version")?;
    usize::try_from(version).with_context(|| format!("negative user_version {version}"))
}

/// Applies every pending script in one transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;
    let latest = MIGRATIONS.len();
    if current > latest {
        bail!("store schema v{current} is newer than this build (v{latest})");
    }
    if current == latest {
        return Ok(());
    }

    let tx = conn.transaction().context("failed to begin schema migration")?;
    for (index, script) in MIGRATIONS.iter().enumerate().skip(current) {
        tx.execute_batch(script)
            .with_context(|| format!("schema migration to v{} failed", index + 1))?;
    }
    tx.pragma_update(None, "user_version", latest as i64)
        .context("failed to record schema version")?;
    tx.commit().context("failed to commit schema migration")
}
