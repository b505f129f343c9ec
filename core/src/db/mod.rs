use anyhow::{anyhow, bail, Context, Result};
use log::Level;
use r2d2::Pool;
use r2d2_sqlite::rusqlite::{Connection, OpenFlags};
use r2d2_sqlite::SqliteConnectionManager;
use serde_json::json;
use tokio::task::spawn_blocking;

use crate::logging::log_event;
use crate::provision::Provisioner;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Provision the bundled dictionary and open it read-only.
///
/// A file that passes the cheap integrity checks but holds no tables is
/// treated as a bad copy: the version marker is dropped so the next call
/// copies it again, and this call fails.
pub async fn open_dictionary(provisioner: &Provisioner) -> Result<DbPool> {
    provisioner
        .ensure_ready()
        .await
        .context("failed to provision the dictionary")?;

    let path = provisioner.destination_path().to_path_buf();
    let (pool, tables) = spawn_blocking(move || -> Result<(DbPool, Vec<String>)> {
        let mgr = SqliteConnectionManager::file(&path).with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY);
        let pool = Pool::builder().max_size(4).build(mgr)?;
        let tables = {
            let conn = pool.get()?;
            list_tables(&conn)?
        };
        Ok((pool, tables))
    })
    .await
    .map_err(|err| anyhow!(err.to_string()))??;

    if tables.is_empty() {
        log_event(
            Level::Error,
            "DB-1002",
            "db",
            "dictionary has no tables, scheduling re-copy",
            Some(json!({ "path": provisioner.destination_path().display().to_string() })),
        );
        provisioner.invalidate().await?;
        bail!("dictionary at {} is empty", provisioner.destination_path().display());
    }

    log_event(Level::Info, "DB-0100", "db", "dictionary opened", Some(json!({ "tables": tables })));
    Ok(pool)
}

pub fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}
