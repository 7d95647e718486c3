use crate::error::{OrchestratorError, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    SqlitePool,
};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Initialize database connection pool
#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .journal_mode(SqliteJournalMode::Wal)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;

    Ok(pool)
}

/// Run database migrations
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Backups kept next to the database; older ones are pruned.
pub const BACKUPS_KEPT: usize = 5;

/// Backup database before migrations (returns backup path)
///
/// Uses `VACUUM INTO` on the live pool so pages still in the WAL are part
/// of the copy.
#[instrument(skip(pool), fields(db_path = %db_path.display()))]
pub async fn backup_database(pool: &SqlitePool, db_path: &Path) -> Result<PathBuf> {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let backup_path = db_path.with_extension(format!("db.backup.{}", timestamp));
    let target = backup_path.to_str().ok_or_else(|| {
        OrchestratorError::InvalidInput(format!(
            "backup path is not valid UTF-8: {}",
            backup_path.display()
        ))
    })?;

    sqlx::query("VACUUM INTO ?").bind(target).execute(pool).await?;

    let pruned = prune_backups(db_path, BACKUPS_KEPT)?;
    if !pruned.is_empty() {
        debug!(count = pruned.len(), "pruned old database backups");
    }
    Ok(backup_path)
}

/// Backups of `db_path`, oldest first.
pub fn list_backups(db_path: &Path) -> Result<Vec<PathBuf>> {
    let prefix = match db_path.with_extension("db.backup.").file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return Ok(Vec::new()),
    };
    let dir = match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut backups = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let stamp = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(prefix.as_str()))
            .and_then(|stamp| stamp.parse::<i64>().ok());
        if let Some(stamp) = stamp {
            backups.push((stamp, path));
        }
    }
    backups.sort();
    Ok(backups.into_iter().map(|(_, path)| path).collect())
}

fn prune_backups(db_path: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let backups = list_backups(db_path)?;
    let excess = backups.len().saturating_sub(keep);
    let stale: Vec<PathBuf> = backups.into_iter().take(excess).collect();
    for path in &stale {
        std::fs::remove_file(path)?;
    }
    Ok(stale)
}
