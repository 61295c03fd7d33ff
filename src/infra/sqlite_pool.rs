// Opens the SQLite pool shared by every store.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::path::Path;

/// Connect to `database_url`, creating the parent directory of a file
/// database first. Accepts "sqlite://path?opts" or a bare path.
pub async fn connect(database_url: &str) -> anyhow::Result<Pool<Sqlite>> {
    let conn_str = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite://{}?mode=rwc", database_url)
    };

    if !conn_str.contains(":memory:") {
        let path_str = conn_str
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .split('?')
            .next()
            .unwrap_or_default();
        if let Some(parent) = Path::new(path_str).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&conn_str)
        .await?;
    Ok(pool)
}
