use std::path::Path;
use std::str::FromStr;

use crate::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS canonical_screens (
        id TEXT PRIMARY KEY,
        label TEXT NOT NULL,
        description TEXT NOT NULL,
        url_patterns TEXT NOT NULL,
        example_screenshot_path TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS captured_events (
        session_id TEXT NOT NULL,
        event_index INTEGER NOT NULL,
        screen_id TEXT REFERENCES canonical_screens(id),
        payload TEXT NOT NULL,
        PRIMARY KEY (session_id, event_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_templates (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL,
        inputs TEXT NOT NULL,
        outputs TEXT NOT NULL,
        steps TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_instances (
        id TEXT PRIMARY KEY,
        template_id TEXT NOT NULL REFERENCES workflow_templates(id),
        session_id TEXT NOT NULL,
        goal TEXT NOT NULL,
        succeeded INTEGER NOT NULL,
        parameter_values TEXT NOT NULL,
        extracted_values TEXT NOT NULL,
        step_snapshots TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_instances_template ON workflow_instances(template_id)",
];

/// Open the configured database. `sqlite://~/x.db` has its `~` expanded and
/// the parent directory created; `sqlite::memory:` is passed through.
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool, sqlx::Error> {
    let options = match database_path(&config.url) {
        Some(path) => {
            if let Some(parent) = Path::new(&path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            SqliteConnectOptions::new().filename(path)
        }
        None => SqliteConnectOptions::from_str(&config.url)?,
    };

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options.create_if_missing(true).foreign_keys(true))
        .await
}

/// File path of a `sqlite:` URL, tilde-expanded. `None` for in-memory URLs.
fn database_path(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    if rest.starts_with(":memory:") || rest.contains("mode=memory") {
        return None;
    }
    let path = rest.split('?').next().unwrap_or(rest);
    Some(shellexpand::tilde(path).into_owned())
}

/// Create all tables if they do not exist yet. Safe to call on every start.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn health_check(pool: &SqlitePool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT sqlite_version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Single-connection in-memory pool with the schema applied.
///
/// The connection is never recycled, otherwise the database would vanish.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}
