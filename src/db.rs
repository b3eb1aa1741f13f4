//! SQLite pool setup and schema migrations.

use anyhow::Result;
use sqlx::SqlitePool;

/// Schema applied on start-up; every statement is idempotent.
const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Run the embedded migration statement by statement.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .map(strip_comments)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(&stmt).execute(db).await?;
    }

    Ok(())
}

/// Drop whole-line `--` comments so a comment-only fragment is skipped.
fn strip_comments(fragment: &str) -> String {
    fragment
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Fresh in-memory database with the schema applied.
#[cfg(test)]
pub async fn test_pool() -> std::sync::Arc<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory sqlite");
    run_migrations(&pool).await.expect("migrations failed");
    std::sync::Arc::new(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = test_pool().await;
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&*pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["chunked_uploads", "stored_uploads"]);
    }

    #[test]
    fn comments_are_stripped() {
        assert_eq!(strip_comments("-- only a comment"), "");
        assert_eq!(strip_comments("-- note\nSELECT 1"), "SELECT 1");
    }
}
