// Migration Runner

use sqlx::SqlitePool;
use tracing::info;

/// Run database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Running database migrations...");

    let current_version = current_version(pool).await?;
    info!("Current schema version: {}", current_version);

    if current_version < 1 {
        info!("Applying migration 001: Cards & import batches");
        apply_migration(
            pool,
            include_str!("../migrations/001_cards_and_import_batches.sql"),
        )
        .await?;
    }

    if current_version < 2 {
        info!("Applying migration 002: Background jobs");
        apply_migration(pool, include_str!("../migrations/002_background_jobs.sql")).await?;
    }

    if current_version < 3 {
        info!("Applying migration 003: Stations");
        apply_migration(pool, include_str!("../migrations/003_stations.sql")).await?;
    }

    info!("All migrations applied successfully");
    Ok(())
}

async fn current_version(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    let table_exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
    )
    .fetch_one(pool)
    .await?;

    if table_exists == 0 {
        return Ok(0);
    }

    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;
    Ok(version.unwrap_or(0))
}

/// Apply a single migration SQL file in one transaction
///
/// Statements are split on `;`, so migration files must not use it inside
/// literals or comments.
async fn apply_migration(pool: &SqlitePool, sql: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut tx = pool.begin().await?;

    for statement in sql.split(';') {
        let clean_statement: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        if !clean_statement.is_empty() {
            sqlx::query(&clean_statement).execute(&mut *tx).await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        assert_ok!(run_migrations(&pool).await);

        for table in [
            "cards",
            "import_batches",
            "background_jobs",
            "recurring_jobs",
            "transport_modes",
            "stations",
            "station_transport_modes",
        ] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(count, 0, "table {} should start empty", table);
        }
    }

    #[tokio::test]
    async fn test_migrations_are_applied_once() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_sha256_check_constraint() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO cards (id, user_id, alias, number, card_type, expiry_date, created_at)
             VALUES ('c1', 'u1', 'Work', '123', 0, '2030-01-01', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let insert = |sha: String| {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "INSERT INTO import_batches (id, card_id, blob_container, blob_name, sha256, status, uploaded_at)
                     VALUES (?, 'c1', 'transport-import', 'a.csv', ?, 0, 0)",
                )
                .bind(sha.clone())
                .bind(sha)
                .execute(&pool)
                .await
            }
        };

        assert_ok!(insert("AB".repeat(32)).await);
        assert_err!(insert("ZZ".repeat(32)).await);
        assert_err!(insert("AB".repeat(31)).await);
    }
}
