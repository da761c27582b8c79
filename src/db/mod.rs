pub mod models;
pub mod pool;

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteConnectOptions;

use pool::ConnectionPool;

#[derive(Clone)]
pub struct Database {
    pub pool: ConnectionPool,
    /// Tests run against a named shared-cache in-memory database, which is
    /// destroyed when its last connection closes; this handle keeps it alive
    /// while pooled handles come and go.
    #[allow(dead_code)]
    anchor: Option<std::sync::Arc<tokio::sync::Mutex<sqlx::SqliteConnection>>>,
}

impl Database {
    pub async fn connect(
        database_url: &str,
        password: Option<&str>,
        pool_capacity: usize,
    ) -> Result<Self> {
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        if let Some(pw) = password {
            options = options.pragma("key", pw.to_string());
        }

        Ok(Self {
            pool: ConnectionPool::new(options, pool_capacity),
            anchor: None,
        })
    }

    pub async fn migrate(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::migrate!("./migrations")
            .run(&mut *conn)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Create an in-memory database for tests, with migrations applied.
    #[cfg(test)]
    pub async fn test_db() -> Self {
        use sqlx::ConnectOptions;
        use std::sync::atomic::{AtomicU64, Ordering};

        static NEXT_DB: AtomicU64 = AtomicU64::new(0);
        let id = NEXT_DB.fetch_add(1, Ordering::Relaxed);

        // A distinct name per test; cache=shared lets every pooled handle see
        // the same data, unlike plain :memory:.
        let url = format!("sqlite:file:bistro_test_{id}?mode=memory&cache=shared");
        let options = SqliteConnectOptions::from_str(&url)
            .expect("valid memory URL")
            .shared_cache(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let anchor = options.connect().await.expect("connect to in-memory SQLite");

        let db = Self {
            pool: ConnectionPool::new(options, 10),
            anchor: Some(std::sync::Arc::new(tokio::sync::Mutex::new(anchor))),
        };
        db.migrate().await.expect("run migrations");
        db
    }
}
