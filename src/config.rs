use anyhow::Result;

/// Default TCP listen port for terminal connections.
const DEFAULT_PORT: u16 = 5555;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// TCP port terminals connect to (env: LISTEN_PORT)
    pub listen_port: u16,

    /// SQLite database URL (env: DATABASE_URL)
    pub database_url: String,

    /// Database password, applied to the pool before the startup test
    /// connection (env: DB_PASSWORD). Optional for unprotected stores.
    pub db_password: Option<String>,

    /// Maximum pooled database handles (env: DB_POOL_CAPACITY)
    pub pool_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            listen_port: std::env::var("LISTEN_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://bistro.db".into()),
            db_password: std::env::var("DB_PASSWORD").ok().filter(|s| !s.is_empty()),
            pool_capacity: std::env::var("DB_POOL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        })
    }

    /// Bind address derived from the configured port.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }
}
