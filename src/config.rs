//! Process-level configuration: database URL, bind address, log level.
//! Everything else (per-relay quota policy) comes from the `relays` table,
//! not the environment — see `src/relay.rs`.

/// Loaded once at startup from the process environment (optionally via a
/// `.env` file).
pub struct Config {
    pub database_url: String,
    pub bind_addr: std::net::SocketAddr,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

        let port = std::env::var("RELAY_PORT").unwrap_or_else(|_| "3001".to_string());
        let bind_addr = format!("0.0.0.0:{port}")
            .parse()
            .expect("RELAY_PORT must be a valid port number");

        Config {
            database_url,
            bind_addr,
        }
    }
}

/// Installs the `tracing` subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}
