use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub mpesa: MpesaConfig,
    pub card: CardConfig,
    pub reconciliation: ReconciliationConfig,
    pub log_level: String,
    pub service_name: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn from_string(s: &str) -> Self {
        match s {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Postgres,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<Secret<String>>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Clone, Debug)]
pub struct MpesaConfig {
    pub base_url: String,
    pub short_code: String,
    pub passkey: Secret<String>,
    pub consumer_key: String,
    pub consumer_secret: Secret<String>,
    pub callback_url: String,
    pub callback_secret: Secret<String>,
}

#[derive(Clone, Debug)]
pub struct CardConfig {
    pub base_url: String,
    pub secret_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub currency: String,
}

#[derive(Clone, Debug)]
pub struct ReconciliationConfig {
    pub interval_secs: u64,
    pub stale_after_secs: i64,
    pub give_up_after_secs: i64,
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env_or("FEES_SERVICE_HOST", "0.0.0.0");
        let port = env_or("FEES_SERVICE_PORT", "3006").parse()?;

        let backend = StoreBackend::from_string(&env_or("FEES_STORE", "postgres"));
        let database_url = env::var("FEES_DATABASE_URL").ok().map(Secret::new);
        if backend == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("FEES_DATABASE_URL must be set when FEES_STORE=postgres");
        }

        Ok(Self {
            server: ServerConfig { host, port },
            store: StoreConfig {
                backend,
                database_url,
                max_connections: env_or("FEES_DB_MAX_CONNECTIONS", "10").parse()?,
                min_connections: env_or("FEES_DB_MIN_CONNECTIONS", "1").parse()?,
            },
            mpesa: MpesaConfig {
                base_url: env_or("MPESA_BASE_URL", "https://sandbox.safaricom.co.ke"),
                short_code: env_or("MPESA_SHORT_CODE", ""),
                passkey: Secret::new(env_or("MPESA_PASSKEY", "")),
                consumer_key: env_or("MPESA_CONSUMER_KEY", ""),
                consumer_secret: Secret::new(env_or("MPESA_CONSUMER_SECRET", "")),
                callback_url: env_or("MPESA_CALLBACK_URL", ""),
                callback_secret: Secret::new(env_or("MPESA_CALLBACK_SECRET", "dev-secret")),
            },
            card: CardConfig {
                base_url: env_or("CARD_BASE_URL", "https://api.processor.example"),
                secret_key: Secret::new(env_or("CARD_SECRET_KEY", "")),
                webhook_secret: Secret::new(env_or("CARD_WEBHOOK_SECRET", "dev-secret")),
                currency: env_or("CARD_CURRENCY", "KES"),
            },
            reconciliation: ReconciliationConfig {
                interval_secs: env_or("RECON_INTERVAL_SECS", "60").parse()?,
                stale_after_secs: env_or("RECON_STALE_AFTER_SECS", "120").parse()?,
                give_up_after_secs: env_or("RECON_GIVE_UP_AFTER_SECS", "86400").parse()?,
            },
            log_level: env_or("FEES_LOG_LEVEL", "info"),
            service_name: "fees-service".to_string(),
        })
    }
}
