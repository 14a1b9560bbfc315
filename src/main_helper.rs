use crate::constants::{DB_CLEANUP_RETENTION_DAYS, DEFAULT_EVENT_PREFIX, DEFAULT_HISTORY_PAGE_SIZE, DEFAULT_REALTIME_CAPACITY};
use crate::crypto::MessageCipher;
use crate::db::{DbPool, SqliteHistory};
use crate::decoder::DecoderConfig;
use crate::kernel::StoreHandle;
use crate::realtime::BroadcastRealtime;
use crate::streaming::StreamHandler;
use crate::types::*;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const ENV_API_TOKEN: &str = "PARLEY_API_TOKEN";
pub const ENV_REFRESH_TOKEN: &str = "PARLEY_REFRESH_TOKEN";
pub const ENV_ENCRYPTION_KEY: &str = "PARLEY_ENCRYPTION_KEY";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "parley.db")]
    pub database: String,
    /// Streaming completion endpoint
    #[arg(long, default_value = "http://127.0.0.1:9000/v1/stream")]
    pub upstream_url: String,
    /// Credential refresh endpoint
    #[arg(long, default_value = "http://127.0.0.1:9000/v1/auth/refresh")]
    pub refresh_url: String,
    #[arg(long, default_value = DEFAULT_EVENT_PREFIX)]
    pub event_prefix: String,
    #[arg(long, default_value_t = DEFAULT_HISTORY_PAGE_SIZE)]
    pub history_page_size: u32,
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = DEFAULT_REALTIME_CAPACITY)]
    pub realtime_capacity: usize,
    #[arg(long, default_value_t = DB_CLEANUP_RETENTION_DAYS)]
    pub retention_days: i64,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
}

impl Args {
    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig::default().with_prefix(self.event_prefix.clone())
    }
}

/// Secrets read from the environment at startup.
pub struct Secrets {
    pub api_token: String,
    pub refresh_token: String,
    pub cipher: MessageCipher,
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        let api_token = require_env(ENV_API_TOKEN)?;
        let refresh_token = require_env(ENV_REFRESH_TOKEN)?;
        let key = require_env(ENV_ENCRYPTION_KEY)?;
        let cipher = MessageCipher::from_base64_key(&key)?;
        Ok(Self {
            api_token,
            refresh_token,
            cipher,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ParleyError::InvalidRequest(format!(
            "{} environment variable is missing or empty",
            name
        ))
        .into()),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub args: Arc<Args>,
    pub db: DbPool,
    pub store: StoreHandle,
    pub realtime: BroadcastRealtime,
    pub history: Arc<SqliteHistory>,
    pub handler: Arc<StreamHandler>,
    /// Cancelled on shutdown; every running turn holds a child token.
    pub shutdown: CancellationToken,
}
