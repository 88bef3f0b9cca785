use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_RATE_LIMIT_CALLS: u32 = 50;
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 1_000;
const DEFAULT_MAX_CONCURRENCY: usize = 5;
const DEFAULT_CACHE_FILE: &str = "geocode-cache.db";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub rate_limit_calls: u32,
    pub rate_limit_window_ms: u64,
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub cache_file: PathBuf,
    pub geocode_endpoint: String,
    pub http_timeout_secs: u64,
    pub google_client_id: Option<String>,
    pub google_crypto_key: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub rate_limit_calls: u32,
    pub rate_limit_window_ms: u64,
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub cache_file: PathBuf,
    pub geocode_endpoint: String,
    pub has_client_id: bool,
    pub has_crypto_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            rate_limit_calls: parse_u32("GEOCODE_RATE_LIMIT_CALLS", DEFAULT_RATE_LIMIT_CALLS)
                .max(1),
            rate_limit_window_ms: parse_u64(
                "GEOCODE_RATE_LIMIT_WINDOW_MS",
                DEFAULT_RATE_LIMIT_WINDOW_MS,
            )
            .max(1),
            max_concurrency: parse_usize("GEOCODE_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY)
                .max(1),
            max_attempts: parse_u32("GEOCODE_MAX_ATTEMPTS", 3).max(1),
            base_backoff_ms: parse_u64("GEOCODE_BASE_BACKOFF_MS", 250),
            cache_file: env::var_os("GEOCODE_CACHE_FILE")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_FILE)),
            geocode_endpoint: env::var("GEOCODE_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODE_ENDPOINT.to_string()),
            http_timeout_secs: parse_u64("GEOCODE_HTTP_TIMEOUT_SECS", 10),
            google_client_id: env::var("GOOGLE_MAPS_CLIENT_ID")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            google_crypto_key: env::var("GOOGLE_MAPS_CRYPTO_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
        }
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            rate_limit_calls: self.rate_limit_calls,
            rate_limit_window_ms: self.rate_limit_window_ms,
            max_concurrency: self.max_concurrency,
            max_attempts: self.max_attempts,
            cache_file: self.cache_file.clone(),
            geocode_endpoint: self.geocode_endpoint.clone(),
            has_client_id: self.google_client_id.is_some(),
            has_crypto_key: self.google_crypto_key.is_some(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rate_limit_calls: DEFAULT_RATE_LIMIT_CALLS,
            rate_limit_window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_attempts: 3,
            base_backoff_ms: 250,
            cache_file: PathBuf::from(DEFAULT_CACHE_FILE),
            geocode_endpoint: DEFAULT_GEOCODE_ENDPOINT.to_string(),
            http_timeout_secs: 10,
            google_client_id: None,
            google_crypto_key: None,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
