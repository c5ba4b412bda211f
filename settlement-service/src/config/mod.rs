use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config as core_config;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub common: core_config::Config,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub redis: Option<RedisConfig>,
    pub links: LinkConfig,
    pub mpesa: MpesaConfig,
    pub paystack: PaystackConfig,
    pub resilience: ResilienceConfig,
    pub reconciliation: ReconciliationConfig,
    pub service_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Mongodb,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mongodb" | "mongo" => Ok(Self::Mongodb),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(anyhow!("unknown storage backend '{}'", other)),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database: Option<DatabaseConfig>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RedisConfig {
    pub url: Secret<String>,
}

/// Public URLs the service hands out to processors and payers.
#[derive(Deserialize, Clone, Debug)]
pub struct LinkConfig {
    /// Base URL processors call back on, e.g. `https://api.example.com`.
    pub callback_base_url: String,
    /// Base URL of the customer-facing app used in notification actions.
    pub app_base_url: String,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MpesaEnvironment {
    Sandbox,
    Production,
}

impl MpesaEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            MpesaEnvironment::Sandbox => "https://sandbox.safaricom.co.ke",
            MpesaEnvironment::Production => "https://api.safaricom.co.ke",
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct MpesaConfig {
    pub environment: MpesaEnvironment,
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: Secret<String>,
    pub shortcode: String,
    pub passkey: Secret<String>,
    /// Shared token appended to the callback URL and required on inbound callbacks.
    pub callback_token: Option<Secret<String>>,
}

impl MpesaConfig {
    pub fn is_configured(&self) -> bool {
        !self.consumer_key.is_empty()
            && !self.consumer_secret.expose_secret().is_empty()
            && !self.shortcode.is_empty()
            && !self.passkey.expose_secret().is_empty()
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct PaystackConfig {
    pub base_url: String,
    pub secret_key: Secret<String>,
    pub currency: String,
    pub verify_webhooks: bool,
}

impl PaystackConfig {
    pub fn is_configured(&self) -> bool {
        !self.secret_key.expose_secret().is_empty()
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ResilienceConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl ResilienceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ReconciliationConfig {
    /// Sweep interval; zero disables the background worker.
    pub interval_secs: u64,
    /// Age after which a pending payment is considered stale.
    pub pending_after_secs: u64,
}

impl ReconciliationConfig {
    pub fn enabled(&self) -> bool {
        self.interval_secs > 0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn pending_after(&self) -> Duration {
        Duration::from_secs(self.pending_after_secs)
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let common = core_config::Config::load()?;

        let host = var_or("SETTLEMENT_HOST", "0.0.0.0");
        let port = var_or("SETTLEMENT_PORT", "3003").parse()?;

        let backend: StorageBackend = var_or("SETTLEMENT_STORAGE", "mongodb").parse()?;
        let database = match env::var("SETTLEMENT_DATABASE_URL") {
            Ok(url) => Some(DatabaseConfig {
                url: Secret::new(url),
                db_name: var_or("SETTLEMENT_DATABASE_NAME", "settlement_db"),
            }),
            Err(_) if backend == StorageBackend::Mongodb => {
                return Err(anyhow!(
                    "SETTLEMENT_DATABASE_URL must be set when SETTLEMENT_STORAGE=mongodb"
                ));
            }
            Err(_) => None,
        };

        let redis = env::var("SETTLEMENT_REDIS_URL").ok().map(|url| RedisConfig {
            url: Secret::new(url),
        });

        let environment = match var_or("MPESA_ENVIRONMENT", "sandbox").as_str() {
            "production" | "live" => MpesaEnvironment::Production,
            _ => MpesaEnvironment::Sandbox,
        };

        let mpesa = MpesaConfig {
            environment,
            base_url: env::var("MPESA_BASE_URL")
                .unwrap_or_else(|_| environment.base_url().to_string()),
            consumer_key: var_or("MPESA_CONSUMER_KEY", ""),
            consumer_secret: Secret::new(var_or("MPESA_CONSUMER_SECRET", "")),
            shortcode: var_or("MPESA_SHORTCODE", ""),
            passkey: Secret::new(var_or("MPESA_PASSKEY", "")),
            callback_token: env::var("MPESA_CALLBACK_TOKEN")
                .ok()
                .filter(|s| !s.is_empty())
                .map(Secret::new),
        };

        let paystack = PaystackConfig {
            base_url: var_or("PAYSTACK_BASE_URL", "https://api.paystack.co"),
            secret_key: Secret::new(var_or("PAYSTACK_SECRET_KEY", "")),
            currency: var_or("PAYSTACK_CURRENCY", "KES"),
            verify_webhooks: parsed_or("PAYSTACK_VERIFY_WEBHOOKS", true),
        };

        Ok(Self {
            server: ServerConfig { host, port },
            storage: StorageConfig { backend, database },
            redis,
            links: LinkConfig {
                callback_base_url: var_or("PAYMENTS_CALLBACK_BASE_URL", "http://localhost:3003"),
                app_base_url: var_or("PAYMENTS_APP_BASE_URL", "http://localhost:3000"),
            },
            mpesa,
            paystack,
            resilience: ResilienceConfig {
                timeout_secs: parsed_or("PROCESSOR_TIMEOUT_SECS", 30),
                max_retries: parsed_or("PROCESSOR_MAX_RETRIES", 3),
                retry_base_ms: parsed_or("PROCESSOR_RETRY_BASE_MS", 1000),
            },
            reconciliation: ReconciliationConfig {
                interval_secs: parsed_or("RECONCILE_INTERVAL_SECS", 0),
                pending_after_secs: parsed_or("RECONCILE_PENDING_AFTER_SECS", 300),
            },
            service_name: var_or("SERVICE_NAME", "settlement-service"),
            common,
        })
    }
}
