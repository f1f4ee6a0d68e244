use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub tokenizer: TokenizerConfig,
    pub tokens: TokenDurationConfig,
    pub spicedb: SpiceDbConfig,
    pub callout: CalloutConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenizerConfig {
    pub algorithm: String,
    pub secret_key: String,
    pub private_key_path: Option<String>,
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenDurationConfig {
    pub access_minutes: i64,
    pub refresh_minutes: i64,
    pub invitation_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpiceDbConfig {
    pub endpoint: String,
    pub pre_shared_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalloutConfig {
    pub urls: Vec<String>,
    pub method: String,
    pub timeout_seconds: u64,
    pub operations: Vec<String>,
    /// When false, server certificates are not verified.
    pub tls_verification: bool,
    /// Extra root CA (PEM) trusted for callout endpoints.
    pub ca_cert: Option<String>,
    /// Client certificate and key (PEM) presented for mutual TLS.
    pub cert: Option<String>,
    pub key: Option<String>,
}

impl Default for CalloutConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            method: "POST".to_string(),
            timeout_seconds: 10,
            operations: Vec::new(),
            tls_verification: true,
            ca_cert: None,
            cert: None,
            key: None,
        }
    }
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = AuthConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("tenant-auth"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            tokenizer: TokenizerConfig {
                algorithm: get_env("AUTH_KEY_ALGORITHM", Some("HS256"), is_prod)?,
                secret_key: env::var("AUTH_SECRET_KEY").unwrap_or_default(),
                private_key_path: env::var("AUTH_PRIVATE_KEY_PATH")
                    .ok()
                    .filter(|v| !v.is_empty()),
                key_id: env::var("AUTH_KEY_ID").ok().filter(|v| !v.is_empty()),
            },
            tokens: TokenDurationConfig {
                access_minutes: parse_env("AUTH_ACCESS_TOKEN_DURATION_MINUTES", "60", is_prod)?,
                refresh_minutes: parse_env("AUTH_REFRESH_TOKEN_DURATION_MINUTES", "1440", is_prod)?,
                invitation_minutes: parse_env("AUTH_INVITATION_DURATION_MINUTES", "10080", is_prod)?,
            },
            spicedb: SpiceDbConfig {
                endpoint: get_env("SPICEDB_ENDPOINT", Some("http://localhost:8443"), is_prod)?,
                pre_shared_key: get_env("SPICEDB_PRE_SHARED_KEY", Some("12345678"), is_prod)?,
            },
            callout: CalloutConfig {
                urls: split_list(&env::var("AUTH_CALLOUT_URLS").unwrap_or_default()),
                method: env::var("AUTH_CALLOUT_METHOD").unwrap_or_else(|_| "POST".to_string()),
                timeout_seconds: env::var("AUTH_CALLOUT_TIMEOUT_SECONDS")
                    .ok()
                    .map(|v| v.parse())
                    .transpose()
                    .map_err(|e: std::num::ParseIntError| {
                        AppError::ConfigError(anyhow::anyhow!(
                            "AUTH_CALLOUT_TIMEOUT_SECONDS: {}",
                            e
                        ))
                    })?
                    .unwrap_or(10),
                operations: split_list(&env::var("AUTH_CALLOUT_OPERATIONS").unwrap_or_default()),
                tls_verification: parse_env("AUTH_CALLOUT_TLS_VERIFICATION", "true", is_prod)?,
                ca_cert: env::var("AUTH_CALLOUT_CA_CERT").ok().filter(|v| !v.is_empty()),
                cert: env::var("AUTH_CALLOUT_CERT").ok().filter(|v| !v.is_empty()),
                key: env::var("AUTH_CALLOUT_KEY").ok().filter(|v| !v.is_empty()),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        for (name, minutes) in [
            ("AUTH_ACCESS_TOKEN_DURATION_MINUTES", self.tokens.access_minutes),
            ("AUTH_REFRESH_TOKEN_DURATION_MINUTES", self.tokens.refresh_minutes),
            ("AUTH_INVITATION_DURATION_MINUTES", self.tokens.invitation_minutes),
        ] {
            if minutes <= 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} must be positive",
                    name
                )));
            }
        }

        match crate::services::tokenizer::is_symmetric(&self.tokenizer.algorithm) {
            Ok(true) if self.tokenizer.secret_key.is_empty() => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "AUTH_SECRET_KEY is required for {}",
                    self.tokenizer.algorithm
                )));
            }
            Ok(false) if self.tokenizer.private_key_path.is_none() => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "AUTH_PRIVATE_KEY_PATH is required for {}",
                    self.tokenizer.algorithm
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(AppError::ConfigError(anyhow::anyhow!(e))),
        }

        if !matches!(self.callout.method.as_str(), "GET" | "POST") {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUTH_CALLOUT_METHOD must be GET or POST, got {}",
                self.callout.method
            )));
        }

        if self.callout.timeout_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUTH_CALLOUT_TIMEOUT_SECONDS must be positive"
            )));
        }

        if self.callout.cert.is_some() != self.callout.key.is_some() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUTH_CALLOUT_CERT and AUTH_CALLOUT_KEY must be set together"
            )));
        }

        if self.environment == Environment::Prod && self.tokenizer.secret_key.len() < 32 {
            if let Ok(true) = crate::services::tokenizer::is_symmetric(&self.tokenizer.algorithm) {
                tracing::warn!("AUTH_SECRET_KEY is shorter than 32 bytes in production");
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod && default.is_none() {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
