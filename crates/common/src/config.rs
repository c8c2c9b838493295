//! Application configuration.

use serde::Deserialize;
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Redis configuration.
    pub redis: RedisConfig,
    /// `WebAuthn` relying-party configuration.
    pub webauthn: WebAuthnConfig,
    /// Security key material and MFA settings.
    pub security: SecurityConfig,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// `WebAuthn` relying-party configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebAuthnConfig {
    /// The relying party ID (usually the domain name).
    pub rp_id: String,
    /// The relying party name (displayed to users).
    pub rp_name: String,
    /// The origin URL (e.g. `https://example.com`).
    pub origin: String,
}

/// Security key material and MFA settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Base64-encoded 32-byte key for encrypting TOTP secrets at rest.
    pub encryption_key: String,
    /// Base64-encoded key for backup-code digests.
    pub mac_key: String,
    /// Issuer shown in authenticator apps.
    #[serde(default = "default_issuer")]
    pub totp_issuer: String,
}

fn default_redis_prefix() -> String {
    "vigil".to_string()
}

fn default_issuer() -> String {
    "Vigil".to_string()
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `VIGIL_ENV`)
    /// 3. Environment variables with `VIGIL_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("VIGIL_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
