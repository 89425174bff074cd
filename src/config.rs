//! Process configuration, read from the environment (after `.env` is loaded).

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::services::jwks::SigningKeyCacheConfig;
use crate::services::quote_cache::QuoteCacheConfig;

pub const DEFAULT_COINGECKO_BASE_URL: &str = "https://api.coingecko.com/api/v3";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub clerk_issuer: String,
    pub jwks_url: String,
    pub jwks_refresh: Duration,
    pub jwks_min_refresh: Duration,
    pub coingecko_base_url: String,
    pub coingecko_api_key: Option<String>,
    pub quote_ttl: Duration,
    pub quote_wait_timeout: Duration,
    pub quote_max_staleness: Option<Duration>,
    pub http_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let clerk_issuer = get("CLERK_ISSUER")
            .ok_or(ConfigError::Missing("CLERK_ISSUER"))?
            .trim_end_matches('/')
            .to_string();
        let jwks_url = get("CLERK_JWKS_URL")
            .unwrap_or_else(|| format!("{}/.well-known/jwks.json", clerk_issuer));

        let cors_origins = get("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        let quote_ttl = secs(parse(&get, "QUOTE_CACHE_TTL_SECS", 60)?);
        if quote_ttl.is_zero() {
            return Err(invalid(&get, "QUOTE_CACHE_TTL_SECS"));
        }
        let quote_wait_timeout = secs(parse(&get, "QUOTE_WAIT_TIMEOUT_SECS", 10)?);
        if quote_wait_timeout.is_zero() {
            return Err(invalid(&get, "QUOTE_WAIT_TIMEOUT_SECS"));
        }
        let jwks_refresh = secs(parse(&get, "JWKS_REFRESH_SECS", 3600)?);
        if jwks_refresh.is_zero() {
            return Err(invalid(&get, "JWKS_REFRESH_SECS"));
        }

        let quote_max_staleness = match get("QUOTE_MAX_STALENESS_SECS") {
            Some(raw) => Some(secs(parse_value("QUOTE_MAX_STALENESS_SECS", &raw)?)),
            None => None,
        };

        Ok(Self {
            database_url,
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse(&get, "PORT", 8000)?,
            cors_origins,
            clerk_issuer,
            jwks_url,
            jwks_refresh,
            jwks_min_refresh: secs(parse(&get, "JWKS_MIN_REFRESH_SECS", 0)?),
            coingecko_base_url: get("COINGECKO_BASE_URL")
                .unwrap_or_else(|| DEFAULT_COINGECKO_BASE_URL.to_string()),
            coingecko_api_key: get("COINGECKO_API_KEY"),
            quote_ttl,
            quote_wait_timeout,
            quote_max_staleness,
            http_timeout: secs(parse(&get, "HTTP_TIMEOUT_SECS", 10)?),
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::Invalid {
                name: "HOST",
                value: self.host.clone(),
            })
    }

    pub fn quote_cache_config(&self) -> QuoteCacheConfig {
        QuoteCacheConfig {
            ttl: self.quote_ttl,
            wait_timeout: self.quote_wait_timeout,
            max_staleness: self.quote_max_staleness,
        }
    }

    pub fn signing_key_config(&self) -> SigningKeyCacheConfig {
        SigningKeyCacheConfig {
            refresh_interval: self.jwks_refresh,
            min_refresh_interval: self.jwks_min_refresh,
        }
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn parse<G, T>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        name,
        value: raw.to_string(),
    })
}

fn invalid<G>(get: &G, name: &'static str) -> ConfigError
where
    G: Fn(&str) -> Option<String>,
{
    ConfigError::Invalid {
        name,
        value: get(name).unwrap_or_default(),
    }
}
