use billing_core::CoreError;
use std::net::SocketAddr;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_SESSION_TTL_SECONDS: u64 = 12 * 60 * 60;
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Runtime settings, read from the environment (and `.env` via dotenvy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// In-memory storage when unset.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub session_ttl_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = var("BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| CoreError::Configuration(format!("BIND_ADDR: {}", e)))?;

        let database_max_connections = match var("DATABASE_MAX_CONNECTIONS") {
            Some(v) => v.parse::<u32>().map_err(|e| {
                CoreError::Configuration(format!("DATABASE_MAX_CONNECTIONS: {}", e))
            })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let session_ttl_seconds = match var("SESSION_TTL_SECONDS") {
            Some(v) => v
                .parse::<u64>()
                .map_err(|e| CoreError::Configuration(format!("SESSION_TTL_SECONDS: {}", e)))?,
            None => DEFAULT_SESSION_TTL_SECONDS,
        };
        if session_ttl_seconds == 0 {
            return Err(CoreError::Configuration(
                "SESSION_TTL_SECONDS must be positive".into(),
            ));
        }

        Ok(Self {
            bind_addr,
            database_url: var("DATABASE_URL"),
            database_max_connections,
            session_ttl_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, CoreError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.session_ttl_seconds, 43_200);
        assert_eq!(cfg.database_max_connections, 5);
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("DATABASE_URL", "postgres://localhost/billing"),
            ("SESSION_TTL_SECONDS", "60"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
        ])
        .unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert_eq!(
            cfg.database_url.as_deref(),
            Some("postgres://localhost/billing")
        );
        assert_eq!(cfg.session_ttl_seconds, 60);
        assert_eq!(cfg.database_max_connections, 12);
    }

    #[test]
    fn test_blank_database_url_means_in_memory() {
        assert_eq!(config(&[("DATABASE_URL", "  ")]).unwrap().database_url, None);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config(&[("BIND_ADDR", "not-an-addr")]),
            Err(CoreError::Configuration(_))
        ));
        assert!(config(&[("SESSION_TTL_SECONDS", "0")]).is_err());
        assert!(config(&[("DATABASE_MAX_CONNECTIONS", "many")]).is_err());
    }
}
