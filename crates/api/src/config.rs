//! Process configuration read from the environment.

use std::net::SocketAddr;

use anyhow::{Context, bail};

/// Settings for the API binary. The controller's fixed constants live in
/// `ControllerConfig`, not here.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    /// Where self-continuations are POSTed.
    pub self_url: String,
    pub pipeline_url: String,
    pub pipeline_token: Option<String>,
    /// Drain the queue with an in-process worker loop as well as the trigger.
    pub worker_mode: bool,
}

impl AppConfig {
    /// Load `.env` (if present), then read the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(e).context("failed to load .env");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = var("ENRICHQ_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("ENRICHQ_BIND_ADDR must be a socket address")?;

        let use_persistent_stores = flag(var("USE_PERSISTENT_STORES"));
        let database_url = var("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            bail!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");
        }

        let self_url = var("ENRICHQ_SELF_URL")
            .unwrap_or_else(|| format!("http://127.0.0.1:{}/process", bind_addr.port()));
        let Some(pipeline_url) = var("ENRICHQ_PIPELINE_URL") else {
            bail!("ENRICHQ_PIPELINE_URL must be set");
        };

        Ok(Self {
            bind_addr,
            use_persistent_stores,
            database_url,
            self_url,
            pipeline_url,
            pipeline_token: var("ENRICHQ_PIPELINE_TOKEN"),
            worker_mode: flag(var("ENRICHQ_WORKER_MODE")),
        })
    }
}

fn flag(value: Option<String>) -> bool {
    value.and_then(|v| v.parse::<bool>().ok()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let env: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_to_in_memory_and_local_continuation() {
        let config = load(&[("ENRICHQ_PIPELINE_URL", "http://enricher/run")]).unwrap();
        assert!(!config.use_persistent_stores);
        assert!(!config.worker_mode);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.self_url, "http://127.0.0.1:8080/process");
    }

    #[test]
    fn persistent_mode_requires_database_url() {
        let err = load(&[
            ("ENRICHQ_PIPELINE_URL", "http://enricher/run"),
            ("USE_PERSISTENT_STORES", "true"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn pipeline_url_is_required() {
        assert!(load(&[]).is_err());
    }

    #[test]
    fn unparseable_flags_are_off() {
        let config = load(&[
            ("ENRICHQ_PIPELINE_URL", "http://enricher/run"),
            ("ENRICHQ_WORKER_MODE", "yes"),
        ])
        .unwrap();
        assert!(!config.worker_mode);
    }
}
