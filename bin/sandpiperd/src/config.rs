//! Environment-driven configuration, read once at startup.
//!
//! `PRODUCTION` switches the default value set; every knob can be
//! overridden individually through its `SANDPIPER_*` variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use sandpiper_broker::BrokerConfig;
use sandpiper_proxy::ProxyConfig;

/// Startup misconfiguration; always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub production: bool,

    /// Agent endpoints as `host:port`, in placement tie-break order.
    pub agent_endpoints: Vec<String>,
    pub context_expiry: Duration,
    pub base_image: String,

    pub storage_account_name: String,
    pub storage_account_key: String,
    pub storage_container: String,

    /// Endpoint sandboxes call back into for log ingestion.
    pub internal_api_endpoint: String,
    /// Secret used to verify API tokens. Verification itself lives in the
    /// auth middleware, outside this service.
    pub auth_secret: String,

    pub log_dir: PathBuf,
    pub log_idle: Duration,

    pub autosave_interval_secs: u32,

    pub cdn_upload_url: String,
    pub cdn_download_url: String,

    /// Host label that marks app traffic (`<app>.<label>.<tld>`).
    pub app_domain_label: String,

    pub proxy_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub internal_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let production = !std::env::var("PRODUCTION").unwrap_or_default().is_empty();

        let agent_endpoints = match var("SANDPIPER_AGENTS") {
            Some(list) => parse_agent_list(&list),
            None if production => vec![
                "compute-prod-0:8080".to_string(),
                "compute-prod-1:8080".to_string(),
                "compute-prod-2:8080".to_string(),
            ],
            None => vec!["localhost:8080".to_string()],
        };

        Ok(Self {
            production,
            agent_endpoints,
            context_expiry: Duration::from_secs(parsed(
                "SANDPIPER_CONTEXT_EXPIRY_SECS",
                if production { 600 } else { 30 },
            )?),
            base_image: var("SANDPIPER_BASE_IMAGE").unwrap_or_else(|| {
                if production {
                    "sandpiper/base:latest".to_string()
                } else {
                    "sandpiper/base-dev:latest".to_string()
                }
            }),
            storage_account_name: var("SANDPIPER_STORAGE_ACCOUNT").unwrap_or_default(),
            storage_account_key: var("SANDPIPER_STORAGE_KEY").unwrap_or_default(),
            storage_container: var("SANDPIPER_STORAGE_CONTAINER")
                .unwrap_or_else(|| "worktree".to_string()),
            internal_api_endpoint: var("SANDPIPER_INTERNAL_API").unwrap_or_else(|| {
                if production {
                    "http://api:9091".to_string()
                } else {
                    "http://localhost:9091".to_string()
                }
            }),
            auth_secret: var("SANDPIPER_AUTH_SECRET").unwrap_or_default(),
            log_dir: PathBuf::from(var("SANDPIPER_LOG_DIR").unwrap_or_else(|| {
                if production {
                    "/mnt/log/prod".to_string()
                } else {
                    "/tmp/sandpiper/log".to_string()
                }
            })),
            log_idle: Duration::from_secs(parsed(
                "SANDPIPER_LOG_IDLE_SECS",
                if production { 60 } else { 10 },
            )?),
            autosave_interval_secs: parsed(
                "SANDPIPER_AUTOSAVE_SECS",
                if production { 30 } else { 5 },
            )?,
            cdn_upload_url: var("SANDPIPER_CDN_UPLOAD_URL")
                .unwrap_or_else(|| "https://cdn.sandpiper.dev/upload".to_string()),
            cdn_download_url: var("SANDPIPER_CDN_DOWNLOAD_URL")
                .unwrap_or_else(|| "https://cdn.sandpiper.dev/iconify".to_string()),
            app_domain_label: var("SANDPIPER_APP_DOMAIN")
                .unwrap_or_else(|| "sandpiper".to_string()),
            proxy_addr: parsed(
                "SANDPIPER_PROXY_ADDR",
                if production {
                    "0.0.0.0:80".parse().expect("static addr")
                } else {
                    "0.0.0.0:8000".parse().expect("static addr")
                },
            )?,
            api_addr: parsed(
                "SANDPIPER_API_ADDR",
                "0.0.0.0:9090".parse().expect("static addr"),
            )?,
            internal_addr: parsed(
                "SANDPIPER_INTERNAL_ADDR",
                "0.0.0.0:9091".parse().expect("static addr"),
            )?,
        })
    }

    /// Broker parameters derived from this configuration.
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            image: self.base_image.clone(),
            storage_account_name: self.storage_account_name.clone(),
            storage_account_key: self.storage_account_key.clone(),
            storage_container: self.storage_container.clone(),
            internal_api_endpoint: self.internal_api_endpoint.clone(),
            autosave_interval_secs: self.autosave_interval_secs,
            context_expiry: self.context_expiry,
            ..Default::default()
        }
    }

    /// Proxy parameters derived from this configuration.
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            app_domain_label: self.app_domain_label.clone(),
            ..Default::default()
        }
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn parsed<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(value) => value.parse().map_err(|err: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_agent_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|ep| !ep.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_list_parsing() {
        assert_eq!(
            parse_agent_list("a:8080, b:8080 ,,c:8080"),
            vec!["a:8080", "b:8080", "c:8080"]
        );
        assert!(parse_agent_list(" , ").is_empty());
    }

    #[test]
    fn dev_defaults_are_short_lived() {
        // Uses the process environment; assumes PRODUCTION is unset in CI.
        if std::env::var("PRODUCTION").is_ok() {
            return;
        }
        let config = Config::from_env().expect("config");
        assert!(!config.production);
        assert_eq!(config.context_expiry, Duration::from_secs(30));
        assert_eq!(config.agent_endpoints, vec!["localhost:8080".to_string()]);
        assert_eq!(config.app_domain_label, "sandpiper");
    }
}
