//! CLI flags and file/env configuration, loaded with `figment` the way the
//! pack's `Lay3rLabs-WAVS` loads its node config: a TOML file as the base
//! layer, environment variables as overrides, CLI flags as the final word.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Parser)]
#[command(name = "tproxy", about = "Telemetry ingestion proxy")]
pub struct Args {
    /// Path to the proxy's TOML configuration file.
    #[arg(long, default_value = "tproxy.toml")]
    pub config: PathBuf,

    /// Overrides `backend.url` from the config file.
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Overrides `backend.token` from the config file.
    #[arg(long)]
    pub token: Option<String>,

    /// Overrides `proxy.id` from the config file.
    #[arg(long)]
    pub proxy_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyIdentityConfig {
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleConfig {
    /// Port/handle string this listener binds, e.g. "2878" for the default
    /// Wavefront line-protocol port.
    pub handle: String,
    #[serde(default = "default_sender_count")]
    pub sender_count: usize,
}

fn default_sender_count() -> usize {
    2
}

/// A [`tproxy_core::PointRule`] in a form that can come out of a TOML file.
/// `ExtractTag`/`ReplaceRegex` hold a compiled `Regex`, which isn't
/// (de)serializable, so the config layer carries the pattern as a plain
/// string and compiles it once while building the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rule")]
pub enum RuleConfig {
    AddTag { key: String, value_template: String },
    AddTagIfNotExists { key: String, value_template: String },
    DropTag {
        key_pattern: String,
        #[serde(default)]
        value_pattern: Option<String>,
    },
    RenameTag {
        from: String,
        to: String,
        #[serde(default)]
        value_pattern: Option<String>,
    },
    ExtractTag { key: String, source: String, pattern: String },
    LimitLength {
        key: String,
        max_len: usize,
        #[serde(default)]
        action: tproxy_core::preprocessor::LimitLengthAction,
    },
    ForceLowercase {
        key: String,
        #[serde(default)]
        match_pattern: Option<String>,
    },
    ReplaceRegex { key: String, pattern: String, replacement: String },
}

impl RuleConfig {
    pub fn compile(self) -> Result<tproxy_core::PointRule, tproxy_core::PreprocessorError> {
        use tproxy_core::PointRule;
        Ok(match self {
            RuleConfig::AddTag { key, value_template } => PointRule::AddTag { key, value_template },
            RuleConfig::AddTagIfNotExists { key, value_template } => {
                PointRule::AddTagIfNotExists { key, value_template }
            }
            RuleConfig::DropTag { key_pattern, value_pattern } => {
                PointRule::drop_tag(&key_pattern, value_pattern.as_deref())?
            }
            RuleConfig::RenameTag { from, to, value_pattern } => {
                PointRule::rename_tag(from, to, value_pattern.as_deref())?
            }
            RuleConfig::ExtractTag { key, source, pattern } => PointRule::extract_tag(key, source, &pattern)?,
            RuleConfig::LimitLength { key, max_len, action } => PointRule::LimitLength { key, max_len, action },
            RuleConfig::ForceLowercase { key, match_pattern } => {
                PointRule::force_lowercase(key, match_pattern.as_deref())?
            }
            RuleConfig::ReplaceRegex { key, pattern, replacement } => {
                PointRule::replace_regex(key, &pattern, replacement)?
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub proxy: ProxyIdentityConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub points: Vec<HandleConfig>,
    #[serde(default)]
    pub histograms: Vec<HandleConfig>,
    #[serde(default)]
    pub spans: Vec<HandleConfig>,
    #[serde(default)]
    pub source_tags: Vec<HandleConfig>,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    #[serde(default)]
    pub preprocessor_rules: BTreeMap<String, Vec<RuleConfig>>,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/tproxy")
}

/// Tuning for the decorator stack wrapped around the backend client: retry,
/// circuit breaker, and a token-bucket rate limiter the check-in loop can
/// retune live via [`tproxy_core::RateLimiterHandle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub retry: tproxy_core::RetryConfig,
    #[serde(default)]
    pub circuit_breaker: tproxy_core::CircuitBreakerConfig,
    /// Requests/sec the rate limiter starts at; a check-in `rateLimit` later
    /// retunes this. Non-positive means unlimited.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: tproxy_core::RetryConfig::default(),
            circuit_breaker: tproxy_core::CircuitBreakerConfig::default(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

fn default_rate_limit_per_sec() -> f64 {
    0.0
}

fn default_rate_limit_burst() -> f64 {
    100.0
}

impl ProxyConfig {
    pub fn checkin_interval(&self) -> Duration {
        tproxy_core::CHECKIN_INTERVAL
    }

    pub fn metrics_snapshot_interval(&self) -> Duration {
        tproxy_core::METRICS_SNAPSHOT_INTERVAL
    }
}

pub fn load(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config: ProxyConfig = Figment::new()
        .merge(Toml::file(&args.config))
        .merge(Env::prefixed("TPROXY_").split("__"))
        .extract()?;

    if let Some(url) = &args.backend_url {
        config.backend.url = url.clone();
    }
    if let Some(token) = &args.token {
        config.backend.token = token.clone();
    }
    if let Some(proxy_id) = &args.proxy_id {
        config.proxy.id = proxy_id.clone();
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(dir: &std::path::Path, contents: &str) -> PathBuf {
        let path = dir.join("tproxy.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            dir.path(),
            r#"
            [proxy]
            id = "proxy-1"
            hostname = "host-a"

            [backend]
            url = "https://example.invalid"
            token = "tok"
            "#,
        );

        let config = load(&Args {
            config: path,
            backend_url: None,
            token: None,
            proxy_id: None,
        })
        .unwrap();

        assert_eq!(config.proxy.id, "proxy-1");
        assert!(!config.proxy.ephemeral);
        assert_eq!(config.spool_dir, default_spool_dir());
        assert!(config.points.is_empty());
    }

    #[test]
    fn cli_flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            dir.path(),
            r#"
            [proxy]
            id = "proxy-1"
            hostname = "host-a"

            [backend]
            url = "https://example.invalid"
            token = "tok"
            "#,
        );

        let config = load(&Args {
            config: path,
            backend_url: Some("https://override.invalid".into()),
            token: Some("override-tok".into()),
            proxy_id: Some("proxy-2".into()),
        })
        .unwrap();

        assert_eq!(config.proxy.id, "proxy-2");
        assert_eq!(config.backend.url, "https://override.invalid");
        assert_eq!(config.backend.token, "override-tok");
    }

    #[test]
    fn extract_tag_rule_compiles_its_pattern() {
        let rule = RuleConfig::ExtractTag {
            key: "region".into(),
            source: "source".into(),
            pattern: r"^(\w+)-\d+$".into(),
        };
        let compiled = rule.compile().unwrap();
        assert!(matches!(compiled, tproxy_core::PointRule::ExtractTag { .. }));
    }

    #[test]
    fn invalid_regex_pattern_fails_to_compile() {
        let rule = RuleConfig::ReplaceRegex {
            key: "host".into(),
            pattern: "(".into(),
            replacement: "x".into(),
        };
        assert!(rule.compile().is_err());
    }

    #[test]
    fn source_tags_and_resilience_default_when_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            dir.path(),
            r#"
            [proxy]
            id = "proxy-1"
            hostname = "host-a"

            [backend]
            url = "https://example.invalid"
            token = "tok"
            "#,
        );

        let config = load(&Args {
            config: path,
            backend_url: None,
            token: None,
            proxy_id: None,
        })
        .unwrap();

        assert!(config.source_tags.is_empty());
        assert_eq!(config.resilience.rate_limit_per_sec, 0.0);
        assert_eq!(config.resilience.rate_limit_burst, 100.0);
    }

    #[test]
    fn source_tags_handle_and_resilience_overrides_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            dir.path(),
            r#"
            [proxy]
            id = "proxy-1"
            hostname = "host-a"

            [backend]
            url = "https://example.invalid"
            token = "tok"

            [[source_tags]]
            handle = "source-tags"

            [resilience]
            rate_limit_per_sec = 50.0
            rate_limit_burst = 20.0
            "#,
        );

        let config = load(&Args {
            config: path,
            backend_url: None,
            token: None,
            proxy_id: None,
        })
        .unwrap();

        assert_eq!(config.source_tags.len(), 1);
        assert_eq!(config.source_tags[0].handle, "source-tags");
        assert_eq!(config.resilience.rate_limit_per_sec, 50.0);
        assert_eq!(config.resilience.rate_limit_burst, 20.0);
    }
}
