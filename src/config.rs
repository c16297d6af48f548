//! Configuration: a JSON config file mirroring the CLI options plus a
//! `pools` array for failover definitions. CLI values win over the file,
//! the file wins over built-in defaults.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    /// Hash algorithm name.
    pub algo: Option<String>,

    /// Primary pool URL (additional pools go in `pools`).
    pub url: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,

    /// Worker threads, one per GPU.
    pub threads: Option<usize>,

    pub retries: Option<i32>,
    pub retry_pause: Option<u64>,
    pub scantime: Option<u64>,
    pub timeout: Option<u64>,
    pub time_limit: Option<u64>,
    pub statsavg: Option<usize>,

    /// Difficulty divisor.
    pub diff: Option<f64>,
    /// Block reward vote for the vote-carrying family.
    pub vote: Option<u16>,
    #[serde(default)]
    pub trust_pool: bool,

    pub max_temp: Option<f64>,
    pub max_diff: Option<f64>,
    /// Accepts K/M/G suffixes, e.g. "250K" or "3.2M".
    pub max_rate: Option<String>,

    #[serde(default)]
    pub no_gbt: bool,
    #[serde(default)]
    pub no_longpoll: bool,
    #[serde(default)]
    pub no_extranonce: bool,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PoolConfig {
    pub url: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub name: Option<String>,
    pub scantime: Option<u64>,
    pub max_diff: Option<f64>,
    pub max_rate: Option<String>,
    pub time_limit: Option<u64>,
    /// Keep the entry but never rotate into it.
    #[serde(default, alias = "disabled")]
    pub removed: bool,
}

impl ConfigFile {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read config file {}", path.as_ref().display())
        })?;
        serde_json::from_str(&content).context("failed to parse config JSON")
    }
}

/// "250K" / "3.2M" / "1G" style rates, plain numbers pass through.
pub fn parse_rate(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, mult) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1e3),
        'm' | 'M' => (&s[..s.len() - 1], 1e6),
        'g' | 'G' => (&s[..s.len() - 1], 1e9),
        _ => (s, 1.0),
    };
    digits.trim().parse::<f64>().ok().map(|v| v * mult)
}

/// Default worker identity when no user is configured anywhere.
pub fn default_user() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "worker".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let json = r#"{
            "algo": "x11",
            "url": "stratum+tcp://pool.example.com:3333",
            "user": "wallet.rig",
            "pass": "x",
            "threads": 2,
            "retries": 3,
            "retry-pause": 5,
            "scantime": 15,
            "max-rate": "500K",
            "quiet": true,
            "pools": [
                { "url": "stratum+tcp://backup.example.com:3333", "user": "wallet.b", "time-limit": 3600 },
                { "url": "http://node.example.com:8332", "disabled": true }
            ]
        }"#;
        let cfg: ConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.algo.as_deref(), Some("x11"));
        assert_eq!(cfg.threads, Some(2));
        assert_eq!(cfg.retry_pause, Some(5));
        assert!(cfg.quiet);
        assert_eq!(cfg.pools.len(), 2);
        assert_eq!(cfg.pools[0].time_limit, Some(3600));
        assert!(cfg.pools[1].removed);
        assert_eq!(parse_rate(cfg.max_rate.as_deref().unwrap()).unwrap(), 5e5);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(serde_json::from_str::<ConfigFile>(r#"{"alg": "x11"}"#).is_err());
    }

    #[test]
    fn rate_suffixes() {
        assert_eq!(parse_rate("100"), Some(100.0));
        assert_eq!(parse_rate("2K"), Some(2000.0));
        assert_eq!(parse_rate("3.5M"), Some(3.5e6));
        assert_eq!(parse_rate("1g"), Some(1e9));
        assert_eq!(parse_rate("junk"), None);
        assert_eq!(parse_rate(""), None);
    }

    #[test]
    fn empty_config_is_valid() {
        let cfg: ConfigFile = serde_json::from_str("{}").unwrap();
        assert!(cfg.url.is_none());
        assert!(cfg.pools.is_empty());
        assert!(!cfg.trust_pool);
    }
}
