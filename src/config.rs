//! Command-line configuration.
//!
//! Mirrors the flag table of the original tool one field at a time, parsed
//! with `clap` instead of hand-rolled flag registration. [`RawArgs`] is the
//! thing `clap` fills in; [`RuntimeConfig`] is the validated, immutable form
//! every other component is built from.

use std::sync::Arc;

use clap::Parser;
use regex::Regex;

use crate::error::ConfigError;
use crate::policy::MatchMode;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_UA_PATTERN: &str =
    r"(iPhone|iPad|Android|Macintosh|Windows|Linux|Apple|Mac OS X|Mobile)";
const DEFAULT_KEYWORDS: &str = "iPhone,iPad,Android,Macintosh,Windows";
const DEFAULT_FW_SET_NAME: &str = "UAmask_bypass_set";
const DEFAULT_STATS_PATH: &str = "/tmp/uamask.stats";

#[derive(Parser, Debug)]
#[command(name = "uamaskd", version = VERSION, about = "Transparent User-Agent rewriting proxy")]
pub struct RawArgs {
    /// Replacement User-Agent string.
    #[arg(short = 'u', long = "ua", default_value = "FFF")]
    pub user_agent: String,

    /// TPROXY/REDIRECT listen port.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Log level (off, error, warn, info, debug, trace).
    #[arg(long = "loglevel", default_value = "info")]
    pub log_level: String,

    /// Comma-separated User-Agent allowlist (exact match).
    #[arg(short = 'w', long = "whitelist", default_value = "")]
    pub whitelist: String,

    /// Force-replace every User-Agent regardless of content.
    #[arg(long = "force", default_value_t = false)]
    pub force: bool,

    /// Use regex matching mode instead of the default keyword mode.
    #[arg(long = "enable-regex", default_value_t = false)]
    pub enable_regex: bool,

    /// Regex pattern used in regex mode.
    #[arg(short = 'r', long = "ua-pattern", default_value = DEFAULT_UA_PATTERN)]
    pub ua_pattern: String,

    /// Comma-separated keyword list used in keyword mode.
    #[arg(long = "keywords", default_value = DEFAULT_KEYWORDS)]
    pub keywords: String,

    /// Substitute only the matched portion of the UA instead of replacing it wholesale.
    #[arg(short = 's', long = "partial-replace", default_value_t = false)]
    pub partial_replace: bool,

    /// Decision Cache capacity.
    #[arg(long = "cache-size", default_value_t = 1000)]
    pub cache_size: usize,

    /// I/O buffer size in bytes (1024-65536).
    #[arg(long = "buffer-size", default_value_t = 8192)]
    pub buffer_size: usize,

    /// Worker pool size; 0 disables pooling (one task per connection).
    #[arg(short = 'p', long = "pool-size", default_value_t = 0)]
    pub pool_size: usize,

    /// Firewall backend: "ipt" (ipset) or "nft".
    #[arg(long = "fw-type", default_value = "ipt")]
    pub fw_type: String,

    /// Target firewall set name.
    #[arg(long = "fw-set-name", default_value = DEFAULT_FW_SET_NAME)]
    pub fw_set_name: String,

    /// Enable the Endpoint Profile Engine / firewall bypass pipeline.
    #[arg(long = "fw-bypass", default_value_t = false)]
    pub fw_bypass: bool,

    /// Comma-separated substrings; a UA match here schedules a bypass entry.
    #[arg(long = "fw-ua-w", default_value = "")]
    pub fw_ua_whitelist: String,

    /// Drop the connection after a firewall-UA match instead of continuing to rewrite it.
    #[arg(long = "fw-drop", default_value_t = false)]
    pub fw_drop: bool,

    /// Non-HTTP events required before a bypass decision is armed.
    #[arg(long = "fw-nonhttp-threshold", default_value_t = 5)]
    pub fw_nonhttp_threshold: u32,

    /// Default firewall set-entry timeout, in seconds.
    #[arg(long = "fw-timeout", default_value_t = 28800)]
    pub fw_timeout: u64,

    /// Debounce delay before a bypass decision is finalized, in seconds.
    #[arg(long = "fw-decision-delay", default_value_t = 60)]
    pub fw_decision_delay: u64,

    /// How long an endpoint stays vetoed after an HTTP request is observed, in seconds.
    #[arg(long = "fw-http-cooldown", default_value_t = 3600)]
    pub fw_http_cooldown: u64,
}

/// Validated, process-lifetime configuration built from [`RawArgs`].
#[derive(Debug)]
pub struct RuntimeConfig {
    pub port: u16,
    pub buffer_size: usize,
    pub cache_size: usize,
    pub pool_size: usize,
    pub stats_path: String,

    pub fw_bypass: bool,
    pub fw_type: FirewallKind,
    pub fw_set_name: String,
    pub fw_nonhttp_threshold: u32,
    pub fw_timeout_secs: u64,
    pub fw_decision_delay_secs: u64,
    pub fw_http_cooldown_secs: u64,

    pub policy: Arc<crate::policy::MatchPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallKind {
    Ipset,
    Nft,
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

pub fn validate_set_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidSetName(name.to_owned()))
    }
}

impl RawArgs {
    pub fn into_runtime_config(self) -> Result<RuntimeConfig, ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if !(1024..=65536).contains(&self.buffer_size) {
            return Err(ConfigError::BufferSizeOutOfRange(self.buffer_size));
        }
        validate_set_name(&self.fw_set_name)?;

        let whitelist = split_csv(&self.whitelist);
        let keywords = split_csv(&self.keywords);
        let fw_ua_whitelist = split_csv(&self.fw_ua_whitelist);

        let mode = if self.force {
            MatchMode::Force
        } else if self.enable_regex {
            MatchMode::Regex
        } else {
            MatchMode::Keyword
        };

        let compiled_regex = if matches!(mode, MatchMode::Regex) || self.partial_replace {
            let pattern = format!("(?i){}", self.ua_pattern);
            Some(Regex::new(&pattern)?)
        } else {
            None
        };

        let policy = crate::policy::MatchPolicy {
            replacement_ua: self.user_agent,
            mode,
            regex: compiled_regex,
            keywords,
            whitelist,
            fw_ua_whitelist,
            partial_replace: self.partial_replace,
            drop_on_fw_match: self.fw_drop,
        };

        let fw_type = match self.fw_type.as_str() {
            "nft" => FirewallKind::Nft,
            _ => FirewallKind::Ipset,
        };

        Ok(RuntimeConfig {
            port: self.port,
            buffer_size: self.buffer_size,
            cache_size: self.cache_size,
            pool_size: self.pool_size,
            stats_path: DEFAULT_STATS_PATH.to_owned(),
            fw_bypass: self.fw_bypass,
            fw_type,
            fw_set_name: self.fw_set_name,
            fw_nonhttp_threshold: self.fw_nonhttp_threshold,
            fw_timeout_secs: self.fw_timeout,
            fw_decision_delay_secs: self.fw_decision_delay,
            fw_http_cooldown_secs: self.fw_http_cooldown,
            policy: Arc::new(policy),
        })
    }
}

impl RuntimeConfig {
    /// Mirrors the original tool's startup config dump, at info level.
    pub fn log_summary(&self) {
        log::info!("uamaskd v{}", VERSION);
        log::info!("port: {}", self.port);
        log::info!("buffer size: {}", self.buffer_size);
        log::info!("cache size: {}", self.cache_size);
        log::info!("worker pool size: {}", self.pool_size);
        match self.policy.mode {
            MatchMode::Force => log::info!("mode: force replace (all)"),
            MatchMode::Regex => log::info!(
                "mode: regex (partial replace: {})",
                self.policy.partial_replace
            ),
            MatchMode::Keyword => {
                log::info!("mode: keyword ({} keywords)", self.policy.keywords.len())
            }
        }
        if self.fw_bypass {
            log::info!(
                "firewall bypass enabled: {:?} set {} (threshold {}, delay {}s, cooldown {}s)",
                self.fw_type,
                self.fw_set_name,
                self.fw_nonhttp_threshold,
                self.fw_decision_delay_secs,
                self.fw_http_cooldown_secs
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RawArgs {
        RawArgs::parse_from(std::iter::once(&"uamaskd").chain(args.iter()))
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = parse(&[]).into_runtime_config().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.buffer_size, 8192);
        assert_eq!(cfg.cache_size, 1000);
        assert!(!cfg.fw_bypass);
    }

    #[test]
    fn zero_port_rejected() {
        let err = parse(&["--port", "0"]).into_runtime_config().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroPort));
    }

    #[test]
    fn buffer_size_out_of_range_rejected() {
        let err = parse(&["--buffer-size", "16"])
            .into_runtime_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::BufferSizeOutOfRange(16)));
    }

    #[test]
    fn invalid_set_name_rejected() {
        let err = parse(&["--fw-set-name", "not valid!"])
            .into_runtime_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetName(_)));
    }

    #[test]
    fn csv_whitelist_trims_and_drops_empties() {
        let cfg = parse(&["-w", " Foo , , Bar"]).into_runtime_config().unwrap();
        assert_eq!(cfg.policy.whitelist, vec!["Foo".to_string(), "Bar".to_string()]);
    }
}
