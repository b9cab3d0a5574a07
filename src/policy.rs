//! Match Policy: the configured decision function that turns an observed
//! User-Agent string into a replace/keep decision, plus the UA Builder that
//! turns a "replace" decision into the actual replacement string.
//!
//! Priority order and reasons are grounded directly on the original tool's
//! `ModifyAndForward`: firewall-UA allowlist beats the UA allowlist, which
//! beats the configured mode (force/regex/keyword).

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Force,
    Regex,
    Keyword,
}

#[derive(Debug)]
pub struct MatchPolicy {
    pub replacement_ua: String,
    pub mode: MatchMode,
    pub regex: Option<Regex>,
    pub keywords: Vec<String>,
    pub whitelist: Vec<String>,
    pub fw_ua_whitelist: Vec<String>,
    pub partial_replace: bool,
    pub drop_on_fw_match: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    FirewallAllowlist,
    Allowlist,
    Force,
    RegexHit,
    RegexMiss,
    KeywordHit,
    KeywordMiss,
}

pub struct Decision {
    pub replace: bool,
    pub reason: MatchReason,
    pub firewall_hit: bool,
}

impl MatchPolicy {
    pub fn decide(&self, ua: &str) -> Decision {
        if !self.fw_ua_whitelist.is_empty() && self.fw_ua_whitelist.iter().any(|kw| ua.contains(kw.as_str())) {
            return Decision {
                replace: false,
                reason: MatchReason::FirewallAllowlist,
                firewall_hit: true,
            };
        }

        if self.whitelist.iter().any(|w| w == ua) {
            return Decision {
                replace: false,
                reason: MatchReason::Allowlist,
                firewall_hit: false,
            };
        }

        match self.mode {
            MatchMode::Force => Decision {
                replace: true,
                reason: MatchReason::Force,
                firewall_hit: false,
            },
            MatchMode::Regex => {
                let hit = self.regex.as_ref().is_some_and(|re| re.is_match(ua));
                Decision {
                    replace: hit,
                    reason: if hit { MatchReason::RegexHit } else { MatchReason::RegexMiss },
                    firewall_hit: false,
                }
            }
            MatchMode::Keyword => {
                let hit = self.keywords.iter().any(|kw| ua.contains(kw.as_str()));
                Decision {
                    replace: hit,
                    reason: if hit { MatchReason::KeywordHit } else { MatchReason::KeywordMiss },
                    firewall_hit: false,
                }
            }
        }
    }

    /// Builds the final User-Agent string for a "replace" decision.
    pub fn build_ua(&self, origin_ua: &str) -> String {
        if self.partial_replace {
            if let Some(re) = &self.regex {
                return re.replace_all(origin_ua, self.replacement_ua.as_str()).into_owned();
            }
        }
        self.replacement_ua.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mode: MatchMode) -> MatchPolicy {
        MatchPolicy {
            replacement_ua: "FFF".into(),
            mode,
            regex: Regex::new("(?i)(iphone|android)").ok(),
            keywords: vec!["iPhone".into(), "Android".into()],
            whitelist: vec!["trusted-agent".into()],
            fw_ua_whitelist: vec![],
            partial_replace: false,
            drop_on_fw_match: false,
        }
    }

    #[test]
    fn allowlist_beats_everything() {
        let p = policy(MatchMode::Force);
        let d = p.decide("trusted-agent");
        assert!(!d.replace);
        assert_eq!(d.reason, MatchReason::Allowlist);
    }

    #[test]
    fn firewall_allowlist_outranks_allowlist() {
        let mut p = policy(MatchMode::Force);
        p.fw_ua_whitelist = vec!["trusted".into()];
        let d = p.decide("trusted-agent");
        assert!(d.firewall_hit);
        assert_eq!(d.reason, MatchReason::FirewallAllowlist);
    }

    #[test]
    fn force_mode_always_replaces() {
        let p = policy(MatchMode::Force);
        let d = p.decide("curl/8.0");
        assert!(d.replace);
        assert_eq!(d.reason, MatchReason::Force);
    }

    #[test]
    fn regex_mode_hit_and_miss() {
        let p = policy(MatchMode::Regex);
        assert!(p.decide("Mozilla iPhone").replace);
        assert!(!p.decide("curl/8.0").replace);
    }

    #[test]
    fn keyword_mode_hit_and_miss() {
        let p = policy(MatchMode::Keyword);
        assert!(p.decide("Mozilla Android 13").replace);
        assert!(!p.decide("curl/8.0").replace);
    }

    #[test]
    fn ua_builder_full_replace_by_default() {
        let p = policy(MatchMode::Keyword);
        assert_eq!(p.build_ua("Mozilla iPhone"), "FFF");
    }

    #[test]
    fn ua_builder_partial_replace_substitutes_match_only() {
        let mut p = policy(MatchMode::Regex);
        p.partial_replace = true;
        assert_eq!(p.build_ua("Mozilla/5.0 (iPhone; CPU)"), "Mozilla/5.0 (FFF; CPU)");
    }

    #[test]
    fn ua_builder_partial_replace_no_match_returns_original() {
        let mut p = policy(MatchMode::Regex);
        p.partial_replace = true;
        assert_eq!(p.build_ua("curl/8.0"), "curl/8.0");
    }
}
