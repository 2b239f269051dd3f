//! Runtime configuration.
//!
//! Plain structs with defaults. Loading them from disk is left to the embedding program;
//! `Deserialize` is derived so any serde format can fill them.

use serde::Deserialize;
use std::time::Duration;

/// Fixed protocol parameter for every attachToTangle call.
pub const MIN_WEIGHT_MAGNITUDE: u32 = 14;

/// One ledger node endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Node API URL (HTTP).
    pub url: String,
    /// Per-call timeout in seconds; must be positive.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            url: url.into(),
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Reconnection backoff for the push feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectionConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

/// Confirmation monitor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Poll interval while no push feed is connected.
    pub poll_interval_secs: u64,
    /// Poll interval while the push feed is connected (polling is then only a backstop).
    pub push_poll_interval_secs: u64,
    /// WebSocket URL of the push notification feed, if any.
    pub push_url: Option<String>,
    pub reconnection: ReconnectionConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            push_poll_interval_secs: 5 * 60,
            push_url: None,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self, push_connected: bool) -> Duration {
        if push_connected {
            Duration::from_secs(self.push_poll_interval_secs)
        } else {
            Duration::from_secs(self.poll_interval_secs)
        }
    }
}

/// Confirmation engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfirmerConfig {
    /// Tip selection depth.
    pub tip_depth: u32,
    /// Tag carried by promotion transactions (padded to 27 trytes).
    pub promote_tag: String,
    /// Address promotions are sent to (null/burn address by default).
    pub promote_address: String,
    /// Seed handed to the signing endpoint when preparing promotion transfers.
    pub promote_seed: String,
    /// Reattach even a promotable bundle after this many minutes.
    pub force_reattach_after_min: u64,
    pub promote_every_sec: u64,
    /// Chain promotions on the last promotion's tail instead of the bundle tail.
    pub promote_chain: bool,
    pub promote_tick_ms: u64,
    pub reattach_tick_ms: u64,
    pub promotability_check_sec: u64,
    /// Promotability checks slow to half rate once this many loops run process-wide.
    pub slow_down_threshold: usize,
    /// Sleep after a failed promote/reattach attempt.
    pub error_backoff_sec: u64,
    /// Longest an update send may wait on a stalled consumer before the event is dropped.
    pub update_send_timeout_sec: u64,
}

impl Default for ConfirmerConfig {
    fn default() -> Self {
        Self {
            tip_depth: 3,
            promote_tag: "PROMOTE".to_string(),
            promote_address: "9".repeat(81),
            promote_seed: "9".repeat(81),
            force_reattach_after_min: 15,
            promote_every_sec: 10,
            promote_chain: false,
            promote_tick_ms: 500,
            reattach_tick_ms: 100,
            promotability_check_sec: 10,
            slow_down_threshold: 50,
            error_backoff_sec: 5,
            update_send_timeout_sec: 60,
        }
    }
}

impl ConfirmerConfig {
    /// Reject configurations no task should be started with.
    pub fn validate(&self) -> Result<(), String> {
        if self.promote_every_sec == 0 {
            return Err("promote_every_sec must be positive".into());
        }
        if self.force_reattach_after_min == 0 {
            return Err("force_reattach_after_min must be positive".into());
        }
        if self.promote_tick_ms == 0 || self.reattach_tick_ms == 0 {
            return Err("loop ticks must be positive".into());
        }
        if self.promotability_check_sec == 0 {
            return Err("promotability_check_sec must be positive".into());
        }
        if self.update_send_timeout_sec == 0 {
            return Err("update_send_timeout_sec must be positive".into());
        }
        crate::trytes::validate(&self.promote_tag, None)
            .map_err(|e| format!("promote_tag: {e}"))?;
        if self.promote_tag.len() > crate::trytes::TAG_TRYTES {
            return Err("promote_tag longer than 27 trytes".into());
        }
        crate::trytes::Hash::new(self.promote_address.clone())
            .map_err(|e| format!("promote_address: {e}"))?;
        Ok(())
    }

    pub fn force_reattach_after(&self) -> Duration {
        Duration::from_secs(self.force_reattach_after_min * 60)
    }

    pub fn promote_every(&self) -> Duration {
        Duration::from_secs(self.promote_every_sec)
    }

    pub fn promote_tick(&self) -> Duration {
        Duration::from_millis(self.promote_tick_ms)
    }

    pub fn reattach_tick(&self) -> Duration {
        Duration::from_millis(self.reattach_tick_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_sec)
    }

    pub fn update_send_timeout(&self) -> Duration {
        Duration::from_secs(self.update_send_timeout_sec)
    }

    /// Promotability check interval: doubled once `running` loops reach the threshold.
    pub fn promotability_interval(&self, running: usize) -> Duration {
        let base = Duration::from_secs(self.promotability_check_sec);
        if running >= self.slow_down_threshold {
            base * 2
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnection_config_default() {
        let c = ReconnectionConfig::default();
        assert_eq!(c.initial_backoff_secs, 1);
        assert_eq!(c.max_backoff_secs, 60);
    }

    #[test]
    fn default_confirmer_config_is_valid() {
        assert!(ConfirmerConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_confirmer_config_is_rejected() {
        let c = ConfirmerConfig {
            promote_every_sec: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
        let c = ConfirmerConfig {
            promote_tag: "lowercase".into(),
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn promotability_interval_doubles_at_threshold() {
        let c = ConfirmerConfig {
            promotability_check_sec: 10,
            slow_down_threshold: 3,
            ..Default::default()
        };
        assert_eq!(c.promotability_interval(2), Duration::from_secs(10));
        assert_eq!(c.promotability_interval(3), Duration::from_secs(20));
        assert_eq!(c.promotability_interval(10), Duration::from_secs(20));
    }

    #[test]
    fn monitor_interval_lengthens_with_push() {
        let c = MonitorConfig::default();
        assert_eq!(c.poll_interval(false), Duration::from_secs(30));
        assert_eq!(c.poll_interval(true), Duration::from_secs(300));
    }

    #[test]
    fn endpoint_config_deserializes_with_default_timeout() {
        let c: EndpointConfig = serde_json::from_str(r#"{"url":"http://node:14265"}"#).unwrap();
        assert_eq!(c.timeout(), Duration::from_secs(10));
    }
}
