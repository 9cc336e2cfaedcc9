// Copyright 2026 Joyent, Inc.

//! Runtime configuration. Every field has a default so a partial JSON
//! document (or none at all) is enough to build a bus.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::constants::{
    JD_ANNOUNCE_INTERVAL, JD_DEVICE_DISCONNECTED_DELAY, JD_DEVICE_LOST_DELAY,
};
use crate::error::Error;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub device_lost_delay_ms: u64,
    pub device_disconnected_delay_ms: u64,
    pub announce_interval_ms: u64,
    pub event_resend_delays_ms: Vec<u64>,
    pub delayed_send_poll_ms: u64,
    pub hf2: Hf2Config,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            device_lost_delay_ms: JD_DEVICE_LOST_DELAY,
            device_disconnected_delay_ms: JD_DEVICE_DISCONNECTED_DELAY,
            announce_interval_ms: JD_ANNOUNCE_INTERVAL,
            event_resend_delays_ms: vec![20, 100],
            delayed_send_poll_ms: 10,
            hf2: Hf2Config::default(),
        }
    }
}

impl BusConfig {
    pub fn from_json_str(s: &str) -> Result<BusConfig, Error> {
        let cfg: BusConfig = serde_json::from_str(s)
            .map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.device_disconnected_delay_ms < self.device_lost_delay_ms {
            return Err(Error::Config(String::from(
                "disconnected delay must not be shorter than lost delay",
            )));
        }
        if self.announce_interval_ms == 0 {
            return Err(Error::Config(String::from(
                "announce interval must be positive",
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Hf2Config {
    pub response_timeout_ms: u64,
    pub max_desync_retries: u32,
    pub empty_read_backoff_ms: u64,
    pub error_backoff_ms: u64,
}

impl Default for Hf2Config {
    fn default() -> Self {
        Hf2Config {
            response_timeout_ms: 1000,
            max_desync_retries: 3,
            empty_read_backoff_ms: 5,
            error_backoff_ms: 300,
        }
    }
}

impl Hf2Config {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn empty_read_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_read_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = BusConfig::from_json_str(
            r#"{"device_lost_delay_ms": 1000, "hf2": {"max_desync_retries": 5}}"#,
        )
        .expect("valid config");
        assert_eq!(cfg.device_lost_delay_ms, 1000);
        assert_eq!(cfg.device_disconnected_delay_ms, 5000);
        assert_eq!(cfg.event_resend_delays_ms, vec![20, 100]);
        assert_eq!(cfg.hf2.max_desync_retries, 5);
        assert_eq!(cfg.hf2.response_timeout_ms, 1000);
    }

    #[test]
    fn inverted_delays_are_rejected() {
        let res = BusConfig::from_json_str(
            r#"{"device_lost_delay_ms": 6000, "device_disconnected_delay_ms": 5000}"#,
        );
        assert!(res.is_err());
    }
}
