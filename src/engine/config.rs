//! Engine configuration.

use std::time::Duration;

use crate::endpoint::ReplenishPolicy;
use crate::error::{Error, Result};
use crate::types::{MIN_MAX_FRAME_SIZE, ReceiverSettleMode, SenderSettleMode};

/// Which end of the transport the engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EngineRole {
    /// Sends its protocol header as soon as it starts.
    #[default]
    Client,
    /// Answers the peer's protocol header.
    Server,
}

/// Defaults applied to new sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionOptions {
    /// Transfer frames accepted before a flow must reopen the window.
    pub incoming_window: u32,
    /// Transfer frames announced as the outgoing window.
    pub outgoing_window: u32,
    /// Highest link handle this side will use.
    pub handle_max: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            incoming_window: 2048,
            outgoing_window: u32::MAX,
            handle_max: u32::MAX,
        }
    }
}

/// Defaults applied to new links.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkOptions {
    /// Credit a receiver keeps topped up; 0 leaves credit to the application.
    pub credit_window: u32,
    /// Sender settlement mode requested in attach.
    pub snd_settle_mode: SenderSettleMode,
    /// Receiver settlement mode requested in attach.
    pub rcv_settle_mode: ReceiverSettleMode,
    /// Credit refill thresholds for `credit_window`.
    pub replenish: ReplenishPolicy,
    /// Largest message accepted; `None` leaves it unbounded.
    pub max_message_size: Option<u64>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            credit_window: 10,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            replenish: ReplenishPolicy::default(),
            max_message_size: None,
        }
    }
}

/// Settings of one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Client or server end.
    pub role: EngineRole,
    /// Container id sent in open.
    pub container_id: String,
    /// Virtual host sent in open.
    pub hostname: Option<String>,
    /// Largest inbound frame.
    pub max_frame_size: u32,
    /// Highest channel number this side will use.
    pub channel_max: u16,
    /// Fail the connection when nothing arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Deadline for the peer's open after ours.
    pub open_timeout: Option<Duration>,
    /// Deadline for the peer's close after ours.
    pub close_timeout: Option<Duration>,
    /// Deadline for a drain request to complete.
    pub drain_timeout: Option<Duration>,
    /// Connection capabilities offered in open.
    pub offered_capabilities: Vec<String>,
    /// Connection capabilities desired in open.
    pub desired_capabilities: Vec<String>,
    /// Log every frame read and written at trace level.
    pub trace_frames: bool,
    /// Session defaults.
    pub session: SessionOptions,
    /// Link defaults.
    pub link: LinkOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            role: EngineRole::Client,
            container_id: uuid::Uuid::new_v4().to_string(),
            hostname: None,
            max_frame_size: 65_536,
            channel_max: u16::MAX,
            idle_timeout: None,
            open_timeout: Some(Duration::from_secs(30)),
            close_timeout: Some(Duration::from_secs(30)),
            drain_timeout: Some(Duration::from_secs(60)),
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            trace_frames: false,
            session: SessionOptions::default(),
            link: LinkOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Server-side defaults.
    #[must_use]
    pub fn server() -> Self {
        Self {
            role: EngineRole::Server,
            ..Self::default()
        }
    }

    /// Reject settings no peer could work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(Error::Config(format!(
                "max_frame_size {} is below the minimum of {MIN_MAX_FRAME_SIZE}",
                self.max_frame_size
            )));
        }
        if self.container_id.is_empty() {
            return Err(Error::Config("container_id must not be empty".into()));
        }
        if self.session.incoming_window == 0 {
            return Err(Error::Config("session incoming_window must be positive".into()));
        }
        validate_timeout("idle_timeout", self.idle_timeout)?;
        validate_timeout("open_timeout", self.open_timeout)?;
        validate_timeout("close_timeout", self.close_timeout)?;
        validate_timeout("drain_timeout", self.drain_timeout)?;
        if self.idle_timeout.is_some_and(|idle| idle.as_millis() > u128::from(u32::MAX)) {
            return Err(Error::Config("idle_timeout does not fit in 32-bit milliseconds".into()));
        }
        let policy = self.link.replenish;
        if policy.credit_low_percent > 100 || policy.buffered_high_percent > 100 {
            return Err(Error::Config("replenish percentages must be at most 100".into()));
        }
        Ok(())
    }

    /// Idle timeout in the millisecond form carried by open.
    pub(crate) fn idle_timeout_millis(&self) -> Option<u32> {
        self.idle_timeout
            .map(|idle| u32::try_from(idle.as_millis()).unwrap_or(u32::MAX))
    }
}

fn validate_timeout(name: &str, timeout: Option<Duration>) -> Result<()> {
    match timeout {
        Some(timeout) if timeout.is_zero() => {
            Err(Error::Config(format!("{name} must be positive when set")))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_frame_size, 65_536);
        assert!(uuid::Uuid::parse_str(&config.container_id).is_ok());
        assert_eq!(EngineConfig::server().role, EngineRole::Server);
    }

    #[test]
    fn rejects_small_frames_and_zero_timeouts() {
        let config = EngineConfig {
            max_frame_size: 511,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = EngineConfig {
            open_timeout: Some(Duration::ZERO),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_policy() {
        let mut config = EngineConfig::default();
        config.link.replenish.buffered_high_percent = 150;
        assert!(config.validate().is_err());
    }
}
