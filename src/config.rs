//! Probe configuration and retry policy

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};
use crate::http::Target;

/// User agent sent with every fetch
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:40.0) Gecko/20100101 Firefox/40.1";

/// Attribute holding one content identifier per timeline entry
pub const DEFAULT_IDENTIFIER_ATTRIBUTE: &str = "data-tweet-id";

/// Delay between circuit build attempts after an asynchronous build failure
pub const DEFAULT_CIRCUIT_RETRY_DELAY_MS: u64 = 1000;

/// How often an operation may be attempted, and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    /// Pause before the next attempt
    pub delay: Duration,
}

impl RetryPolicy {
    /// Retry forever with a fixed delay
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }

    /// Give up after `max_attempts` attempts
    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay,
        }
    }

    /// Whether attempt number `attempt` (1-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded(Duration::from_millis(DEFAULT_CIRCUIT_RETRY_DELAY_MS))
    }
}

/// Configuration for a probe run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// URL fetched over every circuit
    pub target: String,

    /// Number of concurrent fetches (one circuit each)
    pub concurrency: usize,

    /// User-Agent header value
    pub user_agent: String,

    /// HTML attribute the identifiers are read from
    pub identifier_attribute: String,

    /// Only read the attribute from elements with this class (`None` = any)
    pub identifier_class: Option<String>,

    /// Pause after a failed circuit build (ms)
    pub circuit_retry_delay_ms: u64,

    /// Cap on circuit attempts per allocation (`None` = forever)
    pub max_circuit_attempts: Option<u32>,

    /// Cap on connect-and-fetch attempts per task (`None` = forever)
    pub max_fetch_attempts: Option<u32>,

    /// Append one line per completed fetch to this file
    pub output_path: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            concurrency: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            identifier_attribute: DEFAULT_IDENTIFIER_ATTRIBUTE.to_string(),
            identifier_class: None,
            circuit_retry_delay_ms: DEFAULT_CIRCUIT_RETRY_DELAY_MS,
            max_circuit_attempts: None,
            max_fetch_attempts: None,
            output_path: None,
        }
    }
}

impl ProbeConfig {
    /// Create a configuration for the given target with defaults elsewhere
    pub fn for_target(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ProbeConfig = serde_json::from_str(json)
            .map_err(|e| ProbeError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ProbeError::Config("concurrency must be at least 1".into()));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ProbeError::Config("user_agent must not be empty".into()));
        }
        if self.identifier_attribute.trim().is_empty() {
            return Err(ProbeError::Config(
                "identifier_attribute must not be empty".into(),
            ));
        }
        Target::parse(&self.target)?;
        Ok(())
    }

    /// Policy used by the circuit allocator
    pub fn circuit_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_circuit_attempts,
            delay: Duration::from_millis(self.circuit_retry_delay_ms),
        }
    }

    /// Policy used by fetch tasks (restart immediately)
    pub fn fetch_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_fetch_attempts,
            delay: Duration::ZERO,
        }
    }
}
