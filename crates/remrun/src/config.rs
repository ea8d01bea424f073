//! # Configuration
//!
//! Tunables for the partition client, the fault pipeline and the cancel race.
//! All structs have working defaults; a TOML document may override any subset:
//!
//! ```toml
//! [partition]
//! resolve_timeout_per_try_ms = 2000
//! max_retry_attempts = 5
//!
//! [exceptions]
//! max_depth = 4
//!
//! [cancellation]
//! cancel_timeout_ms = 500
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Config read error: {}", e),
            Self::Parse(e) => write!(f, "Config parse error: {}", e),
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level runtime configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RemotingConfig {
    pub partition: PartitionClientConfig,
    pub exceptions: ExceptionConfig,
    pub cancellation: CancellationConfig,
}

impl RemotingConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RemotingConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.partition;
        if p.initial_retry_delay.is_zero() {
            return Err(Error::Invalid("partition.initial_retry_delay_ms must be positive".into()));
        }
        if p.max_retry_delay < p.initial_retry_delay {
            return Err(Error::Invalid(
                "partition.max_retry_delay_ms must not be below initial_retry_delay_ms".into(),
            ));
        }
        if p.resolve_timeout_per_try.is_zero() {
            return Err(Error::Invalid("partition.resolve_timeout_per_try_ms must be positive".into()));
        }
        if p.max_retry_attempts == 0 {
            return Err(Error::Invalid("partition.max_retry_attempts must be at least 1".into()));
        }
        if self.cancellation.max_cancel_attempts == 0 {
            return Err(Error::Invalid("cancellation.max_cancel_attempts must be at least 1".into()));
        }
        if self.exceptions.max_breadth == 0 {
            return Err(Error::Invalid("exceptions.max_breadth must be at least 1".into()));
        }
        Ok(())
    }
}

/// Partition resolution and retry policy.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PartitionClientConfig {
    /// Timeout handed to the resolver for a single resolution attempt.
    #[serde(rename = "resolve_timeout_per_try_ms", with = "millis")]
    pub resolve_timeout_per_try: Duration,
    /// Base of the exponential backoff between attempts.
    #[serde(rename = "initial_retry_delay_ms", with = "millis")]
    pub initial_retry_delay: Duration,
    /// Upper bound of a single backoff interval.
    #[serde(rename = "max_retry_delay_ms", with = "millis")]
    pub max_retry_delay: Duration,
    /// Total attempts (first try included) before giving up.
    pub max_retry_attempts: u32,
    /// Register for push notifications so cached locations stay valid until invalidated.
    pub use_change_notifications: bool,
}

impl Default for PartitionClientConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_per_try: Duration::from_secs(5),
            initial_retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_secs(2),
            max_retry_attempts: 10,
            use_change_notifications: true,
        }
    }
}

impl PartitionClientConfig {
    pub fn with_resolve_timeout_per_try(mut self, timeout: Duration) -> Self {
        self.resolve_timeout_per_try = timeout;
        self
    }

    pub fn with_retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_retry_delay = initial;
        self.max_retry_delay = max;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_change_notifications(mut self, enabled: bool) -> Self {
        self.use_change_notifications = enabled;
        self
    }
}

/// Bounds applied when converting native errors into fault envelopes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExceptionConfig {
    /// Maximum nesting of inner exceptions below the root.
    pub max_depth: usize,
    /// Maximum inner exceptions kept per envelope.
    pub max_breadth: usize,
}

impl Default for ExceptionConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_breadth: 16,
        }
    }
}

impl ExceptionConfig {
    pub fn new(max_depth: usize, max_breadth: usize) -> Self {
        Self { max_depth, max_breadth }
    }
}

/// Client side of the cancel race.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CancellationConfig {
    /// Bound on a single cancel delivery attempt. `None` leaves it to the transport.
    #[serde(rename = "cancel_timeout_ms", with = "optional_millis")]
    pub cancel_timeout: Option<Duration>,
    /// Cancel messages sent while the server reports nothing in flight yet.
    pub max_cancel_attempts: u32,
    /// Pause between cancel messages.
    #[serde(rename = "cancel_retry_delay_ms", with = "millis")]
    pub cancel_retry_delay: Duration,
    /// How long the response may still arrive after the server acknowledged the cancel.
    #[serde(rename = "cancel_grace_ms", with = "millis")]
    pub cancel_grace: Duration,
    /// How long the response is awaited after every cancel attempt found
    /// nothing in flight. One last cancel is sent when it runs out.
    #[serde(rename = "undelivered_wait_ms", with = "millis")]
    pub undelivered_wait: Duration,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            cancel_timeout: None,
            max_cancel_attempts: 3,
            cancel_retry_delay: Duration::from_millis(25),
            cancel_grace: Duration::from_millis(100),
            undelivered_wait: Duration::from_secs(1),
        }
    }
}

impl CancellationConfig {
    pub fn with_cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = Some(timeout);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_cancel_attempts(mut self, attempts: u32, delay: Duration) -> Self {
        self.max_cancel_attempts = attempts;
        self.cancel_retry_delay = delay;
        self
    }

    pub fn with_undelivered_wait(mut self, wait: Duration) -> Self {
        self.undelivered_wait = wait;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
