//! Configuration for the sync engine.

use std::time::Duration;
use url::Url;

/// Per-account connection settings.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Server endpoint (the protocol path, without query).
    pub endpoint: Url,
    /// User name sent in the `User` query parameter and basic auth.
    pub username: String,
    /// Password for basic auth.
    pub password: Option<String>,
    /// Device id.
    pub device_id: String,
    /// Device type.
    pub device_type: String,
    /// User agent header.
    pub user_agent: String,
    /// Protocol version header.
    pub protocol_version: String,
    /// Prefer the binary encoding when a binary codec is registered.
    pub prefer_wbxml: bool,
}

impl AccountConfig {
    /// Creates an account configuration.
    pub fn new(endpoint: Url, username: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            username: username.into(),
            password: None,
            device_id: device_id.into(),
            device_type: "groupsync".to_string(),
            user_agent: concat!("groupsync/", env!("CARGO_PKG_VERSION")).to_string(),
            protocol_version: "12.1".to_string(),
            prefer_wbxml: true,
        }
    }

    /// Sets the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the device type.
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the protocol version.
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Selects plain XML even when a binary codec is available.
    pub fn with_prefer_wbxml(mut self, prefer: bool) -> Self {
        self.prefer_wbxml = prefer;
        self
    }
}

/// Retry, timeout and backoff settings for the HTTP transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout of the first attempt.
    pub timeout: Duration,
    /// Factor applied to the timeout after each timed-out attempt.
    pub timeout_expander: f64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Server-directed delay used when a 503 carries no Retry-After.
    pub default_delay: Duration,
    /// Longest server-directed delay that is honoured.
    pub max_delay: Duration,
    /// Backoff before retrying an ordinary temporary failure.
    pub temp_fail_backoff: Duration,
    /// Delay used when a 503 says the account is throttled.
    pub throttle_delay: Duration,
    /// Server-directed delays honoured per request before giving up.
    pub max_delays: u32,
}

impl TransportConfig {
    /// Creates a configuration with the given retry count.
    pub fn new(max_retries: u32) -> Self {
        Self {
            timeout: Duration::from_secs(20),
            timeout_expander: 1.2,
            max_retries,
            default_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            temp_fail_backoff: Duration::from_secs(2),
            throttle_delay: Duration::from_secs(60),
            max_delays: 8,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    /// Sets the first-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the timeout expander.
    pub fn with_timeout_expander(mut self, expander: f64) -> Self {
        self.timeout_expander = expander;
        self
    }

    /// Sets the default server-directed delay.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Sets the longest honoured server-directed delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the temporary-failure backoff.
    pub fn with_temp_fail_backoff(mut self, backoff: Duration) -> Self {
        self.temp_fail_backoff = backoff;
        self
    }

    /// Sets the throttle delay.
    pub fn with_throttle_delay(mut self, delay: Duration) -> Self {
        self.throttle_delay = delay;
        self
    }

    /// Sets how many server-directed delays are honoured per request.
    pub fn with_max_delays(mut self, delays: u32) -> Self {
        self.max_delays = delays;
        self
    }

    /// Total attempts allowed, counting the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Timeout of the next attempt after `timeouts` attempts timed out.
    pub fn timeout_after(&self, timeouts: u32) -> Duration {
        let factor = self.timeout_expander.max(1.0).powi(timeouts as i32);
        Duration::from_secs_f64(self.timeout.as_secs_f64() * factor)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Account connection settings.
    pub account: AccountConfig,
    /// Transport settings.
    pub transport: TransportConfig,
    /// Changes requested per collection.
    pub window_size: u32,
    /// Email age filter code (5 = one month).
    pub email_filter: u32,
    /// Preferred body type (1 = plain text).
    pub body_preference: u32,
    /// Poll interval while idle; `None` waits for local edits only.
    pub idle_interval: Option<Duration>,
}

impl SyncConfig {
    /// Creates a sync configuration.
    pub fn new(account: AccountConfig) -> Self {
        Self {
            account,
            transport: TransportConfig::default(),
            window_size: 25,
            email_filter: 5,
            body_preference: 1,
            idle_interval: None,
        }
    }

    /// Sets the transport configuration.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the window size.
    pub fn with_window_size(mut self, size: u32) -> Self {
        self.window_size = size;
        self
    }

    /// Sets the email age filter.
    pub fn with_email_filter(mut self, filter: u32) -> Self {
        self.email_filter = filter;
        self
    }

    /// Sets the body preference.
    pub fn with_body_preference(mut self, body: u32) -> Self {
        self.body_preference = body;
        self
    }

    /// Sets the idle poll interval.
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = Some(interval);
        self
    }
}
