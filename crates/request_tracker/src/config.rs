//! Configuration for request registries.

use crate::error::ConfigError;
use serde::Deserialize;

/// What happens to a request whose execution context goes away while spans
/// are still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonPolicy {
    /// Close the open spans innermost-first and finish the request normally.
    #[default]
    Finalize,
    /// Drop the request without submitting it.
    Discard,
}

/// Configuration for a [`RequestRegistry`](crate::RequestRegistry).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Policy applied when a bound request is torn down mid-span.
    ///
    /// Default: `Finalize`
    pub abandon_policy: AbandonPolicy,

    /// Log a warning when a scoped span is closed while it is not the
    /// innermost open span.
    ///
    /// Default: true
    pub warn_on_out_of_order_close: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            abandon_policy: AbandonPolicy::Finalize,
            warn_on_out_of_order_close: true,
        }
    }
}

impl RegistryConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the abandon policy.
    pub fn with_abandon_policy(mut self, policy: AbandonPolicy) -> Self {
        self.abandon_policy = policy;
        self
    }

    /// Enables or disables the out-of-order close warning.
    pub fn with_out_of_order_warning(mut self, enabled: bool) -> Self {
        self.warn_on_out_of_order_close = enabled;
        self
    }
}
