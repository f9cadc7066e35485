//! Runtime configuration: the handful of tunables a host application needs
//! to control, deserializable through `serde` the same way the rest of the
//! ambient stack's config sections are.
//!
//! This crate has no global configuration file of its own — it is a library,
//! not a service — but a host application typically embeds a `RuntimeConfig`
//! section inside its own config (YAML/TOML/JSON via `serde`) to tune the
//! production scheduler without recompiling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::ExecutionModel;

/// Tunables for constructing a [`crate::scheduler::TokioScheduler`] from
/// host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Number of frames the trampoline runs before forcing an async yield.
    /// `0` selects [`ExecutionModel::AlwaysAsync`].
    #[serde(default = "RuntimeConfig::default_batch_size")]
    pub batch_size: usize,

    /// If `true`, the run-loop never forces an async yield
    /// ([`ExecutionModel::Synchronous`]), overriding `batch_size`. Only
    /// appropriate for short, bounded programs.
    #[serde(default)]
    pub unbounded_synchronous_frames: bool,

    /// Default timeout applied by callers that compose `first_completed_of`
    /// with a delayed failure to express a deadline; purely advisory data
    /// carried in config, not enforced by this crate.
    #[serde(default = "RuntimeConfig::default_operation_timeout")]
    #[serde(with = "duration_millis")]
    pub default_operation_timeout: Duration,
}

impl RuntimeConfig {
    fn default_batch_size() -> usize {
        1024
    }

    fn default_operation_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// Resolves the configured tunables into the [`ExecutionModel`] the
    /// run-loop actually consumes.
    pub fn execution_model(&self) -> ExecutionModel {
        if self.unbounded_synchronous_frames {
            ExecutionModel::Synchronous
        } else if self.batch_size == 0 {
            ExecutionModel::AlwaysAsync
        } else {
            ExecutionModel::Batched {
                batch_size: self.batch_size,
            }
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            unbounded_synchronous_frames: false,
            default_operation_timeout: Self::default_operation_timeout(),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
