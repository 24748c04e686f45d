//! Runtime configuration
//!
//! Configuration comes from three places, in increasing priority: defaults,
//! a JSON document ([`RuntimeConfig::from_json`]) and environment variables
//! ([`RuntimeConfig::from_env`]).
//!
//! ```rust
//! use hologram_runtime::{QueueType, RuntimeConfig, RuntimeType};
//!
//! let config = RuntimeConfig::from_json(r#"{ "runtime": "unified_queue", "queue_type": "out_of_order" }"#).unwrap();
//! assert_eq!(config.runtime, RuntimeType::UnifiedQueue);
//! assert_eq!(config.queue_type, QueueType::OutOfOrder);
//! ```

use crate::device::DeviceInfo;
use crate::error::{Result, RuntimeError};
use crate::memory::SurfaceRepr;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

/// Which backend queue model executes streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    /// Classic command-queue model
    #[default]
    CommandQueue,
    /// Unified asynchronous-queue model
    UnifiedQueue,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CommandQueue => "command_queue",
            Self::UnifiedQueue => "unified_queue",
        })
    }
}

/// Execution order of commands within a device queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    #[default]
    InOrder,
    OutOfOrder,
}

/// How a command-queue stream turns event dependencies into ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    /// Rely on the in-order queue; only foreign dependencies are passed on
    None,
    /// Pass full wait lists
    Events,
    /// Insert a barrier whenever a dependency is newer than the last barrier
    Barriers,
}

/// Runtime-wide settings consumed by [`crate::Engine`] and the streams it creates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub runtime: RuntimeType,
    pub queue_type: QueueType,
    /// Overrides the sync method derived from `queue_type` and `enable_profiling`
    pub sync_method: Option<SyncMethod>,
    /// Worker threads per out-of-order queue. In-order queues always use one.
    pub worker_threads: usize,
    /// Record queued/started/finished instants on events
    pub enable_profiling: bool,
    /// Maximum number of idle events a stream keeps for reuse
    pub event_pool_capacity: usize,
    /// Representation of surface fields in shared-memory descriptors
    pub surface_repr: SurfaceRepr,
    /// Simulated devices returned by device enumeration. Empty means one default device.
    pub devices: Vec<DeviceInfo>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeType::default(),
            queue_type: QueueType::default(),
            sync_method: None,
            worker_threads: 4,
            enable_profiling: false,
            event_pool_capacity: 256,
            surface_repr: SurfaceRepr::for_target(),
            devices: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Default configuration overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `HOLOGRAM_RUNTIME_TYPE` - `command_queue` or `unified_queue`
    /// - `HOLOGRAM_RUNTIME_QUEUE` - `in_order` or `out_of_order`
    /// - `HOLOGRAM_RUNTIME_SYNC` - `none`, `events` or `barriers`
    /// - `HOLOGRAM_RUNTIME_WORKERS` - worker threads per out-of-order queue
    /// - `HOLOGRAM_RUNTIME_PROFILING` - `true`/`1`/`yes` enables event profiling
    /// - `HOLOGRAM_RUNTIME_EVENT_POOL` - event pool capacity
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] when a variable holds an unknown value
    /// or the resulting configuration fails [`RuntimeConfig::validate`].
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RuntimeError::config(format!("invalid runtime config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of `self`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(value) = env_value("HOLOGRAM_RUNTIME_TYPE") {
            self.runtime = parse_variant("HOLOGRAM_RUNTIME_TYPE", &value)?;
        }
        if let Some(value) = env_value("HOLOGRAM_RUNTIME_QUEUE") {
            self.queue_type = parse_variant("HOLOGRAM_RUNTIME_QUEUE", &value)?;
        }
        if let Some(value) = env_value("HOLOGRAM_RUNTIME_SYNC") {
            self.sync_method = Some(parse_variant("HOLOGRAM_RUNTIME_SYNC", &value)?);
        }
        if let Some(value) = env_value("HOLOGRAM_RUNTIME_WORKERS") {
            self.worker_threads = parse_number("HOLOGRAM_RUNTIME_WORKERS", &value)?;
        }
        if let Some(value) = env_value("HOLOGRAM_RUNTIME_PROFILING") {
            self.enable_profiling = matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(value) = env_value("HOLOGRAM_RUNTIME_EVENT_POOL") {
            self.event_pool_capacity = parse_number("HOLOGRAM_RUNTIME_EVENT_POOL", &value)?;
        }
        Ok(())
    }

    /// Reject settings that cannot order or execute work.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(RuntimeError::config("worker_threads must be at least 1"));
        }
        if self.runtime == RuntimeType::CommandQueue
            && self.queue_type == QueueType::OutOfOrder
            && self.sync_method == Some(SyncMethod::None)
        {
            return Err(RuntimeError::config(
                "sync_method 'none' requires an in-order queue to preserve dependencies",
            ));
        }
        for (index, device) in self.devices.iter().enumerate() {
            if device.max_alloc_size > device.global_mem_size {
                return Err(RuntimeError::config(format!(
                    "device {index} ('{}'): max_alloc_size exceeds global_mem_size",
                    device.name
                )));
            }
        }
        Ok(())
    }

    /// Sync method used by command-queue streams
    pub fn effective_sync_method(&self) -> SyncMethod {
        match self.sync_method {
            Some(method) => method,
            None if self.enable_profiling => SyncMethod::Events,
            None if self.queue_type == QueueType::OutOfOrder => SyncMethod::Barriers,
            None => SyncMethod::None,
        }
    }

    /// Worker threads for a queue of this configuration's type
    pub fn queue_workers(&self) -> usize {
        match self.queue_type {
            QueueType::InOrder => 1,
            QueueType::OutOfOrder => self.worker_threads.max(1),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_variant<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| RuntimeError::config(format!("{key}: unrecognized value '{value}'")))
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| RuntimeError::config(format!("{key}: expected a non-negative integer, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "HOLOGRAM_RUNTIME_TYPE",
        "HOLOGRAM_RUNTIME_QUEUE",
        "HOLOGRAM_RUNTIME_SYNC",
        "HOLOGRAM_RUNTIME_WORKERS",
        "HOLOGRAM_RUNTIME_PROFILING",
        "HOLOGRAM_RUNTIME_EVENT_POOL",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_sync_method(), SyncMethod::None);
        assert_eq!(config.queue_workers(), 1);
    }

    #[test]
    fn test_derived_sync_method() {
        let mut config = RuntimeConfig {
            queue_type: QueueType::OutOfOrder,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.effective_sync_method(), SyncMethod::Barriers);
        config.enable_profiling = true;
        assert_eq!(config.effective_sync_method(), SyncMethod::Events);
        config.sync_method = Some(SyncMethod::Barriers);
        assert_eq!(config.effective_sync_method(), SyncMethod::Barriers);
    }

    #[test]
    fn test_validation_rejects_unordered_setups() {
        let zero_workers = RuntimeConfig {
            worker_threads: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(zero_workers.validate(), Err(RuntimeError::Config(_))));

        let unordered = RuntimeConfig {
            queue_type: QueueType::OutOfOrder,
            sync_method: Some(SyncMethod::None),
            ..RuntimeConfig::default()
        };
        assert!(unordered.validate().is_err());
    }

    #[test]
    fn test_json_with_devices() {
        let json = r#"{
            "worker_threads": 2,
            "devices": [{
                "name": "sim-igpu",
                "global_mem_size": 1048576,
                "max_alloc_size": 65536,
                "mem_caps": ["native_buffer", "unified_shared"]
            }]
        }"#;
        let config = RuntimeConfig::from_json(json).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].max_alloc_size, 65536);
        assert!(config.devices[0].mem_caps.supports_any_unified());
    }

    #[test]
    fn test_json_errors_are_config_errors() {
        assert!(matches!(RuntimeConfig::from_json("{ nope"), Err(RuntimeError::Config(_))));
        assert!(RuntimeConfig::from_json(r#"{ "worker_threads": 0 }"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("HOLOGRAM_RUNTIME_TYPE", "unified_queue");
        env::set_var("HOLOGRAM_RUNTIME_QUEUE", "OUT_OF_ORDER");
        env::set_var("HOLOGRAM_RUNTIME_WORKERS", "3");
        env::set_var("HOLOGRAM_RUNTIME_PROFILING", "yes");

        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.runtime, RuntimeType::UnifiedQueue);
        assert_eq!(config.queue_type, QueueType::OutOfOrder);
        assert_eq!(config.worker_threads, 3);
        assert!(config.enable_profiling);
        clear_env();
    }

    #[test]
    fn test_env_rejects_unknown_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("HOLOGRAM_RUNTIME_SYNC", "semaphores");
        assert!(matches!(RuntimeConfig::from_env(), Err(RuntimeError::Config(_))));
        clear_env();
    }
}
