use super::{Device, DeviceInfo, DevicePtr};
use crate::config::{RuntimeConfig, RuntimeType};
use crate::error::Result;
use std::collections::BTreeMap;

/// Enumerates the devices usable by a runtime type
///
/// Devices are keyed by their ordinal among the usable devices (`"0"`, `"1"`, ...).
/// The unified-queue runtime only sees devices with at least one unified
/// allocation kind.
pub struct DeviceQuery {
    devices: BTreeMap<String, DevicePtr>,
}

impl DeviceQuery {
    pub fn new(runtime: RuntimeType, config: &RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let described = if config.devices.is_empty() {
            vec![DeviceInfo::default()]
        } else {
            config.devices.clone()
        };

        let devices: BTreeMap<_, _> = described
            .into_iter()
            .filter(|info| {
                let usable = runtime != RuntimeType::UnifiedQueue || info.mem_caps.supports_any_unified();
                if !usable {
                    tracing::debug!(device = %info.name, %runtime, "skipping device without unified memory");
                }
                usable
            })
            .enumerate()
            .map(|(ordinal, info)| (ordinal.to_string(), Device::new(info)))
            .collect();

        tracing::debug!(count = devices.len(), %runtime, "device query complete");
        Ok(Self { devices })
    }

    pub fn get_available_devices(&self) -> &BTreeMap<String, DevicePtr> {
        &self.devices
    }

    pub fn into_devices(self) -> BTreeMap<String, DevicePtr> {
        self.devices
    }
}
