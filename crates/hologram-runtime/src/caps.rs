//! Allocation kinds and per-device memory capabilities

use serde::{Deserialize, Serialize};
use std::fmt;

/// Backing kind of a memory object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    /// Kind not decided yet; never allocatable
    Unspecified,
    /// Classic buffer or image object
    NativeBuffer,
    /// Unified memory that only the host touches
    UnifiedHost,
    /// Unified memory visible to host and device, migrated on demand
    UnifiedShared,
    /// Unified memory resident on the device, not host-accessible
    UnifiedDevice,
}

impl AllocationKind {
    pub const ALL: [AllocationKind; 5] = [
        Self::Unspecified,
        Self::NativeBuffer,
        Self::UnifiedHost,
        Self::UnifiedShared,
        Self::UnifiedDevice,
    ];

    /// True for the three unified-memory kinds
    pub const fn is_unified(self) -> bool {
        matches!(self, Self::UnifiedHost | Self::UnifiedShared | Self::UnifiedDevice)
    }

    /// Whether host code may obtain a pointer to the memory
    ///
    /// Native buffers are host accessible through a mapping.
    pub const fn is_host_accessible(self) -> bool {
        matches!(self, Self::NativeBuffer | Self::UnifiedHost | Self::UnifiedShared)
    }

    /// Whether the physical backing may move between host and device
    pub const fn is_migratable(self) -> bool {
        matches!(self, Self::UnifiedShared)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::NativeBuffer => "native_buffer",
            Self::UnifiedHost => "unified_host",
            Self::UnifiedShared => "unified_shared",
            Self::UnifiedDevice => "unified_device",
        }
    }
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable ordered set of allocation kinds a device supports
///
/// Built once when devices are enumerated and owned by the device.
///
/// ```rust
/// use hologram_runtime::{AllocationKind, MemoryCapabilities};
///
/// let caps = MemoryCapabilities::new([AllocationKind::NativeBuffer, AllocationKind::UnifiedShared]);
/// assert!(caps.supports(AllocationKind::UnifiedShared));
/// assert!(!caps.supports(AllocationKind::UnifiedDevice));
/// assert!(caps.supports_any_unified());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<AllocationKind>", into = "Vec<AllocationKind>")]
pub struct MemoryCapabilities {
    kinds: Vec<AllocationKind>,
}

impl MemoryCapabilities {
    /// Build from a list of kinds; duplicates are dropped, first occurrence wins.
    pub fn new(kinds: impl IntoIterator<Item = AllocationKind>) -> Self {
        let mut unique = Vec::new();
        for kind in kinds {
            if !unique.contains(&kind) {
                unique.push(kind);
            }
        }
        Self { kinds: unique }
    }

    pub fn supports(&self, kind: AllocationKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn supports_any_unified(&self) -> bool {
        self.kinds.iter().any(|kind| kind.is_unified())
    }

    /// Device-independent classification of `kind`
    pub const fn is_unified_kind(kind: AllocationKind) -> bool {
        kind.is_unified()
    }

    pub fn kinds(&self) -> &[AllocationKind] {
        &self.kinds
    }
}

impl From<Vec<AllocationKind>> for MemoryCapabilities {
    fn from(kinds: Vec<AllocationKind>) -> Self {
        Self::new(kinds)
    }
}

impl From<MemoryCapabilities> for Vec<AllocationKind> {
    fn from(caps: MemoryCapabilities) -> Self {
        caps.kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unified_classification() {
        let unified: Vec<_> = AllocationKind::ALL.into_iter().filter(|k| k.is_unified()).collect();
        assert_eq!(
            unified,
            vec![
                AllocationKind::UnifiedHost,
                AllocationKind::UnifiedShared,
                AllocationKind::UnifiedDevice
            ]
        );
    }

    #[test]
    fn test_accessibility_table() {
        assert!(AllocationKind::UnifiedHost.is_host_accessible());
        assert!(!AllocationKind::UnifiedHost.is_migratable());
        assert!(!AllocationKind::UnifiedDevice.is_host_accessible());
        assert!(!AllocationKind::UnifiedDevice.is_migratable());
        assert!(AllocationKind::UnifiedShared.is_host_accessible());
        assert!(AllocationKind::UnifiedShared.is_migratable());
    }

    #[test]
    fn test_duplicates_collapse_in_order() {
        let caps = MemoryCapabilities::new([
            AllocationKind::UnifiedDevice,
            AllocationKind::NativeBuffer,
            AllocationKind::UnifiedDevice,
        ]);
        assert_eq!(caps.kinds(), &[AllocationKind::UnifiedDevice, AllocationKind::NativeBuffer]);
    }

    #[test]
    fn test_empty_set_supports_nothing() {
        let caps = MemoryCapabilities::default();
        assert!(!caps.supports_any_unified());
        assert!(AllocationKind::ALL.iter().all(|k| !caps.supports(*k)));
    }

    #[test]
    fn test_serde_uses_plain_list() {
        let caps = MemoryCapabilities::new([AllocationKind::NativeBuffer, AllocationKind::UnifiedHost]);
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, r#"["native_buffer","unified_host"]"#);
        let back: MemoryCapabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }

    #[test]
    fn test_display_matches_serde_name() {
        for kind in AllocationKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }
}
