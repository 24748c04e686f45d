//! Unified shared memory allocations

use super::lockable::LockStrategy;
use super::shared::{NativeHandle, SharedMemParams};
use crate::caps::AllocationKind;

/// One unified-memory allocation of a host, shared or device sub-kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnifiedMemory {
    kind: AllocationKind,
}

impl UnifiedMemory {
    /// `None` unless `kind` is one of the unified kinds.
    pub fn new(kind: AllocationKind) -> Option<Self> {
        kind.is_unified().then_some(Self { kind })
    }

    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    /// Host-accessible kinds lock to the allocation pointer itself.
    pub(crate) fn lock_strategy(&self) -> LockStrategy {
        if self.kind.is_host_accessible() {
            LockStrategy::Direct
        } else {
            LockStrategy::Denied(self.kind)
        }
    }

    pub fn export(&self, context: NativeHandle, ptr: NativeHandle) -> SharedMemParams {
        SharedMemParams::unified(context, ptr)
    }
}
