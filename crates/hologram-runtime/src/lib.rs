//! # hologram-runtime - GPU Memory Objects, Streams and Events
//!
//! Backend-agnostic runtime layer between a compute engine and a GPU driver.
//!
//! ## Architecture
//!
//! ```text
//!   Engine ──allocate/import──▶ Memory (native buffer | image | media surface |
//!     │                                 external buffer | unified memory)
//!     │
//!     └──create_stream──▶ Stream (command-queue | unified-queue)
//!                            │
//!                            ├─ enqueue_kernel / marker / barrier ──▶ Event
//!                            └─ EventPool (free list keyed by reuse token)
//! ```
//!
//! - **Capabilities**: a device advertises the [`AllocationKind`]s it can
//!   back through [`MemoryCapabilities`].
//! - **Memory**: one tagged variant per resource kind. Host mapping is
//!   reference counted; unified device-only memory refuses host access.
//! - **Streams**: one trait, two queue models. Command-queue streams order
//!   work through in-order queues, events or barriers; unified-queue streams
//!   pass explicit dependencies and group events on the host.
//! - **Events**: base, user and group events with forward-only state.
//!   Failures of device work surface only through events.
//!
//! Device resources are simulated in aligned host memory and executed by
//! per-queue worker threads.
//!
//! ## Example
//!
//! ```rust
//! use hologram_runtime::{AllocationKind, Engine, Layout, RuntimeConfig};
//!
//! # fn main() -> hologram_runtime::Result<()> {
//! let engine = Engine::from_query(RuntimeConfig::default())?;
//! let mut stream = engine.create_stream()?;
//!
//! let src = engine.allocate_memory(&Layout::of::<f32>(256), AllocationKind::NativeBuffer)?;
//! let dst = engine.allocate_memory(&Layout::of::<f32>(256), AllocationKind::NativeBuffer)?;
//!
//! src.fill_value(stream.as_mut(), 1.5f32)?;
//! dst.copy_from(stream.as_mut(), &src)?;
//! stream.finish()?;
//!
//! let values: Vec<f32> = dst.read_as_vec(stream.as_mut())?;
//! assert!(values.iter().all(|&v| v == 1.5));
//! # Ok(())
//! # }
//! ```

pub mod caps;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod event;
pub mod kernel;
pub mod layout;
pub mod memory;
pub mod stream;

// Re-export primary types
pub use caps::{AllocationKind, MemoryCapabilities};
pub use config::{QueueType, RuntimeConfig, RuntimeType, SyncMethod};
pub use device::{Device, DeviceInfo, DevicePtr, DeviceQuery, DeviceType};
pub use engine::{Engine, ExternalMemoryProvider, MemoryUsage};
pub use error::{Result, RuntimeError};
pub use event::{Event, EventKind, EventPool, EventPtr, EventStatus, PoolStats, ProfilingInfo, ReuseToken};
pub use kernel::{
    ArgumentDesc, Kernel, KernelArgumentsData, KernelArgumentsDesc, KernelContext, ScalarValue, WorkGroupSizes,
};
pub use layout::{Layout, MemoryFormat};
pub use memory::{
    DeviceAllocation, LockType, MappedPtr, MemLock, Memory, MemoryPtr, MemoryVariant, NativeHandle, SharedMemParams,
    SharedMemType, SharedSurface, SurfaceRepr,
};
pub use stream::{CommandQueueStream, DeviceOp, Stream, UnifiedQueueStream};
