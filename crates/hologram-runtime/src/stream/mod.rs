//! Execution streams
//!
//! A stream is an ordered submission channel on one device. Two queue models
//! are supported:
//!
//! ```text
//!            ┌──────────────────────── Stream ────────────────────────┐
//!            │ enqueue_kernel / enqueue_marker / enqueue_barrier      │
//!            │ group_events / sync_events / wait_for_events / finish  │
//!            └──────────────┬──────────────────────────┬──────────────┘
//!                           ▼                          ▼
//!              ┌─────────────────────┐    ┌─────────────────────────┐
//!              │ CommandQueueStream  │    │  UnifiedQueueStream     │
//!              │ sync: none/events/  │    │  explicit dependencies, │
//!              │       barriers      │    │  host-side event groups │
//!              └──────────┬──────────┘    └────────────┬────────────┘
//!                         └──────────┬─────────────────┘
//!                                    ▼
//!                            DeviceQueue workers
//! ```
//!
//! Both variants share submission bookkeeping (counter, last barrier,
//! output events, event pool, staged host memory). Streams are `Send` but
//! not `Sync`: every mutating operation takes `&mut self`.

mod command_queue;
mod queue;
mod state;
mod unified_queue;

pub use command_queue::CommandQueueStream;
pub use queue::{Dependencies, DeviceOp, DeviceQueue};
pub use unified_queue::UnifiedQueueStream;

use crate::config::{RuntimeConfig, RuntimeType};
use crate::device::DevicePtr;
use crate::error::Result;
use crate::event::{EventPtr, PoolStats};
use crate::kernel::{Kernel, KernelArgumentsData, KernelArgumentsDesc};
use std::sync::Arc;

/// Ordered submission channel on one device
pub trait Stream: Send {
    // ============================================================================================
    // Identity
    // ============================================================================================

    /// Queue model this stream implements
    fn queue_model(&self) -> RuntimeType;

    /// Device the stream submits to
    fn device(&self) -> &DevicePtr;

    /// Underlying device queue
    fn queue(&self) -> &Arc<DeviceQueue>;

    /// Submission counter value of the most recent barrier (0 before any)
    fn last_barrier(&self) -> u64;

    fn event_pool_stats(&self) -> PoolStats;

    // ============================================================================================
    // Submission
    // ============================================================================================

    /// Validate and cache `args` for the next launch of `kernel`.
    ///
    /// Fails with `InvalidArgument` when an index is out of range, a native
    /// argument is mapped on the host or a written argument aliases another,
    /// and with `ForeignMemory` when an argument lives on another device.
    fn set_arguments(&mut self, kernel: &Kernel, args_desc: &KernelArgumentsDesc, args: &KernelArgumentsData)
        -> Result<()>;

    /// Launch `kernel` after `deps`.
    ///
    /// Uses the arguments cached by [`set_arguments`](Self::set_arguments)
    /// when present, otherwise binds `args` now.
    fn enqueue_kernel(
        &mut self,
        kernel: &Kernel,
        args_desc: &KernelArgumentsDesc,
        args: &KernelArgumentsData,
        deps: &[EventPtr],
        is_output: bool,
    ) -> Result<EventPtr>;

    /// Event that completes after `deps`, or after every command submitted
    /// since the last barrier when `deps` is empty.
    ///
    /// Fails when one of `deps` failed. Without `deps` it only marks
    /// completion.
    fn enqueue_marker(&mut self, deps: &[EventPtr], is_output: bool) -> Result<EventPtr>;

    /// Single event standing for all of `deps`, failed iff a member failed.
    /// An empty list yields an already signaled event.
    fn group_events(&mut self, deps: &[EventPtr]) -> Result<EventPtr>;

    /// Order every later submission after `deps`. A failed dependency does
    /// not fail later work.
    fn sync_events(&mut self, deps: &[EventPtr], is_output: bool) -> Result<()>;

    /// Join point after which later submissions start.
    fn enqueue_barrier(&mut self) -> Result<EventPtr>;

    /// Submit a device operation (fill, copy) after `deps`.
    fn enqueue_transfer(&mut self, deps: &[EventPtr], op: DeviceOp, label: &'static str) -> Result<EventPtr>;

    // ============================================================================================
    // Waiting
    // ============================================================================================

    /// Block until every event completes. Returns the first failure.
    fn wait_for_events(&mut self, events: &[EventPtr]) -> Result<()>;

    /// Ensure submitted work reaches the device.
    fn flush(&mut self) -> Result<()>;

    /// Block until submitted work completes.
    ///
    /// When events were marked as outputs only those are awaited. Otherwise
    /// the first command failure since the previous such call is returned.
    fn finish(&mut self) -> Result<()>;

    // ============================================================================================
    // Events and resources
    // ============================================================================================

    /// Host-controlled event
    fn create_user_event(&mut self, signaled: bool) -> EventPtr;

    /// Event completed by the device once prior work finishes
    fn create_base_event(&mut self) -> Result<EventPtr>;

    /// Mark every subsequently created event as an output.
    fn set_output_event(&mut self, enabled: bool);

    /// Forget output events and return reusable events to the pool.
    fn reset_events(&mut self);

    /// Drop the event pool. Events held elsewhere stay valid.
    fn release_events_pool(&mut self);

    /// Keep host staging bytes alive until released.
    fn park_staging(&mut self, data: Arc<[u8]>);

    /// Release staged host memory; returns the bytes freed.
    fn release_pending_memory(&mut self) -> usize;
}

/// Stream of the model selected by `config`
pub fn create_stream(device: DevicePtr, config: &RuntimeConfig) -> Result<Box<dyn Stream>> {
    let stream: Box<dyn Stream> = match config.runtime {
        RuntimeType::CommandQueue => Box::new(CommandQueueStream::new(device, config)?),
        RuntimeType::UnifiedQueue => Box::new(UnifiedQueueStream::new(device, config)?),
    };
    tracing::debug!(model = %config.runtime, queue = stream.queue().id(), "stream created");
    Ok(stream)
}

/// Forwards the operations both stream variants implement identically to
/// their `core` field.
macro_rules! delegate_to_core {
    () => {
        fn device(&self) -> &crate::device::DevicePtr {
            self.core.device()
        }

        fn queue(&self) -> &std::sync::Arc<crate::stream::DeviceQueue> {
            self.core.queue()
        }

        fn last_barrier(&self) -> u64 {
            self.core.last_barrier()
        }

        fn event_pool_stats(&self) -> crate::event::PoolStats {
            self.core.pool_stats()
        }

        fn set_arguments(
            &mut self,
            kernel: &crate::kernel::Kernel,
            args_desc: &crate::kernel::KernelArgumentsDesc,
            args: &crate::kernel::KernelArgumentsData,
        ) -> crate::error::Result<()> {
            self.core.bind(kernel, args_desc, args)
        }

        fn enqueue_barrier(&mut self) -> crate::error::Result<crate::event::EventPtr> {
            self.core.barrier(Vec::new(), false)
        }

        fn wait_for_events(&mut self, events: &[crate::event::EventPtr]) -> crate::error::Result<()> {
            self.core.wait_events(events)
        }

        fn flush(&mut self) -> crate::error::Result<()> {
            tracing::trace!(queue = self.core.queue_id(), pending = self.core.queue().pending(), "flush");
            Ok(())
        }

        fn finish(&mut self) -> crate::error::Result<()> {
            self.core.finish()
        }

        fn create_user_event(&mut self, signaled: bool) -> crate::event::EventPtr {
            self.core.create_user_event(signaled)
        }

        fn create_base_event(&mut self) -> crate::error::Result<crate::event::EventPtr> {
            self.core.marker(Vec::new(), false)
        }

        fn set_output_event(&mut self, enabled: bool) {
            self.core.set_output_default(enabled);
        }

        fn reset_events(&mut self) {
            self.core.reset_events();
        }

        fn release_events_pool(&mut self) {
            self.core.release_events_pool();
        }

        fn park_staging(&mut self, data: std::sync::Arc<[u8]>) {
            self.core.park_staging(data);
        }

        fn release_pending_memory(&mut self) -> usize {
            self.core.release_pending_memory()
        }
    };
}

pub(crate) use delegate_to_core;
