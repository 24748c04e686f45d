//! Stream over a unified-queue device
//!
//! Every submission carries its dependencies explicitly plus the most recent
//! barrier event. Groups are host-side group events and submit nothing;
//! syncs submit a barrier that orders later work without failing it.

use super::delegate_to_core;
use super::queue::DeviceOp;
use super::state::StreamCore;
use super::Stream;
use crate::config::{RuntimeConfig, RuntimeType};
use crate::device::DevicePtr;
use crate::error::{Result, RuntimeError};
use crate::event::{Event, EventPtr};
use crate::kernel::{Kernel, KernelArgumentsData, KernelArgumentsDesc};
use std::sync::Arc;

pub struct UnifiedQueueStream {
    core: StreamCore,
}

impl UnifiedQueueStream {
    pub fn new(device: DevicePtr, config: &RuntimeConfig) -> Result<Self> {
        config.validate()?;
        if !device.mem_caps().supports_any_unified() {
            return Err(RuntimeError::unsupported(format!(
                "device '{}' has no unified memory support",
                device.info().name
            )));
        }
        let core = StreamCore::new(device, config)?;
        tracing::debug!(queue = core.queue_id(), "unified queue stream created");
        Ok(Self { core })
    }
}

impl Stream for UnifiedQueueStream {
    fn queue_model(&self) -> RuntimeType {
        RuntimeType::UnifiedQueue
    }

    delegate_to_core!();

    fn enqueue_kernel(
        &mut self,
        kernel: &Kernel,
        args_desc: &KernelArgumentsDesc,
        args: &KernelArgumentsData,
        deps: &[EventPtr],
        is_output: bool,
    ) -> Result<EventPtr> {
        let op = self.core.kernel_op(kernel, args_desc, args)?;
        self.core.submit(deps.to_vec(), Some(op), "kernel", is_output)
    }

    fn enqueue_marker(&mut self, deps: &[EventPtr], is_output: bool) -> Result<EventPtr> {
        if deps.is_empty() {
            return self.core.marker(Vec::new(), is_output);
        }
        self.core.submit(deps.to_vec(), None, "marker", is_output)
    }

    fn group_events(&mut self, deps: &[EventPtr]) -> Result<EventPtr> {
        if deps.is_empty() {
            return Ok(self.core.create_user_event(true));
        }
        Ok(Arc::new(Event::group(self.core.queue_id(), deps.to_vec())))
    }

    fn sync_events(&mut self, deps: &[EventPtr], is_output: bool) -> Result<()> {
        self.core.barrier(deps.to_vec(), is_output)?;
        Ok(())
    }

    fn enqueue_transfer(&mut self, deps: &[EventPtr], op: DeviceOp, label: &'static str) -> Result<EventPtr> {
        self.core.submit(deps.to_vec(), Some(op), label, false)
    }
}
