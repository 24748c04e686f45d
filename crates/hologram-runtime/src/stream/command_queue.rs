//! Stream over a command-queue device
//!
//! Ordering follows the queue's synchronization method:
//!
//! - `None`: an in-order queue already orders local work.
//! - `Events`: every dependency orders the command.
//! - `Barriers`: local dependencies newer than the last barrier force a new
//!   barrier; foreign ones order the command directly.
//!
//! Every dependency is still handed to the queue, so a failed dependency
//! fails the command whatever the method. Local ones are complete by then
//! under `None` and `Barriers`.

use super::delegate_to_core;
use super::queue::DeviceOp;
use super::state::StreamCore;
use super::Stream;
use crate::config::{RuntimeConfig, RuntimeType, SyncMethod};
use crate::device::DevicePtr;
use crate::error::Result;
use crate::event::{Event, EventPtr};
use crate::kernel::{Kernel, KernelArgumentsData, KernelArgumentsDesc};
use std::sync::Arc;

pub struct CommandQueueStream {
    core: StreamCore,
    sync_method: SyncMethod,
}

impl CommandQueueStream {
    pub fn new(device: DevicePtr, config: &RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let sync_method = config.effective_sync_method();
        let core = StreamCore::new(device, config)?;
        tracing::debug!(queue = core.queue_id(), ?sync_method, "command queue stream created");
        Ok(Self { core, sync_method })
    }

    pub fn sync_method(&self) -> SyncMethod {
        self.sync_method
    }

    fn foreign(&self, deps: &[EventPtr]) -> Vec<EventPtr> {
        deps.iter().filter(|e| !self.core.is_local(e)).cloned().collect()
    }

    fn needs_barrier(&self, deps: &[EventPtr]) -> bool {
        let last_barrier = self.core.last_barrier();
        deps.iter()
            .any(|e| self.core.is_local(e) && e.stamp() > last_barrier && !e.is_set())
    }

    /// Dependencies to hand to the queue for a submission after `deps`.
    fn resolve(&mut self, deps: &[EventPtr]) -> Result<Vec<EventPtr>> {
        if self.sync_method == SyncMethod::Barriers && self.needs_barrier(deps) {
            self.core.barrier(Vec::new(), false)?;
        }
        Ok(deps.to_vec())
    }
}

impl Stream for CommandQueueStream {
    fn queue_model(&self) -> RuntimeType {
        RuntimeType::CommandQueue
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
        let deps = self.resolve(deps)?;
        self.core.submit(deps, Some(op), "kernel", is_output)
    }

    fn enqueue_marker(&mut self, deps: &[EventPtr], is_output: bool) -> Result<EventPtr> {
        if deps.is_empty() {
            return self.core.marker(Vec::new(), is_output);
        }
        let resolved = self.resolve(deps)?;
        self.core.submit(resolved, None, "marker", is_output)
    }

    fn group_events(&mut self, deps: &[EventPtr]) -> Result<EventPtr> {
        match deps {
            [] => Ok(self.core.create_user_event(true)),
            [single] => Ok(single.clone()),
            _ => Ok(Arc::new(Event::group(self.core.queue_id(), deps.to_vec()))),
        }
    }

    fn sync_events(&mut self, deps: &[EventPtr], is_output: bool) -> Result<()> {
        match self.sync_method {
            SyncMethod::Barriers => {
                let foreign = self.foreign(deps);
                if self.needs_barrier(deps) || !foreign.is_empty() || is_output {
                    self.core.barrier(foreign, is_output)?;
                }
            }
            SyncMethod::Events | SyncMethod::None => {
                self.core.barrier(deps.to_vec(), is_output)?;
            }
        }
        Ok(())
    }

    fn enqueue_transfer(&mut self, deps: &[EventPtr], op: DeviceOp, label: &'static str) -> Result<EventPtr> {
        let deps = self.resolve(deps)?;
        self.core.submit(deps, Some(op), label, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueType;
    use crate::device::{Device, DeviceInfo};
    use crate::error::RuntimeError;
    use crate::event::{EventKind, EventStatus};
    use parking_lot::Mutex;

    fn stream(queue_type: QueueType, sync_method: Option<SyncMethod>) -> CommandQueueStream {
        let config = RuntimeConfig {
            queue_type,
            sync_method,
            ..RuntimeConfig::default()
        };
        CommandQueueStream::new(Device::new(DeviceInfo::default()), &config).unwrap()
    }

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> DeviceOp {
        let log = log.clone();
        Box::new(move || {
            log.lock().push(value);
            Ok(())
        })
    }

    #[test]
    fn test_in_order_defaults_to_no_sync() {
        let s = stream(QueueType::InOrder, None);
        assert_eq!(s.sync_method(), SyncMethod::None);
        assert_eq!(stream(QueueType::OutOfOrder, None).sync_method(), SyncMethod::Barriers);
    }

    #[test]
    fn test_in_order_transfers_run_in_submission_order() {
        let mut s = stream(QueueType::InOrder, None);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            s.enqueue_transfer(&[], recorder(&log, i), "record").unwrap();
        }
        s.finish().unwrap();
        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_barrier_method_inserts_barrier_for_newer_local_dep() {
        let mut s = stream(QueueType::OutOfOrder, Some(SyncMethod::Barriers));
        let gate = s.create_user_event(false);
        let first = s.enqueue_marker(&[gate.clone()], false).unwrap();
        assert_eq!(s.last_barrier(), 0);

        let log = Arc::new(Mutex::new(Vec::new()));
        let second = s.enqueue_transfer(&[first.clone()], recorder(&log, 1), "after").unwrap();
        assert!(s.last_barrier() > 0);
        assert!(second.stamp() > s.last_barrier());

        gate.set();
        second.wait().unwrap();
        assert!(first.is_set());
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_group_of_one_is_the_event_itself() {
        let mut s = stream(QueueType::InOrder, None);
        let marker = s.enqueue_marker(&[], false).unwrap();
        let group = s.group_events(&[marker.clone()]).unwrap();
        assert!(Arc::ptr_eq(&marker, &group));

        let empty = s.group_events(&[]).unwrap();
        assert!(empty.is_set());
    }

    #[test]
    fn test_sync_events_orders_later_work_after_user_event() {
        let mut s = stream(QueueType::OutOfOrder, Some(SyncMethod::Events));
        let gate = s.create_user_event(false);
        s.sync_events(&[gate.clone()], false).unwrap();
        let after = s.enqueue_marker(&[], false).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!after.is_set());
        gate.set();
        after.wait().unwrap();
    }

    #[test]
    fn test_finish_reports_failed_command() {
        let mut s = stream(QueueType::InOrder, None);
        let fail: DeviceOp = Box::new(|| Err(RuntimeError::unsupported("copy engine")));
        s.enqueue_transfer(&[], fail, "copy").unwrap();
        assert_eq!(s.finish().unwrap_err(), RuntimeError::unsupported("copy engine"));
        assert!(s.finish().is_ok());
    }

    #[test]
    fn test_group_of_many_is_host_side_and_reports_failures() {
        let mut s = stream(QueueType::InOrder, None);
        let fail: DeviceOp = Box::new(|| Err(RuntimeError::unsupported("copy engine")));
        let bad = s.enqueue_transfer(&[], fail, "copy").unwrap();
        let good = s.enqueue_marker(&[], false).unwrap();

        let group = s.group_events(&[bad, good]).unwrap();
        assert_eq!(group.kind(), EventKind::Group);
        assert!(s.wait_for_events(&[group.clone()]).is_err());
        assert!(matches!(group.status(), EventStatus::Failed(_)));
    }

    #[test]
    fn test_failed_local_dependency_fails_in_order_follower() {
        let mut s = stream(QueueType::InOrder, None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let fail: DeviceOp = Box::new(|| Err(RuntimeError::unsupported("copy engine")));
        let bad = s.enqueue_transfer(&[], fail, "copy").unwrap();
        let follower = s.enqueue_transfer(&[bad], recorder(&log, 1), "after").unwrap();
        let unrelated = s.enqueue_transfer(&[], recorder(&log, 2), "unrelated").unwrap();

        assert!(matches!(follower.wait(), Err(RuntimeError::DependencyFailed(_))));
        unrelated.wait().unwrap();
        assert_eq!(*log.lock(), vec![2]);
    }

    #[test]
    fn test_implicit_barrier_does_not_fail_later_work() {
        let mut s = stream(QueueType::OutOfOrder, Some(SyncMethod::Barriers));
        let gate = s.create_user_event(false);
        let fail: DeviceOp = Box::new(|| Err(RuntimeError::unsupported("copy engine")));
        let bad = s.enqueue_transfer(&[gate.clone()], fail, "copy").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let dependent = s.enqueue_transfer(&[bad], recorder(&log, 1), "dependent").unwrap();
        assert!(s.last_barrier() > 0);
        let unrelated = s.enqueue_transfer(&[], recorder(&log, 2), "unrelated").unwrap();
        gate.set();

        assert!(matches!(dependent.wait(), Err(RuntimeError::DependencyFailed(_))));
        unrelated.wait().unwrap();
        assert_eq!(*log.lock(), vec![2]);
    }
}
