//! State shared by both stream variants
//!
//! Holds the submission counter, barrier tracking, output events, the event
//! pool and staged host memory. Not internally synchronized; the owning
//! stream is driven through `&mut self`.

use super::queue::{Dependencies, DeviceOp, DeviceQueue};
use crate::config::RuntimeConfig;
use crate::device::DevicePtr;
use crate::error::Result;
use crate::event::{Event, EventKind, EventPool, EventPtr, PoolStats};
use crate::kernel::{BoundArguments, Kernel, KernelArgumentsData, KernelArgumentsDesc};
use hologram_tracing::performance::record_queue_wait;
use hologram_tracing::{perf_event, perf_span};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Completed entries are dropped from the since-barrier list past this length
const SINCE_BARRIER_PRUNE: usize = 64;

/// Submissions between opportunistic event pool reclaims
const RECLAIM_INTERVAL: u64 = 32;

pub(crate) struct StreamCore {
    device: DevicePtr,
    queue: Arc<DeviceQueue>,
    pool: EventPool,
    queue_counter: u64,
    last_barrier: u64,
    last_barrier_ev: Option<EventPtr>,
    since_barrier: Vec<EventPtr>,
    output_events: Vec<EventPtr>,
    output_event_default: bool,
    pending_memory: Vec<Arc<[u8]>>,
    bound: HashMap<String, BoundArguments>,
}

/// Signaled and referenced only by the pool
fn reusable(event: &EventPtr) -> bool {
    event.is_set() && Arc::strong_count(event) == 1
}

impl StreamCore {
    pub fn new(device: DevicePtr, config: &RuntimeConfig) -> Result<Self> {
        let queue = Arc::new(DeviceQueue::new(config.queue_type, config.queue_workers())?);
        let pool = EventPool::new(queue.id(), config.event_pool_capacity, config.enable_profiling);
        Ok(Self {
            device,
            queue,
            pool,
            queue_counter: 0,
            last_barrier: 0,
            last_barrier_ev: None,
            since_barrier: Vec::new(),
            output_events: Vec::new(),
            output_event_default: false,
            pending_memory: Vec::new(),
            bound: HashMap::new(),
        })
    }

    pub fn device(&self) -> &DevicePtr {
        &self.device
    }

    pub fn queue(&self) -> &Arc<DeviceQueue> {
        &self.queue
    }

    pub fn queue_id(&self) -> u64 {
        self.queue.id()
    }

    pub fn last_barrier(&self) -> u64 {
        self.last_barrier
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Whether `event` is a command of this stream's own queue
    pub fn is_local(&self, event: &EventPtr) -> bool {
        event.queue_id() == self.queue_id() && event.kind() == EventKind::Base
    }

    fn next_stamp(&mut self) -> u64 {
        self.queue_counter += 1;
        self.queue_counter
    }

    fn acquire_event(&mut self, stamp: u64) -> EventPtr {
        if stamp % RECLAIM_INTERVAL == 0 {
            let reclaimed = self.pool.recycle_where(reusable);
            if reclaimed > 0 {
                perf_event!("event_pool_reclaim", queue = self.queue_id(), reclaimed = reclaimed);
            }
        }
        self.pool.acquire(stamp)
    }

    fn track(&mut self, event: &EventPtr, is_output: bool) {
        if self.since_barrier.len() >= SINCE_BARRIER_PRUNE {
            self.since_barrier.retain(|e| !e.is_set());
        }
        self.since_barrier.push(event.clone());
        if is_output || self.output_event_default {
            self.output_events.push(event.clone());
        }
    }

    /// Submit one command after `deps`, ordered after the last barrier.
    ///
    /// A failed entry of `deps` fails the command; the barrier only orders it.
    pub fn submit(
        &mut self,
        deps: Vec<EventPtr>,
        op: Option<DeviceOp>,
        label: &'static str,
        is_output: bool,
    ) -> Result<EventPtr> {
        let mut deps = Dependencies::new(deps);
        self.push_barrier(&mut deps);
        self.enqueue(deps, op, label, is_output)
    }

    fn push_barrier(&self, deps: &mut Dependencies) {
        if let Some(barrier) = &self.last_barrier_ev {
            if !deps.deps.iter().any(|d| Arc::ptr_eq(d, barrier)) {
                deps.after.push(barrier.clone());
            }
        }
    }

    fn enqueue(
        &mut self,
        deps: Dependencies,
        op: Option<DeviceOp>,
        label: &'static str,
        is_output: bool,
    ) -> Result<EventPtr> {
        let stamp = self.next_stamp();
        let event = self.acquire_event(stamp);
        self.queue.submit(event.clone(), deps, op, label)?;
        self.track(&event, is_output);
        Ok(event)
    }

    /// Marker over `deps`, or a completion point for everything since the
    /// last barrier when empty.
    pub fn marker(&mut self, deps: Vec<EventPtr>, is_output: bool) -> Result<EventPtr> {
        if !deps.is_empty() {
            return self.submit(deps, None, "marker", is_output);
        }
        let pending = self.since_barrier.iter().filter(|e| !e.is_set()).cloned().collect();
        let mut deps = Dependencies::ordering(pending);
        self.push_barrier(&mut deps);
        self.enqueue(deps, None, "marker", is_output)
    }

    /// Join point over everything since the previous barrier, the previous
    /// barrier itself and `extra`.
    ///
    /// Barriers only order work. A failed command before the barrier fails
    /// its own dependents and shows up in `finish`, never in later work.
    pub fn barrier(&mut self, extra: Vec<EventPtr>, is_output: bool) -> Result<EventPtr> {
        let mut after: Vec<EventPtr> = std::mem::take(&mut self.since_barrier)
            .into_iter()
            .filter(|e| !e.is_set())
            .collect();
        after.extend(extra);
        if let Some(previous) = self.last_barrier_ev.take() {
            after.push(previous);
        }

        let stamp = self.next_stamp();
        let event = self.acquire_event(stamp);
        self.queue.submit(event.clone(), Dependencies::ordering(after), None, "barrier")?;

        self.last_barrier = stamp;
        self.last_barrier_ev = Some(event.clone());
        if is_output || self.output_event_default {
            self.output_events.push(event.clone());
        }
        perf_event!("barrier", queue = self.queue_id(), stamp = stamp);
        Ok(event)
    }

    pub fn create_user_event(&self, signaled: bool) -> EventPtr {
        Arc::new(Event::user(self.queue_id(), signaled))
    }

    pub fn set_output_default(&mut self, enabled: bool) {
        self.output_event_default = enabled;
    }

    // ============================================================================================
    // Kernels
    // ============================================================================================

    pub fn bind(&mut self, kernel: &Kernel, desc: &KernelArgumentsDesc, args: &KernelArgumentsData) -> Result<()> {
        let bound = BoundArguments::bind(&self.device, desc, args)?;
        self.bound.insert(kernel.name().to_string(), bound);
        Ok(())
    }

    /// Operation running `kernel` with arguments bound by `bind`, or bound now from `args`.
    pub fn kernel_op(
        &mut self,
        kernel: &Kernel,
        desc: &KernelArgumentsDesc,
        args: &KernelArgumentsData,
    ) -> Result<DeviceOp> {
        let bound = match self.bound.remove(kernel.name()) {
            Some(bound) => bound,
            None => BoundArguments::bind(&self.device, desc, args)?,
        };
        let kernel = kernel.clone();
        Ok(Box::new(move || {
            let _span = perf_span!("kernel", kernel = kernel.name());
            bound.execute(&kernel)
        }))
    }

    // ============================================================================================
    // Waiting
    // ============================================================================================

    /// Wait for every event; the first failure is returned after all have completed.
    pub fn wait_events(&self, events: &[EventPtr]) -> Result<()> {
        let start = Instant::now();
        let mut first_error = None;
        for event in events {
            if let Err(err) = event.wait() {
                first_error.get_or_insert(err);
            }
        }
        record_queue_wait(self.queue_id(), events.len(), start.elapsed().as_micros() as u64);
        first_error.map_or(Ok(()), Err)
    }

    /// Wait for the output events, or for the whole queue if none were marked.
    ///
    /// Waiting for the whole queue reports the first command failure since
    /// the previous such wait.
    pub fn finish(&mut self) -> Result<()> {
        if !self.output_events.is_empty() {
            let outputs = std::mem::take(&mut self.output_events);
            return self.wait_events(&outputs);
        }

        self.queue.wait_idle();
        self.since_barrier.retain(|e| !e.is_set());
        self.queue.take_failure().map_or(Ok(()), Err)
    }

    // ============================================================================================
    // Resource release
    // ============================================================================================

    pub fn reset_events(&mut self) {
        self.output_events.clear();
        self.since_barrier.retain(|e| !e.is_set());
        let (recycled, orphaned) = self.pool.reset(reusable);
        tracing::debug!(queue = self.queue_id(), recycled, orphaned, "event pool reset");
    }

    pub fn release_events_pool(&mut self) {
        let referenced = self.pool.referenced();
        if referenced > 0 {
            tracing::warn!(queue = self.queue_id(), referenced, "releasing event pool with referenced events");
        }
        self.pool.release();
    }

    pub fn park_staging(&mut self, data: Arc<[u8]>) {
        self.pending_memory.push(data);
    }

    /// Drop staged host buffers; returns the bytes released.
    pub fn release_pending_memory(&mut self) -> usize {
        let bytes = self.pending_memory.iter().map(|b| b.len()).sum();
        self.pending_memory.clear();
        if bytes > 0 {
            tracing::debug!(queue = self.queue_id(), bytes, "released pending host memory");
        }
        bytes
    }
}
