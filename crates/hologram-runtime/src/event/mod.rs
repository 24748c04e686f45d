//! Completion events
//!
//! An [`Event`] tracks one submitted operation (base event), a software
//! signal (user event) or a set of other events (group event). States only
//! move forward: `Pending` to `Signaled` or `Failed`.

mod pool;

pub use pool::{EventPool, PoolStats};

use crate::error::{Result, RuntimeError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared handle to an event
pub type EventPtr = Arc<Event>;

type Handler = Box<dyn FnOnce(&EventStatus) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Completed by a device queue
    Base,
    /// Completed by an explicit [`Event::set`]
    User,
    /// Completed when all member events complete
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Signaled,
    Failed(RuntimeError),
}

impl EventStatus {
    pub fn is_complete(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Slot and generation of a pooled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReuseToken {
    pub slot: u32,
    pub generation: u32,
}

/// Timestamps recorded when profiling is enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingInfo {
    pub queued: Instant,
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
}

impl ProfilingInfo {
    /// Time spent waiting in the queue
    pub fn queue_time(&self) -> Option<Duration> {
        self.started.map(|s| s.duration_since(self.queued))
    }

    /// Time spent executing
    pub fn execution_time(&self) -> Option<Duration> {
        Some(self.finished?.duration_since(self.started?))
    }
}

struct EventState {
    kind: EventKind,
    status: EventStatus,
    stamp: u64,
    token: Option<ReuseToken>,
    handlers: Vec<Handler>,
    profiling: Option<ProfilingInfo>,
}

/// Completion state of one operation or signal
pub struct Event {
    queue_id: u64,
    members: Vec<EventPtr>,
    state: Mutex<EventState>,
    cond: Condvar,
}

impl Event {
    fn with_state(queue_id: u64, members: Vec<EventPtr>, state: EventState) -> Self {
        Self {
            queue_id,
            members,
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    /// Event completed by a device queue command with submission `stamp`.
    pub(crate) fn base(queue_id: u64, stamp: u64, token: Option<ReuseToken>, profiling: bool) -> Self {
        Self::with_state(
            queue_id,
            Vec::new(),
            EventState {
                kind: EventKind::Base,
                status: EventStatus::Pending,
                stamp,
                token,
                handlers: Vec::new(),
                profiling: profiling.then(|| ProfilingInfo {
                    queued: Instant::now(),
                    started: None,
                    finished: None,
                }),
            },
        )
    }

    /// Software-only event, optionally already signaled.
    pub fn user(queue_id: u64, signaled: bool) -> Self {
        Self::with_state(
            queue_id,
            Vec::new(),
            EventState {
                kind: EventKind::User,
                status: if signaled {
                    EventStatus::Signaled
                } else {
                    EventStatus::Pending
                },
                stamp: 0,
                token: None,
                handlers: Vec::new(),
                profiling: None,
            },
        )
    }

    /// Event that completes when every member has completed.
    pub fn group(queue_id: u64, members: Vec<EventPtr>) -> Self {
        let stamp = members.iter().map(|e| e.stamp()).max().unwrap_or(0);
        Self::with_state(
            queue_id,
            members,
            EventState {
                kind: EventKind::Group,
                status: EventStatus::Pending,
                stamp,
                token: None,
                handlers: Vec::new(),
                profiling: None,
            },
        )
    }

    pub fn kind(&self) -> EventKind {
        self.state.lock().kind
    }

    /// Id of the queue that created the event
    pub fn queue_id(&self) -> u64 {
        self.queue_id
    }

    /// Submission counter value at creation; groups carry their newest member's stamp
    pub fn stamp(&self) -> u64 {
        self.state.lock().stamp
    }

    pub fn token(&self) -> Option<ReuseToken> {
        self.state.lock().token
    }

    pub fn members(&self) -> &[EventPtr] {
        &self.members
    }

    pub fn status(&self) -> EventStatus {
        if self.kind() == EventKind::Group {
            return group_status(&self.members);
        }
        self.state.lock().status.clone()
    }

    /// Whether the event has reached a terminal state
    pub fn is_set(&self) -> bool {
        self.status().is_complete()
    }

    /// Completed without error
    pub fn is_signaled(&self) -> bool {
        self.status() == EventStatus::Signaled
    }

    /// Block until the event completes.
    ///
    /// A group waits for every member and fails if any member failed.
    pub fn wait(&self) -> Result<()> {
        if self.kind() == EventKind::Group {
            let mut first_error = None;
            for member in &self.members {
                if let Err(err) = member.wait() {
                    first_error.get_or_insert(err);
                }
            }
            return first_error.map_or(Ok(()), Err);
        }

        let mut state = self.state.lock();
        while state.status == EventStatus::Pending {
            self.cond.wait(&mut state);
        }
        match &state.status {
            EventStatus::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Signal a user event.
    pub fn set(&self) {
        self.complete(Ok(()));
    }

    /// Complete the event in the failed state.
    pub fn set_error(&self, err: RuntimeError) {
        self.complete(Err(err));
    }

    /// Move a pending event to its terminal state and run its handlers.
    ///
    /// Returns false if the event had already completed or is a group.
    pub(crate) fn complete(&self, result: Result<()>) -> bool {
        let (status, handlers) = {
            let mut state = self.state.lock();
            if state.kind == EventKind::Group {
                tracing::warn!(queue = self.queue_id, "group events complete through their members");
                return false;
            }
            if state.status.is_complete() {
                return false;
            }
            state.status = match result {
                Ok(()) => EventStatus::Signaled,
                Err(err) => EventStatus::Failed(err),
            };
            if let Some(profiling) = state.profiling.as_mut() {
                profiling.finished = Some(Instant::now());
            }
            (state.status.clone(), std::mem::take(&mut state.handlers))
        };

        self.cond.notify_all();
        for handler in handlers {
            handler(&status);
        }
        true
    }

    pub(crate) fn mark_started(&self) {
        if let Some(profiling) = self.state.lock().profiling.as_mut() {
            profiling.started = Some(Instant::now());
        }
    }

    /// Run `handler` once the event completes; immediately if it already has.
    pub fn add_handler(&self, handler: impl FnOnce(&EventStatus) + Send + 'static) {
        if self.kind() == EventKind::Group {
            self.add_group_handler(Box::new(handler));
            return;
        }

        let mut state = self.state.lock();
        if state.status.is_complete() {
            let status = state.status.clone();
            drop(state);
            handler(&status);
        } else {
            state.handlers.push(Box::new(handler));
        }
    }

    fn add_group_handler(&self, handler: Handler) {
        if self.members.is_empty() {
            handler(&EventStatus::Signaled);
            return;
        }

        let remaining = Arc::new(AtomicUsize::new(self.members.len()));
        let handler = Arc::new(Mutex::new(Some(handler)));
        let members = self.members.clone();
        for member in &self.members {
            let remaining = remaining.clone();
            let handler = handler.clone();
            let members = members.clone();
            member.add_handler(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(handler) = handler.lock().take() {
                        handler(&group_status(&members));
                    }
                }
            });
        }
    }

    /// Profiling timestamps, if the event was created with profiling enabled
    pub fn profiling_info(&self) -> Option<ProfilingInfo> {
        self.state.lock().profiling
    }

    /// Re-arm a pooled event for a new submission.
    pub(crate) fn reset(&self, stamp: u64, profiling: bool) {
        let mut state = self.state.lock();
        state.kind = EventKind::Base;
        state.status = EventStatus::Pending;
        state.stamp = stamp;
        state.handlers.clear();
        state.profiling = profiling.then(|| ProfilingInfo {
            queued: Instant::now(),
            started: None,
            finished: None,
        });
        if let Some(token) = state.token.as_mut() {
            token.generation = token.generation.wrapping_add(1);
        }
    }
}

fn group_status(members: &[EventPtr]) -> EventStatus {
    let mut failure = None;
    for member in members {
        match member.status() {
            EventStatus::Pending => return EventStatus::Pending,
            EventStatus::Failed(err) => {
                failure.get_or_insert(err);
            }
            EventStatus::Signaled => {}
        }
    }
    failure.map_or(EventStatus::Signaled, EventStatus::Failed)
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Event")
            .field("queue_id", &self.queue_id)
            .field("kind", &state.kind)
            .field("stamp", &state.stamp)
            .field("status", &state.status)
            .field("members", &self.members.len())
            .finish()
    }
}
