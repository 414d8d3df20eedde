// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Connectivity state of a channel and asynchronous fan-out of its
//! transitions to watchers.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use tokio::{runtime::Handle, sync::mpsc};
#[cfg(feature = "tracing")]
use tracing::trace;

/// Lifecycle state of a channel. [`Shutdown`](Self::Shutdown) is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectivityState {
    /// No connection and none being attempted.
    Idle = 0,
    /// A connection attempt is in progress.
    Connecting = 1,
    /// Connected and usable.
    Ready = 2,
    /// The last attempt failed; another may follow.
    TransientFailure = 3,
    /// Closed for good.
    Shutdown = 4,
}

impl ConnectivityState {
    /// Canonical upper-case name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Ready => "READY",
            Self::TransientFailure => "TRANSIENT_FAILURE",
            Self::Shutdown => "SHUTDOWN",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::TransientFailure,
            _ => Self::Shutdown,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives connectivity state changes.
pub trait ConnectivityStateWatcher: Send + Sync + 'static {
    /// Called once per delivered state, never concurrently with itself when
    /// the watcher is bound to a [`WorkSerializer`].
    fn on_connectivity_state_change(&self, new_state: ConnectivityState);
}

type Work = Box<dyn FnOnce() + Send + 'static>;

/// Runs queued work one item at a time, in submission order.
#[derive(Clone)]
pub struct WorkSerializer {
    queue: mpsc::UnboundedSender<Work>,
}

impl WorkSerializer {
    /// Spawn the worker on `handle`.
    #[must_use]
    pub fn new(handle: &Handle) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Work>();
        handle.spawn(async move {
            while let Some(work) = rx.recv().await {
                work();
            }
        });
        Self { queue }
    }

    /// Queue `work`. Returns `false` if the worker is gone (runtime shut
    /// down), in which case `work` is dropped without running.
    pub fn run(&self, work: impl FnOnce() + Send + 'static) -> bool {
        self.queue.send(Box::new(work)).is_ok()
    }
}

impl fmt::Debug for WorkSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkSerializer")
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

/// Identity of a registered watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(usize);

impl WatcherId {
    /// Identity of `watcher`, derived from its allocation.
    #[must_use]
    pub fn of(watcher: &Arc<dyn ConnectivityStateWatcher>) -> Self {
        Self(Arc::as_ptr(watcher).cast::<()>().addr())
    }
}

/// A watcher plus the context its notifications run on.
pub struct AsyncWatcher {
    watcher: Arc<dyn ConnectivityStateWatcher>,
    serializer: Option<WorkSerializer>,
}

impl AsyncWatcher {
    /// Deliver each notification as an independent task.
    #[must_use]
    pub fn new(watcher: Arc<dyn ConnectivityStateWatcher>) -> Self {
        Self {
            watcher,
            serializer: None,
        }
    }

    /// Deliver notifications in order through `serializer`.
    #[must_use]
    pub fn serialized(watcher: Arc<dyn ConnectivityStateWatcher>, serializer: WorkSerializer) -> Self {
        Self {
            watcher,
            serializer: Some(serializer),
        }
    }

    /// Identity used by [`ConnectivityStateTracker::remove_watcher`].
    #[must_use]
    pub fn id(&self) -> WatcherId {
        WatcherId::of(&self.watcher)
    }

    /// Fire-and-forget delivery of `state`. The task keeps the watcher
    /// alive until its handler returns.
    fn notify(&self, state: ConnectivityState, handle: &Handle) {
        let watcher = Arc::clone(&self.watcher);
        let deliver = move || {
            #[cfg(feature = "tracing")]
            trace!(
                watcher = ?WatcherId::of(&watcher),
                state = state.name(),
                "delivering async notification"
            );
            watcher.on_connectivity_state_change(state);
            drop(watcher);
        };
        match &self.serializer {
            Some(serializer) => {
                if !serializer.run(deliver) {
                    #[cfg(feature = "tracing")]
                    trace!(state = state.name(), "serializer closed, notification dropped");
                }
            }
            None => {
                handle.spawn(async move { deliver() });
            }
        }
    }
}

impl fmt::Debug for AsyncWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncWatcher")
            .field("id", &self.id())
            .field("serializer", &self.serializer)
            .finish()
    }
}

/// Lock-free view of a tracker's current state, usable from any thread.
#[derive(Debug, Clone)]
pub struct StateReader {
    state: Arc<AtomicU8>,
}

impl StateReader {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::Relaxed))
    }
}

/// Single authoritative connectivity state of a channel and its watchers.
///
/// Registry mutations take `&mut self` and therefore come from one owner,
/// typically the channel's control plane; [`StateReader`] gives other
/// threads lock-free reads. Notifications never run on the caller's stack.
pub struct ConnectivityStateTracker {
    name: String,
    state: Arc<AtomicU8>,
    watchers: HashMap<WatcherId, AsyncWatcher>,
    handle: Handle,
}

impl ConnectivityStateTracker {
    /// Tracker starting in `initial`; notifications are spawned on `handle`.
    #[must_use]
    pub fn new(name: impl Into<String>, initial: ConnectivityState, handle: Handle) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(AtomicU8::new(initial as u8)),
            watchers: HashMap::new(),
            handle,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        let state = ConnectivityState::from_u8(self.state.load(Ordering::Relaxed));
        #[cfg(feature = "tracing")]
        trace!(tracker = %self.name, state = state.name(), "get current state");
        state
    }

    /// Shareable reader of the current state.
    #[must_use]
    pub fn reader(&self) -> StateReader {
        StateReader {
            state: Arc::clone(&self.state),
        }
    }

    /// Number of registered watchers.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Register `watcher`, which believes the state is `initial_state`.
    ///
    /// If that belief is stale the watcher is told the current state right
    /// away. In [`ConnectivityState::Shutdown`] the watcher is not retained.
    pub fn add_watcher(&mut self, initial_state: ConnectivityState, watcher: AsyncWatcher) -> WatcherId {
        let id = watcher.id();
        #[cfg(feature = "tracing")]
        trace!(tracker = %self.name, watcher = ?id, "add watcher");
        let current = ConnectivityState::from_u8(self.state.load(Ordering::Relaxed));
        if initial_state != current {
            #[cfg(feature = "tracing")]
            trace!(
                tracker = %self.name,
                watcher = ?id,
                "notifying watcher: {} -> {}",
                initial_state,
                current
            );
            watcher.notify(current, &self.handle);
        }
        if current != ConnectivityState::Shutdown {
            self.watchers.insert(id, watcher);
        }
        id
    }

    /// Unregister the watcher with identity `id`; unknown ids are ignored.
    pub fn remove_watcher(&mut self, id: WatcherId) {
        #[cfg(feature = "tracing")]
        trace!(tracker = %self.name, watcher = ?id, "remove watcher");
        self.watchers.remove(&id);
    }

    /// Move to `state` and notify every watcher. No-op if unchanged.
    ///
    /// Entering [`ConnectivityState::Shutdown`] releases all watchers after
    /// notifying them. Shutdown is terminal: later transitions are ignored.
    pub fn set_state(&mut self, state: ConnectivityState, reason: &str) {
        let current = ConnectivityState::from_u8(self.state.load(Ordering::Relaxed));
        if state == current {
            return;
        }
        if current == ConnectivityState::Shutdown {
            #[cfg(feature = "tracing")]
            trace!(tracker = %self.name, reason, "ignoring {} after shutdown", state);
            return;
        }
        #[cfg(feature = "tracing")]
        trace!(tracker = %self.name, reason, "{} -> {}", current, state);
        #[cfg(not(feature = "tracing"))]
        let _ = reason;

        self.state.store(state as u8, Ordering::Relaxed);
        for (_id, watcher) in &self.watchers {
            #[cfg(feature = "tracing")]
            trace!(
                tracker = %self.name,
                watcher = ?_id,
                "notifying watcher: {} -> {}",
                current,
                state
            );
            watcher.notify(state, &self.handle);
        }
        if state == ConnectivityState::Shutdown {
            self.watchers.clear();
        }
    }
}

impl Drop for ConnectivityStateTracker {
    fn drop(&mut self) {
        let current = ConnectivityState::from_u8(self.state.load(Ordering::Relaxed));
        if current == ConnectivityState::Shutdown {
            return;
        }
        for (_id, watcher) in self.watchers.drain() {
            #[cfg(feature = "tracing")]
            trace!(
                tracker = %self.name,
                watcher = ?_id,
                "notifying watcher: {} -> SHUTDOWN",
                current
            );
            watcher.notify(ConnectivityState::Shutdown, &self.handle);
        }
    }
}

impl fmt::Debug for ConnectivityStateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityStateTracker")
            .field("name", &self.name)
            .field("state", &ConnectivityState::from_u8(self.state.load(Ordering::Relaxed)))
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(ConnectivityState::TransientFailure.to_string(), "TRANSIENT_FAILURE");
        for state in [
            ConnectivityState::Idle,
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
            ConnectivityState::TransientFailure,
            ConnectivityState::Shutdown,
        ] {
            assert_eq!(ConnectivityState::from_u8(state as u8), state);
        }
    }
}
