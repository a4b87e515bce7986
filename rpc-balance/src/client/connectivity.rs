/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::sync::Arc;

use crate::client::{ConnectivityState, SubchannelState};

/// Receives connectivity state transitions from a subchannel, a health
/// checker, or anything else owning a [`ConnectivityStateTracker`].
///
/// Notifications are delivered off the owner's lock, on its work serializer;
/// a watcher may re-enter the owner (including cancelling itself) from
/// within a notification.  A watcher that has been cancelled must tolerate
/// notifications that were already in flight at cancellation time.
pub trait StateWatcher: Send + Sync {
    fn on_state_change(&self, state: SubchannelState);
}

/// A pending delivery produced by the tracker while its owner's lock was
/// held.  The owner schedules these on its work serializer after unlocking.
pub(crate) struct Notification {
    watcher: Arc<dyn StateWatcher>,
    state: SubchannelState,
}

impl Notification {
    pub(crate) fn deliver(self) {
        self.watcher.on_state_change(self.state);
    }
}

/// Tracks a connectivity state plus its registered watchers.
///
/// Watchers are notified in registration order, exactly once per transition.
/// The state is monotonic to Shutdown: once Shutdown has been set no further
/// transitions are recorded or notified.
pub(crate) struct ConnectivityStateTracker {
    state: SubchannelState,
    watchers: Vec<Arc<dyn StateWatcher>>,
}

impl ConnectivityStateTracker {
    pub(crate) fn new(initial: SubchannelState) -> Self {
        Self {
            state: initial,
            watchers: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        self.state.connectivity_state
    }

    /// Records a transition and returns the notifications to deliver.
    /// Same-state sets and sets after Shutdown produce nothing.
    #[must_use]
    pub(crate) fn set(&mut self, next: SubchannelState) -> Vec<Notification> {
        if self.state.connectivity_state == ConnectivityState::Shutdown {
            return Vec::new();
        }
        if self.state.connectivity_state == next.connectivity_state {
            return Vec::new();
        }
        self.state = next;
        self.watchers
            .iter()
            .map(|w| Notification {
                watcher: w.clone(),
                state: self.state.clone(),
            })
            .collect()
    }

    /// Registers a watcher and returns the immediate delivery of the current
    /// state.
    #[must_use]
    pub(crate) fn add_watcher(&mut self, watcher: Arc<dyn StateWatcher>) -> Notification {
        self.watchers.push(watcher.clone());
        Notification {
            watcher,
            state: self.state.clone(),
        }
    }

    /// Removes a watcher.  Idempotent; unknown watchers are ignored.
    pub(crate) fn remove_watcher(&mut self, watcher: &Arc<dyn StateWatcher>) {
        self.watchers.retain(|w| !Arc::ptr_eq(w, watcher));
    }

    pub(crate) fn has_watchers(&self) -> bool {
        !self.watchers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingWatcher {
        seen: Mutex<Vec<ConnectivityState>>,
    }

    impl StateWatcher for RecordingWatcher {
        fn on_state_change(&self, state: SubchannelState) {
            self.seen.lock().unwrap().push(state.connectivity_state);
        }
    }

    fn deliver(notifications: Vec<Notification>) {
        for n in notifications {
            n.deliver();
        }
    }

    #[test]
    fn watchers_see_transitions_in_order() {
        let mut tracker = ConnectivityStateTracker::new(SubchannelState::default());
        let watcher = Arc::new(RecordingWatcher::default());
        let initial = tracker.add_watcher(watcher.clone());
        initial.deliver();

        deliver(tracker.set(SubchannelState::new(ConnectivityState::Connecting)));
        deliver(tracker.set(SubchannelState::new(ConnectivityState::Ready)));
        deliver(tracker.set(SubchannelState::new(ConnectivityState::Idle)));

        assert_eq!(
            *watcher.seen.lock().unwrap(),
            vec![
                ConnectivityState::Idle,
                ConnectivityState::Connecting,
                ConnectivityState::Ready,
                ConnectivityState::Idle,
            ]
        );
    }

    #[test]
    fn same_state_set_is_not_notified() {
        let mut tracker = ConnectivityStateTracker::new(SubchannelState::default());
        let watcher = Arc::new(RecordingWatcher::default());
        let _ = tracker.add_watcher(watcher.clone());

        assert!(tracker.set(SubchannelState::default()).is_empty());
        assert!(watcher.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn shutdown_is_terminal() {
        let mut tracker = ConnectivityStateTracker::new(SubchannelState::default());
        let watcher = Arc::new(RecordingWatcher::default());
        let _ = tracker.add_watcher(watcher.clone());

        deliver(tracker.set(SubchannelState::new(ConnectivityState::Shutdown)));
        assert!(
            tracker
                .set(SubchannelState::new(ConnectivityState::Connecting))
                .is_empty()
        );
        assert!(
            tracker
                .set(SubchannelState::new(ConnectivityState::Ready))
                .is_empty()
        );

        assert_eq!(
            *watcher.seen.lock().unwrap(),
            vec![ConnectivityState::Shutdown]
        );
    }

    #[test]
    fn remove_watcher_is_idempotent() {
        let mut tracker = ConnectivityStateTracker::new(SubchannelState::default());
        let watcher: Arc<dyn StateWatcher> = Arc::new(RecordingWatcher::default());
        let _ = tracker.add_watcher(watcher.clone());

        tracker.remove_watcher(&watcher);
        tracker.remove_watcher(&watcher);
        assert!(!tracker.has_watchers());

        assert!(
            tracker
                .set(SubchannelState::new(ConnectivityState::Connecting))
                .is_empty()
        );
    }
}
