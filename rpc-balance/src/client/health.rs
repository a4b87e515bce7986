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

//! Out-of-band health checking bound to a subchannel.
//!
//! A [`HealthProducer`] attaches to a subchannel as its health data
//! producer.  For each service name with at least one watcher it runs a
//! [`HealthChecker`]: whenever the subchannel is Ready, the checker holds a
//! streaming watch call against the backend's health service and folds the
//! responses into the connectivity state its watchers observe.  Watchers
//! registered without a service name see the subchannel's raw state.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::client::backoff::Backoff;

use tokio_stream::StreamExt;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::client::connectivity::{ConnectivityStateTracker, StateWatcher};
use crate::client::subchannel::{DataProducer, InternalSubchannel};
use crate::client::work_serializer::WorkSerializer;
use crate::client::{ConnectivityState, SubchannelState};
use crate::rt::{Runtime, TaskHandle};
use crate::service::{Message, Request, Service};
use crate::client::backoff::ExponentialBackoff;

/// The method of the standard health protocol's streaming watch call.
pub static HEALTH_WATCH_METHOD: &str = "/grpc.health.v1.Health/Watch";

/// Request message of the health watch call: the service to report on.
#[derive(Debug, Clone)]
pub struct HealthCheckRequest {
    pub service: String,
}

impl Message for HealthCheckRequest {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
    ServiceUnknown,
}

/// Response message of the health watch call.
#[derive(Debug, Clone)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

impl Message for HealthCheckResponse {}

/// Registers `watcher` for health-derived connectivity state of
/// `subchannel`.  With a service name, the state is derived from the health
/// protocol; without one, the raw subchannel state is forwarded.  The
/// returned producer is the handle for cancelling the watch.
pub fn watch_health(
    subchannel: &Arc<InternalSubchannel>,
    service_name: Option<String>,
    watcher: Arc<dyn StateWatcher>,
) -> Arc<HealthProducer> {
    let producer = HealthProducer::attach(subchannel);
    producer.add_watcher(service_name, watcher);
    producer
}

/// The per-subchannel owner of health checking state.  All health watchers
/// of one subchannel share a single producer through the subchannel's
/// data-producer slot.
pub struct HealthProducer {
    subchannel: Weak<InternalSubchannel>,
    runtime: Arc<dyn Runtime>,
    serializer: Arc<WorkSerializer>,
    inner: Mutex<ProducerInner>,
}

struct ProducerInner {
    /// Raw subchannel state, as last reported.
    raw: SubchannelState,
    /// Snapshot of the connected transport while the subchannel is Ready.
    connected: Option<Arc<Box<dyn Service>>>,
    /// One checker per service name with at least one watcher.
    checkers: HashMap<String, Arc<HealthChecker>>,
    /// Watchers without a service name: they see the raw state.
    raw_watchers: Vec<Arc<dyn StateWatcher>>,
    /// The watcher this producer registered on the subchannel, kept for
    /// cancellation on drop.
    subchannel_watcher: Option<Arc<dyn StateWatcher>>,
}

impl DataProducer for HealthProducer {}

struct ProducerStateWatcher {
    producer: Weak<HealthProducer>,
}

impl StateWatcher for ProducerStateWatcher {
    fn on_state_change(&self, state: SubchannelState) {
        if let Some(producer) = self.producer.upgrade() {
            producer.on_subchannel_state(state);
        }
    }
}

impl HealthProducer {
    /// Returns the subchannel's health producer, creating and wiring it on
    /// first use.
    pub fn attach(subchannel: &Arc<InternalSubchannel>) -> Arc<HealthProducer> {
        let (producer, created) = subchannel.get_or_add_data_producer(|| {
            Arc::new(HealthProducer {
                subchannel: Arc::downgrade(subchannel),
                runtime: subchannel.runtime(),
                serializer: subchannel.serializer(),
                inner: Mutex::new(ProducerInner {
                    raw: SubchannelState::default(),
                    connected: None,
                    checkers: HashMap::new(),
                    raw_watchers: Vec::new(),
                    subchannel_watcher: None,
                }),
            })
        });
        if created {
            let watcher: Arc<dyn StateWatcher> = Arc::new(ProducerStateWatcher {
                producer: Arc::downgrade(&producer),
            });
            producer.inner.lock().unwrap().subchannel_watcher = Some(watcher.clone());
            subchannel.watch_connectivity_state(watcher);
        }
        producer
    }

    /// Adds a watcher.  `service_name` selects the health checker to derive
    /// state from; `None` forwards the raw subchannel state.  The current
    /// state is delivered immediately.
    pub fn add_watcher(self: &Arc<Self>, service_name: Option<String>, watcher: Arc<dyn StateWatcher>) {
        match service_name {
            None => {
                let state = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.raw_watchers.push(watcher.clone());
                    inner.raw.clone()
                };
                self.serializer.schedule(move || watcher.on_state_change(state));
                self.serializer.drain_queue();
            }
            Some(name) => {
                let (checker, seed) = {
                    let mut inner = self.inner.lock().unwrap();
                    match inner.checkers.get(&name) {
                        Some(checker) => (checker.clone(), None),
                        None => {
                            let checker = Arc::new(HealthChecker::new(
                                name.clone(),
                                Arc::downgrade(self),
                                self.runtime.clone(),
                                self.serializer.clone(),
                            ));
                            inner.checkers.insert(name, checker.clone());
                            (checker, Some((inner.raw.clone(), inner.connected.clone())))
                        }
                    }
                };
                // A fresh checker catches up with the subchannel first, so
                // the watcher's immediate delivery sees derived state.
                if let Some((raw, connected)) = seed {
                    checker.on_subchannel_state(&raw, connected);
                }
                checker.add_watcher(watcher);
            }
        }
    }

    /// Removes a watcher.  Dropping the last watcher of a service name
    /// stops and discards its checker.
    pub fn remove_watcher(&self, service_name: Option<&str>, watcher: &Arc<dyn StateWatcher>) {
        match service_name {
            None => {
                let mut inner = self.inner.lock().unwrap();
                inner.raw_watchers.retain(|w| !Arc::ptr_eq(w, watcher));
            }
            Some(name) => {
                let removed = {
                    let mut inner = self.inner.lock().unwrap();
                    let Some(checker) = inner.checkers.get(name) else {
                        return;
                    };
                    if !checker.remove_watcher(watcher) {
                        return;
                    }
                    inner.checkers.remove(name)
                };
                if let Some(checker) = removed {
                    checker.stop();
                }
            }
        }
    }

    pub(crate) fn connected_service(&self) -> Option<Arc<Box<dyn Service>>> {
        self.inner.lock().unwrap().connected.clone()
    }

    fn on_subchannel_state(self: &Arc<Self>, state: SubchannelState) {
        let (checkers, raw_watchers, connected) = {
            let mut inner = self.inner.lock().unwrap();
            inner.raw = state.clone();
            inner.connected = if state.connectivity_state == ConnectivityState::Ready {
                self.subchannel
                    .upgrade()
                    .and_then(|sc| sc.connected_service())
            } else {
                None
            };
            (
                inner.checkers.values().cloned().collect::<Vec<_>>(),
                inner.raw_watchers.clone(),
                inner.connected.clone(),
            )
        };
        for watcher in raw_watchers {
            let state = state.clone();
            self.serializer
                .schedule(move || watcher.on_state_change(state));
        }
        for checker in checkers {
            checker.on_subchannel_state(&state, connected.clone());
        }
        self.serializer.drain_queue();
    }
}

impl Drop for HealthProducer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for checker in inner.checkers.values() {
            checker.stop();
        }
        if let (Some(subchannel), Some(watcher)) =
            (self.subchannel.upgrade(), inner.subchannel_watcher.take())
        {
            subchannel.cancel_connectivity_state_watch(&watcher);
        }
    }
}

/// Runs the streaming health watch for one `(subchannel, service name)`
/// pair and derives the state its watchers observe:
///
/// - subchannel not Ready: the raw state is forwarded;
/// - subchannel newly Ready: Connecting, until the first response arrives;
/// - response `SERVING`: Ready;
/// - response not `SERVING`, or undecodable: TransientFailure;
/// - call refused with UNIMPLEMENTED: health checking is disabled for this
///   subchannel and Ready is reported;
/// - call ending any other way while the subchannel is still Ready:
///   TransientFailure, retried on the checker's own backoff schedule
///   (independent of the subchannel's).
pub struct HealthChecker {
    service_name: String,
    producer: Weak<HealthProducer>,
    runtime: Arc<dyn Runtime>,
    serializer: Arc<WorkSerializer>,
    backoff: ExponentialBackoff,
    inner: Mutex<CheckerInner>,
}

struct CheckerInner {
    tracker: ConnectivityStateTracker,
    stream_task: Option<Box<dyn TaskHandle>>,
    retry_task: Option<Box<dyn TaskHandle>>,
    /// True while the subchannel is Ready.
    subchannel_ready: bool,
    /// Set when the backend answered the watch call with UNIMPLEMENTED; the
    /// checker then reports Ready and stops health checking.
    disabled: bool,
    /// Incremented whenever the subchannel's raw state changes; stream and
    /// timer callbacks from a previous epoch are ignored.
    epoch: u64,
}

impl HealthChecker {
    fn new(
        service_name: String,
        producer: Weak<HealthProducer>,
        runtime: Arc<dyn Runtime>,
        serializer: Arc<WorkSerializer>,
    ) -> Self {
        Self {
            service_name,
            producer,
            runtime,
            serializer,
            backoff: ExponentialBackoff::default(),
            inner: Mutex::new(CheckerInner {
                tracker: ConnectivityStateTracker::new(SubchannelState::default()),
                stream_task: None,
                retry_task: None,
                subchannel_ready: false,
                disabled: false,
                epoch: 0,
            }),
        }
    }

    fn add_watcher(self: &Arc<Self>, watcher: Arc<dyn StateWatcher>) {
        let notification = self.inner.lock().unwrap().tracker.add_watcher(watcher);
        self.serializer.schedule(move || notification.deliver());
        self.serializer.drain_queue();
    }

    /// Returns true when the last watcher was removed.
    fn remove_watcher(&self, watcher: &Arc<dyn StateWatcher>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.tracker.remove_watcher(watcher);
        !inner.tracker.has_watchers()
    }

    fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.epoch += 1;
        if let Some(task) = inner.stream_task.take() {
            task.abort();
        }
        if let Some(task) = inner.retry_task.take() {
            task.abort();
        }
    }

    fn on_subchannel_state(
        self: &Arc<Self>,
        raw: &SubchannelState,
        connected: Option<Arc<Box<dyn Service>>>,
    ) {
        let start = {
            let mut inner = self.inner.lock().unwrap();
            inner.epoch += 1;
            if let Some(task) = inner.stream_task.take() {
                task.abort();
            }
            if let Some(task) = inner.retry_task.take() {
                task.abort();
            }
            if raw.connectivity_state == ConnectivityState::Ready {
                inner.subchannel_ready = true;
                if inner.disabled {
                    self.set_state_locked(&mut inner, SubchannelState::new(ConnectivityState::Ready));
                    None
                } else {
                    // Hold the watchers at Connecting until the backend
                    // reports on the stream.
                    self.set_state_locked(
                        &mut inner,
                        SubchannelState::new(ConnectivityState::Connecting),
                    );
                    connected.map(|service| (inner.epoch, service))
                }
            } else {
                inner.subchannel_ready = false;
                self.backoff.reset();
                self.set_state_locked(&mut inner, raw.clone());
                None
            }
        };
        self.serializer.drain_queue();
        if let Some((epoch, service)) = start {
            self.start_stream(epoch, service);
        }
    }

    // Schedules watcher notifications; the caller drains after unlocking.
    fn set_state_locked(&self, inner: &mut CheckerInner, state: SubchannelState) {
        for notification in inner.tracker.set(state) {
            self.serializer.schedule(move || notification.deliver());
        }
    }

    fn set_state(&self, state: SubchannelState) {
        {
            let mut inner = self.inner.lock().unwrap();
            self.set_state_locked(&mut inner, state);
        }
        self.serializer.drain_queue();
    }

    fn start_stream(self: &Arc<Self>, epoch: u64, service: Arc<Box<dyn Service>>) {
        debug!(
            "health checker for \"{}\": starting watch stream",
            self.service_name
        );
        let weak = Arc::downgrade(self);
        let service_name = self.service_name.clone();
        let task = self.runtime.spawn(Box::pin(async move {
            let request = Request::new(Box::pin(tokio_stream::once(Box::new(HealthCheckRequest {
                service: service_name,
            })
                as Box<dyn Message>)));
            let response = service.call(HEALTH_WATCH_METHOD.to_string(), request).await;
            let mut stream = response.into_inner();
            loop {
                let item = stream.next().await;
                let Some(checker) = weak.upgrade() else {
                    return;
                };
                match item {
                    Some(Ok(message)) => checker.on_stream_message(epoch, message),
                    Some(Err(status)) => {
                        checker.on_stream_closed(epoch, Some(status));
                        return;
                    }
                    None => {
                        checker.on_stream_closed(epoch, None);
                        return;
                    }
                }
            }
        }));
        let mut inner = self.inner.lock().unwrap();
        if inner.epoch == epoch {
            inner.stream_task = Some(task);
        } else {
            task.abort();
        }
    }

    fn on_stream_message(self: &Arc<Self>, epoch: u64, message: Box<dyn Message>) {
        if !self.epoch_is_current(epoch) {
            return;
        }
        let any: Box<dyn Any> = message;
        let state = match any.downcast::<HealthCheckResponse>() {
            Ok(response) if response.status == ServingStatus::Serving => {
                SubchannelState::new(ConnectivityState::Ready)
            }
            Ok(response) => SubchannelState::with_error(
                ConnectivityState::TransientFailure,
                format!("backend unhealthy (status {:?})", response.status),
            ),
            Err(_) => SubchannelState::with_error(
                ConnectivityState::TransientFailure,
                "cannot parse health check response".to_string(),
            ),
        };
        self.set_state(state);
    }

    fn on_stream_closed(self: &Arc<Self>, epoch: u64, status: Option<Status>) {
        if !self.epoch_is_current(epoch) {
            return;
        }
        if let Some(status) = &status {
            if status.code() == Code::Unimplemented {
                // The backend does not implement the health protocol.
                warn!(
                    "health checking watch for \"{}\" returned UNIMPLEMENTED; \
                     disabling health checks and assuming the server is healthy",
                    self.service_name
                );
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.disabled = true;
                    inner.stream_task = None;
                    self.set_state_locked(&mut inner, SubchannelState::new(ConnectivityState::Ready));
                }
                self.serializer.drain_queue();
                return;
            }
        }

        // The stream broke while the subchannel may still be Ready: report
        // the failure and retry on this checker's own schedule.
        let retry = {
            let mut inner = self.inner.lock().unwrap();
            if inner.epoch != epoch || !inner.subchannel_ready {
                return;
            }
            inner.stream_task = None;
            let message = match status {
                Some(status) => format!("health check call failed: {status}"),
                None => "health check stream ended unexpectedly".to_string(),
            };
            self.set_state_locked(
                &mut inner,
                SubchannelState::with_error(ConnectivityState::TransientFailure, message),
            );
            let delay = self.backoff.backoff_duration();
            let weak = Arc::downgrade(self);
            let sleep = self.runtime.sleep(delay);
            let task = self.runtime.spawn(Box::pin(async move {
                sleep.await;
                if let Some(checker) = weak.upgrade() {
                    checker.on_retry_timer(epoch);
                }
            }));
            inner.retry_task = Some(task);
            true
        };
        if retry {
            self.serializer.drain_queue();
        }
    }

    fn on_retry_timer(self: &Arc<Self>, epoch: u64) {
        let start = {
            let mut inner = self.inner.lock().unwrap();
            if inner.epoch != epoch || !inner.subchannel_ready || inner.disabled {
                return;
            }
            inner.retry_task = None;
            self.set_state_locked(
                &mut inner,
                SubchannelState::new(ConnectivityState::Connecting),
            );
            inner.epoch
        };
        self.serializer.drain_queue();
        let connected = self
            .producer
            .upgrade()
            .and_then(|producer| producer.connected_service());
        if let Some(service) = connected {
            self.start_stream(start, service);
        }
    }

    fn epoch_is_current(&self, epoch: u64) -> bool {
        self.inner.lock().unwrap().epoch == epoch
    }
}
