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

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Display};
use std::sync::{Arc, LazyLock, Mutex, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio::sync::mpsc;
use tonic::{Status, async_trait};
use tracing::{debug, trace};

use crate::client::args::{ChannelArgs, KeyArgs};
use crate::client::backoff::Backoff;
use crate::client::connectivity::{ConnectivityStateTracker, Notification, StateWatcher};
use crate::client::load_balancing::Subchannel;
use crate::client::name_resolution::Address;
use crate::client::transport::{ConnectOptions, ConnectedTransport, Connector};
use crate::client::work_serializer::WorkSerializer;
use crate::client::{ConnectivityState, SubchannelState};
use crate::rt::{Runtime, TaskHandle};
use crate::service::{Request, Response, Service, response_from_status};

/// Uniquely identifies a subchannel in the pool: the address plus the subset
/// of channel args relevant to connection identity.  Channels whose args
/// differ only in identity-irrelevant options (health checking and the like)
/// map to the same key and share a subchannel.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubchannelKey {
    address: Address,
    args: KeyArgs,
}

impl SubchannelKey {
    pub fn new(address: Address, args: &ChannelArgs) -> Self {
        Self {
            address,
            args: args.key_args(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl Display for SubchannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Debug for SubchannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// A per-subchannel extension slot, keyed by type.  Out-of-band machinery
/// (health checking, load reporting) attaches itself to a subchannel as a
/// data producer so that its lifetime tracks the subchannel and all
/// interested parties share one instance.
pub trait DataProducer: Any + Send + Sync {}

fn downcast_producer<T: DataProducer>(producer: Arc<dyn DataProducer>) -> Option<Arc<T>> {
    let any: Arc<dyn Any + Send + Sync> = producer;
    any.downcast::<T>().ok()
}

enum MachineState {
    Idle,
    Connecting {
        attempt_task: Option<Box<dyn TaskHandle>>,
        next_attempt_time: Instant,
    },
    Ready {
        disconnect_task: Option<Box<dyn TaskHandle>>,
    },
    TransientFailure {
        retry_task: Option<Box<dyn TaskHandle>>,
    },
    Shutdown,
}

impl Drop for MachineState {
    fn drop(&mut self) {
        match self {
            Self::Connecting { attempt_task, .. } => {
                if let Some(task) = attempt_task {
                    task.abort();
                }
            }
            Self::Ready { disconnect_task } => {
                if let Some(task) = disconnect_task {
                    task.abort();
                }
            }
            Self::TransientFailure { retry_task } => {
                if let Some(task) = retry_task {
                    task.abort();
                }
            }
            Self::Idle | Self::Shutdown => {}
        }
    }
}

enum SubchannelEvent {
    ConnectionRequested,
    ConnectionSucceeded(ConnectedTransport),
    ConnectionTimedOut,
    ConnectionFailed(String),
    ConnectionTerminated(Option<String>),
    BackoffExpired,
}

impl Debug for SubchannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionRequested => write!(f, "ConnectionRequested"),
            Self::ConnectionSucceeded(_) => write!(f, "ConnectionSucceeded"),
            Self::ConnectionTimedOut => write!(f, "ConnectionTimedOut"),
            Self::ConnectionFailed(err) => write!(f, "ConnectionFailed({err})"),
            Self::ConnectionTerminated(_) => write!(f, "ConnectionTerminated"),
            Self::BackoffExpired => write!(f, "BackoffExpired"),
        }
    }
}

/// The per-endpoint lifecycle object.  Owns at most one connection attempt
/// at a time, drives reconnect backoff, publishes connectivity state to its
/// watchers, and exposes a multiplexed call destination once connected.
///
/// Subchannels are shared: any number of channels may hold strong refs to
/// one instance through the pool.  Every in-flight callback (connect result,
/// timer, state watcher) holds a weak ref, so dropping the last strong ref
/// promptly shuts the subchannel down, unregisters it from the pool, and
/// cancels outstanding work.
pub struct InternalSubchannel {
    key: SubchannelKey,
    connector: Arc<dyn Connector>,
    backoff: Arc<dyn Backoff>,
    runtime: Arc<dyn Runtime>,
    serializer: Arc<WorkSerializer>,
    event_tx: mpsc::UnboundedSender<SubchannelEvent>,
    /// Lock-free snapshot of the connected transport for the call path.
    /// Non-empty exactly while the subchannel is Ready.
    connected: ArcSwapOption<Box<dyn Service>>,
    unregister_fn: Mutex<Option<Box<dyn FnOnce(&SubchannelKey) + Send + Sync>>>,
    inner: Mutex<InnerSubchannel>,
}

struct InnerSubchannel {
    machine: MachineState,
    tracker: ConnectivityStateTracker,
    /// Effective keepalive interval for subsequent attempts; only ever
    /// raised by `throttle_keepalive_time`.
    keepalive_time: Option<Duration>,
    data_producers: HashMap<TypeId, Weak<dyn DataProducer>>,
}

impl InternalSubchannel {
    pub fn new(
        key: SubchannelKey,
        connector: Arc<dyn Connector>,
        backoff: Arc<dyn Backoff>,
        runtime: Arc<dyn Runtime>,
        serializer: Arc<WorkSerializer>,
        unregister_fn: Option<Box<dyn FnOnce(&SubchannelKey) + Send + Sync>>,
    ) -> Arc<InternalSubchannel> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SubchannelEvent>();
        let keepalive_time = key.args.keepalive_time;
        let subchannel = Arc::new(Self {
            key,
            connector,
            backoff,
            runtime: runtime.clone(),
            serializer,
            event_tx,
            connected: ArcSwapOption::empty(),
            unregister_fn: Mutex::new(unregister_fn),
            inner: Mutex::new(InnerSubchannel {
                machine: MachineState::Idle,
                tracker: ConnectivityStateTracker::new(SubchannelState::default()),
                keepalive_time,
                data_producers: HashMap::new(),
            }),
        });

        // The state machine runs on this long-lived task.  It holds only a
        // weak ref so that dropping the last external ref shuts the
        // subchannel down; the event channel closes once the subchannel and
        // all of its attempt/timer tasks are gone, ending the loop.
        let weak = Arc::downgrade(&subchannel);
        runtime.spawn(Box::pin(async move {
            while let Some(event) = event_rx.recv().await {
                let Some(subchannel) = weak.upgrade() else {
                    break;
                };
                trace!("subchannel {}: event {:?}", subchannel.key, event);
                subchannel.handle_event(event);
            }
        }));
        subchannel
    }

    pub fn key(&self) -> &SubchannelKey {
        &self.key
    }

    pub(crate) fn runtime(&self) -> Arc<dyn Runtime> {
        self.runtime.clone()
    }

    pub(crate) fn serializer(&self) -> Arc<WorkSerializer> {
        self.serializer.clone()
    }

    pub fn address(&self) -> Address {
        self.key.address.clone()
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.lock().unwrap().tracker.state()
    }

    /// The connected transport, if the subchannel is currently Ready.  Safe
    /// to call from the data plane; takes no lock.
    pub fn connected_service(&self) -> Option<Arc<Box<dyn Service>>> {
        self.connected.load_full()
    }

    /// Begins connecting if the subchannel is Idle; no-op otherwise.
    pub fn request_connection(&self) {
        let inner = self.inner.lock().unwrap();
        if let MachineState::Idle = inner.machine {
            let _ = self.event_tx.send(SubchannelEvent::ConnectionRequested);
        }
    }

    /// Resets the backoff schedule.  If a retry timer is pending, it is
    /// cancelled and the subchannel transitions to Idle synchronously; if
    /// the timer already fired, Idle is reached through its normal path.
    pub fn reset_backoff(&self) {
        self.backoff.reset();
        let notifications = {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.machine, MachineState::TransientFailure { .. }) {
                inner.machine = MachineState::Idle;
                inner.tracker.set(SubchannelState::new(ConnectivityState::Idle))
            } else {
                if let MachineState::Connecting {
                    next_attempt_time, ..
                } = &mut inner.machine
                {
                    // Should this attempt fail, retry immediately.
                    *next_attempt_time = Instant::now();
                }
                Vec::new()
            }
        };
        self.flush(notifications);
    }

    /// Raises the keepalive interval used for subsequent connection
    /// attempts.  The bound is monotone: attempts to lower it are ignored.
    pub fn throttle_keepalive_time(&self, new_time: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let throttled = match inner.keepalive_time {
            Some(current) => current.max(new_time),
            None => new_time,
        };
        if inner.keepalive_time != Some(throttled) {
            debug!(
                "subchannel {}: keepalive time throttled to {:?}",
                self.key, throttled
            );
            inner.keepalive_time = Some(throttled);
        }
    }

    /// Registers a connectivity state watcher.  The current state is
    /// delivered immediately (on the work serializer), followed by every
    /// subsequent transition, in order.
    pub fn watch_connectivity_state(&self, watcher: Arc<dyn StateWatcher>) {
        let notification = self.inner.lock().unwrap().tracker.add_watcher(watcher);
        self.serializer.schedule(move || notification.deliver());
        self.serializer.drain_queue();
    }

    /// Cancels a watcher.  Idempotent.  Notifications already scheduled for
    /// the watcher are still delivered.
    pub fn cancel_connectivity_state_watch(&self, watcher: &Arc<dyn StateWatcher>) {
        self.inner.lock().unwrap().tracker.remove_watcher(watcher);
    }

    /// Returns the data producer of type `T`, creating it with `factory` if
    /// absent.  The subchannel owns at most one producer per type; the bool
    /// reports whether this call created it (losers of a creation race get
    /// the winner's instance).
    pub fn get_or_add_data_producer<T, F>(&self, factory: F) -> (Arc<T>, bool)
    where
        T: DataProducer,
        F: FnOnce() -> Arc<T>,
    {
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.lookup_producer::<T>(type_id) {
            return (existing, false);
        }
        // Built outside the lock: factories may call back into the
        // subchannel.
        let candidate = factory();
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .data_producers
            .get(&type_id)
            .and_then(|weak| weak.upgrade())
        {
            drop(inner);
            if let Some(existing) = downcast_producer::<T>(existing) {
                return (existing, false);
            }
            return (candidate, true);
        }
        let as_producer: Arc<dyn DataProducer> = candidate.clone();
        inner
            .data_producers
            .insert(type_id, Arc::downgrade(&as_producer));
        (candidate, true)
    }

    /// Drops the registration for `producer` if it is the one currently
    /// registered for its type.  No-op otherwise.
    pub fn remove_data_producer<T: DataProducer>(&self, producer: &Arc<T>) {
        let mut inner = self.inner.lock().unwrap();
        let type_id = TypeId::of::<T>();
        let matches = match inner.data_producers.get(&type_id) {
            Some(weak) => match weak.upgrade() {
                Some(current) => {
                    Arc::as_ptr(&current) as *const () == Arc::as_ptr(producer) as *const ()
                }
                None => true, // dead entry, clean it up
            },
            None => false,
        };
        if matches {
            inner.data_producers.remove(&type_id);
        }
    }

    fn lookup_producer<T: DataProducer>(&self, type_id: TypeId) -> Option<Arc<T>> {
        let inner = self.inner.lock().unwrap();
        let producer = inner.data_producers.get(&type_id)?.upgrade()?;
        drop(inner);
        downcast_producer::<T>(producer)
    }

    fn handle_event(self: &Arc<Self>, event: SubchannelEvent) {
        match event {
            SubchannelEvent::ConnectionRequested => self.move_to_connecting(),
            SubchannelEvent::ConnectionSucceeded(transport) => self.move_to_ready(transport),
            SubchannelEvent::ConnectionTimedOut => {
                self.move_to_transient_failure("connection attempt timed out".to_string())
            }
            SubchannelEvent::ConnectionFailed(error) => self.move_to_transient_failure(error),
            SubchannelEvent::ConnectionTerminated(reason) => self.handle_transport_loss(reason),
            SubchannelEvent::BackoffExpired => self.move_to_idle(),
        }
    }

    fn move_to_connecting(self: &Arc<Self>) {
        let keepalive_time = {
            let inner = self.inner.lock().unwrap();
            if !matches!(inner.machine, MachineState::Idle) {
                return;
            }
            inner.keepalive_time
        };

        // The schedule advances when the attempt starts: the attempt runs
        // until max(next_attempt_time, now + min_connect_timeout), and a
        // failed attempt's retry timer fires at next_attempt_time.
        let next_attempt_time = self.backoff.next_attempt_time();
        let deadline = next_attempt_time.max(Instant::now() + self.backoff.min_connect_timeout());

        let opts = ConnectOptions {
            keepalive_time,
            authority: self.key.args.default_authority.clone(),
            deadline: Some(deadline),
        };
        let connector = self.connector.clone();
        let address = self.key.address.address.clone();
        let event_tx = self.event_tx.clone();
        let deadline_sleep = self
            .runtime
            .sleep(deadline.saturating_duration_since(Instant::now()));
        let attempt_task = self.runtime.spawn(Box::pin(async move {
            tokio::select! {
                _ = deadline_sleep => {
                    let _ = event_tx.send(SubchannelEvent::ConnectionTimedOut);
                }
                result = connector.connect(address, opts) => {
                    match result {
                        Ok(transport) => {
                            let _ = event_tx.send(SubchannelEvent::ConnectionSucceeded(transport));
                        }
                        Err(error) => {
                            let _ = event_tx.send(SubchannelEvent::ConnectionFailed(error));
                        }
                    }
                }
            }
        }));

        let notifications = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.machine, MachineState::Idle) {
                attempt_task.abort();
                return;
            }
            inner.machine = MachineState::Connecting {
                attempt_task: Some(attempt_task),
                next_attempt_time,
            };
            inner
                .tracker
                .set(SubchannelState::new(ConnectivityState::Connecting))
        };
        debug!("subchannel {}: Idle -> Connecting", self.key);
        self.flush(notifications);
    }

    fn move_to_ready(self: &Arc<Self>, transport: ConnectedTransport) {
        let ConnectedTransport {
            service,
            disconnection_listener,
        } = transport;

        let event_tx = self.event_tx.clone();
        let disconnect_task = self.runtime.spawn(Box::pin(async move {
            let reason = match disconnection_listener.await {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                // The transport dropped its end without reporting a reason.
                Err(_) => None,
            };
            let _ = event_tx.send(SubchannelEvent::ConnectionTerminated(reason));
        }));

        let notifications = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.machine, MachineState::Connecting { .. }) {
                disconnect_task.abort();
                return;
            }
            self.connected.store(Some(Arc::new(service)));
            inner.machine = MachineState::Ready {
                disconnect_task: Some(disconnect_task),
            };
            inner
                .tracker
                .set(SubchannelState::new(ConnectivityState::Ready))
        };
        debug!("subchannel {}: Connecting -> Ready", self.key);
        self.flush(notifications);
    }

    fn move_to_transient_failure(self: &Arc<Self>, error: String) {
        let next_attempt_time = {
            let inner = self.inner.lock().unwrap();
            match &inner.machine {
                MachineState::Connecting {
                    next_attempt_time, ..
                } => *next_attempt_time,
                _ => return,
            }
        };

        let event_tx = self.event_tx.clone();
        let retry_sleep = self
            .runtime
            .sleep(next_attempt_time.saturating_duration_since(Instant::now()));
        let retry_task = self.runtime.spawn(Box::pin(async move {
            retry_sleep.await;
            let _ = event_tx.send(SubchannelEvent::BackoffExpired);
        }));

        let notifications = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.machine, MachineState::Connecting { .. }) {
                retry_task.abort();
                return;
            }
            inner.machine = MachineState::TransientFailure {
                retry_task: Some(retry_task),
            };
            inner.tracker.set(SubchannelState::with_error(
                ConnectivityState::TransientFailure,
                error.clone(),
            ))
        };
        debug!(
            "subchannel {}: Connecting -> TransientFailure ({})",
            self.key, error
        );
        self.flush(notifications);
    }

    // A previously Ready transport reported failure or shutdown.  Loss of a
    // connection must not on its own poison backoff: the subchannel returns
    // to Idle with a fresh schedule, never to TransientFailure.
    fn handle_transport_loss(self: &Arc<Self>, reason: Option<String>) {
        let notifications = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.machine, MachineState::Ready { .. }) {
                return;
            }
            self.connected.store(None);
            self.backoff.reset();
            inner.machine = MachineState::Idle;
            let state = match reason {
                Some(error) => SubchannelState::with_error(ConnectivityState::Idle, error),
                None => SubchannelState::new(ConnectivityState::Idle),
            };
            inner.tracker.set(state)
        };
        debug!("subchannel {}: Ready -> Idle (transport loss)", self.key);
        self.flush(notifications);
    }

    // The retry timer fired naturally.  Races with reset_backoff: if the
    // cancellation there won, the machine is already Idle and this is a
    // no-op.
    fn move_to_idle(self: &Arc<Self>) {
        let notifications = {
            let mut inner = self.inner.lock().unwrap();
            if !matches!(inner.machine, MachineState::TransientFailure { .. }) {
                return;
            }
            inner.machine = MachineState::Idle;
            inner
                .tracker
                .set(SubchannelState::new(ConnectivityState::Idle))
        };
        debug!("subchannel {}: TransientFailure -> Idle", self.key);
        self.flush(notifications);
    }

    // Watcher notifications are delivered on the serializer, after the
    // subchannel mutex has been released.
    fn flush(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        for notification in notifications {
            self.serializer.schedule(move || notification.deliver());
        }
        self.serializer.drain_queue();
    }
}

#[async_trait]
impl Service for InternalSubchannel {
    async fn call(&self, method: String, request: Request) -> Response {
        match self.connected_service() {
            Some(service) => service.call(method, request).await,
            None => response_from_status(Status::unavailable("subchannel is not connected")),
        }
    }
}

impl Display for InternalSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

impl Drop for InternalSubchannel {
    fn drop(&mut self) {
        debug!("subchannel {}: shutting down", self.key);
        let notifications = {
            let inner = self.inner.get_mut().unwrap();
            // Replacing the machine state aborts any outstanding tasks.
            inner.machine = MachineState::Shutdown;
            inner
                .tracker
                .set(SubchannelState::new(ConnectivityState::Shutdown))
        };
        self.connected.store(None);
        for notification in notifications {
            notification.deliver();
        }
        if let Some(unregister) = self.unregister_fn.get_mut().unwrap().take() {
            unregister(&self.key);
        }
    }
}

/// Process-wide deduplication of subchannels: channels sharing an address
/// (and identity-relevant args) share a connection.
///
/// Slots hold weak refs; the strong refs live with the channels.  A
/// subchannel unregisters itself when its last strong ref drops.
pub struct SubchannelPool {
    subchannels: Mutex<BTreeMap<SubchannelKey, Weak<InternalSubchannel>>>,
}

static GLOBAL_SUBCHANNEL_POOL: LazyLock<Arc<SubchannelPool>> =
    LazyLock::new(|| Arc::new(SubchannelPool::new()));

impl SubchannelPool {
    pub fn new() -> Self {
        Self {
            subchannels: Mutex::new(BTreeMap::new()),
        }
    }

    /// The process-wide pool.
    pub fn global() -> Arc<SubchannelPool> {
        GLOBAL_SUBCHANNEL_POOL.clone()
    }

    pub fn lookup(&self, key: &SubchannelKey) -> Option<Arc<InternalSubchannel>> {
        self.subchannels.lock().unwrap().get(key)?.upgrade()
    }

    /// Registers `candidate` under its key and returns the canonical
    /// subchannel for that key: `candidate` itself, or, if another live
    /// subchannel won the registration race, that one (the caller drops its
    /// candidate and adopts the winner).
    pub fn register(&self, candidate: Arc<InternalSubchannel>) -> Arc<InternalSubchannel> {
        let mut subchannels = self.subchannels.lock().unwrap();
        if let Some(existing) = subchannels
            .get(candidate.key())
            .and_then(|weak| weak.upgrade())
        {
            return existing;
        }
        trace!("pool: registering subchannel {}", candidate.key());
        subchannels.insert(candidate.key().clone(), Arc::downgrade(&candidate));
        candidate
    }

    /// Removes the slot for `key` unless it holds a different, live
    /// subchannel.  Tolerates the "create replacement, then destroy old"
    /// ordering: the dying subchannel's weak ref can no longer upgrade, so
    /// a live occupant is by definition a newer one and is kept.
    pub fn unregister(&self, key: &SubchannelKey) {
        let mut subchannels = self.subchannels.lock().unwrap();
        if let Some(weak) = subchannels.get(key) {
            if weak.upgrade().is_some() {
                return;
            }
            trace!("pool: removing subchannel {}", key);
            subchannels.remove(key);
        }
    }

    /// Returns the subchannel for `key`, creating and registering one if no
    /// live instance exists.
    pub fn get_or_create(
        self: &Arc<Self>,
        key: SubchannelKey,
        connector: Arc<dyn Connector>,
        backoff: Arc<dyn Backoff>,
        runtime: Arc<dyn Runtime>,
        serializer: Arc<WorkSerializer>,
    ) -> Arc<InternalSubchannel> {
        if let Some(existing) = self.lookup(&key) {
            return existing;
        }
        let pool = Arc::downgrade(self);
        let candidate = InternalSubchannel::new(
            key,
            connector,
            backoff,
            runtime,
            serializer,
            Some(Box::new(move |key| {
                if let Some(pool) = pool.upgrade() {
                    pool.unregister(key);
                }
            })),
        );
        self.register(candidate)
    }

    /// Drops all registrations.  Intended for test teardown; subchannels
    /// themselves are owned by their channels and are unaffected.
    pub fn shutdown(&self) {
        self.subchannels.lock().unwrap().clear();
    }
}

impl Default for SubchannelPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds a pooled subchannel to the load-balancing facing [`Subchannel`]
/// trait.  Each channel using a subchannel holds its own wrapper; dropping
/// the wrapper cancels its connectivity watcher and releases the channel's
/// strong ref, which may in turn shut the underlying subchannel down.
pub struct SharedSubchannel {
    inner: Arc<InternalSubchannel>,
    watcher: Arc<dyn StateWatcher>,
}

impl SharedSubchannel {
    /// Wraps `inner`, registering `watcher` for its state transitions.
    pub fn register(
        inner: Arc<InternalSubchannel>,
        watcher: Arc<dyn StateWatcher>,
    ) -> Arc<SharedSubchannel> {
        inner.watch_connectivity_state(watcher.clone());
        Arc::new(Self { inner, watcher })
    }

    pub fn internal(&self) -> &Arc<InternalSubchannel> {
        &self.inner
    }
}

impl Subchannel for SharedSubchannel {
    fn address(&self) -> Address {
        self.inner.address()
    }

    fn connect(&self) {
        self.inner.request_connection();
    }
}

impl Display for SharedSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl Drop for SharedSubchannel {
    fn drop(&mut self) {
        self.inner.cancel_connectivity_state_watch(&self.watcher);
    }
}
