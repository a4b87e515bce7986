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

//! Pluggable load-balancing policies.
//!
//! A policy consumes resolved addresses plus per-subchannel connectivity and
//! produces a [`Picker`]: a pure function from call context to subchannel
//! choice.  All policy methods run on the channel's work serializer, so a
//! policy needs no locking of its own; pickers, in contrast, run lock-free
//! on the data plane and see state only through atomics.

pub mod registry;
pub mod ring_hash;
pub mod round_robin;
pub(crate) mod subchannel_list;

#[cfg(test)]
pub(crate) mod test_utils;

use std::any::Any;
use std::error::Error;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tonic::Status;
use tonic::metadata::MetadataMap;

pub use registry::{GLOBAL_LB_REGISTRY, LbPolicyRegistry};

use crate::client::SubchannelState;
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::service::Request;

/// A collection of data configured on the channel that is constructing an
/// LB policy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that lets the policy request
    /// a call into its `work` method.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

/// Used to asynchronously request a call into the LB policy's `work` method
/// when the policy needs to perform control-plane operations outside a
/// channel-initiated update — typically from a picker, which must not touch
/// control-plane state itself.
pub trait WorkScheduler: Send + Sync {
    /// Schedules a call into the LB policy's `work` method.  If a call is
    /// already pending, another may not be scheduled.
    fn schedule_work(&self);
}

/// An LB policy factory, registered by name in an [`LbPolicyRegistry`].
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Build must not fail.  Optional configuration is delivered via the
    /// policy's `resolver_update` method.  A new policy is assumed to begin
    /// in a Connecting state that queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// The name of the LB policy.
    fn name(&self) -> &'static str;

    /// Parses a JSON policy configuration into the policy's internal
    /// representation.  Policies without configuration return `Ok(None)`.
    /// Parse errors are surfaced to the channel synchronously and never
    /// alter the state of a running policy.
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// Policies create connections (modeled as [`Subchannel`]s) through the
/// [`ChannelController`] and publish a new picker whenever a relevant event
/// changes what a pick should return.  Every method runs on the channel's
/// work serializer; between calls, nothing else mutates the policy.
pub trait LbPolicy: Send {
    /// Called when the name resolver produces a new set of addresses or a
    /// new policy config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called when any subchannel created by this policy changes state.
    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called in response to this policy's `WorkScheduler::schedule_work`.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);
}

/// The operations a policy may perform on the channel that owns it.
pub trait ChannelController: Send {
    /// Creates a new subchannel for the address, in Idle state.  State
    /// transitions of the subchannel are delivered to the creating policy's
    /// `subchannel_update` method.
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Publishes a new snapshot of the policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Asks the name resolver to re-resolve.  Typically used when
    /// connections fail, indicating a possible change in the overall network
    /// configuration.
    fn request_resolution(&mut self);
}

/// A subchannel as seen by a load-balancing policy: a managed connection to
/// one backend that may connect and disconnect many times over its lifetime.
///
/// Subchannels compare and hash by identity.
pub trait Subchannel: Send + Sync + Display {
    /// The address this subchannel connects to.
    fn address(&self) -> Address;

    /// Asks the subchannel to connect if it is Idle; no-op otherwise.
    fn connect(&self);
}

impl PartialEq for dyn Subchannel {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            self as *const Self as *const (),
            other as *const Self as *const (),
        )
    }
}

impl Eq for dyn Subchannel {}

impl Hash for dyn Subchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self as *const Self as *const () as usize).hash(state);
    }
}

/// A convenience wrapper for a policy's parsed configuration object.
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    pub fn new<T: Send + Sync + 'static>(config: T) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Recovers the typed configuration.
    pub fn convert_to<T: Send + Sync + 'static>(
        &self,
    ) -> Result<Arc<T>, Box<dyn Error + Send + Sync>> {
        self.config
            .clone()
            .downcast::<T>()
            .map_err(|_| "unexpected LB config type".into())
    }
}

/// A JSON LB policy configuration, pre-parsed into a tree and convertible
/// into per-policy typed configs.
#[derive(Debug, Clone)]
pub struct ParsedJsonLbConfig {
    value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    pub fn new(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            value: serde_json::from_str(json)?,
        })
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        Self { value }
    }

    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }
}

/// Decides what subchannel to use for a request.  A picker is used at most
/// once per RPC: on `Queue`, the channel parks the RPC until the policy
/// publishes a new picker and retries with that one.
///
/// Pickers are immutable after publication and must be safe for concurrent
/// picks from many threads; any state they read is shared through atomics.
/// `pick` must not block.
pub trait Picker: Send + Sync {
    fn pick(&self, request: &Request) -> PickResult;
}

pub enum PickResult {
    /// Use the subchannel in the `Pick` for the request.
    Pick(Pick),
    /// The policy is attempting to connect; park the request until a new
    /// picker is produced.
    Queue,
    /// Fail the request with this status (code converted to UNAVAILABLE).
    /// Wait-for-ready RPCs are parked instead and retried on a new picker.
    Fail(Status),
    /// Fail the request immediately, even if it is wait-for-ready.
    Drop(Status),
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    /// Invoked with the trailing metadata of the completed call, for
    /// per-pick bookkeeping.
    pub on_complete: Option<Arc<dyn Fn(&MetadataMap) + Send + Sync>>,
    /// Metadata to be merged into the outgoing request metadata.
    pub metadata: MetadataMap,
}

impl Display for PickResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PickResult::Pick(pick) => write!(f, "Pick({})", pick.subchannel),
            PickResult::Queue => write!(f, "Queue"),
            PickResult::Fail(status) => write!(f, "Fail({status})"),
            PickResult::Drop(status) => write!(f, "Drop({status})"),
        }
    }
}

impl PartialEq for PickResult {
    // Status and callback contents do not participate; used by tests to
    // compare shapes and picked subchannels.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PickResult::Pick(a), PickResult::Pick(b)) => a.subchannel == b.subchannel.clone(),
            (PickResult::Queue, PickResult::Queue) => true,
            (PickResult::Fail(a), PickResult::Fail(b)) => a.code() == b.code(),
            (PickResult::Drop(a), PickResult::Drop(b)) => a.code() == b.code(),
            _ => false,
        }
    }
}

/// The state snapshot a policy publishes to its channel: the aggregate
/// connectivity state plus the picker the channel should route with.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: super::ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// The generic initial state: Connecting, queue every pick.
    pub fn initial() -> Self {
        Self {
            connectivity_state: super::ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// Always returns `Queue`.  Policies that are not actively connecting
/// should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with UNAVAILABLE and the stored message.
pub struct Failing {
    pub error: String,
}

impl Picker for Failing {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Fail(Status::unavailable(&self.error))
    }
}
