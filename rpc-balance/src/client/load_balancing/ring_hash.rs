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

//! The `ring_hash` policy: consistent-hash subchannel selection.
//!
//! Each address occupies a share of a hash ring proportional to its weight;
//! a per-request hash (provided through the [`RequestHash`] request
//! extension) selects the owning ring entry.  Connections are established
//! lazily, driven by picks, with a proactive recovery mode that keeps at
//! least one connection attempt moving while the aggregate state is
//! TransientFailure.

use std::collections::HashSet;
use std::error::Error;
use std::sync::{Arc, Mutex, Once};

use arc_swap::ArcSwap;
use serde::Deserialize;
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::debug;
use twox_hash::XxHash64;

use crate::client::load_balancing::subchannel_list::SubchannelList;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, ParsedJsonLbConfig, Pick, PickResult, Picker, QueuingPicker,
    Subchannel, WorkScheduler,
};
use crate::client::name_resolution::{Address, AddressWeight, ResolverUpdate};
use crate::client::{ConnectivityState, SubchannelState};
use crate::service::Request;

pub static POLICY_NAME: &str = "ring_hash_experimental";

/// The hash driving subchannel selection for one request, attached to the
/// request's extensions by the caller (typically a routing layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHash(pub u64);

const MAX_RING_SIZE_CAP: u64 = 8_388_608;
const DEFAULT_MIN_RING_SIZE: u64 = 1024;

/// Parsed `ring_hash_experimental` configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingHashConfig {
    pub min_ring_size: u64,
    pub max_ring_size: u64,
}

impl Default for RingHashConfig {
    fn default() -> Self {
        Self {
            min_ring_size: DEFAULT_MIN_RING_SIZE,
            max_ring_size: MAX_RING_SIZE_CAP,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct RingHashConfigJson {
    min_ring_size: Option<u64>,
    max_ring_size: Option<u64>,
}

struct RingHashBuilder {}

impl LbPolicyBuilder for RingHashBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RingHashPolicy {
            work_scheduler: options.work_scheduler,
            config: Arc::new(RingHashConfig::default()),
            list: None,
            ring: None,
            addresses: Vec::new(),
            pending_connects: Arc::new(Mutex::new(HashSet::new())),
            last_resolver_error: None,
            last_connection_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let json: RingHashConfigJson = config
            .convert_to()
            .map_err(|e| format!("failed to parse ring_hash config: {e}"))?;
        let min_ring_size = json
            .min_ring_size
            .unwrap_or(DEFAULT_MIN_RING_SIZE)
            .clamp(1, MAX_RING_SIZE_CAP);
        let max_ring_size = json
            .max_ring_size
            .unwrap_or(MAX_RING_SIZE_CAP)
            .clamp(1, MAX_RING_SIZE_CAP);
        if min_ring_size > max_ring_size {
            return Err("ring_hash config: min_ring_size is greater than max_ring_size".into());
        }
        Ok(Some(LbConfig::new(RingHashConfig {
            min_ring_size,
            max_ring_size,
        })))
    }
}

/// Registers ring_hash with the global LB registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(RingHashBuilder {});
    });
}

#[derive(Clone, Copy)]
pub(crate) struct RingEntry {
    hash: u64,
    /// Index of the owning row in the subchannel list.
    index: usize,
}

/// Sorted `(hash, subchannel)` entries approximating each address's share
/// `weight / total_weight` of ring slots.  Rebuilt on every resolver update.
pub(crate) struct Ring {
    entries: Vec<RingEntry>,
}

impl Ring {
    /// Builds the ring.  `addresses` must be non-empty with zero-weighted
    /// addresses already filtered out.
    ///
    /// The per-host hash count is scaled so that the least-weighted host
    /// receives a whole number of ring slots (capped at `max_ring_size`),
    /// which keeps membership stable under weight changes proportional to
    /// `1 / min_ring_size`.
    pub(crate) fn build(addresses: &[Address], config: &RingHashConfig) -> Ring {
        let weights: Vec<f64> = addresses
            .iter()
            .map(|a| a.attributes.get::<AddressWeight>().map_or(1.0, |w| w.0 as f64))
            .collect();
        let total: f64 = weights.iter().sum();
        let normalized: Vec<f64> = weights.iter().map(|w| w / total).collect();
        let min_normalized = normalized.iter().copied().fold(f64::INFINITY, f64::min);

        let scale = ((min_normalized * config.min_ring_size as f64).ceil() / min_normalized)
            .min(config.max_ring_size as f64);
        let mut entries = Vec::with_capacity(scale.ceil() as usize);

        // Walk the hosts, generating (scale * weight) hashes for each.  The
        // shares are not necessarily whole numbers, so two running sums
        // place the boundaries in a mostly stable way.
        let mut current_hashes = 0.0;
        let mut target_hashes = 0.0;
        for (index, normalized_weight) in normalized.iter().enumerate() {
            let address_string = &addresses[index].address;
            target_hashes += scale * normalized_weight;
            let mut count = 0u64;
            while current_hashes < target_hashes {
                let key = format!("{address_string}_{count}");
                let hash = XxHash64::oneshot(0, key.as_bytes());
                entries.push(RingEntry { hash, index });
                count += 1;
                current_hashes += 1.0;
            }
        }
        entries.sort_by_key(|entry| entry.hash);
        debug!(
            "ring_hash: built ring with {} entries for {} addresses",
            entries.len(),
            addresses.len()
        );
        Ring { entries }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Position of the entry owning `hash`: the smallest entry whose hash is
    /// >= the request hash, wrapping around.
    pub(crate) fn pick_position(&self, hash: u64) -> usize {
        let position = self.entries.partition_point(|entry| entry.hash < hash);
        if position == self.entries.len() { 0 } else { position }
    }

    pub(crate) fn entry(&self, position: usize) -> &RingEntry {
        &self.entries[position]
    }

    /// Row index owning `hash`; the pure assignment function used by picks.
    pub(crate) fn owner(&self, hash: u64) -> usize {
        self.entries[self.pick_position(hash)].index
    }
}

/// Consistent-hash LB policy.
struct RingHashPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    config: Arc<RingHashConfig>,
    list: Option<SubchannelList>,
    ring: Option<Arc<Ring>>,
    /// The filtered address list behind `list`, for idempotence checks.
    addresses: Vec<Address>,
    /// Row indices pickers have asked to connect, drained by `work`.
    /// Recreated with each list so stale pickers cannot poke the new list.
    pending_connects: Arc<Mutex<HashSet<usize>>>,
    last_resolver_error: Option<String>,
    last_connection_error: Option<(Address, String)>,
}

impl LbPolicy for RingHashPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let new_config = match config {
            Some(config) => config.convert_to::<RingHashConfig>()?,
            None => Arc::new(RingHashConfig::default()),
        };

        match update.addresses {
            Ok(addresses) => {
                // Zero-weighted addresses never make it onto the ring.
                let addresses = deduplicate(
                    addresses
                        .into_iter()
                        .filter(|a| a.attributes.get::<AddressWeight>().is_none_or(|w| w.0 > 0))
                        .collect(),
                );
                if addresses.is_empty() {
                    self.list = None;
                    self.ring = None;
                    self.addresses = Vec::new();
                    let error = empty_list_error(&update.resolution_note);
                    self.last_resolver_error = Some(error.clone());
                    self.publish_transient_failure(channel_controller, error.clone());
                    channel_controller.request_resolution();
                    return Err(error.into());
                }

                if self.list.is_some()
                    && self.addresses == addresses
                    && self.config == new_config
                {
                    return Ok(());
                }

                self.config = new_config;
                self.list = Some(SubchannelList::new(&addresses, channel_controller));
                self.ring = Some(Arc::new(Ring::build(&addresses, &self.config)));
                self.addresses = addresses;
                self.pending_connects = Arc::new(Mutex::new(HashSet::new()));
                self.publish_aggregate(channel_controller);
                Ok(())
            }
            Err(error) => {
                debug!("ring_hash: resolver error: {error}");
                self.last_resolver_error = Some(error.clone());
                // Keep using the existing list, if any.
                if self.list.is_none() {
                    self.publish_transient_failure(channel_controller, error);
                    channel_controller.request_resolution();
                }
                Ok(())
            }
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(list) = &mut self.list else {
            return;
        };
        let Some(index) = list.index_of(&subchannel) else {
            return;
        };

        if state.connectivity_state == ConnectivityState::TransientFailure {
            if let Some(error) = &state.last_connection_error {
                self.last_connection_error = Some((subchannel.address(), error.to_string()));
            }
            // A failing backend may indicate a change in the overall network
            // configuration.
            channel_controller.request_resolution();
        }

        list.update(&subchannel, state);
        let aggregate = self.publish_aggregate(channel_controller);

        // While reporting TransientFailure the policy receives no picks, so
        // it keeps at least one connection attempt moving itself: each
        // failed attempt hands off to the next subchannel by ring index, and
        // subchannels completing backoff are restarted, until one becomes
        // Ready.
        if aggregate == ConnectivityState::TransientFailure {
            match state.connectivity_state {
                ConnectivityState::TransientFailure => self.connect_next_by_ring(index),
                ConnectivityState::Idle => subchannel.connect(),
                _ => {}
            }
        }
    }

    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {
        let Some(list) = &self.list else {
            return;
        };
        let requested: Vec<usize> = {
            let mut pending = self.pending_connects.lock().unwrap();
            pending.drain().collect()
        };
        for index in requested {
            if index < list.len() {
                list.row(index).subchannel().connect();
            }
        }
    }
}

impl RingHashPolicy {
    // Aggregation rules, first match wins:
    //   1. >= 1 Ready            -> Ready
    //   2. >= 2 TransientFailure -> TransientFailure
    //   3. >= 1 Connecting       -> Connecting
    //   4. >= 1 Idle             -> Idle
    //   5. otherwise             -> TransientFailure
    fn aggregate_state(&self) -> ConnectivityState {
        let list = self.list.as_ref().unwrap();
        if list.num_ready() > 0 {
            ConnectivityState::Ready
        } else if list.num_transient_failure() >= 2 {
            ConnectivityState::TransientFailure
        } else if list.num_connecting() > 0 {
            ConnectivityState::Connecting
        } else if list.num_idle() > 0 {
            ConnectivityState::Idle
        } else {
            ConnectivityState::TransientFailure
        }
    }

    fn publish_aggregate(
        &mut self,
        channel_controller: &mut dyn ChannelController,
    ) -> ConnectivityState {
        let aggregate = self.aggregate_state();
        match aggregate {
            // Ready and Idle both route through the ring: picks on an Idle
            // ring trigger the lazy per-entry connection attempts.
            ConnectivityState::Ready | ConnectivityState::Idle => {
                let picker = self.new_picker();
                channel_controller.update_picker(LbState {
                    connectivity_state: aggregate,
                    picker,
                });
            }
            ConnectivityState::Connecting => {
                channel_controller.update_picker(LbState {
                    connectivity_state: ConnectivityState::Connecting,
                    picker: Arc::new(QueuingPicker {}),
                });
            }
            ConnectivityState::TransientFailure => {
                let error = self.aggregate_error();
                self.publish_transient_failure(channel_controller, error);
            }
            ConnectivityState::Shutdown => {}
        }
        aggregate
    }

    fn new_picker(&self) -> Arc<dyn Picker> {
        let list = self.list.as_ref().unwrap();
        let rows = list
            .rows()
            .map(|row| PickerRow {
                subchannel: row.subchannel().clone(),
                state: row.picker_state().clone(),
            })
            .collect();
        Arc::new(RingHashPicker {
            ring: self.ring.as_ref().unwrap().clone(),
            rows,
            error: self.aggregate_error(),
            work_scheduler: self.work_scheduler.clone(),
            pending_connects: self.pending_connects.clone(),
        })
    }

    fn publish_transient_failure(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        error: String,
    ) {
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
    }

    fn aggregate_error(&self) -> String {
        if let Some((address, error)) = &self.last_connection_error {
            return format!("{address}: {error}");
        }
        if let Some(error) = &self.last_resolver_error {
            return error.clone();
        }
        "connections to backends failing or idle".to_string()
    }

    // Proactive recovery: hand the connection attempt to the next distinct
    // subchannel following `failed_index` in ring order.
    fn connect_next_by_ring(&self, failed_index: usize) {
        let (Some(ring), Some(list)) = (&self.ring, &self.list) else {
            return;
        };
        let Some(position) = (0..ring.len()).find(|p| ring.entry(*p).index == failed_index) else {
            return;
        };
        for offset in 1..ring.len() {
            let entry = ring.entry((position + offset) % ring.len());
            if entry.index != failed_index {
                debug!(
                    "ring_hash: proactively connecting {}",
                    list.row(entry.index).address()
                );
                list.row(entry.index).subchannel().connect();
                return;
            }
        }
    }
}

fn deduplicate(addresses: Vec<Address>) -> Vec<Address> {
    let mut uniques = HashSet::new();
    let mut addresses = addresses;
    addresses.retain(|a| uniques.insert(a.clone()));
    addresses
}

fn empty_list_error(resolution_note: &str) -> String {
    if resolution_note.is_empty() {
        "received empty address list from the name resolver".to_string()
    } else {
        format!("received empty address list from the name resolver: {resolution_note}")
    }
}

struct PickerRow {
    subchannel: Arc<dyn Subchannel>,
    /// Written by the control plane, read here without locking.
    state: Arc<ArcSwap<ConnectivityState>>,
}

/// The ring picker.  Immutable after publication; connection attempts it
/// wants are queued for the policy's `work` method rather than performed on
/// the data plane.
struct RingHashPicker {
    ring: Arc<Ring>,
    rows: Vec<PickerRow>,
    error: String,
    work_scheduler: Arc<dyn WorkScheduler>,
    pending_connects: Arc<Mutex<HashSet<usize>>>,
}

impl RingHashPicker {
    fn row_state(&self, index: usize) -> ConnectivityState {
        **self.rows[index].state.load()
    }

    fn complete(&self, index: usize) -> PickResult {
        PickResult::Pick(Pick {
            subchannel: self.rows[index].subchannel.clone(),
            on_complete: None,
            metadata: MetadataMap::new(),
        })
    }

    fn schedule_connect(&self, index: usize) {
        let scheduled = self.pending_connects.lock().unwrap().insert(index);
        if scheduled {
            self.work_scheduler.schedule_work();
        }
    }
}

impl Picker for RingHashPicker {
    fn pick(&self, request: &Request) -> PickResult {
        let Some(RequestHash(hash)) = request.extensions().get::<RequestHash>().copied() else {
            return PickResult::Fail(Status::internal(
                "no request hash attribute available for ring_hash pick",
            ));
        };

        let first_position = self.ring.pick_position(hash);
        let first_index = self.ring.entry(first_position).index;
        match self.row_state(first_index) {
            ConnectivityState::Ready => return self.complete(first_index),
            ConnectivityState::Idle => {
                self.schedule_connect(first_index);
                return PickResult::Queue;
            }
            ConnectivityState::Connecting => return PickResult::Queue,
            _ => {}
        }
        self.schedule_connect(first_index);

        // The owning entry has failed.  Walk the ring for a Ready
        // subchannel, queueing on the second distinct subchannel if it is
        // still trying, and asking each failed subchannel on the way (up to
        // the first non-failed one) to connect.
        let mut found_second_subchannel = false;
        let mut found_first_non_failed = false;
        for offset in 1..self.ring.len() {
            let entry = self.ring.entry((first_position + offset) % self.ring.len());
            if entry.index == first_index {
                continue;
            }
            let state = self.row_state(entry.index);
            if state == ConnectivityState::Ready {
                return self.complete(entry.index);
            }
            if !found_second_subchannel {
                match state {
                    ConnectivityState::Idle => {
                        self.schedule_connect(entry.index);
                        return PickResult::Queue;
                    }
                    ConnectivityState::Connecting => return PickResult::Queue,
                    _ => {}
                }
                found_second_subchannel = true;
            }
            if !found_first_non_failed {
                if state == ConnectivityState::TransientFailure {
                    self.schedule_connect(entry.index);
                } else {
                    if state == ConnectivityState::Idle {
                        self.schedule_connect(entry.index);
                    }
                    found_first_non_failed = true;
                }
            }
        }
        PickResult::Fail(Status::unavailable(format!(
            "ring hash found no connected subchannel; last failure: {}",
            self.error
        )))
    }
}
