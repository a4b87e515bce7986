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

//! Batched subchannel tracking shared by policies that watch one subchannel
//! per address: ordered rows, per-state counters, and the failure latch that
//! keeps Connecting/TransientFailure flapping from churning the aggregate
//! state.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::client::load_balancing::{ChannelController, Subchannel};
use crate::client::name_resolution::Address;
use crate::client::{ConnectivityState, SubchannelState};

/// One row of a [`SubchannelList`].
pub(crate) struct SubchannelData {
    address: Address,
    subchannel: Arc<dyn Subchannel>,
    /// Most recent state reported by the subchannel.
    last_seen_state: ConnectivityState,
    /// The state this row currently contributes to the counters.  None once
    /// the subchannel has shut down.
    counted_state: Option<ConnectivityState>,
    /// Once a failure has been seen, transitions other than Ready no longer
    /// reach the counters; only Ready clears the latch.
    seen_failure_since_ready: bool,
    /// State visible to the data plane.  Written here on the control plane,
    /// read without locking by pickers.
    picker_state: Arc<ArcSwap<ConnectivityState>>,
}

impl SubchannelData {
    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn subchannel(&self) -> &Arc<dyn Subchannel> {
        &self.subchannel
    }

    pub(crate) fn last_seen_state(&self) -> ConnectivityState {
        self.last_seen_state
    }

    pub(crate) fn picker_state(&self) -> &Arc<ArcSwap<ConnectivityState>> {
        &self.picker_state
    }
}

#[derive(Default)]
struct StateCounters {
    idle: usize,
    connecting: usize,
    ready: usize,
    transient_failure: usize,
}

impl StateCounters {
    fn add(&mut self, state: ConnectivityState) {
        match state {
            ConnectivityState::Idle => self.idle += 1,
            ConnectivityState::Connecting => self.connecting += 1,
            ConnectivityState::Ready => self.ready += 1,
            ConnectivityState::TransientFailure => self.transient_failure += 1,
            ConnectivityState::Shutdown => {}
        }
    }

    fn remove(&mut self, state: ConnectivityState) {
        match state {
            ConnectivityState::Idle => self.idle -= 1,
            ConnectivityState::Connecting => self.connecting -= 1,
            ConnectivityState::Ready => self.ready -= 1,
            ConnectivityState::TransientFailure => self.transient_failure -= 1,
            ConnectivityState::Shutdown => {}
        }
    }
}

/// The subchannels created for one resolver update, in address order, plus
/// per-state counts of their connectivity.  The counters always sum to the
/// number of rows whose subchannel has not shut down.
pub(crate) struct SubchannelList {
    rows: Vec<SubchannelData>,
    counters: StateCounters,
}

impl SubchannelList {
    /// Creates one subchannel per address through the controller.  Rows are
    /// seeded Idle; each subchannel's actual state arrives through the
    /// policy's `subchannel_update` and is applied via [`Self::update`].
    pub(crate) fn new(addresses: &[Address], controller: &mut dyn ChannelController) -> Self {
        let mut list = SubchannelList {
            rows: Vec::with_capacity(addresses.len()),
            counters: StateCounters::default(),
        };
        for address in addresses {
            let subchannel = controller.new_subchannel(address);
            list.rows.push(SubchannelData {
                address: address.clone(),
                subchannel,
                last_seen_state: ConnectivityState::Idle,
                counted_state: Some(ConnectivityState::Idle),
                seen_failure_since_ready: false,
                picker_state: Arc::new(ArcSwap::from_pointee(ConnectivityState::Idle)),
            });
            list.counters.add(ConnectivityState::Idle);
        }
        list
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = &SubchannelData> {
        self.rows.iter()
    }

    pub(crate) fn row(&self, index: usize) -> &SubchannelData {
        &self.rows[index]
    }

    pub(crate) fn index_of(&self, subchannel: &Arc<dyn Subchannel>) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| &row.subchannel == subchannel)
    }

    pub(crate) fn addresses(&self) -> Vec<Address> {
        self.rows.iter().map(|row| row.address.clone()).collect()
    }

    /// Asks every Idle subchannel in the list to connect.
    pub(crate) fn request_connection_all(&self) {
        for row in &self.rows {
            row.subchannel.connect();
        }
    }

    /// Applies a state transition to the row for `subchannel`, updating the
    /// picker-visible state and, through the failure latch, the counters.
    /// Returns false if the subchannel is not in this list.
    pub(crate) fn update(
        &mut self,
        subchannel: &Arc<dyn Subchannel>,
        state: &SubchannelState,
    ) -> bool {
        let Some(index) = self.index_of(subchannel) else {
            return false;
        };
        let new_state = state.connectivity_state;
        let row = &mut self.rows[index];
        row.picker_state.store(Arc::new(new_state));

        if new_state == ConnectivityState::Shutdown {
            if let Some(counted) = row.counted_state.take() {
                self.counters.remove(counted);
            }
            row.last_seen_state = new_state;
            return true;
        }

        if let Some(counted) = row.counted_state {
            if !row.seen_failure_since_ready {
                if new_state == ConnectivityState::TransientFailure {
                    row.seen_failure_since_ready = true;
                }
                self.counters.remove(counted);
                self.counters.add(new_state);
                row.counted_state = Some(new_state);
            } else if new_state == ConnectivityState::Ready {
                row.seen_failure_since_ready = false;
                self.counters.remove(counted);
                self.counters.add(ConnectivityState::Ready);
                row.counted_state = Some(ConnectivityState::Ready);
            }
            // Latched and not Ready: the counters keep attributing this row
            // to TransientFailure.
        }
        row.last_seen_state = new_state;
        true
    }

    pub(crate) fn num_idle(&self) -> usize {
        self.counters.idle
    }

    pub(crate) fn num_connecting(&self) -> usize {
        self.counters.connecting
    }

    pub(crate) fn num_ready(&self) -> usize {
        self.counters.ready
    }

    pub(crate) fn num_transient_failure(&self) -> usize {
        self.counters.transient_failure
    }

    /// The number of rows contributing to the counters (those whose
    /// subchannel has not shut down).
    pub(crate) fn num_tracked(&self) -> usize {
        self.counters.idle + self.counters.connecting + self.counters.ready
            + self.counters.transient_failure
    }
}
