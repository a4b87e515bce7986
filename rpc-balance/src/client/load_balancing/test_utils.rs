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

//! Shared fakes for load-balancing policy tests: a channel controller, a
//! subchannel, and a work scheduler that forward everything they are asked
//! to do onto an event channel for the test to assert on.

use std::fmt::{Debug, Display};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, LbState, PickResult, Picker, Subchannel, WorkScheduler,
};
use crate::client::name_resolution::Address;
use crate::service::{Message, Request};

#[derive(Debug)]
pub(crate) struct EmptyMessage {}

impl Message for EmptyMessage {}

pub(crate) fn new_request() -> Request {
    Request::new(Box::pin(tokio_stream::once(
        Box::new(EmptyMessage {}) as Box<dyn Message>
    )))
}

/// A subchannel that records connect calls on the test's event channel.
pub(crate) struct TestSubchannel {
    address: Address,
    tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl TestSubchannel {
    fn new(address: Address, tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self { address, tx_events }
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        let _ = self
            .tx_events
            .send(TestEvent::Connect(self.address.clone()));
    }
}

impl Display for TestSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    ScheduleWork,
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({sc})"),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(address) => write!(f, "Connect({address})"),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
        }
    }
}

/// A channel controller that forwards subchannel creations, picker updates,
/// and re-resolution requests onto the test's event channel.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> =
            Arc::new(TestSubchannel::new(address.clone(), self.tx_events.clone()));
        let _ = self
            .tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()));
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        let _ = self.tx_events.send(TestEvent::UpdatePicker(update));
    }

    fn request_resolution(&mut self) {
        let _ = self.tx_events.send(TestEvent::RequestResolution);
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.tx_events.send(TestEvent::ScheduleWork);
    }
}

/// Collects the distinct subchannels visited by `count` picks.
pub(crate) fn collect_picks(picker: &Arc<dyn Picker>, count: usize) -> Vec<Arc<dyn Subchannel>> {
    let mut picked = Vec::new();
    for _ in 0..count {
        let request = new_request();
        match picker.pick(&request) {
            PickResult::Pick(pick) => picked.push(pick.subchannel),
            other => panic!("unexpected pick result {other}"),
        }
    }
    picked
}

/// Asserts the next event is a subchannel creation and hands back the
/// subchannel, in creation order.
pub(crate) async fn verify_subchannel_creation(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    count: usize,
) -> Vec<Arc<dyn Subchannel>> {
    let mut subchannels = Vec::new();
    for _ in 0..count {
        match rx_events.recv().await.unwrap() {
            TestEvent::NewSubchannel(sc) => subchannels.push(sc),
            other => panic!("unexpected event {other:?}"),
        }
    }
    subchannels
}

/// Asserts the next event is a picker update with the wanted aggregate
/// state, returning the picker.
pub(crate) async fn verify_picker_update(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    want_state: ConnectivityState,
) -> Arc<dyn Picker> {
    match rx_events.recv().await.unwrap() {
        TestEvent::UpdatePicker(update) => {
            assert_eq!(
                update.connectivity_state, want_state,
                "unexpected aggregate state"
            );
            update.picker
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// Asserts the next event is a re-resolution request.
pub(crate) async fn verify_resolution_request(rx_events: &mut mpsc::UnboundedReceiver<TestEvent>) {
    match rx_events.recv().await.unwrap() {
        TestEvent::RequestResolution => {}
        other => panic!("unexpected event {other:?}"),
    }
}

/// Asserts the next event is a connect request for `address`.
pub(crate) async fn verify_connect(
    rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
    address: &Address,
) {
    match rx_events.recv().await.unwrap() {
        TestEvent::Connect(got) => assert_eq!(&got, address),
        other => panic!("unexpected event {other:?}"),
    }
}

const NO_ACTIVITY_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

/// Asserts the policy produces no further events for a short while.
pub(crate) async fn verify_no_activity(rx_events: &mut mpsc::UnboundedReceiver<TestEvent>) {
    tokio::select! {
        _ = tokio::time::sleep(NO_ACTIVITY_TIMEOUT) => {}
        event = rx_events.recv() => {
            panic!("unexpected event {:?}", event.unwrap());
        }
    }
}
