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

use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::client::load_balancing::subchannel_list::SubchannelList;
use crate::client::load_balancing::{
    ChannelController, Failing, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbState, Pick, PickResult, Picker, QueuingPicker, Subchannel, WorkScheduler,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::{ConnectivityState, SubchannelState};
use crate::service::Request;
use tonic::metadata::MetadataMap;

pub static POLICY_NAME: &str = "round_robin";

struct RoundRobinBuilder {}

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            _work_scheduler: options.work_scheduler,
            current: None,
            pending: None,
            last_published: None,
            last_resolver_error: None,
            last_connection_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

/// Registers round_robin with the global LB registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(RoundRobinBuilder {});
    });
}

/// Rotates picks over the Ready subchannels of the most recent address list.
///
/// Two subchannel lists may coexist: the current list backs the published
/// picker while a pending list (built for a newer resolver update) connects
/// in the background.  The pending list is promoted the first time it would
/// report Ready, or once all of its subchannels have reported
/// TransientFailure, whichever comes first.
struct RoundRobinPolicy {
    _work_scheduler: Arc<dyn WorkScheduler>,
    current: Option<SubchannelList>,
    pending: Option<SubchannelList>,
    /// The aggregate state most recently published, to avoid republishing an
    /// unchanged Connecting or TransientFailure picker on every subchannel
    /// event.
    last_published: Option<ConnectivityState>,
    last_resolver_error: Option<String>,
    last_connection_error: Option<(Address, String)>,
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match update.addresses {
            Ok(addresses) => {
                let addresses = deduplicate(addresses);
                if addresses.is_empty() {
                    self.current = None;
                    self.pending = None;
                    let error = empty_list_error(&update.resolution_note);
                    self.last_resolver_error = Some(error.clone());
                    self.publish_transient_failure(channel_controller, error.clone());
                    channel_controller.request_resolution();
                    return Err(error.into());
                }

                // A repeated update must not disturb subchannel refs or the
                // published picker.
                let target = self.pending.as_ref().or(self.current.as_ref());
                if let Some(list) = target {
                    if list.addresses() == addresses {
                        return Ok(());
                    }
                }

                let list = SubchannelList::new(&addresses, channel_controller);
                list.request_connection_all();
                if self.current.is_none() {
                    self.current = Some(list);
                    self.publish_aggregate(channel_controller);
                } else {
                    // Keep serving from the current list until the new one
                    // is usable.
                    self.pending = Some(list);
                }
                Ok(())
            }
            Err(error) => {
                debug!("round_robin: resolver error: {error}");
                self.last_resolver_error = Some(error.clone());
                if self.current.is_none() && self.pending.is_none() {
                    self.publish_transient_failure(channel_controller, error);
                    channel_controller.request_resolution();
                }
                // Otherwise keep using the previous good update.
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
        if state.connectivity_state == ConnectivityState::TransientFailure {
            if let Some(error) = &state.last_connection_error {
                self.last_connection_error = Some((subchannel.address(), error.to_string()));
            }
        }

        let in_pending = self
            .pending
            .as_mut()
            .is_some_and(|pending| pending.update(&subchannel, state));
        if in_pending {
            self.maybe_promote_pending(channel_controller);
            return;
        }

        let in_current = self
            .current
            .as_mut()
            .is_some_and(|current| current.update(&subchannel, state));
        if in_current {
            // Reconnect subchannels that return to Idle (e.g. after the
            // backend dropped an established connection).
            if state.connectivity_state == ConnectivityState::Idle {
                subchannel.connect();
            }
            self.publish_aggregate(channel_controller);
        }
        // Updates from an orphaned list arrive after a list swap; ignored.
    }

    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}
}

impl RoundRobinPolicy {
    // The pending list is promoted the first time it would report Ready, or
    // once every subchannel in it has reported TransientFailure (so a stuck
    // attempt in the new list cannot stall the swap indefinitely).
    fn maybe_promote_pending(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(pending) = &self.pending else {
            return;
        };
        let all_failed =
            !pending.is_empty() && pending.num_transient_failure() == pending.num_tracked();
        if pending.num_ready() == 0 && !all_failed {
            return;
        }
        debug!("round_robin: promoting pending subchannel list");
        self.current = self.pending.take();
        self.last_published = None;
        self.publish_aggregate(channel_controller);
    }

    // Aggregation rules, first match wins:
    //   1. any Ready        -> Ready, rotating over the Ready subchannels
    //   2. any Connecting   -> Connecting, queue
    //   3. all TransientFailure -> TransientFailure, fail picks
    // Idle rows (start-up, pre-connect) report Connecting: a connection
    // request is already on its way to each of them.
    fn publish_aggregate(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(current) = &self.current else {
            return;
        };
        if current.num_ready() > 0 {
            let ready: Vec<Arc<dyn Subchannel>> = current
                .rows()
                .filter(|row| row.last_seen_state() == ConnectivityState::Ready)
                .map(|row| row.subchannel().clone())
                .collect();
            // Membership may have changed even when the state did not;
            // always republish Ready.
            self.last_published = Some(ConnectivityState::Ready);
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(RoundRobinPicker::new(ready)),
            });
        } else if current.num_transient_failure() == current.num_tracked() {
            if self.last_published == Some(ConnectivityState::TransientFailure) {
                return;
            }
            let error = self.aggregate_error();
            self.publish_transient_failure(channel_controller, error);
            channel_controller.request_resolution();
        } else {
            if self.last_published == Some(ConnectivityState::Connecting) {
                return;
            }
            self.last_published = Some(ConnectivityState::Connecting);
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::Connecting,
                picker: Arc::new(QueuingPicker {}),
            });
        }
    }

    fn publish_transient_failure(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        error: String,
    ) {
        self.last_published = Some(ConnectivityState::TransientFailure);
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
    }

    // The status carried by a failing picker names the representative
    // failing subchannel, peer address first, for diagnosability.
    fn aggregate_error(&self) -> String {
        if let Some((address, error)) = &self.last_connection_error {
            return format!("{address}: {error}");
        }
        if let Some(error) = &self.last_resolver_error {
            return error.clone();
        }
        "connections to all backends failing".to_string()
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

/// Rotates over the Ready subchannels, starting at a random index so
/// separate channels do not converge on the same backend.
struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    fn new(subchannels: Vec<Arc<dyn Subchannel>>) -> Self {
        let start = rand::random_range(..subchannels.len());
        Self {
            subchannels,
            next: AtomicUsize::new(start),
        }
    }
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Pick(Pick {
            subchannel: self.subchannels[index].clone(),
            on_complete: None,
            metadata: MetadataMap::new(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tonic::async_trait;

    use super::*;
    use crate::client::args::ChannelArgs;
    use crate::client::backoff::FixedBackoff;
    use crate::client::connectivity::StateWatcher;
    use crate::client::load_balancing::test_utils::{
        TestChannelController, TestEvent, TestWorkScheduler, collect_picks, new_request,
        verify_connect, verify_no_activity, verify_picker_update, verify_resolution_request,
        verify_subchannel_creation,
    };
    use crate::client::subchannel::{SharedSubchannel, SubchannelKey, SubchannelPool};
    use crate::client::transport::{ConnectOptions, ConnectedTransport, Connector};
    use crate::client::work_serializer::WorkSerializer;
    use crate::rt::default_runtime;
    use crate::service::{Response, Service, response_from_status};

    fn setup() -> (
        mpsc::UnboundedReceiver<TestEvent>,
        Box<dyn LbPolicy>,
        Box<dyn ChannelController>,
    ) {
        reg();
        let (tx_events, rx_events) = mpsc::unbounded_channel::<TestEvent>();
        let work_scheduler = Arc::new(TestWorkScheduler {
            tx_events: tx_events.clone(),
        });
        let controller = Box::new(TestChannelController { tx_events });
        let builder = GLOBAL_LB_REGISTRY.get_policy(POLICY_NAME).unwrap();
        let policy = builder.build(LbPolicyOptions { work_scheduler });
        (rx_events, policy, controller)
    }

    fn addresses(n: usize) -> Vec<Address> {
        (1..=n)
            .map(|i| Address {
                address: format!("{i}.{i}.{i}.{i}:443"),
                ..Default::default()
            })
            .collect()
    }

    fn send_addresses(
        policy: &mut dyn LbPolicy,
        addresses: Vec<Address>,
        controller: &mut dyn ChannelController,
    ) {
        let update = ResolverUpdate {
            addresses: Ok(addresses),
            ..Default::default()
        };
        let _ = policy.resolver_update(update, None, controller);
    }

    fn send_resolver_error(
        policy: &mut dyn LbPolicy,
        error: &str,
        controller: &mut dyn ChannelController,
    ) {
        let update = ResolverUpdate {
            addresses: Err(error.to_string()),
            ..Default::default()
        };
        let _ = policy.resolver_update(update, None, controller);
    }

    fn move_to(
        policy: &mut dyn LbPolicy,
        subchannel: &Arc<dyn Subchannel>,
        state: ConnectivityState,
        controller: &mut dyn ChannelController,
    ) {
        policy.subchannel_update(subchannel.clone(), &SubchannelState::new(state), controller);
    }

    fn move_to_failure(
        policy: &mut dyn LbPolicy,
        subchannel: &Arc<dyn Subchannel>,
        error: &str,
        controller: &mut dyn ChannelController,
    ) {
        policy.subchannel_update(
            subchannel.clone(),
            &SubchannelState::with_error(ConnectivityState::TransientFailure, error.to_string()),
            controller,
        );
    }

    // Consumes the NewSubchannel + Connect event pairs emitted while a list
    // is built and asked to connect.
    async fn verify_list_creation(
        rx_events: &mut mpsc::UnboundedReceiver<TestEvent>,
        want: &[Address],
    ) -> Vec<Arc<dyn Subchannel>> {
        let subchannels = verify_subchannel_creation(rx_events, want.len()).await;
        for (subchannel, address) in subchannels.iter().zip(want) {
            assert_eq!(&subchannel.address(), address);
        }
        for address in want {
            verify_connect(rx_events, address).await;
        }
        subchannels
    }

    #[test]
    fn builder_is_registered() {
        reg();
        let builder = GLOBAL_LB_REGISTRY.get_policy("round_robin").unwrap();
        assert_eq!(builder.name(), "round_robin");
    }

    #[tokio::test]
    async fn first_update_connects_and_queues() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let addrs = addresses(2);
        send_addresses(policy.as_mut(), addrs.clone(), controller.as_mut());

        let subchannels = verify_list_creation(&mut rx_events, &addrs).await;
        let picker = verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;
        assert!(picker.pick(&new_request()) == PickResult::Queue);

        // Subchannels moving to Connecting must not republish an identical
        // Connecting picker.
        for subchannel in &subchannels {
            move_to(
                policy.as_mut(),
                subchannel,
                ConnectivityState::Connecting,
                controller.as_mut(),
            );
        }
        verify_no_activity(&mut rx_events).await;
    }

    #[tokio::test]
    async fn single_ready_subchannel_gets_all_picks() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let addrs = addresses(1);
        send_addresses(policy.as_mut(), addrs.clone(), controller.as_mut());
        let subchannels = verify_list_creation(&mut rx_events, &addrs).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;

        move_to(
            policy.as_mut(),
            &subchannels[0],
            ConnectivityState::Ready,
            controller.as_mut(),
        );
        let picker = verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;
        for picked in collect_picks(&picker, 5) {
            assert!(picked == subchannels[0].clone());
        }
    }

    // Every K picks across a Ready set of size K visit each subchannel
    // exactly once.
    #[tokio::test]
    async fn picks_form_a_permutation_of_the_ready_set() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let addrs = addresses(3);
        send_addresses(policy.as_mut(), addrs.clone(), controller.as_mut());
        let subchannels = verify_list_creation(&mut rx_events, &addrs).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;

        for subchannel in &subchannels {
            move_to(
                policy.as_mut(),
                subchannel,
                ConnectivityState::Ready,
                controller.as_mut(),
            );
        }
        // One Ready picker per transition; the last covers all three.
        verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;
        let picker = verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;

        let picked = collect_picks(&picker, 6);
        for subchannel in &subchannels {
            let count = picked.iter().filter(|p| *p == subchannel).count();
            assert_eq!(count, 2, "{subchannel} picked {count} times in 6");
        }
        // Consecutive windows of K are permutations: positions i and i+3
        // repeat.
        for i in 0..3 {
            assert!(picked[i] == picked[i + 3].clone());
        }
    }

    // S4: Ready subchannels enter the rotation as they connect; the rest are
    // omitted.
    #[tokio::test]
    async fn ready_set_grows_as_subchannels_connect() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let addrs = addresses(3);
        send_addresses(policy.as_mut(), addrs.clone(), controller.as_mut());
        let subchannels = verify_list_creation(&mut rx_events, &addrs).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;

        move_to(
            policy.as_mut(),
            &subchannels[0],
            ConnectivityState::Ready,
            controller.as_mut(),
        );
        let picker = verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;
        for picked in collect_picks(&picker, 4) {
            assert!(picked == subchannels[0].clone());
        }

        move_to(
            policy.as_mut(),
            &subchannels[1],
            ConnectivityState::Ready,
            controller.as_mut(),
        );
        let picker = verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;
        let picked = collect_picks(&picker, 4);
        assert!(picked.contains(&subchannels[0]));
        assert!(picked.contains(&subchannels[1]));
        assert!(!picked.contains(&subchannels[2]));
    }

    #[tokio::test]
    async fn failed_subchannel_leaves_the_rotation() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let addrs = addresses(2);
        send_addresses(policy.as_mut(), addrs.clone(), controller.as_mut());
        let subchannels = verify_list_creation(&mut rx_events, &addrs).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;

        for subchannel in &subchannels {
            move_to(
                policy.as_mut(),
                subchannel,
                ConnectivityState::Ready,
                controller.as_mut(),
            );
            verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;
        }

        move_to_failure(
            policy.as_mut(),
            &subchannels[1],
            "endpoint down",
            controller.as_mut(),
        );
        let picker = verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;
        let picked = collect_picks(&picker, 4);
        assert!(picked.contains(&subchannels[0]));
        assert!(!picked.contains(&subchannels[1]));
    }

    #[tokio::test]
    async fn all_failed_reports_transient_failure_with_peer_address() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let addrs = addresses(2);
        send_addresses(policy.as_mut(), addrs.clone(), controller.as_mut());
        let subchannels = verify_list_creation(&mut rx_events, &addrs).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;

        move_to_failure(
            policy.as_mut(),
            &subchannels[0],
            "connection refused",
            controller.as_mut(),
        );
        // One failure is not enough: others may still connect.
        verify_no_activity(&mut rx_events).await;

        move_to_failure(
            policy.as_mut(),
            &subchannels[1],
            "connection refused",
            controller.as_mut(),
        );
        let picker =
            verify_picker_update(&mut rx_events, ConnectivityState::TransientFailure).await;
        verify_resolution_request(&mut rx_events).await;
        match picker.pick(&new_request()) {
            PickResult::Fail(status) => {
                assert_eq!(status.code(), tonic::Code::Unavailable);
                assert!(status.message().contains("connection refused"));
                // The representative failing peer is named in the status.
                assert!(status.message().contains(&addrs[1].address));
            }
            other => panic!("unexpected pick result {other}"),
        }
    }

    // The policy stays in TransientFailure through Connecting flapping and
    // recovers only when a subchannel becomes Ready.
    #[tokio::test]
    async fn stays_failed_until_a_subchannel_is_ready() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let addrs = addresses(2);
        send_addresses(policy.as_mut(), addrs.clone(), controller.as_mut());
        let subchannels = verify_list_creation(&mut rx_events, &addrs).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;

        for subchannel in &subchannels {
            move_to_failure(
                policy.as_mut(),
                subchannel,
                "connection refused",
                controller.as_mut(),
            );
        }
        verify_picker_update(&mut rx_events, ConnectivityState::TransientFailure).await;
        verify_resolution_request(&mut rx_events).await;

        // Retry cycles do not resurrect the aggregate state.  The policy
        // reconnects the subchannel when it returns to Idle, but publishes
        // nothing.
        move_to(
            policy.as_mut(),
            &subchannels[0],
            ConnectivityState::Idle,
            controller.as_mut(),
        );
        verify_connect(&mut rx_events, &addrs[0]).await;
        move_to(
            policy.as_mut(),
            &subchannels[0],
            ConnectivityState::Connecting,
            controller.as_mut(),
        );
        verify_no_activity(&mut rx_events).await;

        move_to(
            policy.as_mut(),
            &subchannels[0],
            ConnectivityState::Ready,
            controller.as_mut(),
        );
        let picker = verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;
        for picked in collect_picks(&picker, 2) {
            assert!(picked == subchannels[0].clone());
        }
    }

    #[tokio::test]
    async fn empty_address_list_fails_immediately() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let update = ResolverUpdate {
            addresses: Ok(vec![]),
            resolution_note: "backend service has no endpoints".to_string(),
            ..Default::default()
        };
        assert!(
            policy
                .resolver_update(update, None, controller.as_mut())
                .is_err()
        );
        let picker =
            verify_picker_update(&mut rx_events, ConnectivityState::TransientFailure).await;
        verify_resolution_request(&mut rx_events).await;
        match picker.pick(&new_request()) {
            PickResult::Fail(status) => {
                assert!(status.message().contains("empty address list"));
                assert!(status.message().contains("backend service has no endpoints"));
            }
            other => panic!("unexpected pick result {other}"),
        }
    }

    #[tokio::test]
    async fn resolver_error_before_any_update_fails_picks() {
        let (mut rx_events, mut policy, mut controller) = setup();
        send_resolver_error(policy.as_mut(), "DNS timeout", controller.as_mut());
        let picker =
            verify_picker_update(&mut rx_events, ConnectivityState::TransientFailure).await;
        verify_resolution_request(&mut rx_events).await;
        match picker.pick(&new_request()) {
            PickResult::Fail(status) => assert!(status.message().contains("DNS timeout")),
            other => panic!("unexpected pick result {other}"),
        }
    }

    #[tokio::test]
    async fn resolver_error_after_ready_is_ignored() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let addrs = addresses(1);
        send_addresses(policy.as_mut(), addrs.clone(), controller.as_mut());
        let subchannels = verify_list_creation(&mut rx_events, &addrs).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;
        move_to(
            policy.as_mut(),
            &subchannels[0],
            ConnectivityState::Ready,
            controller.as_mut(),
        );
        let picker = verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;

        send_resolver_error(policy.as_mut(), "DNS timeout", controller.as_mut());
        verify_no_activity(&mut rx_events).await;
        // The old picker keeps working.
        for picked in collect_picks(&picker, 2) {
            assert!(picked == subchannels[0].clone());
        }
    }

    // Two consecutive identical updates must not perturb subchannel refs or
    // the published picker.
    #[tokio::test]
    async fn identical_update_is_a_no_op() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let addrs = addresses(2);
        send_addresses(policy.as_mut(), addrs.clone(), controller.as_mut());
        verify_list_creation(&mut rx_events, &addrs).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;

        send_addresses(policy.as_mut(), addrs.clone(), controller.as_mut());
        verify_no_activity(&mut rx_events).await;
    }

    // A new address list connects in the background; the current picker
    // keeps serving until the new list reports Ready.
    #[tokio::test]
    async fn pending_list_promotes_on_ready() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let old_addrs = addresses(1);
        send_addresses(policy.as_mut(), old_addrs.clone(), controller.as_mut());
        let old_subchannels = verify_list_creation(&mut rx_events, &old_addrs).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;
        move_to(
            policy.as_mut(),
            &old_subchannels[0],
            ConnectivityState::Ready,
            controller.as_mut(),
        );
        verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;

        let new_addrs = vec![
            Address {
                address: "9.9.9.9:443".to_string(),
                ..Default::default()
            },
            Address {
                address: "10.10.10.10:443".to_string(),
                ..Default::default()
            },
        ];
        send_addresses(policy.as_mut(), new_addrs.clone(), controller.as_mut());
        let new_subchannels = verify_list_creation(&mut rx_events, &new_addrs).await;
        // No picker change yet: the old list still serves.
        verify_no_activity(&mut rx_events).await;

        move_to(
            policy.as_mut(),
            &new_subchannels[0],
            ConnectivityState::Connecting,
            controller.as_mut(),
        );
        verify_no_activity(&mut rx_events).await;

        move_to(
            policy.as_mut(),
            &new_subchannels[0],
            ConnectivityState::Ready,
            controller.as_mut(),
        );
        let picker = verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;
        let picked = collect_picks(&picker, 4);
        assert!(picked.contains(&new_subchannels[0]));
        assert!(!picked.contains(&old_subchannels[0]));
    }

    // A pending list that fails entirely is promoted anyway, so a stuck
    // attempt cannot stall the swap.
    #[tokio::test]
    async fn pending_list_promotes_when_all_failed() {
        let (mut rx_events, mut policy, mut controller) = setup();
        let old_addrs = addresses(1);
        send_addresses(policy.as_mut(), old_addrs.clone(), controller.as_mut());
        let old_subchannels = verify_list_creation(&mut rx_events, &old_addrs).await;
        verify_picker_update(&mut rx_events, ConnectivityState::Connecting).await;
        move_to(
            policy.as_mut(),
            &old_subchannels[0],
            ConnectivityState::Ready,
            controller.as_mut(),
        );
        verify_picker_update(&mut rx_events, ConnectivityState::Ready).await;

        let new_addrs = vec![Address {
            address: "9.9.9.9:443".to_string(),
            ..Default::default()
        }];
        send_addresses(policy.as_mut(), new_addrs.clone(), controller.as_mut());
        let new_subchannels = verify_list_creation(&mut rx_events, &new_addrs).await;
        verify_no_activity(&mut rx_events).await;

        move_to_failure(
            policy.as_mut(),
            &new_subchannels[0],
            "connection refused",
            controller.as_mut(),
        );
        let picker =
            verify_picker_update(&mut rx_events, ConnectivityState::TransientFailure).await;
        verify_resolution_request(&mut rx_events).await;
        match picker.pick(&new_request()) {
            PickResult::Fail(status) => {
                assert!(status.message().contains("connection refused"));
            }
            other => panic!("unexpected pick result {other}"),
        }
    }

    // End-to-end: real subchannels from the pool behind the policy, with an
    // in-memory connector.  Covers the watcher bridge, the serializer, and
    // the Idle -> Connecting -> Ready publish sequence.
    struct InstantConnector {}

    struct InstantService {}

    #[async_trait]
    impl Service for InstantService {
        async fn call(&self, _method: String, _request: Request) -> Response {
            response_from_status(tonic::Status::ok(""))
        }
    }

    #[async_trait]
    impl Connector for InstantConnector {
        async fn connect(
            &self,
            _address: String,
            _opts: ConnectOptions,
        ) -> Result<ConnectedTransport, String> {
            let (_tx, rx) = tokio::sync::oneshot::channel();
            Ok(ConnectedTransport {
                service: Box::new(InstantService {}),
                disconnection_listener: rx,
            })
        }
    }

    struct AddressWatcher {
        address: Address,
        tx: mpsc::UnboundedSender<(Address, SubchannelState)>,
    }

    impl StateWatcher for AddressWatcher {
        fn on_state_change(&self, state: SubchannelState) {
            let _ = self.tx.send((self.address.clone(), state));
        }
    }

    // A channel controller that creates real pooled subchannels and bridges
    // their transitions back to the test by address.
    struct PoolController {
        pool: Arc<SubchannelPool>,
        serializer: Arc<WorkSerializer>,
        tx_states: mpsc::UnboundedSender<(Address, SubchannelState)>,
        tx_pickers: mpsc::UnboundedSender<LbState>,
        by_address: Arc<Mutex<HashMap<String, Arc<dyn Subchannel>>>>,
    }

    impl ChannelController for PoolController {
        fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
            let internal = self.pool.get_or_create(
                SubchannelKey::new(address.clone(), &ChannelArgs::default()),
                Arc::new(InstantConnector {}),
                Arc::new(FixedBackoff::new(
                    Duration::from_millis(100),
                    Duration::from_secs(20),
                )),
                default_runtime(),
                self.serializer.clone(),
            );
            let watcher = Arc::new(AddressWatcher {
                address: address.clone(),
                tx: self.tx_states.clone(),
            });
            let shared: Arc<dyn Subchannel> = SharedSubchannel::register(internal, watcher);
            self.by_address
                .lock()
                .unwrap()
                .insert(address.address.clone(), shared.clone());
            shared
        }

        fn update_picker(&mut self, update: LbState) {
            let _ = self.tx_pickers.send(update);
        }

        fn request_resolution(&mut self) {}
    }

    #[tokio::test]
    async fn connects_real_subchannels_end_to_end() {
        reg();
        let (tx_states, mut rx_states) = mpsc::unbounded_channel();
        let (tx_pickers, mut rx_pickers) = mpsc::unbounded_channel();
        let by_address = Arc::new(Mutex::new(HashMap::new()));
        let mut controller = PoolController {
            pool: Arc::new(SubchannelPool::new()),
            serializer: Arc::new(WorkSerializer::new()),
            tx_states,
            tx_pickers,
            by_address: by_address.clone(),
        };

        let builder = GLOBAL_LB_REGISTRY.get_policy(POLICY_NAME).unwrap();
        let (tx_events, _rx_events) = mpsc::unbounded_channel();
        let mut policy = builder.build(LbPolicyOptions {
            work_scheduler: Arc::new(TestWorkScheduler { tx_events }),
        });

        let addr = Address {
            address: "127.0.0.1:50051".to_string(),
            ..Default::default()
        };
        let update = ResolverUpdate {
            addresses: Ok(vec![addr.clone()]),
            ..Default::default()
        };
        policy
            .resolver_update(update, None, &mut controller)
            .unwrap();

        // Drive subchannel transitions into the policy until it goes Ready.
        let mut published = Vec::new();
        loop {
            let (address, state) = rx_states.recv().await.unwrap();
            let subchannel = by_address
                .lock()
                .unwrap()
                .get(&address.address)
                .unwrap()
                .clone();
            policy.subchannel_update(subchannel, &state, &mut controller);
            while let Ok(update) = rx_pickers.try_recv() {
                published.push(update);
            }
            if published
                .last()
                .is_some_and(|u| u.connectivity_state == ConnectivityState::Ready)
            {
                break;
            }
        }

        let states: Vec<ConnectivityState> =
            published.iter().map(|u| u.connectivity_state).collect();
        assert_eq!(
            states,
            vec![ConnectivityState::Connecting, ConnectivityState::Ready]
        );
        let picker = &published.last().unwrap().picker;
        match picker.pick(&new_request()) {
            PickResult::Pick(pick) => assert_eq!(pick.subchannel.address(), addr),
            other => panic!("unexpected pick result {other}"),
        }
    }
}
