/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The endpoint load balancing core.
//!
//! Consumes EDS responses, maintains one balancer group per priority
//! with a child balancer per locality inside it, and publishes pickers
//! to the host connection with drop and circuit breaking policies
//! applied on top of whichever priority currently serves.

use std::{collections::HashMap, num::NonZeroU32, sync::Arc};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::IntGauge;
use tokio::sync::mpsc;

use super::{
    aggregator::WeightedAggregator,
    child::{self, WEIGHTED_ROUND_ROBIN},
    drop::{DropPicker, Dropper},
    err_picker,
    group::BalancerGroup,
    priority::PriorityManager,
    BalancerState, ChildBuilder, ClientConn, ClientConnState, ConnectivityState, PickError,
    Picker, SubConn, SubConnKey,
};
use crate::{
    config::{self, DEFAULT_SERVICE_REQUEST_COUNT_MAX},
    counter::{self, CounterRef},
    endpoint::ResolvedAddress,
    load::LoadReporter,
    locality::Locality,
    xds::resource::{EndpointsUpdate, LocalityEndpoints, MalformedUpdate, OverloadDropConfig},
};

fn active_priorities() -> &'static IntGauge {
    static ACTIVE_PRIORITIES: Lazy<IntGauge> = Lazy::new(|| {
        crate::metrics::register(
            IntGauge::with_opts(crate::metrics::opts(
                "active_priorities",
                "eds",
                "Number of priorities in the current endpoint assignment.",
            ))
            .unwrap(),
        )
    });

    &ACTIVE_PRIORITIES
}

fn active_localities() -> &'static IntGauge {
    static ACTIVE_LOCALITIES: Lazy<IntGauge> = Lazy::new(|| {
        crate::metrics::register(
            IntGauge::with_opts(crate::metrics::opts(
                "active_localities",
                "eds",
                "Number of localities currently load balanced across.",
            ))
            .unwrap(),
        )
    });

    &ACTIVE_LOCALITIES
}

/// A failover tier. Lower values are preferred; 0 is the highest
/// priority.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Priority(pub u32);

impl Priority {
    pub(crate) fn next_lower(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether `self` is preferred over `other`.
    pub(crate) fn higher_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Events delivered back to the core's serialized worker: child state
/// published by a priority's aggregator, and init timer firings.
///
/// The host drains the receiving half of the channel handed to
/// [`EdsBalancer::new`] and feeds each event to
/// [`EdsBalancer::handle_event`].
#[derive(Debug)]
pub enum EdsEvent {
    ChildState {
        priority: Priority,
        state: BalancerState,
    },
    InitTimeout {
        priority: Priority,
        generation: u64,
    },
}

/// The balancer group of one priority together with the locality
/// configuration it was built from.
pub(crate) struct PriorityGroup {
    pub(crate) group: BalancerGroup,
    pub(crate) aggregator: Arc<WeightedAggregator>,
    pub(crate) configs: HashMap<Locality, LocalityConfig>,
}

#[derive(Debug)]
pub(crate) struct LocalityConfig {
    weight: u32,
    addresses: Vec<ResolvedAddress>,
}

/// The EDS load balancing core.
///
/// Localities are picked by weighted random selection among the ready
/// ones of the serving priority; a configurable child policy manages
/// the endpoints inside each locality.
///
/// All methods must be called from one logical worker; the borrow
/// checker enforces this through `&mut self`. Work originating on
/// other threads (child state publication, timer firings) arrives as
/// [`EdsEvent`]s on the channel supplied at construction.
pub struct EdsBalancer {
    conn: Arc<dyn ClientConn>,
    load_reporter: Option<Arc<dyn LoadReporter>>,
    events: mpsc::UnboundedSender<EdsEvent>,

    child_builder: Arc<dyn ChildBuilder>,
    child_config: Option<serde_json::Value>,
    priority_to_group: HashMap<Priority, PriorityGroup>,
    priorities: PriorityManager,
    response_received: bool,

    // Shared with the per priority connection wrappers, which insert
    // ownership entries as their children create sub-connections.
    sub_conns: Arc<Mutex<HashMap<SubConnKey, Priority>>>,

    drop_config: Vec<OverloadDropConfig>,
    drops: Vec<Arc<Dropper>>,
    /// The serving priority's state, before drop wrapping.
    inner_state: Option<BalancerState>,
    counter: Option<CounterRef>,
    count_max: u32,
}

impl EdsBalancer {
    /// Creates a core publishing pickers to `conn`. Events sent on the
    /// paired receiver of `events` must be fed back via
    /// [`handle_event`].
    ///
    /// The balancer groups are not started here; the priority manager
    /// starts them as failover requires.
    ///
    /// [`handle_event`]: Self::handle_event
    pub fn new(
        conn: Arc<dyn ClientConn>,
        load_reporter: Option<Arc<dyn LoadReporter>>,
        events: mpsc::UnboundedSender<EdsEvent>,
    ) -> Self {
        Self {
            priorities: PriorityManager::new(conn.clone(), events.clone()),
            conn,
            load_reporter,
            events,
            child_builder: child::default_policy(),
            child_config: None,
            priority_to_group: HashMap::new(),
            response_received: false,
            sub_conns: Arc::new(Mutex::new(HashMap::new())),
            drop_config: Vec::new(),
            drops: Vec::new(),
            inner_state: None,
            counter: None,
            count_max: DEFAULT_SERVICE_REQUEST_COUNT_MAX,
        }
    }

    /// Switches the policy managing endpoints inside each locality.
    ///
    /// An unknown policy name keeps the current one. Otherwise every
    /// existing locality balancer is rebuilt under the new policy; the
    /// rebuilt children publish their own pickers, so no picker update
    /// is emitted from here.
    pub fn handle_child_policy(&mut self, name: &str, policy_config: Option<serde_json::Value>) {
        if self.child_builder.name() == name {
            return;
        }
        let Some(builder) = super::child_policy(name) else {
            tracing::warn!(
                policy = %name,
                current = %self.child_builder.name(),
                "unknown child policy, keeping current"
            );
            return;
        };
        self.child_builder = builder;
        self.child_config = policy_config;

        for group in self.priority_to_group.values_mut() {
            for (id, locality_config) in &group.configs {
                let key = id.to_string();
                group.group.remove(&key);
                group.group.add(key.clone(), self.child_builder.clone());
                group.group.update_client_conn_state(
                    &key,
                    ClientConnState {
                        addresses: locality_config.addresses.clone(),
                        config: self.child_config.clone(),
                    },
                );
            }
        }
    }

    /// Applies one EDS response: updates drop policy, creates and
    /// deletes priorities and localities, and hands the priority
    /// manager any change in the priority set.
    ///
    /// A malformed update is rejected wholesale and the previously
    /// applied state kept.
    pub fn handle_eds_response(&mut self, update: EndpointsUpdate) -> Result<(), MalformedUpdate> {
        update.validate()?;

        // An empty first response is indistinguishable from the
        // initial state, so the failure picker has to be published
        // explicitly.
        if !self.response_received && update.is_empty() {
            self.conn.update_state(BalancerState::new(
                ConnectivityState::TransientFailure,
                err_picker(PickError::AllPrioritiesRemoved),
            ));
        }
        self.response_received = true;

        // Drops are applied before the localities so that one atomic
        // EDS change is seen atomically at the picker layer.
        self.update_drops(&update.drops);

        // Localities with zero weight take no traffic; they get no
        // child balancer at all.
        let mut buckets: HashMap<Priority, Vec<&LocalityEndpoints>> = HashMap::new();
        for locality in &update.localities {
            if locality.weight == 0 {
                continue;
            }
            buckets
                .entry(Priority(locality.priority))
                .or_default()
                .push(locality);
        }

        let mut priority_changed = false;
        let mut lowest: Option<Priority> = None;

        for (&priority, localities) in &buckets {
            lowest = Some(lowest.map_or(priority, |lowest: Priority| lowest.max(priority)));

            if !self.priority_to_group.contains_key(&priority) {
                let group = self.new_priority_group(priority);
                self.priority_to_group.insert(priority, group);
                priority_changed = true;
                tracing::info!(%priority, "new priority added");
            }

            let builder = self.child_builder.clone();
            let child_config = self.child_config.clone();
            if let Some(group) = self.priority_to_group.get_mut(&priority) {
                apply_priority_localities(group, &builder, child_config, localities);
            }
        }
        self.priorities.set_lowest(lowest);

        let removed: Vec<Priority> = self
            .priority_to_group
            .keys()
            .filter(|priority| !buckets.contains_key(*priority))
            .copied()
            .collect();
        for priority in removed {
            if let Some(mut group) = self.priority_to_group.remove(&priority) {
                group.aggregator.stop();
                group.group.close();
            }
            self.priorities.forget(priority);
            priority_changed = true;
            tracing::info!(%priority, "priority deleted");
        }

        if priority_changed {
            self.priorities
                .handle_priority_change(&mut self.priority_to_group);
        }

        active_priorities().set(self.priority_to_group.len() as i64);
        active_localities().set(
            self.priority_to_group
                .values()
                .map(|group| group.configs.len())
                .sum::<usize>() as i64,
        );
        Ok(())
    }

    /// Routes a sub-connection state change to the priority that
    /// created the connection. The ownership entry is dropped once the
    /// connection reports `Shutdown`.
    pub fn handle_sub_conn_state_change(
        &mut self,
        sub_conn: &Arc<dyn SubConn>,
        state: ConnectivityState,
    ) {
        let key = SubConnKey::new(sub_conn);
        let priority = {
            let mut sub_conns = self.sub_conns.lock();
            let Some(&priority) = sub_conns.get(&key) else {
                tracing::debug!("state change for sub-connection with no owning priority");
                return;
            };
            if state == ConnectivityState::Shutdown {
                sub_conns.remove(&key);
            }
            priority
        };

        let Some(group) = self.priority_to_group.get_mut(&priority) else {
            tracing::debug!(%priority, "state change for a deleted priority");
            return;
        };
        group.group.update_sub_conn_state(sub_conn, state);
    }

    /// Reconfigures circuit breaking: swaps the interned counter when
    /// the service changed and updates the cap. Republishes the picker
    /// when either changed. A no-op while circuit breaking is
    /// disabled.
    pub fn update_service_requests_config(&mut self, service_name: &str, max: Option<u32>) {
        if !config::circuit_breaking_enabled() {
            return;
        }

        let mut update_picker = false;
        if self
            .counter
            .as_ref()
            .map_or(true, |counter| counter.service_name() != service_name)
        {
            self.counter = Some(counter::service_requests_counter(service_name));
            update_picker = true;
        }

        let new_max = max.unwrap_or(DEFAULT_SERVICE_REQUEST_COUNT_MAX);
        if self.count_max != new_max {
            self.count_max = new_max;
            update_picker = true;
        }

        if update_picker {
            if let Some(inner) = self.inner_state.clone() {
                self.conn.update_state(BalancerState::new(
                    inner.connectivity,
                    self.wrap_picker(inner.picker),
                ));
            }
        }
    }

    /// Feeds back one event from the channel supplied at construction.
    pub fn handle_event(&mut self, event: EdsEvent) {
        match event {
            EdsEvent::ChildState { priority, state } => self.update_state(priority, state),
            EdsEvent::InitTimeout {
                priority,
                generation,
            } => self.priorities.handle_init_timeout(
                priority,
                generation,
                &mut self.priority_to_group,
            ),
        }
    }

    /// Stops the init timer, all aggregators and balancer groups, and
    /// releases the counter reference.
    pub fn close(&mut self) {
        self.priorities.stop_timer();
        for group in self.priority_to_group.values_mut() {
            group.aggregator.stop();
            group.group.close();
        }
        self.counter = None;
    }

    /// Handles new state from one priority: the priority manager
    /// decides whether it becomes the serving state, and if so it is
    /// published wrapped in the drop picker.
    fn update_state(&mut self, priority: Priority, state: BalancerState) {
        if !self.priority_to_group.contains_key(&priority) {
            tracing::debug!(%priority, "picker update from unknown priority");
            return;
        }

        if self
            .priorities
            .handle_state_update(priority, state.clone(), &mut self.priority_to_group)
        {
            self.inner_state = Some(state.clone());
            self.conn.update_state(BalancerState::new(
                state.connectivity,
                self.wrap_picker(state.picker),
            ));
        }
    }

    /// Rebuilds the droppers when the drop configuration changed, and
    /// republishes the current picker under the new policy.
    fn update_drops(&mut self, drop_config: &[OverloadDropConfig]) {
        if drop_config == self.drop_config.as_slice() {
            return;
        }
        self.drop_config = drop_config.to_vec();
        self.drops = self
            .drop_config
            .iter()
            .map(|config| Arc::new(Dropper::new(config.clone())))
            .collect();

        if let Some(inner) = self.inner_state.clone() {
            self.conn.update_state(BalancerState::new(
                inner.connectivity,
                self.wrap_picker(inner.picker),
            ));
        }
    }

    fn wrap_picker(&self, inner: Arc<dyn Picker>) -> Arc<dyn Picker> {
        Arc::new(DropPicker::new(
            inner,
            self.drops.clone(),
            self.load_reporter.clone(),
            self.counter.as_ref().map(CounterRef::counter),
            self.count_max,
        ))
    }

    fn new_priority_group(&self, priority: Priority) -> PriorityGroup {
        let conn: Arc<dyn ClientConn> = Arc::new(PriorityConn {
            conn: self.conn.clone(),
            priority,
            events: self.events.clone(),
            sub_conns: self.sub_conns.clone(),
        });
        let aggregator = Arc::new(WeightedAggregator::new(conn.clone()));
        PriorityGroup {
            group: BalancerGroup::new(conn, aggregator.clone()),
            aggregator,
            configs: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn timer_armed(&self) -> bool {
        self.priorities.timer_armed()
    }

    #[cfg(test)]
    pub(crate) fn priority_in_use(&self) -> Option<Priority> {
        self.priorities.in_use()
    }
}

/// Reconciles one priority's balancer group against the localities the
/// latest response assigned to that priority.
fn apply_priority_localities(
    group: &mut PriorityGroup,
    builder: &Arc<dyn ChildBuilder>,
    child_config: Option<serde_json::Value>,
    localities: &[&LocalityEndpoints],
) {
    let weighted = builder.name() == WEIGHTED_ROUND_ROBIN;
    let mut rebuild = false;

    for locality in localities {
        let id = &locality.id;
        let key = id.to_string();

        let addresses: Vec<ResolvedAddress> = locality
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.health.is_usable())
            .map(|endpoint| ResolvedAddress {
                addr: endpoint.address.clone(),
                weight: weighted
                    .then(|| NonZeroU32::new(endpoint.weight))
                    .flatten(),
            })
            .collect();

        match group.configs.get_mut(id) {
            None => {
                group.aggregator.add(&key, locality.weight);
                group.group.add(key.clone(), builder.clone());
                group.group.update_client_conn_state(
                    &key,
                    ClientConnState {
                        addresses: addresses.clone(),
                        config: child_config.clone(),
                    },
                );
                group.configs.insert(
                    id.clone(),
                    LocalityConfig {
                        weight: locality.weight,
                        addresses,
                    },
                );
                tracing::info!(locality = %id, "new locality added");
            }
            Some(config) => {
                let weight_changed = config.weight != locality.weight;
                // Order sensitive comparison: a reordered address list
                // counts as a change.
                let addresses_changed = config.addresses != addresses;
                tracing::debug!(
                    locality = %id,
                    weight_changed,
                    addresses_changed,
                    "locality updated"
                );

                if weight_changed {
                    config.weight = locality.weight;
                    group.aggregator.update_weight(&key, locality.weight);
                    rebuild = true;
                }
                if addresses_changed {
                    config.addresses = addresses.clone();
                    group.group.update_client_conn_state(
                        &key,
                        ClientConnState {
                            addresses,
                            config: child_config.clone(),
                        },
                    );
                }
            }
        }
    }

    let removed: Vec<Locality> = group
        .configs
        .keys()
        .filter(|id| !localities.iter().any(|locality| locality.id == **id))
        .cloned()
        .collect();
    for id in removed {
        let key = id.to_string();
        group.aggregator.remove(&key);
        group.group.remove(&key);
        group.configs.remove(&id);
        tracing::info!(locality = %id, "locality deleted");
        rebuild = true;
    }

    if rebuild {
        group.aggregator.build_and_update();
    }
}

/// The connection handed to each priority's balancer group. It records
/// sub-connection ownership and tags state updates with the priority
/// before enqueueing them for the core, holding no reference to the
/// core itself.
struct PriorityConn {
    conn: Arc<dyn ClientConn>,
    priority: Priority,
    events: mpsc::UnboundedSender<EdsEvent>,
    sub_conns: Arc<Mutex<HashMap<SubConnKey, Priority>>>,
}

impl ClientConn for PriorityConn {
    fn new_sub_conn(&self, addresses: Vec<ResolvedAddress>) -> Arc<dyn SubConn> {
        let sub_conn = self.conn.new_sub_conn(addresses);
        self.sub_conns
            .lock()
            .insert(SubConnKey::new(&sub_conn), self.priority);
        sub_conn
    }

    fn remove_sub_conn(&self, sub_conn: &Arc<dyn SubConn>) {
        self.conn.remove_sub_conn(sub_conn);
    }

    fn update_state(&self, state: BalancerState) {
        // The receiver is gone only when the core is shutting down.
        let _ = self.events.send(EdsEvent::ChildState {
            priority: self.priority,
            state,
        });
    }

    fn resolve_now(&self) {
        self.conn.resolve_now();
    }

    fn target(&self) -> String {
        self.conn.target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        endpoint::{Endpoint, HealthStatus},
        test_utils::{
            assignment, drain_events, healthy_endpoint, locality_with, TestClientConn,
        },
        xds::resource::OverloadDropConfig,
        PickInfo,
    };

    fn new_core(
        conn: &Arc<TestClientConn>,
    ) -> (EdsBalancer, mpsc::UnboundedReceiver<EdsEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (EdsBalancer::new(conn.clone(), None, events_tx), events_rx)
    }

    fn make_ready(
        eds: &mut EdsBalancer,
        events: &mut mpsc::UnboundedReceiver<EdsEvent>,
        conn: &Arc<TestClientConn>,
    ) {
        for sub_conn in conn.sub_conns() {
            eds.handle_sub_conn_state_change(&sub_conn, ConnectivityState::Ready);
            drain_events(eds, events);
        }
    }

    #[tokio::test]
    async fn first_empty_response_publishes_failure() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        eds.handle_eds_response(EndpointsUpdate::default()).unwrap();
        drain_events(&mut eds, &mut events);

        let state = conn.latest_state().unwrap();
        assert_eq!(state.connectivity, ConnectivityState::TransientFailure);
        assert_eq!(
            state.picker.pick(&PickInfo::default()).unwrap_err(),
            PickError::AllPrioritiesRemoved
        );
    }

    #[tokio::test]
    async fn weight_zero_localities_get_no_child() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        eds.handle_eds_response(assignment(vec![
            locality_with("serving", 0, 1, &["10.0.0.1:80"]),
            locality_with("ignored", 0, 0, &["10.0.0.2:80"]),
        ]))
        .unwrap();
        drain_events(&mut eds, &mut events);

        assert_eq!(conn.created_count(), 1);
        assert_eq!(conn.sub_conn_addresses(0)[0].addr, "10.0.0.1:80");
    }

    #[tokio::test]
    async fn unhealthy_endpoints_filtered() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        let mut locality = locality_with("a", 0, 1, &["10.0.0.1:80"]);
        locality.endpoints.extend([
            Endpoint::with_health("10.0.0.2:80", HealthStatus::Unhealthy),
            Endpoint::with_health("10.0.0.3:80", HealthStatus::Draining),
            Endpoint::with_health("10.0.0.4:80", HealthStatus::Timeout),
            Endpoint::with_health("10.0.0.5:80", HealthStatus::Degraded),
            Endpoint::with_health("10.0.0.6:80", HealthStatus::Unknown),
        ]);
        eds.handle_eds_response(assignment(vec![locality])).unwrap();
        drain_events(&mut eds, &mut events);

        let addresses: Vec<String> = (0..conn.created_count())
            .map(|index| conn.sub_conn_addresses(index)[0].addr.clone())
            .collect();
        assert_eq!(addresses, ["10.0.0.1:80", "10.0.0.6:80"]);
    }

    #[tokio::test]
    async fn same_update_twice_changes_nothing() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        let update = assignment(vec![
            locality_with("a", 0, 2, &["10.0.0.1:80", "10.0.0.2:80"]),
            locality_with("b", 1, 1, &["10.0.1.1:80"]),
        ]);
        eds.handle_eds_response(update.clone()).unwrap();
        drain_events(&mut eds, &mut events);
        let created = conn.created_count();
        let removed = conn.removed_count();

        eds.handle_eds_response(update).unwrap();
        drain_events(&mut eds, &mut events);
        assert_eq!(conn.created_count(), created);
        assert_eq!(conn.removed_count(), removed);
    }

    #[tokio::test]
    async fn malformed_update_keeps_previous_state() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        eds.handle_eds_response(assignment(vec![locality_with("a", 0, 1, &["10.0.0.1:80"])]))
            .unwrap();
        drain_events(&mut eds, &mut events);
        let created = conn.created_count();

        let err = eds
            .handle_eds_response(assignment(vec![
                locality_with("a", 0, 1, &["10.0.0.1:80"]),
                locality_with("b", 2, 1, &["10.0.0.2:80"]),
            ]))
            .unwrap_err();
        assert_eq!(err, MalformedUpdate::SparsePriorities { missing: 1, max: 2 });
        drain_events(&mut eds, &mut events);

        assert_eq!(conn.created_count(), created);
        make_ready(&mut eds, &mut events, &conn);
        assert_eq!(
            conn.latest_state().unwrap().connectivity,
            ConnectivityState::Ready
        );
    }

    #[tokio::test]
    async fn at_most_one_init_timer() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        eds.handle_eds_response(assignment(vec![
            locality_with("a", 0, 1, &["10.0.0.1:80"]),
            locality_with("b", 1, 1, &["10.0.1.1:80"]),
        ]))
        .unwrap();
        drain_events(&mut eds, &mut events);
        assert!(eds.timer_armed());
        assert_eq!(eds.priority_in_use(), Some(Priority(0)));

        // Failing over re-arms for the next priority; still one timer.
        let first = conn.sub_conns()[0].clone();
        eds.handle_sub_conn_state_change(&first, ConnectivityState::TransientFailure);
        drain_events(&mut eds, &mut events);
        assert!(eds.timer_armed());
        assert_eq!(eds.priority_in_use(), Some(Priority(1)));

        // Becoming ready cancels the timer.
        make_ready(&mut eds, &mut events, &conn);
        assert!(!eds.timer_armed());
    }

    #[tokio::test]
    async fn changed_drops_republish_current_picker() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        eds.handle_eds_response(assignment(vec![locality_with("a", 0, 1, &["10.0.0.1:80"])]))
            .unwrap();
        drain_events(&mut eds, &mut events);
        make_ready(&mut eds, &mut events, &conn);

        let mut update = assignment(vec![locality_with("a", 0, 1, &["10.0.0.1:80"])]);
        update.drops = vec![OverloadDropConfig {
            category: "throttle".into(),
            numerator: 1_000_000,
            denominator: 1_000_000,
        }];
        eds.handle_eds_response(update).unwrap();

        // The republished picker applies the new drop policy without
        // waiting for any child update.
        let state = conn.latest_state().unwrap();
        assert_eq!(state.connectivity, ConnectivityState::Ready);
        assert_eq!(
            state.picker.pick(&PickInfo::default()).unwrap_err(),
            PickError::Unavailable("RPC is dropped".into())
        );
    }

    #[tokio::test]
    async fn unknown_child_policy_keeps_current() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        eds.handle_eds_response(assignment(vec![locality_with("a", 0, 1, &["10.0.0.1:80"])]))
            .unwrap();
        drain_events(&mut eds, &mut events);
        let created = conn.created_count();

        eds.handle_child_policy("pick_first", None);
        drain_events(&mut eds, &mut events);
        assert_eq!(conn.created_count(), created);
        assert_eq!(conn.removed_count(), 0);
    }

    #[tokio::test]
    async fn child_policy_switch_rebuilds_localities() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        let mut locality = locality_with("a", 0, 1, &[]);
        locality.endpoints = vec![Endpoint {
            weight: 7,
            ..healthy_endpoint("10.0.0.1:80")
        }];
        eds.handle_eds_response(assignment(vec![locality.clone()])).unwrap();
        drain_events(&mut eds, &mut events);
        assert_eq!(conn.created_count(), 1);

        eds.handle_child_policy(child::WEIGHTED_ROUND_ROBIN, None);
        drain_events(&mut eds, &mut events);
        assert_eq!(conn.removed_count(), 1);
        assert_eq!(conn.created_count(), 2);

        // The next response resolves addresses with their endpoint
        // weights attached.
        locality.endpoints[0].weight = 9;
        eds.handle_eds_response(assignment(vec![locality])).unwrap();
        drain_events(&mut eds, &mut events);
        let addresses = conn.sub_conn_addresses(conn.created_count() - 1);
        assert_eq!(addresses[0].weight, NonZeroU32::new(9));
    }

    #[tokio::test]
    async fn removed_priority_group_closed() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        eds.handle_eds_response(assignment(vec![
            locality_with("a", 0, 1, &["10.0.0.1:80"]),
            locality_with("b", 1, 1, &["10.0.1.1:80"]),
        ]))
        .unwrap();
        drain_events(&mut eds, &mut events);

        eds.handle_eds_response(assignment(vec![locality_with("a", 0, 1, &["10.0.0.1:80"])]))
            .unwrap();
        drain_events(&mut eds, &mut events);
        assert!(!eds.priority_to_group.contains_key(&Priority(1)));
    }

    #[tokio::test]
    async fn close_releases_everything() {
        let conn = Arc::new(TestClientConn::default());
        let (mut eds, mut events) = new_core(&conn);

        eds.handle_eds_response(assignment(vec![locality_with("a", 0, 1, &["10.0.0.1:80"])]))
            .unwrap();
        drain_events(&mut eds, &mut events);
        assert!(eds.timer_armed());

        eds.close();
        assert!(!eds.timer_armed());
        assert_eq!(conn.removed_count(), 1);
    }
}
