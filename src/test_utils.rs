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

//! Recording fakes shared by the unit and integration tests.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    balancer::{
        eds::{EdsBalancer, EdsEvent},
        BalancerState, ClientConn, SubConn, SubConnKey,
    },
    endpoint::{Endpoint, HealthStatus, ResolvedAddress},
    load::LoadReporter,
    locality::Locality,
    xds::{
        resource::{EndpointsUpdate, ListenerUpdate, LocalityEndpoints, RouteConfigUpdate},
        watcher::{ServiceCallback, ServiceUpdate},
        ClusterWatchCallback, EndpointsWatchCallback, ListenerWatchCallback, RouteWatchCallback,
        WatchCancel, XdsClient, XdsError,
    },
};

/// A sub-connection that records connect calls.
pub struct TestSubConn {
    name: String,
    connects: AtomicUsize,
}

impl TestSubConn {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Relaxed)
    }
}

impl SubConn for TestSubConn {
    fn connect(&self) {
        self.connects.fetch_add(1, Relaxed);
    }
}

impl std::fmt::Debug for TestSubConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestSubConn({})", self.name)
    }
}

/// A connection that records created and removed sub-connections and
/// every published state.
#[derive(Default)]
pub struct TestClientConn {
    sub_conns: Mutex<Vec<(Arc<dyn SubConn>, Vec<ResolvedAddress>)>>,
    removed: Mutex<Vec<SubConnKey>>,
    states: Mutex<Vec<BalancerState>>,
    resolve_nows: AtomicUsize,
}

impl TestClientConn {
    /// All sub-connections in creation order, including removed ones.
    pub fn sub_conns(&self) -> Vec<Arc<dyn SubConn>> {
        self.sub_conns
            .lock()
            .iter()
            .map(|(sub_conn, _)| sub_conn.clone())
            .collect()
    }

    /// The addresses the `index`th sub-connection was created for.
    pub fn sub_conn_addresses(&self, index: usize) -> Vec<ResolvedAddress> {
        self.sub_conns.lock()[index].1.clone()
    }

    pub fn sub_conn_index(&self, sub_conn: &Arc<dyn SubConn>) -> Option<usize> {
        let key = SubConnKey::new(sub_conn);
        self.sub_conns
            .lock()
            .iter()
            .position(|(candidate, _)| SubConnKey::new(candidate) == key)
    }

    pub fn created_count(&self) -> usize {
        self.sub_conns.lock().len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.lock().len()
    }

    pub fn latest_state(&self) -> Option<BalancerState> {
        self.states.lock().last().cloned()
    }

    pub fn states_published(&self) -> usize {
        self.states.lock().len()
    }

    pub fn clear_states(&self) {
        self.states.lock().clear();
    }

    /// Registers an externally created sub-connection in the creation
    /// log.
    pub fn track(&self, sub_conn: Arc<dyn SubConn>) {
        self.sub_conns.lock().push((sub_conn, Vec::new()));
    }

    pub fn resolve_now_count(&self) -> usize {
        self.resolve_nows.load(Relaxed)
    }
}

impl ClientConn for TestClientConn {
    fn new_sub_conn(&self, addresses: Vec<ResolvedAddress>) -> Arc<dyn SubConn> {
        let name = addresses
            .first()
            .map(|address| address.addr.clone())
            .unwrap_or_default();
        let sub_conn: Arc<dyn SubConn> = Arc::new(TestSubConn::named(name));
        self.sub_conns.lock().push((sub_conn.clone(), addresses));
        sub_conn
    }

    fn remove_sub_conn(&self, sub_conn: &Arc<dyn SubConn>) {
        self.removed.lock().push(SubConnKey::new(sub_conn));
    }

    fn update_state(&self, state: BalancerState) {
        self.states.lock().push(state);
    }

    fn resolve_now(&self) {
        self.resolve_nows.fetch_add(1, Relaxed);
    }

    fn target(&self) -> String {
        "test:///target".into()
    }
}

/// Records drop reports by category.
#[derive(Default)]
pub struct TestLoadReporter {
    drops: Mutex<Vec<String>>,
}

impl TestLoadReporter {
    pub fn dropped(&self, category: &str) -> usize {
        self.drops
            .lock()
            .iter()
            .filter(|dropped| *dropped == category)
            .count()
    }

    pub fn total_dropped(&self) -> usize {
        self.drops.lock().len()
    }
}

impl LoadReporter for TestLoadReporter {
    fn call_dropped(&self, category: &str) {
        self.drops.lock().push(category.to_owned());
    }
}

struct RegisteredWatch<C> {
    name: String,
    callback: C,
    canceled: Arc<AtomicBool>,
}

/// An xDS client whose responses are pushed by the test.
///
/// Pushed updates are delivered to every watch registered for the
/// resource name, including canceled ones: cancellation is best effort
/// and the watchers are expected to discard late callbacks themselves.
#[derive(Default)]
pub struct TestXdsClient {
    listeners: Mutex<Vec<RegisteredWatch<ListenerWatchCallback>>>,
    routes: Mutex<Vec<RegisteredWatch<RouteWatchCallback>>>,
    clusters: Mutex<Vec<RegisteredWatch<ClusterWatchCallback>>>,
    endpoints: Mutex<Vec<RegisteredWatch<EndpointsWatchCallback>>>,
}

fn register<C>(watches: &Mutex<Vec<RegisteredWatch<C>>>, name: &str, callback: C) -> WatchCancel {
    let canceled = Arc::new(AtomicBool::new(false));
    watches.lock().push(RegisteredWatch {
        name: name.to_owned(),
        callback,
        canceled: canceled.clone(),
    });
    Box::new(move || canceled.store(true, Relaxed))
}

fn watching<C: Clone>(watches: &Mutex<Vec<RegisteredWatch<C>>>, name: &str) -> Vec<C> {
    watches
        .lock()
        .iter()
        .filter(|watch| watch.name == name)
        .map(|watch| watch.callback.clone())
        .collect()
}

fn all_canceled<C>(watches: &Mutex<Vec<RegisteredWatch<C>>>, name: &str) -> bool {
    let watches = watches.lock();
    let mut any = false;
    for watch in watches.iter().filter(|watch| watch.name == name) {
        if !watch.canceled.load(Relaxed) {
            return false;
        }
        any = true;
    }
    any
}

impl TestXdsClient {
    pub fn push_listener(&self, name: &str, update: Result<ListenerUpdate, XdsError>) {
        for callback in watching(&self.listeners, name) {
            callback(update.clone());
        }
    }

    pub fn push_route(&self, name: &str, update: Result<RouteConfigUpdate, XdsError>) {
        for callback in watching(&self.routes, name) {
            callback(update.clone());
        }
    }

    pub fn route_watch_count(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn route_watch_canceled(&self, name: &str) -> bool {
        all_canceled(&self.routes, name)
    }

    pub fn listener_watch_canceled(&self, name: &str) -> bool {
        all_canceled(&self.listeners, name)
    }
}

impl XdsClient for TestXdsClient {
    fn watch_listener(&self, name: &str, callback: ListenerWatchCallback) -> WatchCancel {
        register(&self.listeners, name, callback)
    }

    fn watch_route_config(&self, name: &str, callback: RouteWatchCallback) -> WatchCancel {
        register(&self.routes, name, callback)
    }

    fn watch_cluster(&self, name: &str, callback: ClusterWatchCallback) -> WatchCancel {
        register(&self.clusters, name, callback)
    }

    fn watch_endpoints(&self, name: &str, callback: EndpointsWatchCallback) -> WatchCancel {
        register(&self.endpoints, name, callback)
    }
}

/// Collects everything a service watcher emits.
#[derive(Clone, Default)]
pub struct UpdateLog {
    updates: Arc<Mutex<Vec<Result<ServiceUpdate, XdsError>>>>,
}

impl UpdateLog {
    pub fn callback(&self) -> ServiceCallback {
        let updates = self.updates.clone();
        Arc::new(move |update| updates.lock().push(update))
    }

    pub fn updates(&self) -> Vec<Result<ServiceUpdate, XdsError>> {
        self.updates.lock().clone()
    }
}

/// Feeds every event already sitting in the queue back into the core,
/// including ones produced while handling earlier ones.
pub fn drain_events(eds: &mut EdsBalancer, events: &mut mpsc::UnboundedReceiver<EdsEvent>) {
    while let Ok(event) = events.try_recv() {
        eds.handle_event(event);
    }
}

/// Waits for the next event, letting the paused clock advance through
/// pending timers.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<EdsEvent>) -> Option<EdsEvent> {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .ok()
        .flatten()
}

pub fn healthy_endpoint(address: &str) -> Endpoint {
    Endpoint::with_health(address, HealthStatus::Healthy)
}

pub fn locality_with(
    region: &str,
    priority: u32,
    weight: u32,
    addresses: &[&str],
) -> LocalityEndpoints {
    LocalityEndpoints {
        id: Locality::with_region(region),
        weight,
        priority,
        endpoints: addresses
            .iter()
            .map(|address| healthy_endpoint(address))
            .collect(),
    }
}

pub fn assignment(localities: Vec<LocalityEndpoints>) -> EndpointsUpdate {
    EndpointsUpdate {
        drops: Vec::new(),
        localities,
    }
}
