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

//! Owns the child balancers of one priority.
//!
//! The group is created idle: children and their resolver states are
//! cached until [`BalancerGroup::start`] builds the balancers, and
//! [`BalancerGroup::close`] tears the balancers down again while
//! keeping the cached configuration, so a priority can be started and
//! stopped repeatedly as failover walks the ladder.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use super::{
    aggregator::WeightedAggregator, BalancerState, ChildBalancer, ChildBuilder, ClientConn,
    ClientConnState, ConnectivityState, SubConn, SubConnKey,
};
use crate::endpoint::ResolvedAddress;

pub(crate) struct BalancerGroup {
    conn: Arc<dyn ClientConn>,
    aggregator: Arc<WeightedAggregator>,
    children: HashMap<String, ChildEntry>,
    shared: Arc<GroupShared>,
    started: bool,
}

struct ChildEntry {
    builder: Arc<dyn ChildBuilder>,
    /// Most recent resolver state, replayed when the group starts.
    state: Option<ClientConnState>,
    /// Built only while the group is started.
    balancer: Option<Box<dyn ChildBalancer>>,
}

/// Routing table from sub-connection to owning child, shared with the
/// per child connection wrappers that insert into it.
#[derive(Default)]
struct GroupShared {
    sub_conn_to_child: Mutex<HashMap<SubConnKey, String>>,
}

impl BalancerGroup {
    pub fn new(conn: Arc<dyn ClientConn>, aggregator: Arc<WeightedAggregator>) -> Self {
        Self {
            conn,
            aggregator,
            children: HashMap::new(),
            shared: Arc::new(GroupShared::default()),
            started: false,
        }
    }

    /// Builds every cached child and replays its resolver state.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        for (id, entry) in &mut self.children {
            let balancer = build_child(id, &entry.builder, &self.conn, &self.aggregator, &self.shared);
            entry.balancer = Some(balancer);
            if let Some(state) = entry.state.clone() {
                if let Some(balancer) = &mut entry.balancer {
                    balancer.update_client_conn_state(state);
                }
            }
        }
    }

    /// Registers a child. When the group is running the balancer is
    /// built immediately, otherwise it is built on `start`.
    pub fn add(&mut self, id: impl Into<String>, builder: Arc<dyn ChildBuilder>) {
        let id = id.into();
        if self.children.contains_key(&id) {
            tracing::warn!(child = %id, "child already in group, ignoring duplicate add");
            return;
        }
        let balancer = self
            .started
            .then(|| build_child(&id, &builder, &self.conn, &self.aggregator, &self.shared));
        self.children.insert(
            id,
            ChildEntry {
                builder,
                state: None,
                balancer,
            },
        );
    }

    /// Removes a child, releasing its sub-connections if it was built.
    pub fn remove(&mut self, id: &str) {
        match self.children.remove(id) {
            Some(mut entry) => {
                if let Some(balancer) = &mut entry.balancer {
                    balancer.close();
                }
            }
            None => tracing::warn!(child = %id, "removing child not in group"),
        }
    }

    /// Forwards new resolver state to a child, caching it for replay.
    pub fn update_client_conn_state(&mut self, id: &str, state: ClientConnState) {
        let Some(entry) = self.children.get_mut(id) else {
            tracing::warn!(child = %id, "resolver update for child not in group");
            return;
        };
        entry.state = Some(state.clone());
        if let Some(balancer) = &mut entry.balancer {
            balancer.update_client_conn_state(state);
        }
    }

    /// Routes a sub-connection state change to the owning child.
    pub fn update_sub_conn_state(&mut self, sub_conn: &Arc<dyn SubConn>, state: ConnectivityState) {
        let key = SubConnKey::new(sub_conn);
        let id = {
            let mut map = self.shared.sub_conn_to_child.lock();
            let Some(id) = map.get(&key).cloned() else {
                tracing::debug!("connectivity change for sub-connection not in group");
                return;
            };
            if state == ConnectivityState::Shutdown {
                map.remove(&key);
            }
            id
        };
        if let Some(entry) = self.children.get_mut(&id) {
            if let Some(balancer) = &mut entry.balancer {
                balancer.update_sub_conn_state(sub_conn, state);
            }
        }
    }

    /// Tears down every child balancer but keeps their cached
    /// configuration so the group can be started again.
    pub fn close(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        for entry in self.children.values_mut() {
            if let Some(mut balancer) = entry.balancer.take() {
                balancer.close();
            }
        }
        self.shared.sub_conn_to_child.lock().clear();
    }
}

fn build_child(
    id: &str,
    builder: &Arc<dyn ChildBuilder>,
    conn: &Arc<dyn ClientConn>,
    aggregator: &Arc<WeightedAggregator>,
    shared: &Arc<GroupShared>,
) -> Box<dyn ChildBalancer> {
    let child_conn = Arc::new(ChildConn {
        id: id.to_owned(),
        conn: conn.clone(),
        aggregator: aggregator.clone(),
        shared: shared.clone(),
    });
    builder.build(child_conn)
}

/// The connection handed to each child balancer. Sub-connection
/// creation is recorded in the group's routing table and state updates
/// are redirected into the aggregator.
struct ChildConn {
    id: String,
    conn: Arc<dyn ClientConn>,
    aggregator: Arc<WeightedAggregator>,
    shared: Arc<GroupShared>,
}

impl ClientConn for ChildConn {
    fn new_sub_conn(&self, addresses: Vec<ResolvedAddress>) -> Arc<dyn SubConn> {
        let sub_conn = self.conn.new_sub_conn(addresses);
        self.shared
            .sub_conn_to_child
            .lock()
            .insert(SubConnKey::new(&sub_conn), self.id.clone());
        sub_conn
    }

    fn remove_sub_conn(&self, sub_conn: &Arc<dyn SubConn>) {
        self.conn.remove_sub_conn(sub_conn);
    }

    fn update_state(&self, state: BalancerState) {
        self.aggregator.update_state(&self.id, state);
    }

    fn resolve_now(&self) {
        self.conn.resolve_now();
    }

    fn target(&self) -> String {
        self.conn.target()
    }
}
