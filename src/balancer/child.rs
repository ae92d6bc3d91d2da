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

//! The built-in child policies managing the endpoints of a single
//! locality.
//!
//! Both policies share one balancer: it diffs resolver updates into
//! sub-connection creates and removals, tracks per connection
//! connectivity, and publishes a fresh picker whenever the ready set
//! changes. They differ only in how the picker spreads picks over the
//! ready connections.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
};

use rand::Rng;

use super::{
    err_picker,
    wrr::WeightedRandom,
    BalancerState, ChildBalancer, ChildBuilder, ClientConn, ClientConnState, ConnectivityState,
    Pick, PickError, PickInfo, Picker, SubConn, SubConnKey,
};
use crate::endpoint::ResolvedAddress;

pub const ROUND_ROBIN: &str = "round_robin";
pub const WEIGHTED_ROUND_ROBIN: &str = "weighted_round_robin";

pub struct RoundRobinBuilder;

impl ChildBuilder for RoundRobinBuilder {
    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }

    fn build(&self, conn: Arc<dyn ClientConn>) -> Box<dyn ChildBalancer> {
        Box::new(EndpointBalancer::new(conn, false))
    }
}

pub struct WeightedRoundRobinBuilder;

impl ChildBuilder for WeightedRoundRobinBuilder {
    fn name(&self) -> &'static str {
        WEIGHTED_ROUND_ROBIN
    }

    fn build(&self, conn: Arc<dyn ClientConn>) -> Box<dyn ChildBalancer> {
        Box::new(EndpointBalancer::new(conn, true))
    }
}

pub(crate) fn builtin_policies() -> Vec<Arc<dyn ChildBuilder>> {
    vec![Arc::new(RoundRobinBuilder), Arc::new(WeightedRoundRobinBuilder)]
}

pub(crate) fn default_policy() -> Arc<dyn ChildBuilder> {
    Arc::new(RoundRobinBuilder)
}

struct EndpointBalancer {
    conn: Arc<dyn ClientConn>,
    weighted: bool,
    sub_conns: HashMap<ResolvedAddress, Arc<dyn SubConn>>,
    states: HashMap<SubConnKey, ConnectivityState>,
    addresses: HashMap<SubConnKey, ResolvedAddress>,
}

impl EndpointBalancer {
    fn new(conn: Arc<dyn ClientConn>, weighted: bool) -> Self {
        Self {
            conn,
            weighted,
            sub_conns: HashMap::new(),
            states: HashMap::new(),
            addresses: HashMap::new(),
        }
    }

    fn aggregate_state(&self) -> ConnectivityState {
        let mut connecting = false;
        for state in self.states.values() {
            match state {
                ConnectivityState::Ready => return ConnectivityState::Ready,
                // An idle sub-connection has a connect pending.
                ConnectivityState::Connecting | ConnectivityState::Idle => connecting = true,
                _ => {}
            }
        }
        if connecting {
            ConnectivityState::Connecting
        } else {
            ConnectivityState::TransientFailure
        }
    }

    fn regenerate_picker(&self) {
        let ready: Vec<(Arc<dyn SubConn>, u32)> = self
            .states
            .iter()
            .filter(|(_, state)| **state == ConnectivityState::Ready)
            .filter_map(|(key, _)| {
                let address = self.addresses.get(key)?;
                let sub_conn = self.sub_conns.get(address)?;
                Some((sub_conn.clone(), address.weight_or_default()))
            })
            .collect();

        let connectivity = self.aggregate_state();
        let picker: Arc<dyn Picker> = if ready.is_empty() {
            match connectivity {
                ConnectivityState::TransientFailure => err_picker(PickError::TransientFailure),
                _ => err_picker(PickError::Queue),
            }
        } else if self.weighted {
            let mut wrr = WeightedRandom::new();
            for (sub_conn, weight) in ready {
                wrr.add(sub_conn, u64::from(weight));
            }
            Arc::new(WeightedPicker { wrr })
        } else {
            let sub_conns: Vec<_> = ready.into_iter().map(|(sub_conn, _)| sub_conn).collect();
            // Start at a random offset so that multiple pickers over
            // the same backends do not synchronize.
            let next = rand::thread_rng().gen_range(0..sub_conns.len());
            Arc::new(RoundRobinPicker {
                sub_conns,
                next: AtomicUsize::new(next),
            })
        };

        self.conn
            .update_state(BalancerState::new(connectivity, picker));
    }
}

impl ChildBalancer for EndpointBalancer {
    fn update_client_conn_state(&mut self, state: ClientConnState) {
        for address in &state.addresses {
            if !self.sub_conns.contains_key(address) {
                let sub_conn = self.conn.new_sub_conn(vec![address.clone()]);
                let key = SubConnKey::new(&sub_conn);
                self.states.insert(key.clone(), ConnectivityState::Idle);
                self.addresses.insert(key, address.clone());
                self.sub_conns.insert(address.clone(), sub_conn.clone());
                sub_conn.connect();
            }
        }

        let removed: Vec<ResolvedAddress> = self
            .sub_conns
            .keys()
            .filter(|address| !state.addresses.contains(*address))
            .cloned()
            .collect();
        for address in removed {
            if let Some(sub_conn) = self.sub_conns.remove(&address) {
                // The connectivity entry stays until Shutdown is
                // delivered, mirroring the sub-connection's lifetime.
                self.conn.remove_sub_conn(&sub_conn);
            }
        }

        self.regenerate_picker();
    }

    fn update_sub_conn_state(&mut self, sub_conn: &Arc<dyn SubConn>, state: ConnectivityState) {
        let key = SubConnKey::new(sub_conn);
        if !self.states.contains_key(&key) {
            tracing::debug!("connectivity change for untracked sub-connection");
            return;
        }

        match state {
            ConnectivityState::Shutdown => {
                self.states.remove(&key);
                if let Some(address) = self.addresses.remove(&key) {
                    // The address may already be served by a newer
                    // sub-connection; only drop it if it still points at
                    // the one shutting down.
                    let same = self
                        .sub_conns
                        .get(&address)
                        .map_or(false, |existing| SubConnKey::new(existing) == key);
                    if same {
                        self.sub_conns.remove(&address);
                    }
                }
            }
            ConnectivityState::Idle => {
                self.states.insert(key, state);
                sub_conn.connect();
            }
            _ => {
                self.states.insert(key, state);
            }
        }

        self.regenerate_picker();
    }

    fn close(&mut self) {
        for (_, sub_conn) in self.sub_conns.drain() {
            self.conn.remove_sub_conn(&sub_conn);
        }
        self.states.clear();
        self.addresses.clear();
    }
}

struct RoundRobinPicker {
    sub_conns: Vec<Arc<dyn SubConn>>,
    next: AtomicUsize,
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _: &PickInfo) -> Result<Pick, PickError> {
        let index = self.next.fetch_add(1, Relaxed) % self.sub_conns.len();
        Ok(Pick::new(self.sub_conns[index].clone()))
    }
}

struct WeightedPicker {
    wrr: WeightedRandom<Arc<dyn SubConn>>,
}

impl Picker for WeightedPicker {
    fn pick(&self, _: &PickInfo) -> Result<Pick, PickError> {
        self.wrr
            .next()
            .map(|sub_conn| Pick::new(sub_conn.clone()))
            .ok_or(PickError::Queue)
    }
}
