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

//! Combines the states and pickers of one priority's locality
//! balancers into a single weighted state.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use super::{
    err_picker, wrr::WeightedRandom, BalancerState, ClientConn, ConnectivityState, Pick,
    PickError, PickInfo, Picker,
};

/// Gathers `(weight, state, picker)` per child balancer and publishes
/// the aggregate to the priority's connection whenever it changes.
///
/// While stopped, child updates are recorded but nothing is published;
/// a closed child may still push a final picker and it must not leak
/// upward.
pub(crate) struct WeightedAggregator {
    conn: Arc<dyn ClientConn>,
    inner: Mutex<AggregatorState>,
}

#[derive(Default)]
struct AggregatorState {
    started: bool,
    children: HashMap<String, ChildState>,
}

struct ChildState {
    weight: u32,
    state: BalancerState,
    /// The state used for aggregation. Kept at `TransientFailure` when
    /// a failing child reports `Connecting`, so the aggregate does not
    /// flap between the two while the child retries.
    state_to_aggregate: ConnectivityState,
}

impl ChildState {
    fn new(weight: u32) -> Self {
        Self {
            weight,
            state: BalancerState::connecting(),
            state_to_aggregate: ConnectivityState::Connecting,
        }
    }
}

impl WeightedAggregator {
    pub fn new(conn: Arc<dyn ClientConn>) -> Self {
        Self {
            conn,
            inner: Mutex::new(AggregatorState::default()),
        }
    }

    pub fn start(&self) {
        self.inner.lock().started = true;
    }

    /// Stops publication and resets every child to the initial
    /// `Connecting` placeholder, keeping weights for a later restart.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.started = false;
        for child in inner.children.values_mut() {
            child.state = BalancerState::connecting();
            child.state_to_aggregate = ConnectivityState::Connecting;
        }
    }

    /// Adds a child as a `Connecting` placeholder until it reports.
    pub fn add(&self, id: &str, weight: u32) {
        self.inner
            .lock()
            .children
            .insert(id.to_owned(), ChildState::new(weight));
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().children.remove(id);
    }

    pub fn update_weight(&self, id: &str, weight: u32) {
        if let Some(child) = self.inner.lock().children.get_mut(id) {
            child.weight = weight;
        }
    }

    /// Ingests a state update from a child balancer and republishes the
    /// aggregate.
    pub fn update_state(&self, id: &str, state: BalancerState) {
        let mut inner = self.inner.lock();
        let Some(child) = inner.children.get_mut(id) else {
            // Either removed or never added; a late update from a
            // closed child.
            return;
        };
        if !(child.state_to_aggregate == ConnectivityState::TransientFailure
            && state.connectivity == ConnectivityState::Connecting)
        {
            child.state_to_aggregate = state.connectivity;
        }
        child.state = state;

        if !inner.started {
            return;
        }
        let aggregate = build(&inner);
        self.conn.update_state(aggregate);
    }

    /// Recomputes and publishes the aggregate after weights or child
    /// membership changed.
    pub fn build_and_update(&self) {
        let inner = self.inner.lock();
        if !inner.started {
            return;
        }
        let aggregate = build(&inner);
        self.conn.update_state(aggregate);
    }
}

fn build(inner: &AggregatorState) -> BalancerState {
    let mut ready = Vec::new();
    let mut connecting = 0;
    for child in inner.children.values() {
        match child.state_to_aggregate {
            ConnectivityState::Ready => ready.push((child.state.picker.clone(), child.weight)),
            ConnectivityState::Connecting => connecting += 1,
            _ => {}
        }
    }

    if !ready.is_empty() {
        let mut wrr = WeightedRandom::new();
        for (picker, weight) in ready {
            wrr.add(picker, u64::from(weight));
        }
        BalancerState::new(
            ConnectivityState::Ready,
            Arc::new(WeightedPickerGroup { wrr }),
        )
    } else if connecting > 0 {
        BalancerState::new(ConnectivityState::Connecting, err_picker(PickError::Queue))
    } else {
        BalancerState::new(
            ConnectivityState::TransientFailure,
            err_picker(PickError::TransientFailure),
        )
    }
}

/// Picks a ready child by weight, then delegates the pick to it.
struct WeightedPickerGroup {
    wrr: WeightedRandom<Arc<dyn Picker>>,
}

impl Picker for WeightedPickerGroup {
    fn pick(&self, info: &PickInfo) -> Result<Pick, PickError> {
        match self.wrr.next() {
            Some(picker) => picker.pick(info),
            None => Err(PickError::Queue),
        }
    }
}
