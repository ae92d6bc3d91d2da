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

//! Selects the single priority that serves traffic and drives failover
//! down the ladder when it cannot become ready.

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;
use prometheus::IntCounter;
use tokio::{sync::mpsc, task::JoinHandle};

use super::{
    eds::{EdsEvent, Priority, PriorityGroup},
    err_picker, BalancerState, ClientConn, ConnectivityState, PickError,
};
use crate::config::DEFAULT_PRIORITY_INIT_TIMEOUT;

fn failovers() -> &'static IntCounter {
    static FAILOVERS: Lazy<IntCounter> = Lazy::new(|| {
        crate::metrics::register(
            IntCounter::with_opts(crate::metrics::opts(
                "failovers_total",
                "priority",
                "Number of times traffic moved to a lower priority.",
            ))
            .unwrap(),
        )
    });

    &FAILOVERS
}

/// The armed init timer. At most one exists because at most one
/// priority can be in its init window.
struct InitTimer {
    priority: Priority,
    generation: u64,
    handle: JoinHandle<()>,
}

impl Drop for InitTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Tracks which priority serves traffic, each priority's most recent
/// state, and the init timer of the priority currently starting up.
///
/// State published from here bypasses the drop picker: it is either an
/// error picker or a cached child state that the core re-wraps on the
/// next child update.
pub(crate) struct PriorityManager {
    conn: Arc<dyn ClientConn>,
    events: mpsc::UnboundedSender<EdsEvent>,
    in_use: Option<Priority>,
    lowest: Option<Priority>,
    states: HashMap<Priority, BalancerState>,
    init_timer: Option<InitTimer>,
    generation: u64,
}

impl PriorityManager {
    pub fn new(conn: Arc<dyn ClientConn>, events: mpsc::UnboundedSender<EdsEvent>) -> Self {
        Self {
            conn,
            events,
            in_use: None,
            lowest: None,
            states: HashMap::new(),
            init_timer: None,
            generation: 0,
        }
    }

    pub fn set_lowest(&mut self, lowest: Option<Priority>) {
        self.lowest = lowest;
    }

    /// Drops the cached state of a priority removed by the control
    /// plane.
    pub fn forget(&mut self, priority: Priority) {
        self.states.remove(&priority);
    }

    pub fn stop_timer(&mut self) {
        self.init_timer = None;
    }

    #[cfg(test)]
    pub fn timer_armed(&self) -> bool {
        self.init_timer.is_some()
    }

    #[cfg(test)]
    pub fn in_use(&self) -> Option<Priority> {
        self.in_use
    }

    /// Re-evaluates which priority should serve after the set of
    /// priorities changed.
    pub fn handle_priority_change(&mut self, groups: &mut HashMap<Priority, PriorityGroup>) {
        // Everything was removed by the control plane.
        let Some(lowest) = self.lowest else {
            self.in_use = None;
            // The only priority can be removed shortly after it was
            // added, while its timer is still pending.
            self.stop_timer();
            self.conn.update_state(BalancerState::new(
                ConnectivityState::TransientFailure,
                err_picker(PickError::AllPrioritiesRemoved),
            ));
            return;
        };

        // Nothing was in use: either the first response, or the
        // previous response had deleted everything.
        let Some(in_use) = self.in_use else {
            tracing::info!("starting priority ladder at 0");
            self.start_priority(Priority(0), groups);
            return;
        };

        // The serving priority was deleted. The ladder is dense and
        // shrinks from the tail, so everything above the new lowest is
        // already running and failing; serve from the new lowest.
        if !groups.contains_key(&in_use) {
            tracing::info!(from = %in_use, to = %lowest, "serving priority was deleted");
            self.in_use = Some(lowest);
            match self.states.get(&lowest) {
                Some(state) => self.conn.update_state(state.clone()),
                // Started but never reported: its init window was cut
                // short by the timer walking past it. Block picks until
                // it reports.
                None => self.conn.update_state(BalancerState::connecting()),
            }
            return;
        }

        // A lower priority was added while the serving one is not
        // ready: continue the ladder into it.
        if let Some(state) = self.states.get(&in_use) {
            if state.connectivity != ConnectivityState::Ready {
                let next = in_use.next_lower();
                if groups.contains_key(&next) {
                    self.start_priority(next, groups);
                }
            }
        }
    }

    /// Ingests a state report from one priority. Returns whether the
    /// state should be published as the new serving state.
    pub fn handle_state_update(
        &mut self,
        priority: Priority,
        state: BalancerState,
        groups: &mut HashMap<Priority, PriorityGroup>,
    ) -> bool {
        let Some(in_use) = self.in_use else {
            tracing::debug!("state update while no priority is in use");
            return false;
        };
        if in_use.higher_than(priority) {
            // Priorities below the serving one are closed; this is a
            // late update from a child told to shut down.
            tracing::debug!(%priority, %in_use, "state update from a closed lower priority");
            return false;
        }

        let previous = self
            .states
            .insert(priority, state.clone())
            .map(|s| s.connectivity);

        match state.connectivity {
            ConnectivityState::Ready => self.on_ready(priority, in_use, groups),
            ConnectivityState::TransientFailure => {
                self.on_transient_failure(priority, in_use, groups)
            }
            ConnectivityState::Connecting => priority == in_use
                && previous.map_or(true, |p| p != ConnectivityState::TransientFailure),
            // Idle and Shutdown are not aggregate states.
            _ => false,
        }
    }

    /// The timer of `priority`'s init window fired without the
    /// priority becoming ready: hedge by starting the next one.
    pub fn handle_init_timeout(
        &mut self,
        priority: Priority,
        generation: u64,
        groups: &mut HashMap<Priority, PriorityGroup>,
    ) {
        match &self.init_timer {
            Some(timer) if timer.generation == generation => {}
            // A stale firing that lost the race with its cancellation.
            _ => return,
        }
        self.init_timer = None;

        if self.in_use != Some(priority) {
            return;
        }
        let next = priority.next_lower();
        if groups.contains_key(&next) {
            tracing::info!(%priority, %next, "priority init timed out, starting next");
            self.start_priority(next, groups);
        }
    }

    /// A ready report locks the priority in. From a higher priority
    /// than the serving one, traffic moves back up and everything
    /// below is shut down.
    fn on_ready(
        &mut self,
        priority: Priority,
        in_use: Priority,
        groups: &mut HashMap<Priority, PriorityGroup>,
    ) -> bool {
        self.stop_timer();

        if priority.higher_than(in_use) {
            tracing::info!(from = %in_use, to = %priority, "higher priority became ready");
            self.in_use = Some(priority);
            let lowest = self.lowest.unwrap_or(priority);
            let mut lower = priority.next_lower();
            while lower <= lowest {
                if let Some(group) = groups.get_mut(&lower) {
                    group.aggregator.stop();
                    group.group.close();
                }
                lower = lower.next_lower();
            }
        }
        true
    }

    /// Failure of the serving priority advances the ladder; failures
    /// of other priorities change nothing.
    fn on_transient_failure(
        &mut self,
        priority: Priority,
        in_use: Priority,
        groups: &mut HashMap<Priority, PriorityGroup>,
    ) -> bool {
        if priority != in_use {
            return false;
        }
        self.stop_timer();

        let next = priority.next_lower();
        if !groups.contains_key(&next) {
            // Already at the bottom; forward the failure and stay.
            return true;
        }
        tracing::info!(from = %priority, to = %next, "serving priority failed, starting next");
        self.start_priority(next, groups);
        true
    }

    /// Starts `priority`'s balancer group and arms its init timer.
    ///
    /// Replacing the previous timer aborts it; the generation tag makes
    /// sure a firing that already reached the event queue is ignored.
    fn start_priority(&mut self, priority: Priority, groups: &mut HashMap<Priority, PriorityGroup>) {
        self.in_use = Some(priority);
        let Some(group) = groups.get_mut(&priority) else {
            tracing::warn!(%priority, "starting a priority with no balancer group");
            return;
        };
        group.aggregator.start();
        group.group.start();

        if priority != Priority(0) {
            failovers().inc();
        }

        self.generation += 1;
        let generation = self.generation;
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEFAULT_PRIORITY_INIT_TIMEOUT).await;
            let _ = events.send(EdsEvent::InitTimeout {
                priority,
                generation,
            });
        });
        self.init_timer = Some(InitTimer {
            priority,
            generation,
            handle,
        });
    }
}

impl std::fmt::Debug for PriorityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityManager")
            .field("in_use", &self.in_use)
            .field("lowest", &self.lowest)
            .field(
                "init_timer",
                &self.init_timer.as_ref().map(|t| t.priority),
            )
            .finish_non_exhaustive()
    }
}
