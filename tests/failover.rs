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

//! Priority ladder behavior, driven through the public API with fake
//! transports and a paused clock.

use std::sync::Arc;

use tokio::sync::mpsc;

use xds_balancer::{
    test_utils::{assignment, drain_events, locality_with, next_event, TestClientConn},
    ConnectivityState, EdsBalancer, EdsEvent, PickError, PickInfo,
};

fn two_priority_update() -> xds_balancer::xds::resource::EndpointsUpdate {
    assignment(vec![
        locality_with("primary", 0, 1, &["10.0.0.1:80"]),
        locality_with("fallback", 1, 1, &["10.0.1.1:80"]),
    ])
}

fn new_core(conn: &Arc<TestClientConn>) -> (EdsBalancer, mpsc::UnboundedReceiver<EdsEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    (EdsBalancer::new(conn.clone(), None, events_tx), events_rx)
}

#[tokio::test(start_paused = true)]
async fn failover_to_lower_priority_and_lock_in() {
    let conn = Arc::new(TestClientConn::default());
    let (mut eds, mut events) = new_core(&conn);

    eds.handle_eds_response(two_priority_update()).unwrap();
    drain_events(&mut eds, &mut events);

    // Only the highest priority is started.
    assert_eq!(conn.created_count(), 1);

    // Priority 0 fails: priority 1 is started alongside it.
    let primary = conn.sub_conns()[0].clone();
    eds.handle_sub_conn_state_change(&primary, ConnectivityState::TransientFailure);
    drain_events(&mut eds, &mut events);
    assert_eq!(conn.created_count(), 2);

    // Priority 1 becomes ready and serves.
    let fallback = conn.sub_conns()[1].clone();
    eds.handle_sub_conn_state_change(&fallback, ConnectivityState::Ready);
    drain_events(&mut eds, &mut events);

    let state = conn.latest_state().unwrap();
    assert_eq!(state.connectivity, ConnectivityState::Ready);
    let pick = state.picker.pick(&PickInfo::default()).unwrap();
    assert_eq!(conn.sub_conn_index(&pick.sub_conn), Some(1));

    // Further failures of the higher priority change nothing.
    let published = conn.states_published();
    eds.handle_sub_conn_state_change(&primary, ConnectivityState::TransientFailure);
    drain_events(&mut eds, &mut events);
    assert_eq!(conn.states_published(), published);
    let state = conn.latest_state().unwrap();
    assert_eq!(state.connectivity, ConnectivityState::Ready);
}

#[tokio::test(start_paused = true)]
async fn init_timeout_starts_next_priority() {
    let conn = Arc::new(TestClientConn::default());
    let (mut eds, mut events) = new_core(&conn);

    eds.handle_eds_response(two_priority_update()).unwrap();
    drain_events(&mut eds, &mut events);
    assert_eq!(conn.created_count(), 1);

    // Priority 0 connects but never becomes ready; after the init
    // timeout the manager starts priority 1.
    let timeout = next_event(&mut events).await.unwrap();
    assert!(matches!(timeout, EdsEvent::InitTimeout { .. }));
    eds.handle_event(timeout);
    drain_events(&mut eds, &mut events);
    assert_eq!(conn.created_count(), 2);

    let fallback = conn.sub_conns()[1].clone();
    eds.handle_sub_conn_state_change(&fallback, ConnectivityState::Ready);
    drain_events(&mut eds, &mut events);
    assert_eq!(
        conn.latest_state().unwrap().connectivity,
        ConnectivityState::Ready
    );
}

#[tokio::test(start_paused = true)]
async fn recovered_higher_priority_takes_back_traffic() {
    let conn = Arc::new(TestClientConn::default());
    let (mut eds, mut events) = new_core(&conn);

    eds.handle_eds_response(two_priority_update()).unwrap();
    drain_events(&mut eds, &mut events);

    let primary = conn.sub_conns()[0].clone();
    eds.handle_sub_conn_state_change(&primary, ConnectivityState::TransientFailure);
    drain_events(&mut eds, &mut events);
    let fallback = conn.sub_conns()[1].clone();
    eds.handle_sub_conn_state_change(&fallback, ConnectivityState::Ready);
    drain_events(&mut eds, &mut events);

    // Priority 0 recovers: traffic moves back up and the lower
    // priority's connections are released.
    eds.handle_sub_conn_state_change(&primary, ConnectivityState::Ready);
    drain_events(&mut eds, &mut events);

    let state = conn.latest_state().unwrap();
    assert_eq!(state.connectivity, ConnectivityState::Ready);
    let pick = state.picker.pick(&PickInfo::default()).unwrap();
    assert_eq!(conn.sub_conn_index(&pick.sub_conn), Some(0));
    assert_eq!(conn.removed_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn serving_priority_removed_by_update() {
    let conn = Arc::new(TestClientConn::default());
    let (mut eds, mut events) = new_core(&conn);

    eds.handle_eds_response(two_priority_update()).unwrap();
    drain_events(&mut eds, &mut events);
    let primary = conn.sub_conns()[0].clone();
    eds.handle_sub_conn_state_change(&primary, ConnectivityState::TransientFailure);
    drain_events(&mut eds, &mut events);

    // Priority 1 is serving; the next update deletes it. The ladder
    // shrinks back to priority 0, whose cached failing state is
    // published until it reports again.
    eds.handle_eds_response(assignment(vec![locality_with(
        "primary",
        0,
        1,
        &["10.0.0.1:80"],
    )]))
    .unwrap();
    drain_events(&mut eds, &mut events);
    assert_eq!(
        conn.latest_state().unwrap().connectivity,
        ConnectivityState::TransientFailure
    );

    eds.handle_sub_conn_state_change(&primary, ConnectivityState::Ready);
    drain_events(&mut eds, &mut events);
    assert_eq!(
        conn.latest_state().unwrap().connectivity,
        ConnectivityState::Ready
    );
}

#[tokio::test(start_paused = true)]
async fn removing_every_priority_fails_all_picks() {
    let conn = Arc::new(TestClientConn::default());
    let (mut eds, mut events) = new_core(&conn);

    eds.handle_eds_response(assignment(vec![locality_with(
        "primary",
        0,
        1,
        &["10.0.0.1:80"],
    )]))
    .unwrap();
    drain_events(&mut eds, &mut events);

    eds.handle_eds_response(assignment(vec![])).unwrap();
    drain_events(&mut eds, &mut events);

    let state = conn.latest_state().unwrap();
    assert_eq!(state.connectivity, ConnectivityState::TransientFailure);
    assert_eq!(
        state.picker.pick(&PickInfo::default()).unwrap_err(),
        PickError::AllPrioritiesRemoved
    );
}

#[tokio::test(start_paused = true)]
async fn lowest_priority_failure_is_forwarded() {
    let conn = Arc::new(TestClientConn::default());
    let (mut eds, mut events) = new_core(&conn);

    eds.handle_eds_response(two_priority_update()).unwrap();
    drain_events(&mut eds, &mut events);

    let primary = conn.sub_conns()[0].clone();
    eds.handle_sub_conn_state_change(&primary, ConnectivityState::TransientFailure);
    drain_events(&mut eds, &mut events);

    // The fallback fails too; there is nowhere left to go, so the
    // failure is surfaced.
    let fallback = conn.sub_conns()[1].clone();
    eds.handle_sub_conn_state_change(&fallback, ConnectivityState::TransientFailure);
    drain_events(&mut eds, &mut events);

    let state = conn.latest_state().unwrap();
    assert_eq!(state.connectivity, ConnectivityState::TransientFailure);
    assert_eq!(
        state.picker.pick(&PickInfo::default()).unwrap_err(),
        PickError::TransientFailure
    );
}
