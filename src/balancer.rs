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

//! The balancer contracts shared between the EDS core, the per
//! priority balancer groups, and the locality child balancers, plus
//! the registry of child policies.

pub(crate) mod aggregator;
pub mod child;
pub(crate) mod drop;
pub mod eds;
pub(crate) mod group;
pub(crate) mod priority;
pub(crate) mod wrr;

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::endpoint::ResolvedAddress;

/// Connectivity of a sub-connection or of an aggregated balancer.
///
/// For aggregation purposes `Ready > Connecting > Idle >
/// TransientFailure`: if any child is `Ready` the aggregate is
/// `Ready`, otherwise if any is `Connecting` the aggregate is
/// `Connecting`, and so on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    /// Terminal state of a removed sub-connection.
    Shutdown,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Ready => "Ready",
            Self::TransientFailure => "TransientFailure",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// A connectivity state paired with the picker that serves it.
#[derive(Clone)]
pub struct BalancerState {
    pub connectivity: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl BalancerState {
    pub fn new(connectivity: ConnectivityState, picker: Arc<dyn Picker>) -> Self {
        Self {
            connectivity,
            picker,
        }
    }

    /// The placeholder published for a balancer that has not yet
    /// reported.
    pub(crate) fn connecting() -> Self {
        Self::new(ConnectivityState::Connecting, err_picker(PickError::Queue))
    }
}

impl std::fmt::Debug for BalancerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancerState")
            .field("connectivity", &self.connectivity)
            .finish_non_exhaustive()
    }
}

/// Per-pick information passed by the host RPC library.
#[derive(Clone, Debug, Default)]
pub struct PickInfo {
    pub method: String,
}

/// Information reported back when an RPC issued on a picked
/// sub-connection completes.
#[derive(Clone, Debug, Default)]
pub struct DoneInfo {
    pub error: Option<String>,
}

pub type DoneCallback = Box<dyn FnOnce(DoneInfo) + Send>;

/// A successful pick. When `done` is present the host must invoke it
/// exactly once when the RPC completes.
pub struct Pick {
    pub sub_conn: Arc<dyn SubConn>,
    pub done: Option<DoneCallback>,
}

impl Pick {
    pub fn new(sub_conn: Arc<dyn SubConn>) -> Self {
        Self {
            sub_conn,
            done: None,
        }
    }
}

impl std::fmt::Debug for Pick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pick")
            .field("done", &self.done.is_some())
            .finish_non_exhaustive()
    }
}

/// Why a pick produced no sub-connection.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PickError {
    /// No sub-connection is ready yet; the RPC should be queued until a
    /// new picker is published.
    #[error("no sub-connection is available")]
    Queue,

    #[error("all sub-connections are in transient failure")]
    TransientFailure,

    /// The last endpoint update removed every priority.
    #[error("no usable localities, all priorities have been removed")]
    AllPrioritiesRemoved,

    /// The RPC was refused before selection, by drop policy or circuit
    /// breaking.
    #[error("{0}")]
    Unavailable(String),
}

/// Selects a sub-connection for one RPC. Invoked concurrently by many
/// RPC threads; implementations are immutable snapshots.
pub trait Picker: Send + Sync {
    fn pick(&self, info: &PickInfo) -> Result<Pick, PickError>;
}

struct ErrPicker(PickError);

impl Picker for ErrPicker {
    fn pick(&self, _: &PickInfo) -> Result<Pick, PickError> {
        Err(self.0.clone())
    }
}

/// A picker that fails every pick with `err`.
pub fn err_picker(err: PickError) -> Arc<dyn Picker> {
    Arc::new(ErrPicker(err))
}

/// A logical transport connection owned by the host RPC library.
pub trait SubConn: Send + Sync {
    /// Begins connecting if the connection is idle.
    fn connect(&self);
}

/// Pointer identity of a [`SubConn`], usable as a map key. The host
/// reuses the same allocation for a connection's whole lifetime, so
/// identity is stable from creation until `Shutdown`.
#[derive(Clone)]
pub struct SubConnKey(Arc<dyn SubConn>);

impl SubConnKey {
    pub fn new(sub_conn: &Arc<dyn SubConn>) -> Self {
        Self(sub_conn.clone())
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for SubConnKey {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.addr(), other.addr())
    }
}

impl Eq for SubConnKey {}

impl std::hash::Hash for SubConnKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.addr() as usize).hash(state);
    }
}

impl std::fmt::Debug for SubConnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SubConnKey({:p})", self.addr())
    }
}

/// The capability set a balancer needs from the connection it serves:
/// create and remove sub-connections, publish pickers, and nudge
/// resolution.
pub trait ClientConn: Send + Sync {
    fn new_sub_conn(&self, addresses: Vec<ResolvedAddress>) -> Arc<dyn SubConn>;

    fn remove_sub_conn(&self, sub_conn: &Arc<dyn SubConn>);

    fn update_state(&self, state: BalancerState);

    fn resolve_now(&self);

    fn target(&self) -> String;
}

/// Resolver state pushed down to a child balancer.
#[derive(Clone, Debug, Default)]
pub struct ClientConnState {
    pub addresses: Vec<ResolvedAddress>,
    /// Opaque per-policy configuration.
    pub config: Option<serde_json::Value>,
}

/// A balancer managing the endpoints of a single locality.
pub trait ChildBalancer: Send {
    fn update_client_conn_state(&mut self, state: ClientConnState);

    fn update_sub_conn_state(&mut self, sub_conn: &Arc<dyn SubConn>, state: ConnectivityState);

    /// Releases every sub-connection the balancer owns.
    fn close(&mut self);
}

/// Builds child balancers for one policy name.
pub trait ChildBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(&self, conn: Arc<dyn ClientConn>) -> Box<dyn ChildBalancer>;
}

static CHILD_POLICIES: Lazy<RwLock<HashMap<&'static str, Arc<dyn ChildBuilder>>>> =
    Lazy::new(|| {
        let mut policies = HashMap::new();
        for builder in child::builtin_policies() {
            policies.insert(builder.name(), builder);
        }
        RwLock::new(policies)
    });

/// Registers a child policy, replacing any previous builder with the
/// same name.
pub fn register_child_policy(builder: Arc<dyn ChildBuilder>) {
    CHILD_POLICIES.write().insert(builder.name(), builder);
}

/// Looks up a child policy by name.
pub fn child_policy(name: &str) -> Option<Arc<dyn ChildBuilder>> {
    CHILD_POLICIES.read().get(name).cloned()
}
