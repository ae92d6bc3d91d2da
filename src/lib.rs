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

//! An xDS driven endpoint load balancing core for RPC clients.
//!
//! Given a stream of endpoint discovery updates, the [`EdsBalancer`]
//! maintains transport connections organized by locality and priority,
//! spreads picks across them with weighted selection, applies drop and
//! circuit breaking policy, and fails over between priorities when the
//! preferred backends cannot become ready. The [`watch_service`]
//! watcher resolves a service's routing configuration by sequencing
//! LDS into RDS.

pub mod balancer;
pub mod config;
pub mod counter;
pub mod endpoint;
pub mod load;
pub mod locality;
pub(crate) mod metrics;
pub mod xds;

#[doc(hidden)]
pub mod test_utils;

#[doc(inline)]
pub use self::{
    balancer::{
        eds::{EdsBalancer, EdsEvent, Priority},
        BalancerState, ClientConn, ClientConnState, ConnectivityState, DoneCallback, DoneInfo,
        Pick, PickError, PickInfo, Picker, SubConn, SubConnKey,
    },
    endpoint::{Endpoint, HealthStatus, ResolvedAddress},
    load::LoadReporter,
    locality::Locality,
    xds::watcher::{watch_service, ServiceUpdate, ServiceWatcher},
};
