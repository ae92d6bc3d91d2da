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

//! Contracts consumed from the xDS wire client collaborator.
//!
//! The wire protocol itself (protobuf parsing, the gRPC stream to the
//! management server) is owned by the client; this crate only consumes
//! the decoded resource updates through the [`XdsClient`] watch
//! interface.

pub mod error;
pub mod resource;
pub mod watcher;

use std::sync::Arc;

pub use error::XdsError;
pub use resource::{
    ClusterUpdate, EndpointsUpdate, ListenerUpdate, RouteConfigUpdate, VirtualHost,
};

/// Cancels an individual resource watch when invoked.
///
/// Cancellation is best effort: one callback may still be delivered
/// after the cancel runs, and watchers are expected to ignore it.
pub type WatchCancel = Box<dyn FnOnce() + Send>;

pub type ListenerWatchCallback = Arc<dyn Fn(Result<ListenerUpdate, XdsError>) + Send + Sync>;
pub type RouteWatchCallback = Arc<dyn Fn(Result<RouteConfigUpdate, XdsError>) + Send + Sync>;
pub type ClusterWatchCallback = Arc<dyn Fn(Result<ClusterUpdate, XdsError>) + Send + Sync>;
pub type EndpointsWatchCallback = Arc<dyn Fn(Result<EndpointsUpdate, XdsError>) + Send + Sync>;

/// The watch interface of the xDS client.
///
/// Callbacks must be delivered asynchronously with respect to watch
/// registration and cancellation; a client that invokes a callback
/// synchronously from inside `watch_*` will deadlock the watchers
/// built on top of this trait.
pub trait XdsClient: Send + Sync {
    fn watch_listener(&self, name: &str, callback: ListenerWatchCallback) -> WatchCancel;

    fn watch_route_config(&self, name: &str, callback: RouteWatchCallback) -> WatchCancel;

    fn watch_cluster(&self, name: &str, callback: ClusterWatchCallback) -> WatchCancel;

    fn watch_endpoints(&self, name: &str, callback: EndpointsWatchCallback) -> WatchCancel;
}
