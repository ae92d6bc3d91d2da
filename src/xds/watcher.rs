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

//! Discovers the routing configuration for a service by sequencing an
//! LDS watch into the RDS watch that the listener nominates.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

use super::{
    resource::{HttpFilter, ListenerUpdate, RouteConfigUpdate, VirtualHost},
    WatchCancel, XdsClient, XdsError,
};

/// Configuration for one service, assembled from the LDS response and
/// the virtual host selected out of the RDS response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceUpdate {
    /// The virtual host whose domains best match the service. `None`
    /// until the first RDS response arrives.
    pub virtual_host: Option<VirtualHost>,
    pub lds: LdsConfig,
}

/// Listener configuration that applies to every route of the service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LdsConfig {
    pub max_stream_duration: Duration,
    pub http_filters: Vec<HttpFilter>,
}

pub type ServiceCallback = Arc<dyn Fn(Result<ServiceUpdate, XdsError>) + Send + Sync>;

/// Watches LDS and RDS to produce a stream of [`ServiceUpdate`]s for
/// one service.
///
/// The watcher holds its lock while invoking `callback`, so callbacks
/// are serialized; a callback must not call back into the watcher.
pub struct ServiceWatcher {
    shared: Arc<WatcherShared>,
}

struct WatcherShared {
    client: Arc<dyn XdsClient>,
    service_name: String,
    callback: ServiceCallback,
    state: Mutex<WatcherState>,
}

#[derive(Default)]
struct WatcherState {
    closed: bool,
    rds_name: String,
    lds_cancel: Option<WatchCancel>,
    rds_cancel: Option<WatchCancel>,
    last_update: ServiceUpdate,
}

/// Starts watching `service_name`.
///
/// `service_name` doubles as the host matched against virtual host
/// domains once a route configuration arrives. A watch cancellation is
/// best effort, so one callback may still be delivered after
/// [`ServiceWatcher::close`]; it is dropped silently.
pub fn watch_service(
    client: Arc<dyn XdsClient>,
    service_name: impl Into<String>,
    callback: ServiceCallback,
) -> ServiceWatcher {
    let shared = Arc::new(WatcherShared {
        client,
        service_name: service_name.into(),
        callback,
        state: Mutex::new(WatcherState::default()),
    });

    let lds_shared = shared.clone();
    let cancel = shared.client.watch_listener(
        &shared.service_name,
        Arc::new(move |update| handle_listener_update(&lds_shared, update)),
    );
    shared.state.lock().lds_cancel = Some(cancel);

    ServiceWatcher { shared }
}

impl ServiceWatcher {
    /// Stops both watches. Idempotent; any callback that raced the
    /// cancellation is dropped.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(cancel) = state.lds_cancel.take() {
            cancel();
        }
        if let Some(cancel) = state.rds_cancel.take() {
            cancel();
        }
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn handle_listener_update(
    shared: &Arc<WatcherShared>,
    update: Result<ListenerUpdate, XdsError>,
) {
    tracing::debug!(service = %shared.service_name, ?update, "received LDS update");
    let mut state = shared.state.lock();
    if state.closed {
        return;
    }

    let update = match update {
        Ok(update) => update,
        Err(err) => {
            // A removed listener invalidates the route configuration it
            // nominated, so the RDS watch goes down with it. Other
            // errors leave the RDS watch running.
            if err.is_resource_not_found() {
                if let Some(cancel) = state.rds_cancel.take() {
                    cancel();
                }
                state.rds_name.clear();
                state.last_update = ServiceUpdate::default();
            }
            (shared.callback)(Err(err));
            return;
        }
    };

    state.last_update.lds = LdsConfig {
        max_stream_duration: update.max_stream_duration,
        http_filters: update.http_filters,
    };

    if state.rds_name == update.route_config_name {
        // Same route configuration; the listener level config changed
        // under it, re-emit with what we already have.
        (shared.callback)(Ok(state.last_update.clone()));
        return;
    }

    // The route name changed: hold emission until the new RDS response
    // arrives.
    state.rds_name = update.route_config_name.clone();
    if let Some(cancel) = state.rds_cancel.take() {
        cancel();
    }
    let rds_shared = shared.clone();
    let watched_route = update.route_config_name.clone();
    let cancel = shared.client.watch_route_config(
        &update.route_config_name,
        Arc::new(move |update| handle_route_update(&rds_shared, &watched_route, update)),
    );
    state.rds_cancel = Some(cancel);
}

fn handle_route_update(
    shared: &Arc<WatcherShared>,
    watched_route: &str,
    update: Result<RouteConfigUpdate, XdsError>,
) {
    tracing::debug!(service = %shared.service_name, ?update, "received RDS update");
    let mut state = shared.state.lock();
    if state.closed {
        return;
    }
    if state.rds_cancel.is_none() {
        // Only the RDS watch was canceled; happens when the listener
        // resource is removed.
        return;
    }
    if state.rds_name != watched_route {
        // A callback from a previous route's watch lost the
        // cancellation race.
        return;
    }

    let update = match update {
        Ok(update) => update,
        Err(err) => {
            (shared.callback)(Err(err));
            return;
        }
    };

    match find_best_matching_virtual_host(&shared.service_name, &update.virtual_hosts) {
        None => (shared.callback)(Err(XdsError::NoMatchingVirtualHost {
            host: shared.service_name.clone(),
        })),
        Some(virtual_host) => {
            state.last_update.virtual_host = Some(virtual_host.clone());
            (shared.callback)(Ok(state.last_update.clone()));
        }
    }
}

/// Ranked domain pattern kinds: `Exact > Suffix > Prefix > Universal`.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum DomainMatchKind {
    Invalid,
    Universal,
    Prefix,
    Suffix,
    Exact,
}

fn domain_match_kind(domain: &str) -> DomainMatchKind {
    if domain.is_empty() {
        DomainMatchKind::Invalid
    } else if domain == "*" {
        DomainMatchKind::Universal
    } else if domain.starts_with('*') {
        DomainMatchKind::Suffix
    } else if domain.ends_with('*') {
        DomainMatchKind::Prefix
    } else if domain.contains('*') {
        DomainMatchKind::Invalid
    } else {
        DomainMatchKind::Exact
    }
}

fn match_domain(domain: &str, host: &str) -> (DomainMatchKind, bool) {
    let kind = domain_match_kind(domain);
    let matched = match kind {
        DomainMatchKind::Invalid => false,
        DomainMatchKind::Universal => true,
        DomainMatchKind::Prefix => host.starts_with(domain.trim_end_matches('*')),
        DomainMatchKind::Suffix => host.ends_with(domain.trim_start_matches('*')),
        DomainMatchKind::Exact => domain == host,
    };
    (kind, matched)
}

/// Returns the virtual host whose domains best match `host`.
///
/// A better pattern kind wins; among equal kinds, the longer pattern
/// wins; among equally long patterns, the first one seen wins. Any
/// invalid pattern anywhere in the list marks the whole route
/// configuration malformed and nothing matches.
pub fn find_best_matching_virtual_host<'a>(
    host: &str,
    virtual_hosts: &'a [VirtualHost],
) -> Option<&'a VirtualHost> {
    let mut best = None;
    let mut best_kind = DomainMatchKind::Invalid;
    let mut best_len = 0;

    for virtual_host in virtual_hosts {
        for domain in &virtual_host.domains {
            let (kind, matched) = match_domain(domain, host);
            if kind == DomainMatchKind::Invalid {
                return None;
            }
            if best_kind > kind || (best_kind == kind && best_len >= domain.len()) || !matched {
                continue;
            }
            best = Some(virtual_host);
            best_kind = kind;
            best_len = domain.len();
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestXdsClient, UpdateLog};

    fn virtual_host(domains: &[&str]) -> VirtualHost {
        VirtualHost {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            routes: vec![],
        }
    }

    #[test]
    fn exact_beats_wildcards() {
        let hosts = vec![
            virtual_host(&["*.bar.com"]),
            virtual_host(&["*.com"]),
            virtual_host(&["foo.bar.com"]),
            virtual_host(&["*"]),
        ];
        let best = find_best_matching_virtual_host("foo.bar.com", &hosts).unwrap();
        assert_eq!(best.domains, vec!["foo.bar.com"]);
    }

    #[test]
    fn suffix_beats_prefix_beats_universal() {
        let hosts = vec![
            virtual_host(&["*"]),
            virtual_host(&["foo.*"]),
            virtual_host(&["*.bar.com"]),
        ];
        let best = find_best_matching_virtual_host("foo.bar.com", &hosts).unwrap();
        assert_eq!(best.domains, vec!["*.bar.com"]);
    }

    #[test]
    fn longer_pattern_wins_within_kind() {
        let hosts = vec![virtual_host(&["*.com"]), virtual_host(&["*.bar.com"])];
        let best = find_best_matching_virtual_host("foo.bar.com", &hosts).unwrap();
        assert_eq!(best.domains, vec!["*.bar.com"]);
    }

    #[test]
    fn first_seen_wins_ties() {
        let hosts = vec![virtual_host(&["*.aaa.com"]), virtual_host(&["*.bbb.com"])];
        let best = find_best_matching_virtual_host("x.aaa.com", &hosts).unwrap();
        assert_eq!(best.domains, vec!["*.aaa.com"]);

        // Equal length, both matching: the earlier entry is kept.
        let hosts = vec![virtual_host(&["foo.*"]), virtual_host(&["foo.*"])];
        let best = find_best_matching_virtual_host("foo.bar.com", &hosts).unwrap();
        assert!(std::ptr::eq(best, &hosts[0]));
    }

    #[test]
    fn invalid_pattern_poisons_the_list() {
        let hosts = vec![virtual_host(&["foo.bar.com"]), virtual_host(&["a*b"])];
        assert!(find_best_matching_virtual_host("foo.bar.com", &hosts).is_none());

        let hosts = vec![virtual_host(&[""])];
        assert!(find_best_matching_virtual_host("foo.bar.com", &hosts).is_none());
    }

    #[test]
    fn no_match_without_candidates() {
        let hosts = vec![virtual_host(&["other.com"])];
        assert!(find_best_matching_virtual_host("foo.bar.com", &hosts).is_none());
    }

    fn listener(route: &str) -> ListenerUpdate {
        ListenerUpdate {
            route_config_name: route.into(),
            max_stream_duration: Duration::from_secs(30),
            http_filters: vec![],
        }
    }

    fn routes_for(domain: &str) -> RouteConfigUpdate {
        RouteConfigUpdate {
            virtual_hosts: vec![virtual_host(&[domain])],
        }
    }

    #[test]
    fn lds_then_rds_emits_virtual_host() {
        let client = Arc::new(TestXdsClient::default());
        let log = UpdateLog::default();
        let _watcher = watch_service(client.clone(), "foo.bar.com", log.callback());

        client.push_listener("foo.bar.com", Ok(listener("route-a")));
        assert!(log.updates().is_empty(), "nothing emitted before RDS");

        client.push_route("route-a", Ok(routes_for("foo.bar.com")));
        let updates = log.updates();
        assert_eq!(updates.len(), 1);
        let update = updates[0].as_ref().unwrap();
        assert_eq!(
            update.virtual_host.as_ref().unwrap().domains,
            vec!["foo.bar.com"]
        );
        assert_eq!(update.lds.max_stream_duration, Duration::from_secs(30));
    }

    #[test]
    fn same_route_name_reemits_without_new_watch() {
        let client = Arc::new(TestXdsClient::default());
        let log = UpdateLog::default();
        let _watcher = watch_service(client.clone(), "foo.bar.com", log.callback());

        client.push_listener("foo.bar.com", Ok(listener("route-a")));
        client.push_route("route-a", Ok(routes_for("foo.bar.com")));
        assert_eq!(client.route_watch_count(), 1);

        client.push_listener("foo.bar.com", Ok(listener("route-a")));
        assert_eq!(client.route_watch_count(), 1);
        let updates = log.updates();
        assert_eq!(updates.len(), 2);
        assert!(updates[1].as_ref().unwrap().virtual_host.is_some());
    }

    #[test]
    fn route_change_holds_emission_until_rds() {
        let client = Arc::new(TestXdsClient::default());
        let log = UpdateLog::default();
        let _watcher = watch_service(client.clone(), "foo.bar.com", log.callback());

        client.push_listener("foo.bar.com", Ok(listener("route-a")));
        client.push_route("route-a", Ok(routes_for("foo.bar.com")));

        client.push_listener("foo.bar.com", Ok(listener("route-b")));
        assert!(client.route_watch_canceled("route-a"));
        assert_eq!(log.updates().len(), 1, "held until the new RDS responds");

        client.push_route("route-b", Ok(routes_for("foo.bar.com")));
        assert_eq!(log.updates().len(), 2);
    }

    #[test]
    fn lds_resource_not_found_tears_down_rds() {
        let client = Arc::new(TestXdsClient::default());
        let log = UpdateLog::default();
        let _watcher = watch_service(client.clone(), "foo.bar.com", log.callback());

        client.push_listener("foo.bar.com", Ok(listener("route-a")));
        client.push_route("route-a", Ok(routes_for("foo.bar.com")));

        client.push_listener(
            "foo.bar.com",
            Err(XdsError::ResourceNotFound {
                name: "foo.bar.com".into(),
            }),
        );
        assert!(client.route_watch_canceled("route-a"));
        let updates = log.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates[1],
            Err(XdsError::ResourceNotFound {
                name: "foo.bar.com".into()
            })
        );

        // A route callback that raced the cancellation is dropped.
        client.push_route("route-a", Ok(routes_for("foo.bar.com")));
        assert_eq!(log.updates().len(), 2);
    }

    #[test]
    fn other_lds_errors_keep_rds_watch() {
        let client = Arc::new(TestXdsClient::default());
        let log = UpdateLog::default();
        let _watcher = watch_service(client.clone(), "foo.bar.com", log.callback());

        client.push_listener("foo.bar.com", Ok(listener("route-a")));
        client.push_route("route-a", Ok(routes_for("foo.bar.com")));

        client.push_listener("foo.bar.com", Err(XdsError::Transport("reset".into())));
        assert!(!client.route_watch_canceled("route-a"));
        assert_eq!(log.updates().len(), 2);

        client.push_route("route-a", Ok(routes_for("foo.bar.com")));
        assert_eq!(log.updates().len(), 3);
    }

    #[test]
    fn no_matching_virtual_host_is_an_error() {
        let client = Arc::new(TestXdsClient::default());
        let log = UpdateLog::default();
        let _watcher = watch_service(client.clone(), "foo.bar.com", log.callback());

        client.push_listener("foo.bar.com", Ok(listener("route-a")));
        client.push_route("route-a", Ok(routes_for("unrelated.com")));

        let updates = log.updates();
        assert_eq!(
            updates[0],
            Err(XdsError::NoMatchingVirtualHost {
                host: "foo.bar.com".into()
            })
        );
    }

    #[test]
    fn close_is_idempotent_and_silences_callbacks() {
        let client = Arc::new(TestXdsClient::default());
        let log = UpdateLog::default();
        let watcher = watch_service(client.clone(), "foo.bar.com", log.callback());

        client.push_listener("foo.bar.com", Ok(listener("route-a")));
        watcher.close();
        watcher.close();
        assert!(client.listener_watch_canceled("foo.bar.com"));
        assert!(client.route_watch_canceled("route-a"));

        client.push_route("route-a", Ok(routes_for("foo.bar.com")));
        client.push_listener("foo.bar.com", Ok(listener("route-b")));
        assert!(log.updates().is_empty());
    }
}
