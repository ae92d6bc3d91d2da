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

//! Decoded resource updates as delivered by the xDS client.

use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{endpoint::Endpoint, locality::Locality};

/// The three fractional percent denominators Envoy allows for drop
/// configuration.
pub const DROP_DENOMINATORS: [u32; 3] = [100, 10_000, 1_000_000];

/// Listener level configuration of interest to the service watcher.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListenerUpdate {
    /// Name of the route configuration to watch via RDS.
    pub route_config_name: String,
    /// Upper bound on stream duration, from the HTTP connection
    /// manager. Zero means unset.
    pub max_stream_duration: Duration,
    pub http_filters: Vec<HttpFilter>,
}

/// An HTTP filter installed on the listener, with its opaque
/// configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct HttpFilter {
    pub name: String,
    pub config: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteConfigUpdate {
    pub virtual_hosts: Vec<VirtualHost>,
}

/// A set of routes served under one or more domain patterns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VirtualHost {
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub prefix: String,
    pub cluster: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClusterUpdate {
    /// The EDS service to watch for this cluster's endpoints.
    pub service_name: String,
}

/// A single category of proactive overload drops.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OverloadDropConfig {
    pub category: String,
    pub numerator: u32,
    pub denominator: u32,
}

/// One locality's endpoints within an EDS response.
///
/// A locality with `weight == 0` is ignored for load balancing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LocalityEndpoints {
    pub id: Locality,
    pub weight: u32,
    pub priority: u32,
    pub endpoints: Vec<Endpoint>,
}

/// The payload of one EDS response.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EndpointsUpdate {
    pub drops: Vec<OverloadDropConfig>,
    pub localities: Vec<LocalityEndpoints>,
}

/// Validation failure for an [`EndpointsUpdate`]. The update is
/// discarded and the previously applied state retained.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum MalformedUpdate {
    #[error("update contains a locality without an identifier")]
    UnnamedLocality,

    #[error("locality {id} appears more than once")]
    DuplicateLocality { id: Locality },

    /// Priorities must form the dense ladder `{0, 1, .., max}`.
    #[error("priority {missing} missing from priorities 0..={max}")]
    SparsePriorities { missing: u32, max: u32 },

    #[error("drop category {category:?} has invalid fraction {numerator}/{denominator}")]
    InvalidDropFraction {
        category: String,
        numerator: u32,
        denominator: u32,
    },
}

impl EndpointsUpdate {
    pub fn is_empty(&self) -> bool {
        self.drops.is_empty() && self.localities.is_empty()
    }

    /// Applies the structural rules the control plane is expected to
    /// uphold. All localities are considered, including weight zero
    /// ones that are later ignored for balancing.
    pub fn validate(&self) -> Result<(), MalformedUpdate> {
        for drop in &self.drops {
            if !DROP_DENOMINATORS.contains(&drop.denominator) || drop.numerator > drop.denominator
            {
                return Err(MalformedUpdate::InvalidDropFraction {
                    category: drop.category.clone(),
                    numerator: drop.numerator,
                    denominator: drop.denominator,
                });
            }
        }

        let mut seen = HashSet::new();
        let mut priorities = HashSet::new();
        let mut max_priority = 0;
        for locality in &self.localities {
            if locality.id.is_unnamed() {
                return Err(MalformedUpdate::UnnamedLocality);
            }
            if !seen.insert(&locality.id) {
                return Err(MalformedUpdate::DuplicateLocality {
                    id: locality.id.clone(),
                });
            }
            priorities.insert(locality.priority);
            max_priority = max_priority.max(locality.priority);
        }

        for priority in 0..=max_priority {
            if !self.localities.is_empty() && !priorities.contains(&priority) {
                return Err(MalformedUpdate::SparsePriorities {
                    missing: priority,
                    max: max_priority,
                });
            }
        }

        Ok(())
    }
}
