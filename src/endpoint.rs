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

//! Types representing where the traffic is sent.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

/// Health of an endpoint as reported by the control plane.
///
/// Following Envoy semantics, `Unknown` is treated the same as
/// `Healthy`; every other status removes the endpoint from load
/// balancing before a child balancer ever sees it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Draining,
    Timeout,
    Degraded,
}

impl HealthStatus {
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Healthy | Self::Unknown)
    }
}

/// A backend destination with its load balancing weight and health.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub health: HealthStatus,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            weight: 0,
            health: HealthStatus::Unknown,
        }
    }

    pub fn with_health(address: impl Into<String>, health: HealthStatus) -> Self {
        Self {
            health,
            ..Self::new(address)
        }
    }
}

/// An address handed down to a locality child balancer, after health
/// filtering.
///
/// `weight` is only attached when the child policy is weighted round
/// robin and the endpoint carried a non-zero weight.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResolvedAddress {
    pub addr: String,
    pub weight: Option<NonZeroU32>,
}

impl ResolvedAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            weight: None,
        }
    }

    pub(crate) fn weight_or_default(&self) -> u32 {
        self.weight.map_or(1, NonZeroU32::get)
    }
}

impl std::fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.addr)
    }
}

impl<T: Into<String>> From<T> for ResolvedAddress {
    fn from(addr: T) -> Self {
        Self::new(addr)
    }
}
