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

/// Errors delivered by the xDS client to resource watchers.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum XdsError {
    /// The management server reported that the watched resource does
    /// not exist (or no longer exists).
    #[error("resource {name} not found")]
    ResourceNotFound { name: String },

    /// The resource was delivered but could not be validated.
    #[error("malformed resource: {0}")]
    MalformedResource(String),

    /// No virtual host in the route configuration matched the watched
    /// service.
    #[error("no matching virtual host found for {host}")]
    NoMatchingVirtualHost { host: String },

    /// The connection to the management server failed.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl XdsError {
    /// Watchers tear down dependent watches on this error kind; every
    /// other kind is forwarded as-is.
    pub fn is_resource_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }
}
