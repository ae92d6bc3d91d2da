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

//! Crate wide tunables and feature flags.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use once_cell::sync::Lazy;

/// How long a freshly started priority has to become `Ready` before the
/// next priority in the ladder is started alongside it.
pub const DEFAULT_PRIORITY_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on concurrent requests per service, applied when circuit
/// breaking is enabled and the control plane does not specify one.
pub const DEFAULT_SERVICE_REQUEST_COUNT_MAX: u32 = 1024;

/// Environment variable that disables circuit breaking when set to
/// `false`.
pub const CIRCUIT_BREAKING_ENV: &str = "XDS_BALANCER_CIRCUIT_BREAKING";

static CIRCUIT_BREAKING: Lazy<AtomicBool> = Lazy::new(|| {
    let enabled = std::env::var(CIRCUIT_BREAKING_ENV)
        .map(|value| !value.eq_ignore_ascii_case("false"))
        .unwrap_or(true);
    AtomicBool::new(enabled)
});

/// Whether the drop picker consults the per service request counter.
///
/// When disabled, [`EdsBalancer::update_service_requests_config`] is a
/// no-op.
///
/// [`EdsBalancer::update_service_requests_config`]: crate::balancer::eds::EdsBalancer::update_service_requests_config
pub fn circuit_breaking_enabled() -> bool {
    CIRCUIT_BREAKING.load(Ordering::Relaxed)
}

/// Overrides the environment derived value, for tests.
#[doc(hidden)]
pub fn set_circuit_breaking(enabled: bool) {
    CIRCUIT_BREAKING.store(enabled, Ordering::Relaxed);
}
