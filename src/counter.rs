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

//! Process wide per-service in-flight request accounting, used for
//! circuit breaking.

use std::sync::{
    atomic::{AtomicU32, Ordering::Relaxed},
    Arc,
};

use dashmap::DashMap;
use once_cell::sync::Lazy;

static COUNTERS: Lazy<DashMap<String, CounterEntry>> = Lazy::new(DashMap::new);

struct CounterEntry {
    refs: usize,
    counter: Arc<ServiceRequestsCounter>,
}

/// Error returned by [`ServiceRequestsCounter::start_request`] when the
/// configured cap has been reached.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("max requests {max} exceeded on service {service}")]
pub struct RequestCapExceeded {
    pub service: String,
    pub max: u32,
}

/// In-flight request counter for one service.
///
/// Counters are interned in a process wide registry so that every
/// balancer watching the same service shares one count. Safe for use
/// from concurrent pick paths.
#[derive(Debug)]
pub struct ServiceRequestsCounter {
    service_name: String,
    num_requests: AtomicU32,
}

impl ServiceRequestsCounter {
    fn new(service_name: String) -> Self {
        Self {
            service_name,
            num_requests: AtomicU32::new(0),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Attempts to account for one more in-flight request, failing if
    /// `max` are already running. Every successful call must be paired
    /// with exactly one [`end_request`].
    ///
    /// [`end_request`]: Self::end_request
    pub fn start_request(&self, max: u32) -> Result<(), RequestCapExceeded> {
        self.num_requests
            .fetch_update(Relaxed, Relaxed, |current| {
                (current < max).then_some(current + 1)
            })
            .map(drop)
            .map_err(|_| RequestCapExceeded {
                service: self.service_name.clone(),
                max,
            })
    }

    pub fn end_request(&self) {
        let previous = self.num_requests.fetch_sub(1, Relaxed);
        if previous == 0 {
            // A mismatched end_request would otherwise park the counter
            // near u32::MAX and reject every future request.
            tracing::error!(
                service = %self.service_name,
                "end_request called with no request in flight"
            );
            self.num_requests.fetch_add(1, Relaxed);
        }
    }

    #[cfg(test)]
    pub(crate) fn num_requests(&self) -> u32 {
        self.num_requests.load(Relaxed)
    }
}

/// A counted reference to an interned [`ServiceRequestsCounter`].
///
/// Dropping the reference releases it; the registry entry is removed
/// once the last reference is gone.
#[derive(Debug)]
pub struct CounterRef {
    counter: Arc<ServiceRequestsCounter>,
}

impl CounterRef {
    pub fn service_name(&self) -> &str {
        self.counter.service_name()
    }

    /// A plain handle for pickers. The handle keeps the atomics alive
    /// but carries no registry reference.
    pub fn counter(&self) -> Arc<ServiceRequestsCounter> {
        self.counter.clone()
    }
}

impl std::ops::Deref for CounterRef {
    type Target = ServiceRequestsCounter;

    fn deref(&self) -> &Self::Target {
        &self.counter
    }
}

impl Drop for CounterRef {
    fn drop(&mut self) {
        let name = self.counter.service_name();
        if let Some(mut entry) = COUNTERS.get_mut(name) {
            entry.refs = entry.refs.saturating_sub(1);
        }
        COUNTERS.remove_if(name, |_, entry| entry.refs == 0);
    }
}

/// Returns the counter for `service_name`, creating it on first use.
pub fn service_requests_counter(service_name: &str) -> CounterRef {
    let mut entry = COUNTERS
        .entry(service_name.to_owned())
        .or_insert_with(|| CounterEntry {
            refs: 0,
            counter: Arc::new(ServiceRequestsCounter::new(service_name.to_owned())),
        });
    entry.refs += 1;
    CounterRef {
        counter: entry.counter.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interned_per_service() {
        let first = service_requests_counter("interned.example.com");
        let second = service_requests_counter("interned.example.com");
        let other = service_requests_counter("other.example.com");

        assert!(Arc::ptr_eq(&first.counter(), &second.counter()));
        assert!(!Arc::ptr_eq(&first.counter(), &other.counter()));
    }

    #[test]
    fn cap_enforced_and_released() {
        let counter = service_requests_counter("cap.example.com");

        counter.start_request(2).unwrap();
        counter.start_request(2).unwrap();
        let err = counter.start_request(2).unwrap_err();
        assert_eq!(
            err,
            RequestCapExceeded {
                service: "cap.example.com".into(),
                max: 2
            }
        );

        counter.end_request();
        counter.start_request(2).unwrap();

        counter.end_request();
        counter.end_request();
        assert_eq!(counter.num_requests(), 0);
    }

    #[test]
    fn registry_entry_removed_with_last_ref() {
        let name = "released.example.com";
        let first = service_requests_counter(name);
        let second = service_requests_counter(name);
        drop(first);
        assert!(COUNTERS.contains_key(name));
        drop(second);
        assert!(!COUNTERS.contains_key(name));
    }

    #[test]
    fn mismatched_end_request_recovers() {
        let counter = service_requests_counter("mismatch.example.com");
        counter.end_request();
        counter.start_request(1).unwrap();
        assert_eq!(counter.num_requests(), 1);
    }
}
