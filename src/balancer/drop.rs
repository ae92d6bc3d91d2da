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

//! Proactive load shedding layered in front of the priority picker:
//! weighted random drops per control plane category, then the per
//! service circuit breaker.

use std::sync::Arc;

use once_cell::sync::Lazy;
use prometheus::IntCounterVec;

use super::{wrr::WeightedRandom, Pick, PickError, PickInfo, Picker};
use crate::{
    counter::ServiceRequestsCounter, load::LoadReporter, xds::resource::OverloadDropConfig,
};

fn dropped_requests() -> &'static IntCounterVec {
    static DROPPED_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
        crate::metrics::register(
            IntCounterVec::new(
                crate::metrics::opts(
                    "dropped_requests_total",
                    "eds",
                    "Number of requests dropped before sub-connection selection.",
                ),
                &["category"],
            )
            .unwrap(),
        )
    });

    &DROPPED_REQUESTS
}

/// Weighted random true/false selector for one drop category.
pub(crate) struct Dropper {
    config: OverloadDropConfig,
    wrr: WeightedRandom<bool>,
}

impl Dropper {
    pub fn new(config: OverloadDropConfig) -> Self {
        let mut wrr = WeightedRandom::new();
        wrr.add(true, u64::from(config.numerator));
        wrr.add(false, u64::from(config.denominator - config.numerator));
        Self { config, wrr }
    }

    pub fn category(&self) -> &str {
        &self.config.category
    }

    pub fn should_drop(&self) -> bool {
        self.wrr.next().copied().unwrap_or(false)
    }
}

/// Wraps the priority selected picker with the drop policy and the
/// circuit breaker.
///
/// `counter` accounting is exactly-once: every successful
/// `start_request` is paired with one `end_request`, either
/// synchronously on the error path or through the wrapped done
/// callback on success.
pub(crate) struct DropPicker {
    inner: Arc<dyn Picker>,
    drops: Vec<Arc<Dropper>>,
    load_reporter: Option<Arc<dyn LoadReporter>>,
    counter: Option<Arc<ServiceRequestsCounter>>,
    count_max: u32,
}

impl DropPicker {
    pub fn new(
        inner: Arc<dyn Picker>,
        drops: Vec<Arc<Dropper>>,
        load_reporter: Option<Arc<dyn LoadReporter>>,
        counter: Option<Arc<ServiceRequestsCounter>>,
        count_max: u32,
    ) -> Self {
        Self {
            inner,
            drops,
            load_reporter,
            counter,
            count_max,
        }
    }

    fn report_drop(&self, category: &str) {
        dropped_requests().with_label_values(&[category]).inc();
        if let Some(reporter) = &self.load_reporter {
            reporter.call_dropped(category);
        }
    }
}

impl Picker for DropPicker {
    fn pick(&self, info: &PickInfo) -> Result<Pick, PickError> {
        for dropper in &self.drops {
            if dropper.should_drop() {
                self.report_drop(dropper.category());
                return Err(PickError::Unavailable("RPC is dropped".into()));
            }
        }

        let Some(counter) = &self.counter else {
            return self.inner.pick(info);
        };

        if let Err(err) = counter.start_request(self.count_max) {
            // Circuit breaker drops only show up in the total, not
            // under any category.
            self.report_drop("");
            return Err(PickError::Unavailable(err.to_string()));
        }

        match self.inner.pick(info) {
            Err(err) => {
                counter.end_request();
                Err(err)
            }
            Ok(mut pick) => {
                let counter = counter.clone();
                let inner_done = pick.done.take();
                pick.done = Some(Box::new(move |info| {
                    counter.end_request();
                    if let Some(done) = inner_done {
                        done(info);
                    }
                }));
                Ok(pick)
            }
        }
    }
}
