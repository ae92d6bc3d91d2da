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

use prometheus::core::Collector;
pub use prometheus::Result;
use prometheus::{Opts, Registry};

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace("xds_balancer")
        .subsystem(subsystem)
}

pub(crate) fn register<T: Collector + Clone + Sized + 'static>(collector: T) -> T {
    collector
        .register_if_not_exists(prometheus::default_registry())
        .unwrap()
}

pub trait CollectorExt: Collector + Clone + Sized + 'static {
    fn register_if_not_exists(self, registry: &Registry) -> Result<Self> {
        match registry.register(Box::new(self.clone())) {
            Ok(_) | Err(prometheus::Error::AlreadyReg) => Ok(self),
            Err(prometheus::Error::Msg(msg)) if msg.contains("already exists") => {
                // FIXME: We should be able to remove this branch entirely if `AlreadyReg` gets fixed.
                //  https://github.com/tikv/rust-prometheus/issues/247
                Ok(self)
            }
            Err(err) => Err(err),
        }
    }
}

impl<C: Collector + Clone + 'static> CollectorExt for C {}
