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

use rand::Rng;

/// Weighted random selector.
///
/// Items are stored with their cumulative weight; `next` draws a
/// uniform sample in `[0, total)` and binary searches it. The read
/// path takes `&self` and is safe to call from concurrent pick
/// threads.
#[derive(Debug, Default)]
pub(crate) struct WeightedRandom<T> {
    // (item, cumulative weight including this item)
    entries: Vec<(T, u64)>,
    total: u64,
}

impl<T> WeightedRandom<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            total: 0,
        }
    }

    /// Adds an item. Zero weight items are never selected and are not
    /// stored.
    pub fn add(&mut self, item: T, weight: u64) {
        if weight == 0 {
            return;
        }
        self.total += weight;
        self.entries.push((item, self.total));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next(&self) -> Option<&T> {
        if self.entries.is_empty() {
            return None;
        }
        let sample = rand::thread_rng().gen_range(0..self.total);
        let index = self
            .entries
            .partition_point(|(_, cumulative)| *cumulative <= sample);
        self.entries.get(index).map(|(item, _)| item)
    }
}
