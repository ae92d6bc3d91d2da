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

/// Sink for pick time drop reports, implemented by the load reporting
/// collaborator.
///
/// Implementations are invoked from concurrent pick paths and must not
/// block.
pub trait LoadReporter: Send + Sync {
    /// Records an RPC that was dropped before a sub-connection was
    /// selected. Circuit breaker drops are reported with an empty
    /// category.
    fn call_dropped(&self, category: &str);
}
