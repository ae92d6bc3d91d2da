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

use serde::{Deserialize, Serialize};

const SEP: char = ':';

/// The location of a group of endpoints, as reported by the control
/// plane.
///
/// Equality is structural. The [`Display`] form is stable and is used
/// as the opaque key for the locality's child balancer.
///
/// [`Display`]: std::fmt::Display
#[derive(
    Clone, Debug, Default, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Locality {
    pub region: String,
    pub zone: String,
    pub sub_zone: String,
}

impl Locality {
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        sub_zone: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            sub_zone: sub_zone.into(),
        }
    }

    pub fn with_region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    /// An update that carries a locality with no identifying components
    /// is malformed.
    pub fn is_unnamed(&self) -> bool {
        self.region.is_empty() && self.zone.is_empty() && self.sub_zone.is_empty()
    }
}

impl std::fmt::Display for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.region)?;

        if !self.zone.is_empty() {
            write!(f, "{SEP}{}", self.zone)?;

            if !self.sub_zone.is_empty() {
                write!(f, "{SEP}{}", self.sub_zone)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_skips_empty_components() {
        assert_eq!(Locality::with_region("us-east1").to_string(), "us-east1");
        assert_eq!(
            Locality::new("us-east1", "us-east1-b", "").to_string(),
            "us-east1:us-east1-b"
        );
        assert_eq!(
            Locality::new("us-east1", "us-east1-b", "rack-4").to_string(),
            "us-east1:us-east1-b:rack-4"
        );
    }

    #[test]
    fn unnamed() {
        assert!(Locality::default().is_unnamed());
        assert!(!Locality::with_region("r").is_unnamed());
    }
}
