//! The device banner carried in the peer's CNXN payload.
//!
//! Format: `<kind>:<serial>:<key>=<value>;<key>=<value>;...`, where the
//! `features` key holds a comma-separated list. Older devices send only
//! `device::` or a bare kind.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

const FEATURES_KEY: &str = "features";

/// Parsed connection banner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionBanner {
    raw: String,
    kind: String,
    serial: String,
    properties: BTreeMap<String, String>,
    features: BTreeSet<String>,
}

impl ConnectionBanner {
    /// Parse the payload of a CNXN message. Never fails: unknown shapes
    /// keep the raw text and leave the structured fields empty.
    pub fn parse(payload: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(payload)
            .trim_end_matches('\0')
            .to_string();

        let mut parts = raw.splitn(3, ':');
        let kind = parts.next().unwrap_or_default().to_string();
        let serial = parts.next().unwrap_or_default().to_string();
        let props = parts.next().unwrap_or_default();

        let mut properties = BTreeMap::new();
        let mut features = BTreeSet::new();
        for entry in props.split(';').filter(|entry| !entry.is_empty()) {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            if key == FEATURES_KEY {
                features.extend(
                    value
                        .split(',')
                        .filter(|feature| !feature.is_empty())
                        .map(str::to_string),
                );
            } else {
                properties.insert(key.to_string(), value.to_string());
            }
        }

        Self {
            raw,
            kind,
            serial,
            properties,
            features,
        }
    }

    /// The banner text as received, without trailing NULs.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Connection kind, usually `device`, `recovery` or `sideload`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// A `ro.*` property announced in the banner.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    pub fn supports_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

impl fmt::Display for ConnectionBanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
