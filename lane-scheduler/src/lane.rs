//! Lanes and combined topic names.
//!
//! Every base topic is carried on three physical topics, one per [`Lane`]. The
//! physical name is the base topic followed by the lane's suffix, e.g.
//! `orders` on the priority lane is `orders-PRIORITY`.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Priority class of a message.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Lane {
    /// Regular traffic
    Normal,
    /// Traffic served ahead of the normal lane
    Priority,
    /// Failures reported by callbacks of the other lanes
    Error,
}

impl Lane {
    /// All lanes, in the order the drain operations service them.
    pub const ALL: [Lane; 3] = [Lane::Normal, Lane::Priority, Lane::Error];

    /// Upper-case lane name.
    pub fn name(self) -> &'static str {
        match self {
            Lane::Normal => "NORMAL",
            Lane::Priority => "PRIORITY",
            Lane::Error => "ERROR",
        }
    }

    /// Topic-name suffix of this lane.
    pub fn suffix(self) -> &'static str {
        match self {
            Lane::Normal => "-NORMAL",
            Lane::Priority => "-PRIORITY",
            Lane::Error => "-ERROR",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown lane name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown lane: {0}")]
pub struct ParseLaneError(pub String);

impl FromStr for Lane {
    type Err = ParseLaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(Lane::Normal),
            "PRIORITY" => Ok(Lane::Priority),
            "ERROR" => Ok(Lane::Error),
            _ => Err(ParseLaneError(s.to_string())),
        }
    }
}

/// Physical topic name of a base topic on one lane.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct CombinedTopic(String);

impl CombinedTopic {
    /// Get the combined topic as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<CombinedTopic> for String {
    fn from(topic: CombinedTopic) -> Self {
        topic.0
    }
}

impl Borrow<str> for CombinedTopic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CombinedTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CombinedTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Combine a base topic with a lane's suffix.
pub fn combine(base_topic: &str, lane: Lane) -> CombinedTopic {
    let suffix = lane.suffix();
    let mut name = String::with_capacity(base_topic.len() + suffix.len());
    name.push_str(base_topic);
    name.push_str(suffix);
    CombinedTopic(name)
}
