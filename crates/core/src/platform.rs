//! Platforms and the source → destination pairs a bridge mirrors between.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

/// A content platform the pipeline knows how to talk to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    Reddit,
    Lemmy,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Reddit, Platform::Lemmy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Reddit => "reddit",
            Platform::Lemmy => "lemmy",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseError::new("platform", s))
    }
}

/// Ordered pair of platforms: items are read from `source` and created on
/// `destination`. Persisted as `"<source>:<destination>"`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlatformPair {
    pub source: Platform,
    pub destination: Platform,
}

impl PlatformPair {
    pub const fn new(source: Platform, destination: Platform) -> Self {
        Self {
            source,
            destination,
        }
    }
}

impl Default for PlatformPair {
    fn default() -> Self {
        Self::new(Platform::Reddit, Platform::Lemmy)
    }
}

impl fmt::Display for PlatformPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.destination)
    }
}

impl FromStr for PlatformPair {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, destination) = s
            .split_once(':')
            .ok_or_else(|| ParseError::new("platform pair", s))?;
        let pair = Self::new(source.parse()?, destination.parse()?);
        if pair.source == pair.destination {
            return Err(ParseError::new("platform pair", s));
        }
        Ok(pair)
    }
}

impl Serialize for PlatformPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PlatformPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_uses_colon_notation() {
        let pair = PlatformPair::default();
        assert_eq!(pair.to_string(), "reddit:lemmy");
        assert_eq!("reddit:lemmy".parse::<PlatformPair>().unwrap(), pair);
        assert_eq!("Reddit:Lemmy".parse::<PlatformPair>().unwrap(), pair);
    }

    #[test]
    fn pair_rejects_malformed_input() {
        assert!("reddit".parse::<PlatformPair>().is_err());
        assert!("reddit:myspace".parse::<PlatformPair>().is_err());
        assert!("lemmy:lemmy".parse::<PlatformPair>().is_err());
    }

    #[test]
    fn pair_serializes_as_string() {
        let json = serde_json::to_string(&PlatformPair::default()).unwrap();
        assert_eq!(json, "\"reddit:lemmy\"");
        let back: PlatformPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PlatformPair::default());
    }
}
