use crate::error::Error;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// A single revision of a document: generation number plus an opaque hash.
///
/// Rendered on the wire as `"<num>-<hash>"`. The hash is not interpreted,
/// only compared. The derived ordering (number first, then hash) is the total
/// order that makes winner selection deterministic across replicas.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rev {
    pub num: u64,
    pub hash: String,
}

impl Rev {
    pub fn new(num: u64, hash: impl Into<String>) -> Self {
        Self {
            num,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.num, self.hash)
    }
}

impl fmt::Debug for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.num, self.hash)
    }
}

impl FromStr for Rev {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (num, hash) = input
            .split_once('-')
            .ok_or_else(|| Error::MalformedRev(input.to_owned()))?;
        let num: u64 = num
            .parse()
            .map_err(|_| Error::MalformedRev(input.to_owned()))?;

        if num == 0 || hash.is_empty() {
            return Err(Error::MalformedRev(input.to_owned()));
        }

        Ok(Self {
            num,
            hash: hash.to_owned(),
        })
    }
}

impl Serialize for Rev {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rev {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = String::deserialize(deserializer)?;
        repr.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_and_format_round_trip() {
        let rev: Rev = "3-deadbeef".parse().unwrap();
        assert_eq!(rev, Rev::new(3, "deadbeef"));
        assert_eq!(rev.to_string(), "3-deadbeef");
    }

    #[test]
    fn parse_keeps_extra_dashes_in_hash() {
        let rev: Rev = "1-a-b".parse().unwrap();
        assert_eq!(rev, Rev::new(1, "a-b"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_matches!("nodash".parse::<Rev>(), Err(Error::MalformedRev(_)));
        assert_matches!("x-a".parse::<Rev>(), Err(Error::MalformedRev(_)));
        assert_matches!("0-a".parse::<Rev>(), Err(Error::MalformedRev(_)));
        assert_matches!("1-".parse::<Rev>(), Err(Error::MalformedRev(_)));
    }

    #[test]
    fn ordering_is_number_then_hash() {
        assert!(Rev::new(2, "a") > Rev::new(1, "z"));
        assert!(Rev::new(1, "b") > Rev::new(1, "a"));
    }

    #[test]
    fn serde_uses_wire_format() {
        let rev = Rev::new(2, "abc");
        assert_eq!(serde_json::to_string(&rev).unwrap(), "\"2-abc\"");
        assert_eq!(serde_json::from_str::<Rev>("\"2-abc\"").unwrap(), rev);
    }
}
