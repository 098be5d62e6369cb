//! KNX group addresses.
//!
//! Three-level `main/middle/sub` form (5/3/8 bits). Parsed from config
//! strings, encoded to the 16-bit wire representation in cEMI frames.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A 3-level KNX group address, e.g. `2/1/14`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAddress {
    pub main: u8,
    pub middle: u8,
    pub sub: u8,
}

impl GroupAddress {
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self> {
        if main > 31 {
            return Err(Error::invalid(format!(
                "group address main {} exceeds 5 bits",
                main
            )));
        }
        if middle > 7 {
            return Err(Error::invalid(format!(
                "group address middle {} exceeds 3 bits",
                middle
            )));
        }
        Ok(Self { main, middle, sub })
    }

    /// 16-bit wire encoding: `MMMMM_III_SSSSSSSS`.
    pub fn to_u16(&self) -> u16 {
        ((self.main as u16) << 11) | ((self.middle as u16) << 8) | self.sub as u16
    }

    pub fn from_u16(raw: u16) -> Self {
        Self {
            main: ((raw >> 11) & 0x1f) as u8,
            middle: ((raw >> 8) & 0x07) as u8,
            sub: (raw & 0xff) as u8,
        }
    }
}

impl FromStr for GroupAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 {
            return Err(Error::invalid(format!(
                "group address {:?} must be main/middle/sub",
                s
            )));
        }
        let parse = |p: &str| -> Result<u8> {
            p.parse::<u8>()
                .map_err(|_| Error::invalid(format!("group address component {:?}", p)))
        };
        Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?)
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main, self.middle, self.sub)
    }
}

impl Serialize for GroupAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GroupAddress {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
