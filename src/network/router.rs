use std::{fmt::Display, net::Ipv4Addr, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid dotted-quad identifier: {0}")]
pub struct IdParseError(pub String);

/// Parses an area or router identifier.
///
/// Both the dotted-quad form (`0.0.0.1`) and the plain decimal form (`1`) are
/// accepted, since area ids are commonly configured either way.
fn parse_dotted_or_decimal(s: &str) -> Result<Ipv4Addr, IdParseError> {
    let trimmed = s.trim();
    if let Ok(addr) = trimmed.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    trimmed
        .parse::<u32>()
        .map(Ipv4Addr::from)
        .map_err(|_| IdParseError(s.to_string()))
}

macro_rules! dotted_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Ipv4Addr);

        impl Default for $name {
            fn default() -> Self {
                Self(Ipv4Addr::UNSPECIFIED)
            }
        }

        impl $name {
            pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
                Self(Ipv4Addr::new(a, b, c, d))
            }

            pub fn addr(&self) -> Ipv4Addr {
                self.0
            }

            pub fn is_unspecified(&self) -> bool {
                self.0.is_unspecified()
            }

            pub fn to_bits(&self) -> u32 {
                u32::from(self.0)
            }
        }

        impl From<Ipv4Addr> for $name {
            fn from(addr: Ipv4Addr) -> Self {
                Self(addr)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_dotted_or_decimal(s).map(Self)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        // Serialized as strings so the ids can be used as JSON map keys.
        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

dotted_id!(
    /// OSPF router identifier.
    RouterId
);

dotted_id!(
    /// OSPF area identifier. `0.0.0.0` is the backbone.
    AreaId
);

impl AreaId {
    pub const BACKBONE: AreaId = AreaId(Ipv4Addr::UNSPECIFIED);

    pub fn is_backbone(&self) -> bool {
        *self == Self::BACKBONE
    }
}

/// Identity of a local OSPF interface: its primary address and kernel ifindex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntfKey {
    pub ip_address: Ipv4Addr,
    pub if_index: u32,
}

impl IntfKey {
    pub fn new(ip_address: Ipv4Addr, if_index: u32) -> Self {
        Self {
            ip_address,
            if_index,
        }
    }
}

impl Display for IntfKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%{}", self.ip_address, self.if_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_id_parses_dotted_and_decimal() {
        assert_eq!("10.0.0.1".parse::<RouterId>().unwrap(), RouterId::new(10, 0, 0, 1));
        assert_eq!("1".parse::<AreaId>().unwrap(), AreaId::new(0, 0, 0, 1));
        assert!("not-an-id".parse::<RouterId>().is_err());
        assert!("1.2.3".parse::<RouterId>().is_err());
    }

    #[test]
    fn test_ids_round_trip_through_json_map_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert(AreaId::new(0, 0, 0, 2), 7u32);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"0.0.0.2":7}"#);

        let back: std::collections::HashMap<AreaId, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&AreaId::new(0, 0, 0, 2)), Some(&7));
    }

    #[test]
    fn test_default_ids_are_unspecified() {
        assert!(RouterId::default().is_unspecified());
        assert_eq!(AreaId::default(), AreaId::BACKBONE);
    }

    #[test]
    fn test_backbone() {
        assert!(AreaId::BACKBONE.is_backbone());
        assert!(!AreaId::new(0, 0, 0, 1).is_backbone());
    }
}
