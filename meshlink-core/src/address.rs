//! Structured `node/component` addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Identifies a component hosted on a node of the mesh.
///
/// Parsed once at the boundary from the textual form `"node/component"`.
///
/// ```rust
/// use meshlink_core::address::Address;
///
/// let address: Address = "node1/socks".parse().unwrap();
/// assert_eq!(address.node(), "node1");
/// assert_eq!(address.component(), "socks");
/// assert_eq!(address.to_string(), "node1/socks");
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Address {
    node: String,
    component: String,
}

impl Address {
    pub fn new(node: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            component: component.into(),
        }
    }
    #[inline]
    pub fn node(&self) -> &str {
        &self.node
    }
    #[inline]
    pub fn component(&self) -> &str {
        &self.component
    }
    pub fn is_on(&self, node: &str) -> bool {
        self.node == node
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, component) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        if node.is_empty() || component.is_empty() || component.contains('/') {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Ok(Address::new(node, component))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.component)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::Address;

    #[test]
    fn parse_address() {
        let address: Address = "a/b".parse().unwrap();
        assert_eq!(address, Address::new("a", "b"));
        assert!("a".parse::<Address>().is_err());
        assert!("/b".parse::<Address>().is_err());
        assert!("a/".parse::<Address>().is_err());
        assert!("a/b/c".parse::<Address>().is_err());
    }
}
