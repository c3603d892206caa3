//! Identities of the parties involved in a session.
//!
//! The consumer and the provider are addressed by their network identity;
//! the hermes (the settlement accountant for the session's payment path) is
//! addressed by a plain account address. Both are opaque strings to this
//! crate; key management lives elsewhere.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A network identity, addressed by its derived account address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Build an identity from its address form.
    pub fn from_address(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The address this identity is known by.
    pub fn address(&self) -> &str {
        &self.0
    }

    /// True for the zero identity (no party).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A settlement account address (e.g. the hermes of a session).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Build an address from its textual form.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The textual form of the address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_address() {
        let identity = Identity::from_address("identity-1");
        assert_eq!(identity.address(), "identity-1");
        assert_eq!(identity.to_string(), "identity-1");
    }

    #[test]
    fn default_identity_is_empty() {
        assert!(Identity::default().is_empty());
        assert!(!Identity::from_address("x").is_empty());
    }

    #[test]
    fn address_displays_textual_form() {
        let address = Address::new("hermes");
        assert_eq!(address.as_str(), "hermes");
        assert_eq!(format!("{address}"), "hermes");
    }
}
