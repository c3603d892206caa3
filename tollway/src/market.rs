//! Marketplace types consumed by the connection core.
//!
//! A [`ServiceProposal`] is a provider's advertised offer. The core treats
//! it as an immutable value: it is handed to `Manager::connect`, echoed in
//! status snapshots and events, and its contacts are used to reach the
//! provider. The service definition payload is opaque; only the concrete
//! tunnel implementation interprets it.

use crate::identity::Identity;
use serde::{Deserialize, Serialize};

/// A way of reaching a provider, tagged by transport type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// Transport type tag, matched against the dialer's supported types.
    #[serde(rename = "type")]
    pub contact_type: String,
    /// Transport-specific definition (broker addresses, rendezvous info).
    #[serde(default)]
    pub definition: serde_json::Value,
}

/// A provider's advertised service offer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceProposal {
    /// Identity of the providing party.
    pub provider_id: Identity,
    /// Ways of reaching the provider, in preference order.
    #[serde(default)]
    pub provider_contacts: Vec<Contact>,
    /// Service type the proposal offers (e.g. "wireguard").
    pub service_type: String,
    /// Opaque service definition interpreted by the tunnel implementation.
    #[serde(default)]
    pub service_definition: serde_json::Value,
}

impl ServiceProposal {
    /// First contact of the given transport type, if the provider offers one.
    pub fn contact_of_type(&self, contact_type: &str) -> Option<&Contact> {
        self.provider_contacts
            .iter()
            .find(|contact| contact.contact_type == contact_type)
    }
}
