//! Connection classification: data vs gossip, plaintext vs TLS, and the
//! handshake state machine gating message admission.

use crate::message::MessageType;
use strand_membership::{FailureDomainScope, Location};

/// What a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Data,
    Gossip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    Plaintext,
    Tls,
}

/// Whether a connection between two locations must use TLS.
///
/// Traffic crossing the configured boundary scope is encrypted: if the
/// peers' closest shared scope is wider than the boundary, they sit in
/// different boundary domains.
pub fn requires_ssl(
    boundary: Option<FailureDomainScope>,
    local: &Location,
    remote: &Location,
) -> bool {
    match boundary {
        None => false,
        Some(scope) => local.closest_shared_scope(remote) > scope,
    }
}

/// Per-connection handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Only HELLO/ACK may flow.
    Pending,
    /// Negotiated protocol version.
    Complete { protocol: u16 },
}

impl HandshakeState {
    /// Whether a message type may be sent or received right now on a
    /// connection of the given kind.
    pub fn admits(self, kind: ConnectionKind, msg_type: MessageType) -> bool {
        match self {
            HandshakeState::Pending => msg_type.is_handshake(),
            HandshakeState::Complete { .. } => match kind {
                // Gossip traffic stays on its own connection.
                ConnectionKind::Data => msg_type != MessageType::Gossip,
                ConnectionKind::Gossip => msg_type.allowed_on_gossip_connection(),
            },
        }
    }

    pub fn protocol(self) -> Option<u16> {
        match self {
            HandshakeState::Pending => None,
            HandshakeState::Complete { protocol } => Some(protocol),
        }
    }
}
