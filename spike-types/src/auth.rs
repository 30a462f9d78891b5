//! The peer-identity gate over SPIFFE IDs.
//!
//! Every request reaching the core carries a [`PeerIdentity`] that was
//! already verified at the transport layer (mTLS, X.509-SVID). The gate
//! maps that identity to a [`PeerRole`] derived from the configured trust
//! root and checks it against the allowlist of the route.
//!
//! On mismatch the gate returns [`SpikeError::AccessUnauthorized`] and
//! nothing else: the caller identity is never echoed back.

use serde::{Deserialize, Serialize};

use crate::error::SpikeError;

/// A verified SPIFFE identity extracted from the transport layer.
///
/// The SVID acquisition plumbing is external to the core; hosting servers
/// insert this as a request extension after the TLS handshake.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

/// The roles a caller can hold against the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// A Keeper instance.
    Keeper,
    /// The Nexus instance (also the trusted recovery peer).
    Nexus,
    /// The bootstrap operator.
    Bootstrap,
    /// A dedicated recovery tool.
    Recovery,
}

impl PeerIdentity {
    /// Creates a new `PeerIdentity` by wrapping a SPIFFE ID string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the inner SPIFFE ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The allowlist check over SPIFFE IDs that authorizes each core operation.
///
/// Built once per service from `(trust_root, nexus_trust_root)`; the two
/// roots are usually identical but may differ in federated deployments.
#[derive(Clone, Debug)]
pub struct PeerGate {
    trust_root: String,
    nexus_trust_root: String,
}

impl PeerGate {
    /// Creates a gate for the given trust roots.
    pub fn new(trust_root: impl Into<String>, nexus_trust_root: impl Into<String>) -> Self {
        Self {
            trust_root: trust_root.into(),
            nexus_trust_root: nexus_trust_root.into(),
        }
    }

    /// The SPIFFE ID of a Keeper with the given id under this gate's trust root.
    pub fn keeper_spiffe_id(&self, keeper_id: &crate::KeeperId) -> PeerIdentity {
        PeerIdentity(format!(
            "spiffe://{}/spike/keeper/{}",
            self.trust_root, keeper_id
        ))
    }

    /// The SPIFFE ID of the Nexus instance.
    pub fn nexus_spiffe_id(&self) -> PeerIdentity {
        PeerIdentity(format!("spiffe://{}/spike/nexus", self.nexus_trust_root))
    }

    /// Resolves the role of a verified peer, if it belongs to this trust domain.
    pub fn role_of(&self, peer: &PeerIdentity) -> Option<PeerRole> {
        let id = peer.as_str();
        if id == format!("spiffe://{}/spike/nexus", self.nexus_trust_root) {
            return Some(PeerRole::Nexus);
        }
        let prefix = format!("spiffe://{}/spike/", self.trust_root);
        let rest = id.strip_prefix(&prefix)?;
        if let Some(keeper) = rest.strip_prefix("keeper/") {
            if keeper.is_empty() || keeper.contains('/') {
                return None;
            }
            return Some(PeerRole::Keeper);
        }
        match rest {
            "bootstrap" => Some(PeerRole::Bootstrap),
            "recovery" => Some(PeerRole::Recovery),
            _ => None,
        }
    }

    /// Checks the peer against the allowlist for a route.
    ///
    /// # Errors
    ///
    /// Returns [`SpikeError::AccessUnauthorized`] if the peer holds none of
    /// the allowed roles. No further detail is attached.
    pub fn authorize(&self, peer: &PeerIdentity, allowed: &[PeerRole]) -> Result<(), SpikeError> {
        match self.role_of(peer) {
            Some(role) if allowed.contains(&role) => Ok(()),
            _ => Err(SpikeError::AccessUnauthorized),
        }
    }

    /// Checks that the peer belongs to the trust domain at all.
    ///
    /// Routes whose fine-grained authorization lives in an external policy
    /// engine still require membership.
    pub fn authorize_member(&self, peer: &PeerIdentity) -> Result<(), SpikeError> {
        self.role_of(peer)
            .map(|_| ())
            .ok_or(SpikeError::AccessUnauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeeperId;

    fn gate() -> PeerGate {
        PeerGate::new("spike.ist", "spike.ist")
    }

    #[test]
    fn resolves_roles_from_spiffe_ids() {
        let gate = gate();
        assert_eq!(
            gate.role_of(&PeerIdentity::new("spiffe://spike.ist/spike/nexus")),
            Some(PeerRole::Nexus)
        );
        assert_eq!(
            gate.role_of(&gate.keeper_spiffe_id(&KeeperId::new("a"))),
            Some(PeerRole::Keeper)
        );
        assert_eq!(
            gate.role_of(&PeerIdentity::new("spiffe://spike.ist/spike/bootstrap")),
            Some(PeerRole::Bootstrap)
        );
        assert_eq!(
            gate.role_of(&PeerIdentity::new("spiffe://evil.example/spike/nexus")),
            None
        );
        assert_eq!(
            gate.role_of(&PeerIdentity::new("spiffe://spike.ist/spike/keeper/a/b")),
            None
        );
    }

    #[test]
    fn authorize_rejects_without_detail() {
        let gate = gate();
        let keeper = gate.keeper_spiffe_id(&KeeperId::new("a"));
        let err = gate
            .authorize(&keeper, &[PeerRole::Nexus])
            .expect_err("keeper is not nexus");
        assert!(matches!(
            err,
            crate::error::SpikeError::AccessUnauthorized
        ));
        gate.authorize(&keeper, &[PeerRole::Keeper, PeerRole::Nexus])
            .expect("keeper is allowed");
    }

    #[test]
    fn federated_nexus_root() {
        let gate = PeerGate::new("spike.ist", "nexus.spike.ist");
        assert_eq!(
            gate.role_of(&PeerIdentity::new("spiffe://nexus.spike.ist/spike/nexus")),
            Some(PeerRole::Nexus)
        );
        assert_eq!(
            gate.role_of(&PeerIdentity::new("spiffe://spike.ist/spike/nexus")),
            None
        );
    }
}
