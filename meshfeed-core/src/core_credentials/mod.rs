//! Space membership from a verifiable chain of credentials
//!
//! Credentials are ordinary feed payloads; [`CredentialChain`] turns the set
//! of credentials seen so far into a [`MembershipSnapshot`].

pub mod chain;
pub mod credential;
pub mod role;

pub use chain::{ChainState, CredentialChain, CredentialRecord, MembershipSnapshot, Verdict};
pub use credential::Credential;
pub use role::Role;

use thiserror::Error;

use crate::core_identity::PublicKey;

/// Why a credential was rejected. Rejections are final.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("genesis must admit the owner at the space origin")]
    InvalidGenesis,

    #[error("credential has no genesis in its causal past")]
    NoGenesis,

    #[error("issuing feed {feed} is not bound to any identity")]
    UnknownIssuer { feed: PublicKey },

    #[error("issuer {issuer} with role {role} lacks the rank for this credential")]
    InsufficientRank { issuer: PublicKey, role: Role },

    #[error("identity {0} cannot admit itself")]
    SelfAdmission(PublicKey),

    #[error("identity {0} cannot update its own role")]
    OwnRoleUpdate(PublicKey),

    #[error("the role of the space owner is immutable")]
    OwnerImmutable,

    #[error("the owner role cannot be granted")]
    OwnerGrant,

    #[error("subject {0} is not a member")]
    UnknownSubject(PublicKey),

    #[error("identity {0} is not an active member")]
    NotMember(PublicKey),

    #[error("invalid identity proof for feed {feed} and identity {identity}")]
    InvalidProof { feed: PublicKey, identity: PublicKey },

    #[error("feed {feed} is already bound to identity {identity}")]
    FeedAlreadyBound { feed: PublicKey, identity: PublicKey },

    #[error("feed admission for {feed} carried on feed {carrier}")]
    FeedCarrierMismatch { carrier: PublicKey, feed: PublicKey },
}

pub type CredentialResult<T> = Result<T, CredentialError>;
