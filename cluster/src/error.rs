use thiserror::Error;

/// Errors raised while mutating a [`crate::MembershipDigest`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MembershipError {
    /// The name is neither in the potential quorum set nor among the witnesses.
    #[error("`{0}` is not a member of the potential quorum set or a witness")]
    UnknownMember(String),

    /// Validation only applies to potential quorum members.
    #[error("`{0}` is a witness and cannot be validated, only probed for reachability")]
    WitnessNotValidatable(String),
}
