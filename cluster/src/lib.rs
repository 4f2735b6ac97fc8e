//! Cluster membership and primary-partition (quorum) determination.
//!
//! A [`digest::MembershipDigest`] is rebuilt for every evaluation round from the statically
//! configured members, the current group communication view and the witness hosts. The
//! [`evaluator::QuorumEvaluator`] drives a full validation pass over it using reachability
//! probes from [`ping`] and returns a verdict that callers treat as "may accept writes".

pub mod digest;
pub mod error;
pub mod evaluator;
pub mod member;
pub mod ping;

pub use digest::{Diagnostic, DiagnosticLevel, MembershipDigest, PartitionVerdict};
pub use error::MembershipError;
pub use evaluator::{MemberProbe, QuorumEvaluation, QuorumEvaluator};
pub use member::ClusterMember;
pub use ping::{HostAddressService, PingMethod, ReachabilityReport};
