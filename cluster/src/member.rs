use std::fmt;

/// A single host known to a [`crate::MembershipDigest`].
///
/// Members are created by the digest from the union of the configured, view and witness name
/// sets and are only mutated through the digest, which keeps its counters in step with the
/// flags. Outside the crate a member is a read-only view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    name: String,
    configured: bool,
    in_view: bool,
    witness: bool,
    validated: Option<bool>,
    reachable: Option<bool>,
}

impl ClusterMember {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            configured: false,
            in_view: false,
            witness: false,
            validated: None,
            reachable: None,
        }
    }

    pub(crate) fn with_configured(mut self, configured: bool) -> Self {
        self.configured = configured;
        self
    }

    pub(crate) fn with_in_view(mut self, in_view: bool) -> Self {
        self.in_view = in_view;
        self
    }

    pub(crate) fn with_witness(mut self, witness: bool) -> Self {
        self.witness = witness;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the member appears in the static configuration.
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Whether the member appears in the current group communication view.
    pub fn is_in_view(&self) -> bool {
        self.in_view
    }

    pub fn is_witness(&self) -> bool {
        self.witness
    }

    /// Validation result, `None` until the member has been probed.
    pub fn validated(&self) -> Option<bool> {
        self.validated
    }

    /// Reachability result, `None` until the member has been probed.
    pub fn reachable(&self) -> Option<bool> {
        self.reachable
    }

    pub fn is_validated(&self) -> bool {
        self.validated == Some(true)
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable == Some(true)
    }

    /// Replaces the validated flag and returns the previous value.
    pub(crate) fn replace_validated(&mut self, validated: bool) -> Option<bool> {
        self.validated.replace(validated)
    }

    /// Replaces the reachable flag and returns the previous value.
    pub(crate) fn replace_reachable(&mut self, reachable: bool) -> Option<bool> {
        self.reachable.replace(reachable)
    }
}

impl fmt::Display for ClusterMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn flag(value: Option<bool>) -> &'static str {
            match value {
                Some(true) => "true",
                Some(false) => "false",
                None => "unset",
            }
        }

        write!(
            f,
            "{} (configured={}, in_view={}, witness={}, validated={}, reachable={})",
            self.name,
            self.configured,
            self.in_view,
            self.witness,
            flag(self.validated),
            flag(self.reachable)
        )
    }
}
