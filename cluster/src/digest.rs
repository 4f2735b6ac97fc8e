use std::collections::BTreeMap;
use std::fmt;

use tracing::{info, warn};

use crate::error::MembershipError;
use crate::member::ClusterMember;

/// Severity of a [`Diagnostic`] line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Warn,
}

/// One human-readable line explaining a step of a quorum decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

impl Diagnostic {
    fn info(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Info,
            message: message.into(),
        }
    }

    fn warn(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warn,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            DiagnosticLevel::Info => write!(f, "INFO: {}", self.message),
            DiagnosticLevel::Warn => write!(f, "WARN: {}", self.message),
        }
    }
}

/// Verdict of [`MembershipDigest::evaluate`] together with the reasoning behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionVerdict {
    pub primary: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Collects diagnostics when a caller asked for them and discards them otherwise.
struct DiagnosticSink {
    lines: Option<Vec<Diagnostic>>,
}

impl DiagnosticSink {
    fn collecting() -> Self {
        Self {
            lines: Some(Vec::new()),
        }
    }

    fn silent() -> Self {
        Self { lines: None }
    }

    fn push(&mut self, diagnostic: Diagnostic) {
        if let Some(lines) = self.lines.as_mut() {
            lines.push(diagnostic);
        }
    }

    fn into_lines(self) -> Vec<Diagnostic> {
        self.lines.unwrap_or_default()
    }
}

/// Membership snapshot of one quorum evaluation round.
///
/// The potential quorum set is the union of the configured members and the members of the
/// current group communication view. Witnesses live in a separate map and never count toward
/// the quorum set; they only rescue a deficit of exactly one member from the simple majority.
///
/// The validated and reachable counters are maintained incrementally by
/// [`MembershipDigest::set_validated`] and [`MembershipDigest::set_reachable`], which are the
/// only mutation paths, so they always equal the number of members carrying the flag.
#[derive(Debug, Clone)]
pub struct MembershipDigest {
    name: String,
    potential_quorum_members: BTreeMap<String, ClusterMember>,
    witnesses: BTreeMap<String, ClusterMember>,
    view_member_count: usize,
    validated_count: usize,
    reachable_count: usize,
    reachable_witness_count: usize,
}

impl MembershipDigest {
    /// Builds a digest for the local member `name`.
    ///
    /// Empty inputs are accepted; they make the validity checks fail later on.
    pub fn new<C, V, W>(name: impl Into<String>, configured: C, view: V, witnesses: W) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        V: IntoIterator,
        V::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        let mut potential_quorum_members: BTreeMap<String, ClusterMember> = BTreeMap::new();

        for member in configured {
            let member = member.into();
            potential_quorum_members.insert(
                member.clone(),
                ClusterMember::new(member).with_configured(true),
            );
        }

        let mut view_member_count = 0;
        for member in view {
            let member = member.into();
            let entry = potential_quorum_members
                .remove(&member)
                .unwrap_or_else(|| ClusterMember::new(member.clone()));
            if !entry.is_in_view() {
                view_member_count += 1;
            }
            potential_quorum_members.insert(member, entry.with_in_view(true));
        }

        let witnesses = witnesses
            .into_iter()
            .map(|witness| {
                let witness = witness.into();
                (witness.clone(), ClusterMember::new(witness).with_witness(true))
            })
            .collect();

        Self {
            name: name.into(),
            potential_quorum_members,
            witnesses,
            view_member_count,
            validated_count: 0,
            reachable_count: 0,
            reachable_witness_count: 0,
        }
    }

    /// Name of the local member.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member(&self, name: &str) -> Option<&ClusterMember> {
        self.potential_quorum_members.get(name)
    }

    pub fn witness(&self, name: &str) -> Option<&ClusterMember> {
        self.witnesses.get(name)
    }

    /// Members of the potential quorum set, ordered by name.
    pub fn potential_quorum_members(&self) -> impl Iterator<Item = &ClusterMember> {
        self.potential_quorum_members.values()
    }

    /// Members of the current group communication view, ordered by name.
    pub fn view_members(&self) -> impl Iterator<Item = &ClusterMember> {
        self.potential_quorum_members
            .values()
            .filter(|member| member.is_in_view())
    }

    pub fn witnesses(&self) -> impl Iterator<Item = &ClusterMember> {
        self.witnesses.values()
    }

    pub fn configured_member_count(&self) -> usize {
        self.potential_quorum_members
            .values()
            .filter(|member| member.is_configured())
            .count()
    }

    pub fn view_member_count(&self) -> usize {
        self.view_member_count
    }

    pub fn potential_quorum_set_size(&self) -> usize {
        self.potential_quorum_members.len()
    }

    pub fn witness_count(&self) -> usize {
        self.witnesses.len()
    }

    pub fn validated_count(&self) -> usize {
        self.validated_count
    }

    pub fn reachable_count(&self) -> usize {
        self.reachable_count
    }

    pub fn reachable_witness_count(&self) -> usize {
        self.reachable_witness_count
    }

    /// `floor(N / 2) + 1` where `N` is the size of the potential quorum set.
    pub fn simple_majority_size(&self) -> usize {
        self.potential_quorum_members.len() / 2 + 1
    }

    /// Records the validation result for a potential quorum member.
    ///
    /// Returns `Ok(true)` when the flag changed and `Ok(false)` when it already held `validated`.
    pub fn set_validated(&mut self, name: &str, validated: bool) -> Result<bool, MembershipError> {
        let Some(member) = self.potential_quorum_members.get_mut(name) else {
            if self.witnesses.contains_key(name) {
                return Err(MembershipError::WitnessNotValidatable(name.to_owned()));
            }

            return Err(MembershipError::UnknownMember(name.to_owned()));
        };

        let previous = member.replace_validated(validated);
        Ok(apply_flag_change(&mut self.validated_count, previous, validated))
    }

    /// Records the reachability result for a potential quorum member or, failing that, a witness.
    ///
    /// Returns `Ok(true)` when the flag changed and `Ok(false)` when it already held `reachable`.
    pub fn set_reachable(&mut self, name: &str, reachable: bool) -> Result<bool, MembershipError> {
        if let Some(member) = self.potential_quorum_members.get_mut(name) {
            let previous = member.replace_reachable(reachable);
            return Ok(apply_flag_change(
                &mut self.reachable_count,
                previous,
                reachable,
            ));
        }

        if let Some(witness) = self.witnesses.get_mut(name) {
            let previous = witness.replace_reachable(reachable);
            return Ok(apply_flag_change(
                &mut self.reachable_witness_count,
                previous,
                reachable,
            ));
        }

        Err(MembershipError::UnknownMember(name.to_owned()))
    }

    /// Returns `true` when every counter equals the number of members carrying its flag.
    pub fn counters_consistent(&self) -> bool {
        let validated = self
            .potential_quorum_members
            .values()
            .filter(|member| member.is_validated())
            .count();
        let reachable = self
            .potential_quorum_members
            .values()
            .filter(|member| member.is_reachable())
            .count();
        let reachable_witnesses = self
            .witnesses
            .values()
            .filter(|witness| witness.is_reachable())
            .count();

        validated == self.validated_count
            && reachable == self.reachable_count
            && reachable_witnesses == self.reachable_witness_count
    }

    /// Returns `true` when the potential quorum set can be used for a decision.
    ///
    /// Every view member, not only the local one, must have been validated first.
    pub fn is_valid_potential_quorum_members_set(&self) -> bool {
        self.check_potential_quorum_members_set(&mut DiagnosticSink::silent())
    }

    /// Returns `true` when the view is non-empty and every view member was validated.
    pub fn is_valid_membership(&self, verbose: bool) -> bool {
        let mut sink = sink_for(verbose);
        let valid = self.check_membership(&mut sink);
        log_diagnostics(&self.name, sink.into_lines());

        valid
    }

    /// Decides whether the local member is part of the primary partition.
    ///
    /// With `verbose`, every check is logged as a leveled tracing event.
    pub fn is_in_primary_partition(&self, verbose: bool) -> bool {
        let mut sink = sink_for(verbose);
        let primary = self.check_primary_partition(&mut sink);
        log_diagnostics(&self.name, sink.into_lines());

        primary
    }

    /// Decides primary-partition membership and returns the diagnostics without logging them.
    pub fn evaluate(&self) -> PartitionVerdict {
        let mut sink = DiagnosticSink::collecting();
        let primary = self.check_primary_partition(&mut sink);

        PartitionVerdict {
            primary,
            diagnostics: sink.into_lines(),
        }
    }

    fn check_potential_quorum_members_set(&self, sink: &mut DiagnosticSink) -> bool {
        if self.configured_member_count() == 0 {
            sink.push(Diagnostic::warn(
                "invalid potential quorum set: there are no configured members",
            ));
            return false;
        }

        if self.view_member_count == 0 {
            sink.push(Diagnostic::warn(
                "invalid potential quorum set: there are no members in the group communication view",
            ));
            return false;
        }

        let Some(local) = self.potential_quorum_members.get(&self.name) else {
            sink.push(Diagnostic::warn(format!(
                "invalid potential quorum set: local member `{}` is not in the potential quorum set",
                self.name
            )));
            return false;
        };

        if !local.is_in_view() {
            sink.push(Diagnostic::warn(format!(
                "invalid potential quorum set: local member `{}` is not in the group communication view",
                self.name
            )));
            return false;
        }

        if self.validated_count != self.view_member_count {
            sink.push(Diagnostic::warn(format!(
                "invalid potential quorum set: {} validated members but {} view members, every view member must be validated before evaluation",
                self.validated_count, self.view_member_count
            )));
            return false;
        }

        true
    }

    fn check_membership(&self, sink: &mut DiagnosticSink) -> bool {
        if self.view_member_count == 0 {
            sink.push(Diagnostic::warn(
                "invalid membership: the group communication view is empty",
            ));
            return false;
        }

        if self.validated_count != self.view_member_count {
            let unvalidated = self
                .view_members()
                .filter(|member| !member.is_validated())
                .map(ClusterMember::name)
                .collect::<Vec<_>>()
                .join(", ");
            sink.push(Diagnostic::warn(format!(
                "invalid membership: {} of {} view members validated, unvalidated: [{unvalidated}]",
                self.validated_count, self.view_member_count
            )));
            return false;
        }

        true
    }

    fn check_primary_partition(&self, sink: &mut DiagnosticSink) -> bool {
        if !self.check_potential_quorum_members_set(sink) || !self.check_membership(sink) {
            sink.push(Diagnostic::warn(format!(
                "member `{}` is not in a primary partition: membership could not be validated",
                self.name
            )));
            return false;
        }

        let quorum_set_size = self.potential_quorum_members.len();
        let majority = self.simple_majority_size();
        let validated = self.validated_count;

        sink.push(Diagnostic::info(format!(
            "potential quorum set size {quorum_set_size}, simple majority {majority}, validated members {validated}"
        )));

        if quorum_set_size == 1 && validated == 1 {
            sink.push(Diagnostic::info(format!(
                "member `{}` is in a primary partition: single node cluster",
                self.name
            )));
            return true;
        }

        if validated >= majority {
            sink.push(Diagnostic::info(format!(
                "member `{}` is in a primary partition: {validated} validated members reach the simple majority of {majority}",
                self.name
            )));
            return true;
        }

        if validated + 1 == majority {
            let witness_count = self.witnesses.len();
            if witness_count == 0 {
                sink.push(Diagnostic::warn(format!(
                    "member `{}` is not in a primary partition: one member short of the majority and no witnesses are configured",
                    self.name
                )));
                return false;
            }

            if self.reachable_witness_count == witness_count {
                sink.push(Diagnostic::info(format!(
                    "member `{}` is in a primary partition: one member short of the majority and all {witness_count} witnesses are reachable",
                    self.name
                )));
                return true;
            }

            let unreachable = self
                .witnesses
                .values()
                .filter(|witness| !witness.is_reachable())
                .map(ClusterMember::name)
                .collect::<Vec<_>>()
                .join(", ");
            sink.push(Diagnostic::warn(format!(
                "member `{}` is not in a primary partition: one member short of the majority and {} of {witness_count} witnesses are reachable, unreachable: [{unreachable}]",
                self.name, self.reachable_witness_count
            )));
            return false;
        }

        sink.push(Diagnostic::warn(format!(
            "member `{}` is not in a primary partition: {validated} validated members are below the simple majority of {majority}",
            self.name
        )));

        false
    }
}

impl fmt::Display for MembershipDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "membership digest for `{}`", self.name)?;
        writeln!(
            f,
            "  potential quorum set: {} members ({} configured, {} in view), simple majority {}",
            self.potential_quorum_members.len(),
            self.configured_member_count(),
            self.view_member_count,
            self.simple_majority_size()
        )?;
        writeln!(
            f,
            "  validated: {}, reachable: {}",
            self.validated_count, self.reachable_count
        )?;
        for member in self.potential_quorum_members.values() {
            writeln!(f, "    {member}")?;
        }
        write!(
            f,
            "  witnesses: {} ({} reachable)",
            self.witnesses.len(),
            self.reachable_witness_count
        )?;
        for witness in self.witnesses.values() {
            write!(f, "\n    {witness}")?;
        }

        Ok(())
    }
}

/// Adjusts `counter` for a flag moving from `previous` to `current` and reports whether it moved.
fn apply_flag_change(counter: &mut usize, previous: Option<bool>, current: bool) -> bool {
    let was_set = previous == Some(true);
    match (was_set, current) {
        (false, true) => *counter += 1,
        (true, false) => *counter -= 1,
        _ => {}
    }

    previous != Some(current)
}

fn sink_for(verbose: bool) -> DiagnosticSink {
    if verbose {
        DiagnosticSink::collecting()
    } else {
        DiagnosticSink::silent()
    }
}

pub(crate) fn log_diagnostics(member: &str, diagnostics: Vec<Diagnostic>) {
    for diagnostic in diagnostics {
        match diagnostic.level {
            DiagnosticLevel::Info => info!(member, "{}", diagnostic.message),
            DiagnosticLevel::Warn => warn!(member, "{}", diagnostic.message),
        }
    }
}
