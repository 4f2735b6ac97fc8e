use async_trait::async_trait;
use config::shared::ClusterConfig;
use futures::future::join_all;
use tracing::{info, warn};

use crate::digest::{Diagnostic, MembershipDigest, log_diagnostics};
use crate::ping::HostAddressService;

/// Liveness checks used by a [`QuorumEvaluator`].
#[async_trait]
pub trait MemberProbe: Send + Sync {
    /// Confirms that a view member is alive and really part of the group.
    async fn validate(&self, member: &str) -> bool;

    /// Confirms that a host, usually a witness, answers on the network.
    async fn is_reachable(&self, host: &str) -> bool;
}

#[async_trait]
impl MemberProbe for HostAddressService {
    async fn validate(&self, member: &str) -> bool {
        HostAddressService::is_reachable(self, member).await
    }

    async fn is_reachable(&self, host: &str) -> bool {
        HostAddressService::is_reachable(self, host).await
    }
}

/// Result of one evaluation round.
#[derive(Debug, Clone)]
pub struct QuorumEvaluation {
    pub primary: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub digest: MembershipDigest,
}

/// Runs full quorum evaluation rounds for the local member.
///
/// A round builds a fresh [`MembershipDigest`] from the configured members, the supplied view
/// and the configured witnesses, validates every view member and probes every witness, then
/// decides whether the local member is in the primary partition.
#[derive(Debug)]
pub struct QuorumEvaluator<P> {
    config: ClusterConfig,
    probe: P,
}

impl QuorumEvaluator<HostAddressService> {
    /// Creates an evaluator probing hosts with the configured ping methods.
    pub fn from_config(config: ClusterConfig) -> Self {
        let probe = HostAddressService::from_config(&config.ping);
        Self::new(config, probe)
    }
}

impl<P> QuorumEvaluator<P>
where
    P: MemberProbe,
{
    pub fn new(config: ClusterConfig, probe: P) -> Self {
        Self { config, probe }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Configured members that answer a probe, always including the local member.
    pub async fn discover_view(&self) -> Vec<String> {
        let members = &self.config.configured_members;
        let answers = join_all(members.iter().map(|member| async move {
            *member == self.config.member_name || self.probe.is_reachable(member).await
        }))
        .await;

        let mut view: Vec<String> = members
            .iter()
            .zip(answers)
            .filter_map(|(member, answered)| answered.then(|| member.clone()))
            .collect();
        if !view.contains(&self.config.member_name) {
            view.push(self.config.member_name.clone());
        }

        view
    }

    /// Evaluates the view made of the configured members that answer probes.
    ///
    /// Used without a group communication layer. Members that do not answer stay in the quorum
    /// set as configured members, so the majority and witness rules decide the outcome.
    pub async fn evaluate_configured(&self) -> QuorumEvaluation {
        let view = self.discover_view().await;
        info!(view = ?view, "discovered view from configured members");

        self.evaluate(view).await
    }

    /// Evaluates `view`, the current group communication view.
    ///
    /// The local member validates itself; every other view member and every witness is probed
    /// concurrently.
    pub async fn evaluate<V>(&self, view: V) -> QuorumEvaluation
    where
        V: IntoIterator,
        V::Item: Into<String>,
    {
        let mut digest = MembershipDigest::new(
            self.config.member_name.clone(),
            self.config.configured_members.iter().cloned(),
            view,
            self.config.witness_hosts.iter().cloned(),
        );

        let view_members: Vec<String> = digest
            .view_members()
            .map(|member| member.name().to_owned())
            .collect();
        let witnesses: Vec<String> = digest
            .witnesses()
            .map(|witness| witness.name().to_owned())
            .collect();

        let validations = join_all(view_members.iter().map(|member| async move {
            if *member == self.config.member_name {
                true
            } else {
                self.probe.validate(member).await
            }
        }))
        .await;
        let reachability = join_all(
            witnesses
                .iter()
                .map(|witness| self.probe.is_reachable(witness)),
        )
        .await;

        for (member, validated) in view_members.iter().zip(validations) {
            if !validated {
                warn!(member = %member, "view member could not be validated");
            }

            // Names come from the digest itself, so they are always known.
            if let Err(err) = digest
                .set_validated(member, validated)
                .and_then(|_| digest.set_reachable(member, validated))
            {
                warn!(error = %err, "failed to record member validation");
            }
        }

        for (witness, reachable) in witnesses.iter().zip(reachability) {
            if !reachable {
                warn!(witness = %witness, "witness host is not reachable");
            }

            if let Err(err) = digest.set_reachable(witness, reachable) {
                warn!(error = %err, "failed to record witness reachability");
            }
        }

        let verdict = digest.evaluate();
        log_diagnostics(digest.name(), verdict.diagnostics.clone());
        info!(
            member = digest.name(),
            primary = verdict.primary,
            validated = digest.validated_count(),
            majority = digest.simple_majority_size(),
            "quorum evaluation completed"
        );

        QuorumEvaluation {
            primary: verdict.primary,
            diagnostics: verdict.diagnostics,
            digest,
        }
    }
}
