use serde::Deserialize;

use crate::shared::ValidationError;

/// A reachability probe method, tried in the order configured.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PingMethodConfig {
    /// Open a TCP connection to the configured port.
    TcpEcho,
    /// Run the operating system `ping` command once.
    SystemPing,
}

/// Reachability probing settings used for witness hosts and view members.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PingConfig {
    #[serde(default = "default_ping_methods")]
    pub methods: Vec<PingMethodConfig>,
    #[serde(default = "default_ping_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
}

impl PingConfig {
    pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
    /// The classic echo service port.
    pub const DEFAULT_TCP_PORT: u16 = 7;
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            methods: default_ping_methods(),
            timeout_ms: default_ping_timeout_ms(),
            tcp_port: default_tcp_port(),
        }
    }
}

/// Static cluster membership of the local replicator.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Name of the local member, as it appears in the group communication view.
    pub member_name: String,
    /// Statically configured members of the cluster.
    #[serde(default)]
    pub configured_members: Vec<String>,
    /// Hosts that only break ties and never count toward the quorum set.
    #[serde(default)]
    pub witness_hosts: Vec<String>,
    #[serde(default)]
    pub ping: PingConfig,
    /// Whether a master replicator must see a primary partition before going online.
    #[serde(default = "default_require_quorum_for_master")]
    pub require_quorum_for_master: bool,
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.member_name.trim().is_empty() {
            return Err(ValidationError::EmptyMemberName);
        }

        if self.ping.methods.is_empty() {
            return Err(ValidationError::NoPingMethods);
        }

        Ok(())
    }
}

fn default_ping_methods() -> Vec<PingMethodConfig> {
    vec![PingMethodConfig::TcpEcho, PingMethodConfig::SystemPing]
}

fn default_ping_timeout_ms() -> u64 {
    PingConfig::DEFAULT_TIMEOUT_MS
}

fn default_tcp_port() -> u16 {
    PingConfig::DEFAULT_TCP_PORT
}

fn default_require_quorum_for_master() -> bool {
    true
}
