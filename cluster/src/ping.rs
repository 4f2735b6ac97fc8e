use std::fmt;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use config::shared::{PingConfig, PingMethodConfig};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// A reachability probe strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingMethod {
    /// Opens a TCP connection to `port`. A refused connection still proves the host is up.
    TcpEcho { port: u16 },
    /// Runs the operating system `ping` command for a single echo request.
    SystemPing,
}

impl PingMethod {
    fn from_config(method: PingMethodConfig, config: &PingConfig) -> Self {
        match method {
            PingMethodConfig::TcpEcho => PingMethod::TcpEcho {
                port: config.tcp_port,
            },
            PingMethodConfig::SystemPing => PingMethod::SystemPing,
        }
    }

    /// Probes `host`, bounded by `timeout`.
    async fn probe(&self, host: &str, timeout: Duration) -> io::Result<bool> {
        match self {
            PingMethod::TcpEcho { port } => {
                match tokio::time::timeout(timeout, TcpStream::connect((host, *port))).await {
                    Ok(Ok(_)) => Ok(true),
                    Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => Ok(true),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Ok(false),
                }
            }
            PingMethod::SystemPing => {
                let wait_secs = timeout.as_secs().max(1).to_string();
                let status = Command::new("ping")
                    .args(["-c", "1", "-W", &wait_secs, host])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status();

                match tokio::time::timeout(timeout, status).await {
                    Ok(status) => Ok(status?.success()),
                    Err(_) => Ok(false),
                }
            }
        }
    }
}

impl fmt::Display for PingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PingMethod::TcpEcho { port } => write!(f, "tcp_echo:{port}"),
            PingMethod::SystemPing => f.write_str("system_ping"),
        }
    }
}

/// Outcome of probing one host with every configured method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityReport {
    pub host: String,
    /// The first method that reached the host.
    pub reached_by: Option<PingMethod>,
    /// Methods tried before `reached_by`, each with the reason it failed.
    pub failures: Vec<(PingMethod, String)>,
}

impl ReachabilityReport {
    pub fn is_reachable(&self) -> bool {
        self.reached_by.is_some()
    }
}

/// Determines host reachability by trying a fixed list of [`PingMethod`]s in order.
#[derive(Debug, Clone)]
pub struct HostAddressService {
    methods: Vec<PingMethod>,
    timeout: Duration,
}

impl HostAddressService {
    pub fn new(methods: Vec<PingMethod>, timeout: Duration) -> Self {
        Self { methods, timeout }
    }

    /// Registers the methods listed in `config`, keeping their order.
    pub fn from_config(config: &PingConfig) -> Self {
        let methods = config
            .methods
            .iter()
            .map(|method| PingMethod::from_config(*method, config))
            .collect();

        Self::new(methods, Duration::from_millis(config.timeout_ms))
    }

    pub fn methods(&self) -> &[PingMethod] {
        &self.methods
    }

    /// Tries each method in order and stops at the first one reaching `host`.
    pub async fn check(&self, host: &str) -> ReachabilityReport {
        let mut failures = Vec::new();

        for method in &self.methods {
            match method.probe(host, self.timeout).await {
                Ok(true) => {
                    debug!(host, %method, "host is reachable");

                    return ReachabilityReport {
                        host: host.to_owned(),
                        reached_by: Some(*method),
                        failures,
                    };
                }
                Ok(false) => {
                    debug!(host, %method, "host did not answer");
                    failures.push((*method, "no answer before timeout".to_owned()));
                }
                Err(err) => {
                    debug!(host, %method, error = %err, "probe failed");
                    failures.push((*method, err.to_string()));
                }
            }
        }

        ReachabilityReport {
            host: host.to_owned(),
            reached_by: None,
            failures,
        }
    }

    pub async fn is_reachable(&self, host: &str) -> bool {
        self.check(host).await.is_reachable()
    }
}
