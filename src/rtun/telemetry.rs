use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

pub const SESSIONS_TOTAL: &str = "rtun_sessions_total";
pub const ACTIVE_SESSIONS: &str = "rtun_active_sessions";
pub const CLIENTS_REJECTED_TOTAL: &str = "rtun_clients_rejected_total";
pub const AGENT_BINDS_TOTAL: &str = "rtun_agent_binds_total";
pub const AGENT_ROUNDS_TOTAL: &str = "rtun_agent_rounds_total";
pub const AGENT_RECONNECTS_TOTAL: &str = "rtun_agent_reconnects_total";
pub const BYTES_INGRESS_TOTAL: &str = "rtun_bytes_ingress_total";
pub const BYTES_EGRESS_TOTAL: &str = "rtun_bytes_egress_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

/// Point-in-time view of the tunnel server's binding cycle.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ServerStatus {
    pub listen_addr: String,
    /// `waiting_for_agent` or `agent_bound`.
    pub state: &'static str,
    pub agent: Option<String>,
    /// `free`, `pending` or `active`.
    pub client_slot: &'static str,
    pub client: Option<String>,
    pub sessions_completed: u64,
    pub clients_rejected: u64,
    pub agent_binds: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AgentStatus {
    pub service_addr: String,
    pub tunnel_addr: String,
    pub connected: bool,
    pub rounds: u64,
    pub reconnects: u64,
}

/// What `/status` reports for this process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Status {
    Tunnel(ServerStatus),
    Agent(AgentStatus),
}

/// Live status feed of whichever mode this process runs.
#[derive(Debug, Clone)]
pub enum StatusFeed {
    Tunnel(tokio::sync::watch::Receiver<ServerStatus>),
    Agent(tokio::sync::watch::Receiver<AgentStatus>),
}

impl StatusFeed {
    pub fn snapshot(&self) -> Status {
        match self {
            StatusFeed::Tunnel(rx) => Status::Tunnel(rx.borrow().clone()),
            StatusFeed::Agent(rx) => Status::Agent(rx.borrow().clone()),
        }
    }
}
