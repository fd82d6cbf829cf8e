use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::rtun::{
    admin, config, logging, telemetry,
    tunnel::{agent::Agent, server::Server},
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Tunnel,
    Agent,
}

pub async fn run(
    config_path: Option<PathBuf>,
    mode: Mode,
    overrides: config::Overrides,
) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let mut cfg = config::load(&resolved)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    cfg.apply(&overrides);

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        mode = ?mode,
        buffer_size = cfg.buffer_size,
        admin_addr = %cfg.admin_addr,
        "rtun: starting"
    );

    let prom = telemetry::init_prometheus()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    let status = match mode {
        Mode::Tunnel => {
            let server = Server::bind(cfg.server_options()?).await?;
            let status = server.status();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { server.serve(shutdown).await });
            telemetry::StatusFeed::Tunnel(status)
        }
        Mode::Agent => {
            let agent = Agent::new(cfg.agent_options()?)?;
            let status = agent.status();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { agent.run(shutdown).await });
            telemetry::StatusFeed::Agent(status)
        }
    };

    if !cfg.admin_addr.is_empty() {
        let addr: SocketAddr = cfg
            .admin_addr
            .parse()
            .with_context(|| format!("config: invalid admin_addr {:?}", cfg.admin_addr))?;
        let admin_state = admin::AdminState {
            prometheus: prom,
            status,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve(addr, admin_state, shutdown).await });
    }

    // Wait for Ctrl-C / SIGTERM or a task ending on its own.
    let mut outcome = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => tracing::info!("shutdown: task finished"),
                Some(Ok(Err(err))) => outcome = Err(err),
                Some(Err(join_err)) => outcome = Err(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = ?DRAIN_TIMEOUT, "shutdown: drain timed out; aborting tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    if let Err(err) = &outcome {
        tracing::error!(err = %format!("{err:#}"), "rtun: stopped with error");
    }
    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
