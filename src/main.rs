mod rtun;

use clap::{Parser, Subcommand};

use rtun::{app::Mode, config::Overrides};

#[derive(Debug, Parser)]
#[command(
    name = "rtun",
    version,
    about = "rtun - reverse TCP tunnel for services behind NAT"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses RTUN_CONFIG; then auto-detects rtun.toml > rtun.yaml > rtun.yml from CWD; then falls back to the OS default path (Linux: /etc/rtun/rtun.toml; others: user config dir).
    #[arg(long, env = "RTUN_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public tunnel endpoint.
    Tunnel {
        /// Address clients and the agent connect to (":7000" binds all interfaces).
        #[arg(long, env = "RTUN_LISTEN")]
        listen: Option<String>,

        /// Source address identifying the agent: an IP (any port) or ip:port.
        #[arg(long, env = "RTUN_AGENT_ADDR")]
        agent: Option<String>,
    },
    /// Run the agent next to the private service.
    Agent {
        /// Private service to expose.
        #[arg(long, env = "RTUN_SERVICE")]
        service: Option<String>,

        /// Tunnel endpoint to dial.
        #[arg(long, env = "RTUN_TUNNEL")]
        tunnel: Option<String>,

        /// Local address the tunnel connection originates from.
        #[arg(long, env = "RTUN_BIND")]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut overrides = Overrides {
        log_level: cli.log_level,
        ..Default::default()
    };
    let mode = match cli.command {
        Command::Tunnel { listen, agent } => {
            overrides.listen_addr = listen;
            overrides.agent_addr = agent;
            Mode::Tunnel
        }
        Command::Agent {
            service,
            tunnel,
            bind,
        } => {
            overrides.service_addr = service;
            overrides.tunnel_addr = tunnel;
            overrides.bind_addr = bind;
            Mode::Agent
        }
    };

    rtun::run(cli.config, mode, overrides).await
}
