use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::rtun::tunnel::{
    agent::AgentOptions, protocol::MAX_DATA_PAYLOAD, pump, server::ServerOptions, transport,
};

pub const DEFAULT_BUFFER_SIZE: usize = pump::DEFAULT_CHUNK_SIZE;
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Flag, then `RTUN_CONFIG`, then `rtun.{toml,yaml,yml}` in the working directory,
/// then the OS default location.
pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps RTUN_CONFIG into the flag already; this covers callers that bypass it.
    if let Some(p) = std::env::var_os("RTUN_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["rtun.toml", "rtun.yaml", "rtun.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/rtun/rtun.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "rtun", "rtun")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("rtun.toml"))
    }
}

/// Loads the resolved file. Only a missing file at the default location is
/// tolerated; it yields the built-in defaults.
pub fn load(resolved: &ResolvedConfigPath) -> anyhow::Result<Config> {
    match fs::metadata(&resolved.path) {
        Ok(_) => load_config(&resolved.path),
        Err(err)
            if err.kind() == std::io::ErrorKind::NotFound
                && resolved.source == ConfigPathSource::Default =>
        {
            Config::from_file_config(FileConfig::default())
        }
        Err(err) => Err(err).with_context(|| {
            format!(
                "config: {} (from {})",
                resolved.path.display(),
                resolved.source
            )
        }),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"),
    };

    Config::from_file_config(fc).with_context(|| format!("config: {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub buffer_size: usize,
    pub logging: LoggingConfig,
    pub tunnel: TunnelConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub listen_addr: String,
    pub agent_addr: String,
    pub transport: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub service_addr: String,
    pub tunnel_addr: String,
    pub bind_addr: String,
    pub transport: String,
    pub dial_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

/// Command-line values; each one that is set replaces the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub listen_addr: Option<String>,
    pub agent_addr: Option<String>,
    pub service_addr: Option<String>,
    pub tunnel_addr: Option<String>,
    pub bind_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    #[serde(default)]
    buffer_size: usize,

    logging: Option<FileLogging>,
    tunnel: Option<FileTunnel>,
    agent: Option<FileAgent>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    listen_addr: Option<String>,
    agent_addr: Option<String>,
    transport: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAgent {
    service_addr: Option<String>,
    tunnel_addr: Option<String>,
    bind_addr: Option<String>,
    transport: Option<String>,
    dial_timeout: Option<String>,
    reconnect_initial: Option<String>,
    reconnect_max: Option<String>,
}

fn parse_duration(key: &str, v: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    match v.map(str::trim) {
        None | Some("") => Ok(default),
        Some(s) => humantime::parse_duration(s).with_context(|| format!("config: {key} = {s:?}")),
    }
}

fn trimmed(v: Option<String>) -> String {
    v.map(|s| s.trim().to_string()).unwrap_or_default()
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: l.level.unwrap_or_else(|| "info".into()),
                format: l.format.unwrap_or_else(|| "text".into()),
                output: l.output.unwrap_or_else(|| "stderr".into()),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let tunnel = match fc.tunnel {
            Some(t) => TunnelConfig {
                listen_addr: trimmed(t.listen_addr),
                agent_addr: trimmed(t.agent_addr),
                transport: transport::parse_transport(&trimmed(t.transport))?,
            },
            None => TunnelConfig {
                transport: "tcp".into(),
                ..Default::default()
            },
        };

        let a = fc.agent.unwrap_or_default();
        let agent = AgentConfig {
            dial_timeout: parse_duration(
                "agent.dial_timeout",
                a.dial_timeout.as_deref(),
                DEFAULT_DIAL_TIMEOUT,
            )?,
            reconnect_initial: parse_duration(
                "agent.reconnect_initial",
                a.reconnect_initial.as_deref(),
                DEFAULT_RECONNECT_INITIAL,
            )?,
            reconnect_max: parse_duration(
                "agent.reconnect_max",
                a.reconnect_max.as_deref(),
                DEFAULT_RECONNECT_MAX,
            )?,
            transport: transport::parse_transport(a.transport.as_deref().unwrap_or(""))?,
            service_addr: trimmed(a.service_addr),
            tunnel_addr: trimmed(a.tunnel_addr),
            bind_addr: trimmed(a.bind_addr),
        };

        // A chunk becomes one `Data` frame, and the peer rejects frames above the limit.
        if fc.buffer_size as u64 > MAX_DATA_PAYLOAD {
            anyhow::bail!(
                "buffer_size {} exceeds the frame limit of {MAX_DATA_PAYLOAD} bytes",
                fc.buffer_size
            );
        }

        Ok(Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            buffer_size: if fc.buffer_size == 0 {
                DEFAULT_BUFFER_SIZE
            } else {
                fc.buffer_size
            },
            logging,
            tunnel,
            agent,
        })
    }

    pub fn apply(&mut self, o: &Overrides) {
        fn set(dst: &mut String, v: &Option<String>) {
            if let Some(v) = v.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                *dst = v.to_string();
            }
        }
        set(&mut self.logging.level, &o.log_level);
        set(&mut self.tunnel.listen_addr, &o.listen_addr);
        set(&mut self.tunnel.agent_addr, &o.agent_addr);
        set(&mut self.agent.service_addr, &o.service_addr);
        set(&mut self.agent.tunnel_addr, &o.tunnel_addr);
        set(&mut self.agent.bind_addr, &o.bind_addr);
    }

    pub fn server_options(&self) -> anyhow::Result<ServerOptions> {
        if self.tunnel.listen_addr.is_empty() {
            anyhow::bail!("config: tunnel listen address is required (--listen or tunnel.listen_addr)");
        }
        if self.tunnel.agent_addr.is_empty() {
            anyhow::bail!("config: agent address is required (--agent or tunnel.agent_addr)");
        }
        Ok(ServerOptions {
            listen_addr: self.tunnel.listen_addr.clone(),
            agent_addr: self.tunnel.agent_addr.clone(),
            transport: self.tunnel.transport.clone(),
            chunk_size: self.buffer_size,
        })
    }

    pub fn agent_options(&self) -> anyhow::Result<AgentOptions> {
        if self.agent.service_addr.is_empty() {
            anyhow::bail!("config: service address is required (--service or agent.service_addr)");
        }
        if self.agent.tunnel_addr.is_empty() {
            anyhow::bail!("config: tunnel address is required (--tunnel or agent.tunnel_addr)");
        }
        let bind_addr = if self.agent.bind_addr.is_empty() {
            None
        } else {
            let addr: SocketAddr = self
                .agent
                .bind_addr
                .parse()
                .with_context(|| format!("config: invalid bind address {:?}", self.agent.bind_addr))?;
            Some(addr)
        };
        Ok(AgentOptions {
            service_addr: self.agent.service_addr.clone(),
            tunnel_addr: self.agent.tunnel_addr.clone(),
            bind_addr,
            transport: self.agent.transport.clone(),
            chunk_size: self.buffer_size,
            dial_timeout: self.agent.dial_timeout,
            reconnect_initial: self.agent.reconnect_initial,
            reconnect_max: self.agent.reconnect_max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("rtun_cfg_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn toml_with_durations_and_defaults() {
        let dir = temp_dir("toml");
        let cfg_path = dir.join("rtun.toml");

        let toml = r#"
buffer_size = 4096

[tunnel]
listen_addr = ":7000"
agent_addr = "10.0.0.7"

[agent]
service_addr = "127.0.0.1:22"
tunnel_addr = "relay.example.com:7000"
dial_timeout = "250ms"
reconnect_max = "1m"
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");

        assert_eq!(cfg.buffer_size, 4096);
        assert_eq!(cfg.admin_addr, "");
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.tunnel.transport, "tcp");
        assert_eq!(cfg.agent.dial_timeout, Duration::from_millis(250));
        assert_eq!(cfg.agent.reconnect_initial, Duration::from_secs(1));
        assert_eq!(cfg.agent.reconnect_max, Duration::from_secs(60));

        let so = cfg.server_options().expect("server options");
        assert_eq!(so.listen_addr, ":7000");
        assert_eq!(so.chunk_size, 4096);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_is_accepted() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("rtun.yml");

        let yaml = r#"
admin_addr: "127.0.0.1:9100"
logging:
  level: debug
  format: json
agent:
  service_addr: "127.0.0.1:8080"
  tunnel_addr: "127.0.0.1:7000"
  bind_addr: "127.0.0.2:0"
"#;
        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.admin_addr, "127.0.0.1:9100");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);

        let ao = cfg.agent_options().expect("agent options");
        assert_eq!(ao.bind_addr, Some("127.0.0.2:0".parse().unwrap()));
        assert_eq!(ao.dial_timeout, Duration::from_secs(5));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        let dir = temp_dir("reject");
        let cfg_path = dir.join("rtun.toml");

        std::fs::write(&cfg_path, "[tunnel]\nlisten = \":7000\"\n").expect("write");
        let msg = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(msg.contains("listen"), "got: {msg}");

        std::fs::write(&cfg_path, "[agent]\ndial_timeout = \"soon\"\n").expect("write");
        let msg = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(msg.contains("agent.dial_timeout"), "got: {msg}");

        std::fs::write(&cfg_path, "[tunnel]\ntransport = \"quic\"\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        std::fs::write(&cfg_path, "buffer_size = 2097152\n").expect("write");
        let msg = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(msg.contains("buffer_size"), "got: {msg}");

        std::fs::write(&cfg_path, "buffer_size = 1048576\n").expect("write");
        let cfg = load_config(&cfg_path).expect("frame-sized buffer");
        assert_eq!(cfg.buffer_size, 1 << 20);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn command_line_overrides_file_values() {
        let mut cfg = Config::from_file_config(FileConfig::default()).expect("defaults");
        cfg.tunnel.listen_addr = "0.0.0.0:7000".into();
        cfg.tunnel.agent_addr = "10.0.0.1".into();

        cfg.apply(&Overrides {
            log_level: Some("warn".into()),
            agent_addr: Some("10.0.0.9".into()),
            listen_addr: Some("  ".into()),
            ..Default::default()
        });
        assert_eq!(cfg.logging.level, "warn");
        assert_eq!(cfg.tunnel.agent_addr, "10.0.0.9");
        // Blank values do not clear the file setting.
        assert_eq!(cfg.tunnel.listen_addr, "0.0.0.0:7000");
    }

    #[test]
    fn missing_addresses_are_reported() {
        let cfg = Config::from_file_config(FileConfig::default()).expect("defaults");
        let msg = cfg.server_options().unwrap_err().to_string();
        assert!(msg.contains("--listen"));
        let msg = cfg.agent_options().unwrap_err().to_string();
        assert!(msg.contains("--service"));
    }

    #[test]
    fn missing_default_file_falls_back_but_explicit_does_not() {
        let dir = temp_dir("missing");
        let path = dir.join("nope.toml");

        let cfg = load(&ResolvedConfigPath {
            path: path.clone(),
            source: ConfigPathSource::Default,
        })
        .expect("defaults");
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);

        assert!(load(&ResolvedConfigPath {
            path,
            source: ConfigPathSource::Flag,
        })
        .is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn discovery_prefers_toml() {
        let dir = temp_dir("discover");
        assert!(discover_config_path(&dir).is_none());
        std::fs::write(dir.join("rtun.yaml"), "").expect("write");
        std::fs::write(dir.join("rtun.toml"), "").expect("write");
        assert_eq!(discover_config_path(&dir), Some(dir.join("rtun.toml")));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
