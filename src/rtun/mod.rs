pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tunnel;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    mode: app::Mode,
    overrides: config::Overrides,
) -> anyhow::Result<()> {
    app::run(config_path, mode, overrides).await
}
