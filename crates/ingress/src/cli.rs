//! CLI definitions for the fleet-ingress server binary.

use std::path::PathBuf;

use clap::Parser;
use uuid::Uuid;

use fleet_common::config::Config;

/// Fleet control plane server.
///
/// Serves the artifact fetch API and runs the coordination plane
/// (policy leadership, coordination, and unenrollment) against the
/// configured document store.
#[derive(Debug, Parser)]
#[command(
    name = "fleet-ingress",
    version,
    about = "Fleet control plane server",
    long_about = "Serves the artifact fetch API and runs the coordination plane\n\
                  (policy leadership, coordination, unenrollment) against the\n\
                  configured document store."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the HTTP bind address (e.g. 0.0.0.0:8220).
    #[arg(long)]
    pub bind: Option<String>,

    /// Log filter directive (e.g. "info", "fleet_coordinator=debug").
    #[arg(long, default_value = "info")]
    pub log: String,
}

impl Cli {
    /// Load configuration, apply CLI overrides, and fill generated
    /// identity fields.
    pub fn load_config(&self) -> anyhow::Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load_from_file(path)?,
            None => Config::default(),
        };

        if let Some(bind) = &self.bind {
            cfg.server.bind_addr = bind.clone();
        }
        if cfg.fleet.agent_id.is_empty() {
            cfg.fleet.agent_id = Uuid::new_v4().to_string();
        }
        if cfg.fleet.host_id.is_empty() {
            cfg.fleet.host_id = cfg.fleet.agent_id.clone();
        }

        cfg.validate()?;
        Ok(cfg)
    }
}
