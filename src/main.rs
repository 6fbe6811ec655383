use std::fs::File;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, info};
use syslog::{BasicLogger, Facility, Formatter3164};

use rgbd::{
    application::Application,
    cli::Cli,
    config::{ConfigManager, locate_config},
};

const DAEMON_LOG: &str = "/var/tmp/rgbd.log";

fn init_log(level: LevelFilter) -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: "rgbd".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|()| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn into_daemon() -> Result<()> {
    File::create(DAEMON_LOG)
        .and_then(|out| Ok((out.try_clone()?, out)))
        .with_context(|| format!("Failed to create {DAEMON_LOG}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => locate_config().context("No configuration file found")?,
    };
    let config = ConfigManager::read_from_path(&path)?;
    if cli.check {
        println!("{}: OK", path.display());
        return Ok(());
    }

    init_log(config.log_filter()?)?;
    // Fork before the runtime spawns any thread.
    if cli.daemonize {
        into_daemon()?;
    }

    info!("rgbd {} starting with {}", env!("CARGO_PKG_VERSION"), path.display());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        Application::builder()
            .with_config_manager(ConfigManager::new(config, path))
            .build()?
            .run()
            .await
    })
}
