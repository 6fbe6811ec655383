use clap::Parser;
use std::path::PathBuf;

/// RGB lighting daemon for HID, E1.31 and virtual devices
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: $RGBD_CONFIG, ~/.config/rgbd/config.yml, /etc/rgbd/config.yml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long = "daemonize", default_value_t = false)]
    pub daemonize: bool,

    /// Validate the configuration and exit
    #[arg(long = "check")]
    pub check: bool,
}
