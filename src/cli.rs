use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Ships container logs to a logstash-compatible collector.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, env = "LOGSHIP_CONFIG", default_value = "logship.toml")]
    pub config: PathBuf,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
