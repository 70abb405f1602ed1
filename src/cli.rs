//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Online-judge API gateway - auth, service discovery and reverse proxying
#[derive(Parser, Debug)]
#[command(name = "oj-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OJ_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "OJ_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "OJ_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "OJ_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OJ_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,
}
