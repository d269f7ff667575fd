//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Admission gateway - bearer token verification and cluster-wide rate limiting
#[derive(Parser, Debug)]
#[command(name = "admission-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "ADMISSION_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "ADMISSION_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "ADMISSION_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "ADMISSION_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "ADMISSION_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Verify a bearer token against the configured issuer and print the identity
    VerifyToken {
        /// Raw token (with or without the `Bearer ` prefix)
        #[arg(required = true)]
        token: String,
    },

    /// Load and validate configuration, then print the effective settings
    CheckConfig,

    /// Publish the cluster load factor read by adaptive limiting
    PublishLoad {
        /// Load between 0.0 (idle) and 1.0 (saturated)
        #[arg(required = true)]
        load: f64,

        /// How long the value stays valid
        #[arg(long, default_value = "60s", value_parser = parse_duration)]
        ttl: std::time::Duration,
    },
}

fn parse_duration(value: &str) -> Result<std::time::Duration, String> {
    crate::config::humantime_serde::parse(value).map_err(|e| format!("invalid duration {value:?}: {e}"))
}
