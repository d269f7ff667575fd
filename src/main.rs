//! Admission gateway - authenticates bearer tokens and enforces cluster-wide rate limits
//! in front of an upstream service.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use admission_gateway::{
    auth::{TokenVerifier, TrustRootCache, bearer_token},
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    limiter::publish_load,
    setup_tracing,
    store::SharedCache,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.command {
        Some(Command::VerifyToken { ref token }) => run_verify_token(&config, token).await,
        Some(Command::CheckConfig) => run_check_config(&config),
        Some(Command::PublishLoad { load, ttl }) => run_publish_load(&config, load, ttl).await,
        Some(Command::Serve) | None => run_server(config).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> admission_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
    Ok(config)
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        environment = ?config.environment,
        strategy = ?config.rate_limit.strategy,
        "Starting admission gateway"
    );

    let gateway = Gateway::new(config)?;
    gateway.run().await?;

    info!("Gateway shutdown complete");
    Ok(())
}

async fn run_verify_token(config: &Config, token: &str) -> anyhow::Result<()> {
    let token = bearer_token(token).unwrap_or(token);
    let cache = SharedCache::from_config(&config.cache)?;
    let trust_root = TrustRootCache::from_config(&config.auth, Some(cache), &config.cache.namespace)?;
    let verifier = TokenVerifier::new(Arc::new(trust_root), &config.auth, config.environment)?;

    match verifier.verify(token).await {
        Ok(identity) => {
            println!("{}", serde_json::to_string_pretty(&identity)?);
            Ok(())
        }
        Err(e) => anyhow::bail!("Token rejected ({}): {e}", e.code()),
    }
}

fn run_check_config(config: &Config) -> anyhow::Result<()> {
    let mut roles: Vec<_> = config
        .rate_limit
        .roles
        .iter()
        .map(|(role, tier)| {
            json!({
                "role": role,
                "requests_per_minute": tier.requests_per_minute,
                "requests_per_hour": tier.requests_per_hour,
                "burst": tier.burst,
            })
        })
        .collect();
    roles.sort_by(|a, b| a["role"].as_str().cmp(&b["role"].as_str()));

    let summary = json!({
        "environment": config.environment,
        "listen": format!("{}:{}", config.server.host, config.server.port),
        "upstream": config.server.upstream_url,
        "auth": {
            "enabled": config.auth.enabled,
            "issuer": config.auth.issuer,
            "jwks_url": config.auth.jwks_url,
            "algorithms": config.auth.algorithms,
            "key_ttl": format!("{:?}", config.auth.key_ttl),
        },
        "cache": {
            "backend": if config.cache.redis_url.is_some() { "redis" } else { "memory" },
            "namespace": config.cache.namespace,
        },
        "rate_limit": {
            "enabled": config.rate_limit.enabled,
            "strategy": config.rate_limit.strategy,
            "roles": roles,
            "routes": config.rate_limit.routes.len(),
            "endpoints": config.rate_limit.endpoints.len(),
            "whitelist": config.rate_limit.whitelist,
            "internal_service_keys": config.rate_limit.resolved_internal_keys().len(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_publish_load(config: &Config, load: f64, ttl: Duration) -> anyhow::Result<()> {
    anyhow::ensure!((0.0..=1.0).contains(&load), "load must be between 0.0 and 1.0, got {load}");
    let cache = SharedCache::from_config(&config.cache)?;
    publish_load(&cache, &config.cache.namespace, load, ttl).await?;
    info!(load, ttl = ?ttl, backend = cache.backend_name(), "Published load factor");
    Ok(())
}
