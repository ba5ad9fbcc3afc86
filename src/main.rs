//! devproxy - Main entry point
//!
//! A local development HTTP/HTTPS reverse proxy

use anyhow::Result;
use clap::builder::FalseyValueParser;
use clap::Parser;
use devproxy::proxy::DEFAULT_HTTPS_BIND;
use devproxy::{
    mappings_from_environ, MappingTable, PathMapping, ProxyConfig, ProxyServer, TransportOptions,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// devproxy - A local development HTTP/HTTPS reverse proxy
///
/// Mappings may also be given through the `DEVPROXY_MAP` and
/// `DEVPROXY_MAP_*` environment variables, one rule per variable.
#[derive(Parser, Debug)]
#[command(name = "devproxy")]
#[command(version)]
#[command(about = "A local development HTTP/HTTPS reverse proxy")]
struct Args {
    /// Run an HTTPS server on addr:port
    #[arg(long, env = "DEVPROXY_HTTPS", value_name = "ADDR", default_value = DEFAULT_HTTPS_BIND)]
    https: String,

    /// Do not run the HTTPS server
    #[arg(
        long,
        alias = "nohttps",
        env = "DEVPROXY_NO_HTTPS",
        value_parser = FalseyValueParser::new()
    )]
    no_https: bool,

    /// Also run a plain HTTP server on addr:port
    #[arg(long, env = "DEVPROXY_HTTP", value_name = "ADDR")]
    http: Option<String>,

    /// Add a reverse proxy mapping: '/map/from/path = http://host/to/other/path'
    #[arg(long = "map", value_name = "RULE")]
    maps: Vec<PathMapping>,

    /// Verify upstream TLS certificates instead of accepting any certificate
    #[arg(long, env = "DEVPROXY_VERIFY_UPSTREAM_TLS", value_parser = FalseyValueParser::new())]
    verify_upstream_tls: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Starting devproxy v{}", env!("CARGO_PKG_VERSION"));

    let environ = std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)));

    let mut mappings = args.maps;
    mappings.extend(mappings_from_environ(environ)?);

    if mappings.is_empty() {
        warn!("No path mappings configured, every request will get a 404");
    }

    let table = MappingTable::build(
        mappings,
        TransportOptions {
            insecure_skip_verify: !args.verify_upstream_tls,
        },
    )?;

    for line in table.to_string().lines() {
        info!("{}", line);
    }

    let https_bind = Some(args.https).filter(|bind| !args.no_https && !bind.trim().is_empty());
    let http_bind = args.http.filter(|bind| !bind.trim().is_empty());

    let config = ProxyConfig {
        https_bind,
        http_bind,
    };

    let server = Arc::new(ProxyServer::new(config, Arc::new(table)));

    server.run().await
}
