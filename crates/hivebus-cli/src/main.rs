// Copyright 2025 Hivebus Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! # Hivebus CLI
//!
//! Entry point for running a broker and for making one-off JSON-RPC calls
//! against a running broker.
//!
//! ## Usage
//!
//! ```bash
//! # Start a broker with defaults (0.0.0.0:8080)
//! hivebus serve
//!
//! # Start from a TOML file, overriding the port
//! hivebus serve --config hivebus.toml --port 9090
//!
//! # Print the effective configuration
//! hivebus config --config hivebus.toml
//!
//! # Call a method (prints the JSON result)
//! hivebus call http://127.0.0.1:8080 discovery.query '{"capability": "nlp"}'
//! ```
//!
//! Configuration precedence: defaults, then the TOML file, then `HIVEBUS_*`
//! environment variables, then flags.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use hivebus_broker::Bus;
use hivebus_client::BusClient;
use hivebus_common::BusConfig;
use serde_json::Value;

#[derive(FromArgs, Debug)]
/// Hivebus - service bus for AI agents and services
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Config(ConfigArgs),
}

/// Arguments for running a broker.
///
/// # Example
///
/// ```bash
/// hivebus serve -c hivebus.toml --host 127.0.0.1 -p 9090 --api-key secret
/// ```
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "serve")]
/// start a Hivebus broker
struct ServeArgs {
    /// path to a TOML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// host to bind to, overrides `server.host`
    #[argh(option)]
    host: Option<String>,

    /// port to bind to, overrides `server.port`
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// API key required on every request, overrides `auth.api_key`
    #[argh(option, long = "api-key")]
    api_key: Option<String>,

    /// per-client rate limit in requests per second
    ///
    /// Burst size defaults to twice the rate unless the config file sets one.
    #[argh(option, long = "rate-limit-rps")]
    rate_limit_rps: Option<f64>,
}

impl ServeArgs {
    /// Loads the configuration and layers the flags on top.
    fn resolve_config(&self) -> Result<BusConfig> {
        let mut config = BusConfig::load(self.config.as_deref())?;
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(key) = &self.api_key {
            config.auth.api_key = Some(key.clone());
        }
        if let Some(rps) = self.rate_limit_rps {
            config.rate_limit.requests_per_second = Some(rps);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Arguments for a single JSON-RPC call.
///
/// Prints the `result` as JSON on stdout. Errors go to stderr with a
/// non-zero exit code, so the output pipes cleanly into `jq`.
///
/// # Examples
///
/// ```bash
/// hivebus call http://127.0.0.1:8080 agent.list
/// hivebus call http://127.0.0.1:8080 task.create '{"name": "summarize"}'
/// hivebus call http://127.0.0.1:8080 _metrics | jq '.methods'
/// ```
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "call")]
/// call a JSON-RPC method on a broker
struct CallArgs {
    /// broker URL, e.g. http://127.0.0.1:8080
    #[argh(positional)]
    server_address: String,

    /// method name, e.g. discovery.query
    #[argh(positional)]
    method: String,

    /// JSON params, defaults to {}
    #[argh(positional, default = "String::from(\"{}\")")]
    params: String,

    /// API key sent in the X-API-Key header
    #[argh(option, long = "api-key")]
    api_key: Option<String>,

    /// request timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "30000")]
    timeout_ms: u64,

    /// print compact JSON instead of pretty-printed
    #[argh(switch)]
    raw: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "config")]
/// print the effective configuration as JSON
struct ConfigArgs {
    /// path to a TOML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep stdout clean for `call` and `config`
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Config(args) => {
            let config = BusConfig::load(args.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = args.resolve_config()?;
    let addr = config.bind_addr()?;
    tracing::info!(%addr, "starting Hivebus broker");
    if config.auth.api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }
    if let Some(rps) = config.rate_limit.requests_per_second {
        tracing::info!("rate limiting enabled: {} requests per second", rps);
    }

    let bus = Bus::start(config).await?;
    let signal = tokio::spawn(shutdown_on_ctrl_c(Arc::clone(&bus)));

    match Arc::clone(&bus).run().await {
        Ok(()) => {
            // The server only stops cleanly once shutdown has started
            let _ = signal.await;
            Ok(())
        }
        Err(e) => {
            signal.abort();
            bus.shutdown().await;
            Err(e).context("broker stopped with an error")
        }
    }
}

async fn shutdown_on_ctrl_c(bus: Arc<Bus>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl-C"),
        Err(e) => tracing::warn!("failed to listen for Ctrl-C: {}", e),
    }
    bus.shutdown().await;
}

async fn run_call(args: CallArgs) -> Result<()> {
    let params = parse_params(&args.params)?;

    let mut client = BusClient::new(&args.server_address)?
        .with_timeout(Duration::from_millis(args.timeout_ms));
    if let Some(key) = args.api_key {
        client = client.with_api_key(key);
    }

    let result = client.call(args.method.as_str(), params).await?;
    let output = if args.raw {
        serde_json::to_string(&result)?
    } else {
        serde_json::to_string_pretty(&result)?
    };
    println!("{}", output);
    Ok(())
}

fn parse_params(text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("invalid JSON params: {}", text))
}
