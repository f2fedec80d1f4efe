//! pooler - process manager for a pool of worker processes.
//!
//! # Usage
//!
//! ```bash
//! # Run 4 echo workers behind 127.0.0.1:8080
//! pooler serve --workers 4 --port 8080
//!
//! # Run a custom worker executable, recycling each after 500 connections
//! pooler serve --worker-program ./my-worker --restart-strategy request --max-requests 500
//!
//! # Query or stop a running controller
//! pooler status
//! pooler stop
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use pooler::bridge::transport::{DEFAULT_CONTROL_PORT, DEFAULT_RUN_DIR};
use pooler::logging::init_tracing;
use pooler::shutdown::shutdown_signal;
use pooler::{
    Client, CommandSpawner, ControlAddress, Controller, ControllerConfig, EchoHandler,
    TransportKind, WorkerConfig, run_worker,
};

#[derive(Debug, Parser)]
#[command(name = "pooler", version, about = "Supervise a pool of worker processes")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run the controller
    Serve(ServeArgs),
    /// Print the status of a running controller
    Status(ControlArgs),
    /// Ask a running controller to stop
    Stop(ControlArgs),
    /// Run the built-in echo worker (started by the controller)
    Worker,
}

#[derive(Debug, Args)]
struct EndpointArgs {
    /// Control channel transport
    #[arg(long, env = "POOLER_TRANSPORT", default_value_t = TransportKind::default())]
    transport: TransportKind,

    /// Directory holding control sockets
    #[arg(long, env = "POOLER_RUN_DIR", default_value = DEFAULT_RUN_DIR)]
    run_dir: PathBuf,

    /// Control port for the tcp transport
    #[arg(long, env = "POOLER_CONTROL_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[command(flatten)]
    endpoints: EndpointArgs,

    /// Number of workers to keep running
    #[arg(long, short = 'w', env = "POOLER_WORKERS", default_value_t = 8)]
    workers: usize,

    /// Public host to accept connections on
    #[arg(long, env = "POOLER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Public port to accept connections on
    #[arg(long, short = 'p', env = "POOLER_PORT", default_value_t = 8080)]
    port: u16,

    /// First port assigned to workers
    #[arg(long, env = "POOLER_WORKER_BASE_PORT", default_value_t = 5501)]
    worker_base_port: u16,

    /// Restart strategy: request or expire
    #[arg(long, env = "POOLER_RESTART_STRATEGY")]
    restart_strategy: Option<String>,

    /// Worker lifetime in seconds (expire strategy)
    #[arg(long, env = "POOLER_TTL")]
    ttl: Option<u64>,

    /// Connections served before a worker is recycled (request strategy)
    #[arg(long, env = "POOLER_MAX_REQUESTS", default_value_t = 1000)]
    max_requests: u64,

    /// Seconds an inbound connection may wait for a ready worker
    #[arg(long, env = "POOLER_ROUTE_TIMEOUT", default_value_t = 30)]
    route_timeout: u64,

    /// Inbound connections allowed to wait at once
    #[arg(long, env = "POOLER_MAX_PENDING", default_value_t = 1024)]
    max_pending: usize,

    /// Seconds between SIGTERM and SIGKILL when stopping a worker
    #[arg(long, env = "POOLER_GRACE_PERIOD", default_value_t = 10)]
    grace_period: u64,

    /// Seconds a stop may take before remaining workers are abandoned
    #[arg(long, env = "POOLER_DRAIN_TIMEOUT", default_value_t = 30)]
    drain_timeout: u64,

    /// Environment tag passed to workers
    #[arg(long, env = "POOLER_APP_ENV")]
    app_env: Option<String>,

    /// Worker executable (defaults to this binary's `worker` subcommand)
    #[arg(long, env = "POOLER_WORKER_PROGRAM")]
    worker_program: Option<PathBuf>,

    /// Argument passed to the worker executable (repeatable)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,
}

impl ServeArgs {
    fn into_config(self) -> Result<ControllerConfig> {
        let mut config = ControllerConfig::new()
            .with_workers(self.workers)
            .with_public(self.host, self.port)
            .with_transport(self.endpoints.transport)
            .with_run_dir(self.endpoints.run_dir)
            .with_control_port(self.endpoints.control_port)
            .with_worker_base_port(self.worker_base_port)
            .with_max_requests(self.max_requests)
            .with_route_timeout(Duration::from_secs(self.route_timeout))
            .with_max_pending(self.max_pending)
            .with_grace_period(Duration::from_secs(self.grace_period))
            .with_drain_timeout(Duration::from_secs(self.drain_timeout))
            .with_app_env(self.app_env);

        if let Some(strategy) = self.restart_strategy {
            config = config.with_restart_strategy(&strategy)?;
        }
        if let Some(ttl) = self.ttl {
            config = config.with_ttl(Duration::from_secs(ttl));
        }
        if let Some(program) = self.worker_program {
            config = config.with_spawner(Arc::new(CommandSpawner::new(program, self.worker_args)));
        }
        Ok(config)
    }
}

#[derive(Debug, Args)]
struct ControlArgs {
    #[command(flatten)]
    endpoints: EndpointArgs,

    /// Control address (unix://path, IPv4 or IPv6 socket address); overrides the run dir
    #[arg(long, env = "POOLER_CONTROLLER")]
    address: Option<ControlAddress>,
}

impl ControlArgs {
    fn client(self) -> Client {
        let address = self.address.unwrap_or_else(|| {
            let endpoints = &self.endpoints;
            pooler::Endpoints::new(endpoints.transport, &endpoints.run_dir, endpoints.control_port)
                .controller()
        });
        Client::new(address)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        match cli.command {
            CliCommand::Serve(args) => serve(args).await,
            CliCommand::Status(args) => status(args).await,
            CliCommand::Stop(args) => stop(args).await,
            CliCommand::Worker => worker().await,
        }
    })
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config()?;
    let controller = Controller::bind(config)
        .await
        .context("failed to start controller")?;

    let handle = controller.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        if handle.stop().is_err() {
            tracing::debug!("Controller already stopped");
        }
    });

    controller.run().await?;
    Ok(())
}

async fn status(args: ControlArgs) -> Result<()> {
    let client = args.client();
    let reply = client
        .request(&pooler::Command::Status)
        .await
        .with_context(|| format!("status request to {} failed", client.address()))?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn stop(args: ControlArgs) -> Result<()> {
    let client = args.client();
    let reply = client
        .stop()
        .await
        .with_context(|| format!("stop request to {} failed", client.address()))?;
    println!("{}", serde_json::to_string(&reply)?);
    Ok(())
}

async fn worker() -> Result<()> {
    let config = WorkerConfig::from_env().context("worker environment is incomplete")?;
    run_worker(EchoHandler, config).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pooler::RestartStrategy;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    fn serve_args(args: &[&str]) -> ServeArgs {
        let cli = Cli::try_parse_from(["pooler", "serve"].iter().chain(args)).unwrap();
        match cli.command {
            CliCommand::Serve(args) => args,
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn serve_flags_build_config() {
        let config = serve_args(&[
            "--workers",
            "3",
            "--port",
            "9000",
            "--transport",
            "tcp",
            "--restart-strategy",
            "expire",
            "--ttl",
            "60",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.port, 9000);
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.restart_strategy, RestartStrategy::Expire);
        assert_eq!(config.ttl, Some(Duration::from_secs(60)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_restart_strategy_fails_at_configuration() {
        let err = serve_args(&["--restart-strategy", "invalid_strategy"])
            .into_config()
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Invalid restart strategy. Expected request or expire but invalid_strategy given"
        );
    }

    #[test]
    fn control_address_overrides_run_dir() {
        let cli = Cli::try_parse_from(["pooler", "status", "--address", "127.0.0.1:6000"]).unwrap();
        let CliCommand::Status(args) = cli.command else {
            panic!("expected status");
        };
        assert_eq!(
            args.client().address(),
            &ControlAddress::Tcp("127.0.0.1:6000".parse().unwrap())
        );
    }
}
