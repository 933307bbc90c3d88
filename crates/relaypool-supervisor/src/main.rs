//! relaypool - worker process supervisor.
//!
//! `relaypool serve` keeps a pool of workers correlated over a relay socket.
//! `relaypool worker` is a reference worker that dials back and answers the
//! pid handshake.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::process::Command;
use relaypool_core::WorkerStatus;
use serde_json::json;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use relaypool_supervisor::relay::{self, RelayAddress};
use relaypool_supervisor::{
    BoundedVec, Config, Container, Context, EventBus, Factory, PoolEvent, SocketFactory,
    TtlSupervisor, WorkerProcess,
};

/// Environment variable carrying the relay address to spawned workers.
const RELAY_ENV: &str = "RELAYPOOL_RELAY";

#[derive(Parser)]
#[command(name = "relaypool")]
#[command(about = "Spawn workers and pool them over a relay socket")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor
    Serve(ServeArgs),

    /// Run a reference worker that dials the supervisor's relay
    Worker {
        /// Relay address to dial
        #[arg(long, env = "RELAYPOOL_RELAY")]
        relay: String,

        /// Never connect (exercises relay timeouts)
        #[arg(long)]
        no_connect: bool,

        /// Report a wrong pid after the first handshake
        #[arg(long)]
        misreport_pid: bool,

        /// Wait before connecting (milliseconds)
        #[arg(long, default_value = "0")]
        connect_delay_ms: u64,

        /// Exit without connecting
        #[arg(long)]
        exit_immediately: bool,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Relay listener address (unix://<path> or tcp://<host:port>)
    #[arg(long, default_value = "unix:///tmp/relaypool.sock")]
    relay: String,

    /// Number of pooled workers
    #[arg(short = 'n', long, default_value = "4")]
    num_workers: usize,

    /// Seconds a worker has to dial back
    #[arg(long, default_value = "60")]
    relay_timeout: u64,

    /// Milliseconds an accepted connection has to answer the pid handshake
    #[arg(long, default_value = "5000")]
    handshake_timeout_ms: u64,

    /// Seconds a health check waits for a free worker and its reply
    #[arg(long, default_value = "60")]
    allocate_timeout: u64,

    /// Seconds a worker gets to exit on shutdown
    #[arg(long, default_value = "10")]
    destroy_timeout: u64,

    /// Maximum worker lifetime in seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    ttl: u64,

    /// Maximum idle time in seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    idle_ttl: u64,

    /// Maximum execution time in seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    exec_ttl: u64,

    /// Seconds between supervision passes
    #[arg(long, default_value = "1")]
    supervise_interval: u64,

    /// Worker command and arguments
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl ServeArgs {
    fn into_parts(self) -> (Config, Vec<String>) {
        let config = Config {
            relay_address: self.relay,
            relay_timeout_secs: self.relay_timeout,
            handshake_timeout_ms: self.handshake_timeout_ms,
            num_workers: self.num_workers,
            allocate_timeout_secs: self.allocate_timeout,
            destroy_timeout_secs: self.destroy_timeout,
            ttl_secs: self.ttl,
            idle_ttl_secs: self.idle_ttl,
            exec_ttl_secs: self.exec_ttl,
            supervise_interval_secs: self.supervise_interval,
            ..Config::default()
        };
        (config, self.command)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Workers log to stderr too; stdout stays free for payloads
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => {
            let (config, command) = args.into_parts();
            serve(config, command).await?;
        }
        Commands::Worker {
            relay,
            no_connect,
            misreport_pid,
            connect_delay_ms,
            exit_immediately,
        } => {
            if exit_immediately {
                return Ok(());
            }
            if no_connect {
                std::future::pending::<()>().await;
            }
            if connect_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(connect_delay_ms)).await;
            }
            run_worker(&relay, misreport_pid).await?;
        }
    }

    Ok(())
}

async fn serve(config: Config, command: Vec<String>) -> Result<(), Box<dyn Error>> {
    let address = config.relay_address()?;

    let events = EventBus::new();
    let mut event_rx = events.channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
        }
    });

    let factory = SocketFactory::bind(&address, config.factory_options(), events.clone()).await?;
    let pool = BoundedVec::new(config.num_workers).with_events(events.clone());
    let supervisor = Arc::new(TtlSupervisor::new(
        config.ttl_policy(),
        config.supervise_interval(),
        events.clone(),
    ));

    info!(
        address = %factory.address(),
        workers = config.num_workers,
        "Starting relaypool supervisor"
    );

    let root = Context::background();
    let ttl_task = tokio::spawn(supervisor.clone().run(root.clone()));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(config.supervise_interval());
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        // A spawn can take up to the relay timeout; stay responsive to Ctrl-C.
        let pass = async {
            replenish(&factory, &pool, &supervisor, &root, &command, config.num_workers).await;
            health_check(&pool, &root, config.allocate_timeout()).await;
        };
        tokio::select! {
            _ = &mut shutdown => break,
            _ = pass => {}
        }
    }

    info!("Shutting down");
    pool.destroy();
    root.cancel();
    if let Err(e) = ttl_task.await {
        warn!(error = %e, "TTL supervisor failed");
    }

    for worker in supervisor.tracked() {
        if let Err(e) = worker.stop(config.destroy_timeout()).await {
            warn!(pid = worker.pid(), error = %e, "Failed to stop worker");
        }
    }
    factory.close().await?;

    info!("relaypool supervisor stopped");
    Ok(())
}

/// Reap exited workers and spawn replacements until `target` are usable.
///
/// Replacements are pushed into a full pool, evicting an unhealthy worker.
async fn replenish(
    factory: &SocketFactory,
    pool: &BoundedVec<WorkerProcess>,
    supervisor: &TtlSupervisor,
    ctx: &Context,
    command: &[String],
    target: usize,
) {
    for worker in supervisor.tracked() {
        if let Err(e) = worker.try_wait().await {
            warn!(pid = worker.pid(), error = %e, "Failed to check worker");
        }
    }
    supervisor.prune();

    let usable = supervisor
        .tracked()
        .iter()
        .filter(|w| w.state().is_usable())
        .count();

    for _ in usable..target {
        let Some(cmd) = worker_command(command, factory.address()) else {
            error!("Empty worker command");
            return;
        };

        match factory.spawn_worker_with_timeout(ctx, cmd, &[]).await {
            Ok(worker) => {
                supervisor.watch(worker.clone());
                pool.push(worker);
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn worker");
                return;
            }
        }
    }
}

/// Round-trip a payload through the next pooled worker and put it back.
///
/// Workers rotate through the check in pool order. A worker that fails or
/// stalls is left unhealthy so the next replenish pass replaces it.
async fn health_check(pool: &BoundedVec<WorkerProcess>, ctx: &Context, timeout: Duration) {
    if pool.is_empty() {
        return;
    }

    let worker = match pool.pop(&ctx.with_timeout(timeout)).await {
        Ok(worker) => worker,
        Err(e) => {
            debug!(error = %e, "No worker free for health check");
            return;
        }
    };

    let ping = json!({ "ping": worker.state().num_execs() });
    match tokio::time::timeout(timeout, worker.exec(ping)).await {
        Ok(Ok(_)) => debug!(
            pid = worker.pid(),
            execs = worker.state().num_execs(),
            "Health check passed"
        ),
        Ok(Err(e)) => warn!(pid = worker.pid(), error = %e, "Health check failed"),
        Err(_) => {
            warn!(pid = worker.pid(), "Health check timed out");
            worker
                .state()
                .transition(WorkerStatus::Working, WorkerStatus::Invalid);
        }
    }
    pool.push(worker);
}

fn worker_command(command: &[String], address: &RelayAddress) -> Option<Command> {
    let (program, args) = command.split_first()?;
    let mut cmd = Command::new(program);
    cmd.args(args).env(RELAY_ENV, address.to_string());
    Some(cmd)
}

fn log_event(event: &PoolEvent) {
    let pid = event.payload.as_ref().map(|w| w.pid());
    match &event.error {
        Some(e) => warn!(event = %event.kind, pid = ?pid, error = %e, "Pool event"),
        None => info!(event = %event.kind, pid = ?pid, "Pool event"),
    }
}

async fn run_worker(relay: &str, misreport_pid: bool) -> Result<(), Box<dyn Error>> {
    let address: RelayAddress = relay.parse()?;
    let pid = std::process::id();

    let relay = relay::connect(&address).await?;
    info!(pid, relay = %address, "Worker connected");

    relay::serve_worker(relay, |request| {
        if misreport_pid && request > 0 {
            pid + 1
        } else {
            pid
        }
    })
    .await?;

    info!(pid, "Worker exiting");
    Ok(())
}
