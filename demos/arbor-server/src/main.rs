//! Arbor overlay node
//!
//! Listens for peer servers and clients, dials the configured remotes and
//! takes part in building the minimum spanning tree. Activities from
//! clients are flooded along the tree.

use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use arbor_core::{ArborResult, Message, PeerId};
use arbor_runtime::{
    event_queue, init_logging, spawn_engine, Engine, EngineSnapshot, Inbound, LogFormat,
    NodeConfig, RemotePeer, DEFAULT_PORT,
};
use arbor_transport::{dial, ConnectionRegistry, TcpTransport};

#[derive(Debug, Parser)]
#[command(name = "arbor-server", about = "Minimum-spanning-tree overlay node")]
struct Opt {
    /// Address to accept peers and clients on
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    listen: SocketAddr,

    /// This node's simulated lag in milliseconds
    #[arg(long, default_value_t = 0)]
    lag: u64,

    /// Peer server to dial, repeatable
    #[arg(long = "remote", value_name = "HOST:PORT:LAG")]
    remotes: Vec<RemotePeer>,

    /// Start the tree construction after the wake delay
    #[arg(long)]
    wake: bool,

    #[arg(long, default_value_t = 2000)]
    wake_delay_ms: u64,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Opt {
    fn into_config(self) -> NodeConfig {
        NodeConfig {
            listen_addr: self.listen,
            lag_floor_ms: self.lag,
            remotes: self.remotes,
            wake_on_start: self.wake,
            wake_delay: Duration::from_millis(self.wake_delay_ms),
            log_format: if self.log_json {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = Opt::parse().into_config();
    init_logging(config.log_format)?;

    run(config).await?;
    Ok(())
}

async fn run(config: NodeConfig) -> ArborResult<()> {
    let local = PeerId::random();
    info!(peer = %local, lag = config.lag_floor_ms, "starting node");

    let (events, queue) = event_queue();
    let registry = ConnectionRegistry::new();

    let transport = TcpTransport::bind(
        config.listen_addr,
        registry.clone(),
        events.clone(),
        config.local_lag(),
    )
    .await?;
    let accept = transport.start_accept_loop();

    let engine = Engine::new(local, config.engine_config());
    let mut handle = spawn_engine(engine, queue, registry.clone());

    for remote in &config.remotes {
        if let Err(e) = dial(remote, &registry, &events).await {
            warn!(%remote, "dial failed: {}", e);
        }
    }

    if config.wake_on_start {
        let events = events.clone();
        let delay = config.wake_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if events.push(Inbound::local(Message::WakeUp)).is_err() {
                warn!("engine gone before wake-up");
            }
        });
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut last = handle.snapshots.borrow().clone();
    loop {
        tokio::select! {
            changed = handle.snapshots.changed() => {
                if changed.is_err() {
                    warn!("engine stopped");
                    break;
                }
                let snapshot = handle.snapshots.borrow_and_update().clone();
                if tree_changed(&last, &snapshot) {
                    log_snapshot(&snapshot);
                }
                last = snapshot;
            }
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
        }
    }

    accept.abort();
    Ok(())
}

fn tree_changed(before: &EngineSnapshot, after: &EngineSnapshot) -> bool {
    before.state != after.state
        || before.level != after.level
        || before.fragment != after.fragment
        || before.branches != after.branches
        || before.rejected != after.rejected
        || before.clients != after.clients
        || before.halted != after.halted
}

fn log_snapshot(snapshot: &EngineSnapshot) {
    info!(
        state = %snapshot.state,
        level = snapshot.level,
        fragment = %snapshot.fragment,
        branches = ?snapshot.branches,
        rejected = ?snapshot.rejected,
        unclassified = snapshot.unclassified,
        clients = snapshot.clients,
        halted = snapshot.halted,
        "tree updated"
    );
}
