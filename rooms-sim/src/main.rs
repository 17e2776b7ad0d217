// Rooms simulation: peers share a counter over the loopback transport, the
// host is severed, a participant takes over and a late peer joins it.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rooms_core::{
    host_identity, ConnectionStatus, FileHints, HintStore, LoopbackNetwork, MemoryHints, Room,
    RoomId,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time given to payloads to reach every peer.
const SETTLE: Duration = Duration::from_millis(200);

type Counter = Room<i64>;

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("rooms-sim {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("rooms_core=info".parse()?)
                .add_directive("rooms_sim=info".parse()?),
        )
        .init();

    let cfg = config::load();
    anyhow::ensure!(cfg.peers > 0, "peers must be at least 1");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::select! {
            result = simulate(&cfg) => result,
            result = shutdown_signal() => {
                tracing::info!("interrupted");
                result
            }
        }
    })
}

fn hint_store(cfg: &config::Config, index: usize) -> Arc<dyn HintStore> {
    match &cfg.hint_file {
        Some(path) => Arc::new(FileHints::open(
            path.with_extension(format!("peer{}.json", index)),
        )),
        None => Arc::new(MemoryHints::new()),
    }
}

fn spawn_peer(net: &LoopbackNetwork, cfg: &config::Config, index: usize) -> Counter {
    Room::builder(RoomId::new(cfg.room_id.clone()), Arc::new(net.clone()), 0)
        .config(cfg.room.clone())
        .hints(hint_store(cfg, index))
        .action("increment", |n: &i64, _| n + 1)
        .action("add", |n: &i64, args: &[Value]| {
            n + args.first().and_then(Value::as_i64).unwrap_or(0)
        })
        .spawn()
}

async fn simulate(cfg: &config::Config) -> anyhow::Result<()> {
    let net = LoopbackNetwork::new();
    let room = RoomId::new(cfg.room_id.clone());
    tracing::info!(room = %room, peers = cfg.peers, "starting peers");

    let mut peers = Vec::with_capacity(cfg.peers);
    let mut joins = Vec::with_capacity(cfg.peers);
    for index in 0..cfg.peers {
        let peer = spawn_peer(&net, cfg, index);
        let handle = peer.clone();
        joins.push(tokio::spawn(async move { handle.connect().await }));
        peers.push(peer);
        tokio::time::sleep(Duration::from_millis(cfg.stagger_ms)).await;
    }
    for (index, join) in joins.into_iter().enumerate() {
        join.await?
            .with_context(|| format!("peer {} failed to connect", index))?;
    }
    report("connected", &peers);

    for (index, peer) in peers.iter().enumerate() {
        peer.dispatch("add", vec![json!(index + 1)]);
    }
    tokio::time::sleep(SETTLE).await;
    report("after actions", &peers);

    anyhow::ensure!(
        net.sever(&host_identity(&room)),
        "no endpoint holds the host identity of {}",
        room
    );
    tracing::info!(room = %room, "host severed");

    tokio::time::timeout(cfg.room.failover_window(), wait_for_single_host(&peers))
        .await
        .context("no peer took over as host")?;
    tokio::time::sleep(SETTLE).await;
    report("after failover", &peers);

    let late = spawn_peer(&net, cfg, peers.len());
    late.connect().await.context("late peer failed to connect")?;
    peers.push(late);
    tokio::time::sleep(SETTLE).await;
    peers[peers.len() - 1].dispatch("increment", vec![]);
    tokio::time::sleep(SETTLE).await;
    report("after late join", &peers);

    let first = peers[0].state();
    if peers.iter().all(|p| p.state() == first) {
        tracing::info!(state = first, "all peers agree");
    } else {
        tracing::warn!("peers disagree on the state");
    }
    for peer in &peers {
        peer.disconnect().await;
    }
    Ok(())
}

async fn wait_for_single_host(peers: &[Counter]) {
    loop {
        let hosts = peers.iter().filter(|p| p.is_host()).count();
        let connected = peers
            .iter()
            .all(|p| p.status() == ConnectionStatus::Connected);
        if hosts == 1 && connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn report(label: &str, peers: &[Counter]) {
    println!("-- {}", label);
    for (index, peer) in peers.iter().enumerate() {
        let role = peer.role().map_or("none", |r| r.as_str());
        let id = peer
            .peer_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "peer {:>2}  {:<11}  {:<12}  state={:<4}  id={}",
            index,
            role,
            peer.status().as_str(),
            peer.state(),
            id
        );
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
