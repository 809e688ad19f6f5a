use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::info;

use chainkv::membership::{MembershipMonitor, NodeId};
use chainkv::replication::Coordinator;
use chainkv::server::Server;
use chainkv::store::{LocalStore, RequestCache};
use chainkv::transport::UdpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let args: Vec<String> = std::env::args().collect();
    let mut bind_addr: Option<SocketAddr> = None;
    let mut seeds: Vec<NodeId> = Vec::new();
    let mut replication_factor: usize = 3;
    let mut capacity: Option<usize> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" if i + 1 < args.len() => {
                bind_addr = Some(args[i + 1].parse().context("parsing --bind address")?);
                i += 2;
            }
            "--seed" if i + 1 < args.len() => {
                seeds.push(args[i + 1].parse().context("parsing --seed address")?);
                i += 2;
            }
            "--replicas" if i + 1 < args.len() => {
                replication_factor = args[i + 1].parse().context("parsing --replicas")?;
                i += 2;
            }
            "--capacity" if i + 1 < args.len() => {
                capacity = Some(args[i + 1].parse().context("parsing --capacity bytes")?);
                i += 2;
            }
            other => {
                anyhow::bail!(
                    "unknown argument '{}'\nusage: chainkv --bind <ip:port> [--seed <ip:port>]... [--replicas <n>] [--capacity <bytes>]",
                    other
                );
            }
        }
    }

    let bind_addr = bind_addr.context("--bind <ip:port> is required")?;
    let socket = UdpSocket::bind(bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    let local = NodeId::new(socket.local_addr()?);

    info!(
        "Starting node {} ({} seed(s), replication factor {})",
        local,
        seeds.len(),
        replication_factor
    );

    let store = Arc::new(match capacity {
        Some(bytes) => LocalStore::with_capacity(bytes),
        None => LocalStore::new(),
    });
    let cache = Arc::new(RequestCache::new());
    let transport = UdpTransport::new(local.addr()).await?;

    let monitor = MembershipMonitor::new(
        local.clone(),
        seeds,
        replication_factor,
        store.clone(),
        transport.clone(),
    );
    monitor.clone().start();

    let coordinator = Coordinator::new(local, store, cache.clone(), monitor, transport.clone());
    let server = Server::new(socket, coordinator, cache, transport);
    server.run().await
}
