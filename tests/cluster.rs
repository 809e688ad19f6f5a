//! Multi-node tests over loopback UDP: writes travel the full replica
//! chain (propose, ack, commit), reads are served at the tail, and a
//! proposal alone never mutates a backup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use chainkv::codec::{generate_message_id, protocol, Envelope, Request, Response};
use chainkv::membership::{MembershipMonitor, NodeId};
use chainkv::replication::Coordinator;
use chainkv::server::Server;
use chainkv::store::{LocalStore, RequestCache};
use chainkv::transport::UdpTransport;

/// Spawns `n` nodes seeded with each other, so every ring and chain agrees
/// from the start. Returns each node's address and a handle on its store.
async fn spawn_cluster(n: usize) -> Vec<(SocketAddr, Arc<LocalStore>)> {
    let mut sockets = Vec::with_capacity(n);
    for _ in 0..n {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        sockets.push((socket, addr));
    }
    let addrs: Vec<SocketAddr> = sockets.iter().map(|(_, addr)| *addr).collect();

    let mut nodes = Vec::with_capacity(n);
    for (socket, addr) in sockets {
        let local = NodeId::new(addr);
        let seeds: Vec<NodeId> = addrs
            .iter()
            .filter(|a| **a != addr)
            .map(|a| NodeId::new(*a))
            .collect();

        let store = Arc::new(LocalStore::new());
        let cache = Arc::new(RequestCache::with_ttl(Duration::from_secs(5)));
        let transport = UdpTransport::new(addr).await.unwrap();
        let monitor =
            MembershipMonitor::new(local.clone(), seeds, 3, store.clone(), transport.clone());
        let coordinator =
            Coordinator::new(local, store.clone(), cache.clone(), monitor, transport.clone());

        let server = Server::new(socket, coordinator, cache, transport);
        tokio::spawn(server.run());
        nodes.push((addr, store));
    }
    nodes
}

async fn call(client: &UdpTransport, node: SocketAddr, request: Request) -> Response {
    let reply = client
        .request(node, request.encode().unwrap())
        .await
        .unwrap();
    Response::decode(&reply.payload).unwrap()
}

async fn client() -> Arc<UdpTransport> {
    UdpTransport::new("127.0.0.1:9999".parse().unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn write_is_readable_from_every_node_after_commit() {
    let nodes = spawn_cluster(3).await;
    let client = client().await;

    let put = Request::write(protocol::PUT, b"chained".to_vec(), b"value".to_vec(), 5);
    let written = call(&client, nodes[0].0, put).await;
    assert_eq!(written.status, protocol::SUCCESS);

    // the write only answers once the whole chain holds it, so a read
    // through any node must see it immediately
    for (addr, _) in &nodes {
        let got = call(
            &client,
            *addr,
            Request::keyed(protocol::GET, b"chained".to_vec()),
        )
        .await;
        assert_eq!(got.status, protocol::SUCCESS);
        assert_eq!(got.value, Some(b"value".to_vec()));
        assert_eq!(got.version, 5);
    }
}

#[tokio::test]
async fn commit_reaches_every_replica_store() {
    let nodes = spawn_cluster(3).await;
    let client = client().await;

    let put = Request::write(protocol::PUT, b"fanout".to_vec(), b"v".to_vec(), 1);
    let written = call(&client, nodes[0].0, put).await;
    assert_eq!(written.status, protocol::SUCCESS);

    // the mid-chain commit wave is fire-and-forget; allow it to land
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if nodes.iter().all(|(_, store)| store.contains(b"fanout")) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "a replica never received the committed write"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn removal_propagates_down_the_chain() {
    let nodes = spawn_cluster(3).await;
    let client = client().await;

    let put = Request::write(protocol::PUT, b"gone".to_vec(), b"v".to_vec(), 0);
    assert_eq!(call(&client, nodes[0].0, put).await.status, protocol::SUCCESS);

    let removed = call(
        &client,
        nodes[1].0,
        Request::keyed(protocol::REMOVE, b"gone".to_vec()),
    )
    .await;
    assert_eq!(removed.status, protocol::SUCCESS);

    for (addr, _) in &nodes {
        let got = call(&client, *addr, Request::keyed(protocol::GET, b"gone".to_vec())).await;
        assert_eq!(got.status, protocol::NO_KEY);
    }
}

#[tokio::test]
async fn proposal_locks_a_replica_without_mutating_until_commit() {
    let nodes = spawn_cluster(1).await;
    let (replica, store) = (nodes[0].0, nodes[0].1.clone());

    // stand in for the chain head on a raw socket
    let head = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let head_addr = head.local_addr().unwrap();

    let propose = Request::write(protocol::REPLICA_PUT, b"staged".to_vec(), b"v".to_vec(), 1);
    let envelope = Envelope::new(generate_message_id(head_addr), propose.encode().unwrap())
        .with_routing(
            Some("127.0.0.1:9999".parse().unwrap()),
            Some(head_addr.port()),
        );
    head.send_to(&envelope.encode().unwrap(), replica)
        .await
        .unwrap();

    // the replica acknowledges the proposal but must not apply it yet
    let mut buf = vec![0u8; 16 * 1024];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), head.recv_from(&mut buf))
        .await
        .expect("replica never acknowledged")
        .unwrap();
    let ack = Envelope::decode(&buf[..len]).unwrap();
    assert_eq!(ack.message_id, envelope.message_id);
    let acked = Request::decode(&ack.payload).unwrap();
    assert_eq!(acked.command, protocol::ACK_PUT);
    assert!(!store.contains(b"staged"));

    // the commit applies it and answers back to us as the tail
    let commit = Request::write(protocol::TAIL_ACK_PUT, b"staged".to_vec(), b"v".to_vec(), 1);
    let wave = Envelope::new(envelope.message_id.clone(), commit.encode().unwrap());
    head.send_to(&wave.encode().unwrap(), replica).await.unwrap();

    let (len, _) = tokio::time::timeout(Duration::from_secs(2), head.recv_from(&mut buf))
        .await
        .expect("tail never answered the commit")
        .unwrap();
    let reply = Envelope::decode(&buf[..len]).unwrap();
    assert_eq!(Response::decode(&reply.payload).unwrap().status, protocol::SUCCESS);

    let stored = store.get(b"staged").unwrap();
    assert_eq!(stored.value, b"v".to_vec());
    assert_eq!(stored.version, 1);
}
