//! End-to-end tests against a real node on a loopback socket: the full
//! decode/dispatch/respond path, admission rejections, and at-most-once
//! replay of retransmitted requests.

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

async fn spawn_node() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let local = NodeId::new(addr);

    let store = Arc::new(LocalStore::new());
    // longer TTL than production so replay assertions are not racy
    let cache = Arc::new(RequestCache::with_ttl(Duration::from_secs(5)));
    let transport = UdpTransport::new(addr).await.unwrap();
    let monitor = MembershipMonitor::new(local.clone(), vec![], 3, store.clone(), transport.clone());
    let coordinator = Coordinator::new(local, store, cache.clone(), monitor, transport.clone());

    let server = Server::new(socket, coordinator, cache, transport);
    tokio::spawn(server.run());
    addr
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
async fn put_get_remove_over_the_wire() {
    let node = spawn_node().await;
    let client = client().await;

    let put = Request::write(protocol::PUT, b"city".to_vec(), b"vancouver".to_vec(), 2);
    assert_eq!(call(&client, node, put).await.status, protocol::SUCCESS);

    let got = call(&client, node, Request::keyed(protocol::GET, b"city".to_vec())).await;
    assert_eq!(got.status, protocol::SUCCESS);
    assert_eq!(got.value, Some(b"vancouver".to_vec()));
    assert_eq!(got.version, 2);

    let removed = call(
        &client,
        node,
        Request::keyed(protocol::REMOVE, b"city".to_vec()),
    )
    .await;
    assert_eq!(removed.status, protocol::SUCCESS);

    let gone = call(&client, node, Request::keyed(protocol::GET, b"city".to_vec())).await;
    assert_eq!(gone.status, protocol::NO_KEY);
}

#[tokio::test]
async fn admission_rejections_over_the_wire() {
    let node = spawn_node().await;
    let client = client().await;

    let long_key = Request::write(protocol::PUT, vec![0; 33], b"v".to_vec(), 0);
    assert_eq!(call(&client, node, long_key).await.status, protocol::BAD_KEY);

    let big_value = Request::write(protocol::PUT, vec![1], vec![0; 10_001], 0);
    assert_eq!(
        call(&client, node, big_value).await.status,
        protocol::BAD_VALUE
    );
}

#[tokio::test]
async fn wipeout_and_liveness_commands() {
    let node = spawn_node().await;
    let client = client().await;

    let put = Request::write(protocol::PUT, vec![7], b"data".to_vec(), 0);
    call(&client, node, put).await;

    let wiped = call(&client, node, Request::control(protocol::WIPEOUT)).await;
    assert_eq!(wiped.status, protocol::SUCCESS);

    let gone = call(&client, node, Request::keyed(protocol::GET, vec![7])).await;
    assert_eq!(gone.status, protocol::NO_KEY);

    let alive = call(&client, node, Request::control(protocol::IS_ALIVE)).await;
    assert_eq!(alive.status, protocol::SUCCESS);

    let count = call(
        &client,
        node,
        Request::control(protocol::GET_MEMBERSHIP_COUNT),
    )
    .await;
    assert_eq!(count.membership_count, Some(1));

    let list = call(
        &client,
        node,
        Request::control(protocol::GET_MEMBERSHIP_LIST),
    )
    .await;
    assert_eq!(list.members.len(), 1);
}

/// Sends one envelope and waits for the matching reply on a raw socket,
/// bypassing the retry client so message identifiers can be fixed.
async fn raw_exchange(socket: &UdpSocket, node: SocketAddr, envelope: &Envelope) -> Response {
    let datagram = envelope.encode().unwrap();
    socket.send_to(&datagram, node).await.unwrap();

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let recv = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("node did not answer")
            .unwrap();
        let reply = Envelope::decode(&buf[..recv.0]).unwrap();
        if reply.message_id == envelope.message_id {
            return Response::decode(&reply.payload).unwrap();
        }
    }
}

#[tokio::test]
async fn retransmitted_put_replays_without_reexecuting() {
    let node = spawn_node().await;
    let client = client().await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let put = Request::write(protocol::PUT, b"once".to_vec(), b"v".to_vec(), 0);
    let envelope = Envelope::new(
        generate_message_id(socket.local_addr().unwrap()),
        put.encode().unwrap(),
    );

    let first = raw_exchange(&socket, node, &envelope).await;
    assert_eq!(first.status, protocol::SUCCESS);

    // the key is deleted out of band, then the same PUT datagram arrives
    // again: the cached response is replayed, the store is not touched
    let removed = call(
        &client,
        node,
        Request::keyed(protocol::REMOVE, b"once".to_vec()),
    )
    .await;
    assert_eq!(removed.status, protocol::SUCCESS);

    let replayed = raw_exchange(&socket, node, &envelope).await;
    assert_eq!(replayed.status, protocol::SUCCESS);

    let got = call(&client, node, Request::keyed(protocol::GET, b"once".to_vec())).await;
    assert_eq!(got.status, protocol::NO_KEY);
}

#[tokio::test]
async fn corrupted_datagram_is_dropped_then_retry_succeeds() {
    let node = spawn_node().await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let put = Request::write(protocol::PUT, b"k".to_vec(), b"v".to_vec(), 0);
    let envelope = Envelope::new(
        generate_message_id(socket.local_addr().unwrap()),
        put.encode().unwrap(),
    );

    // first attempt arrives damaged and is silently dropped
    let mut damaged = envelope.encode().unwrap();
    let n = damaged.len();
    damaged[n - 1] ^= 0xFF;
    socket.send_to(&damaged, node).await.unwrap();

    // the intact retransmission goes through
    let response = raw_exchange(&socket, node, &envelope).await;
    assert_eq!(response.status, protocol::SUCCESS);
}
