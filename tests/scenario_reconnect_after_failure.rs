//! Scenario 5 (spec §8): an outbound connection to an unreachable peer
//! fails at connect, stays in `Connecting` with `reconnect_at = now + 5s`,
//! is skipped while that deadline hasn't passed, and retries successfully
//! once it has.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use repsvr::connection::{Connection, State, RECONNECT_DELAY};
use repsvr::crypto::KEY_LEN;
use repsvr::log::PeerLog;

#[tokio::test]
async fn unreachable_peer_schedules_reconnect_then_succeeds_once_listening() {
    let dir = tempfile::tempdir().unwrap();
    let log = PeerLog::open_in(dir.path(), "node1").unwrap();
    let key = [5u8; KEY_LEN];

    // Reserve a port, then drop the listener so nothing answers the first
    // connect attempt.
    let probe = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    let mut conn = Connection::outbound(target, "2".to_string());

    let before = Instant::now();
    conn.tick("1", &key, &log).await;
    assert_eq!(conn.status(), State::Connecting, "a refused connect stays in Connecting");
    let reconnect_at = conn.reconnect_at.expect("a failed connect schedules a retry");
    assert!(reconnect_at >= before + RECONNECT_DELAY);

    // Retrying immediately, before the deadline, must not attempt another
    // connect (the deadline check in tick_connecting short-circuits).
    let unchanged_deadline = reconnect_at;
    conn.tick("1", &key, &log).await;
    assert_eq!(conn.reconnect_at, Some(unchanged_deadline));

    // Simulate the 5-second window elapsing, and start listening where the
    // peer would now be reachable.
    let listener = tokio::net::TcpListener::bind(target).await.unwrap();
    conn.reconnect_at = Some(Instant::now());
    let accept_task = tokio::spawn(async move { listener.accept().await });

    conn.tick("1", &key, &log).await;
    assert_eq!(conn.status(), State::Authenticating, "the retried connect must succeed");
    assert!(conn.reconnect_at.is_none());

    accept_task.await.unwrap().unwrap();
}
