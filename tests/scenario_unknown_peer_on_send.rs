//! Scenario 6 (spec §8): sending to a peer id absent from the registry
//! must not silently vanish. The library surface resolves this by making
//! the check available at dispatch time (`queue::peer_known`); callers
//! that skip the check still get a safe no-op rather than a panic.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use repsvr::crypto::KEY_LEN;
use repsvr::log::PeerLog;
use repsvr::queue::{peer_known, QueueManager};
use repsvr::registry::PeerRegistry;

#[tokio::test]
async fn unknown_peer_is_rejected_at_dispatch_and_is_a_safe_no_op_in_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let servers = dir.path().join("servers.txt");
    std::fs::write(&servers, "1, 127.0.0.1, 9701\n2, 127.0.0.1, 9702\n").unwrap();
    let peers = PeerRegistry::load(&servers, Ipv4Addr::LOCALHOST, 9701).unwrap();

    assert!(!peer_known(&peers, "ghost"), "an unlisted peer id must be rejected at dispatch time");
    assert!(peer_known(&peers, "2"), "a listed peer id must be accepted");

    let mut queue = QueueManager::bind(Ipv4Addr::LOCALHOST, 9701, HashSet::new(), peers.local_id.clone(), [0u8; KEY_LEN])
        .await
        .unwrap();
    queue.send_to_peer("ghost", b"never delivered".to_vec());

    let log = PeerLog::open_in(dir.path(), "node1").unwrap();
    queue.handle_queue(&log).await;
    assert!(
        queue.pop(&peers, &log).is_none(),
        "an unknown peer must not produce a phantom recv entry"
    );

    let log_contents = std::fs::read_to_string(log.path()).unwrap();
    assert!(
        log_contents.contains("unknown peer"),
        "the dropped send must be logged, not silently discarded: {log_contents:?}"
    );
}
