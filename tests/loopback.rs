//! End-to-end scenarios over real loopback UDP sockets.

use kademlia_dht::{DhtConfig, DhtServer};
use std::net::SocketAddr;
use std::time::Duration;

fn loopback() -> SocketAddr {
    ([127, 0, 0, 1], 0).into()
}

fn fast_config() -> DhtConfig {
    DhtConfig {
        k: 8,
        alpha: 3,
        rpc_timeout: Duration::from_millis(500),
        ..DhtConfig::default()
    }
}

/// Scenario 1: two nodes on loopback, N2 bootstraps off N1. Afterwards each
/// has the other in its routing table.
#[tokio::test]
async fn two_node_bootstrap_is_symmetric() {
    let n1 = DhtServer::new(fast_config(), None, None);
    let n1_addr = n1.listen(loopback()).await.unwrap();

    let n2 = DhtServer::new(fast_config(), None, None);
    n2.listen(loopback()).await.unwrap();

    let live = n2.bootstrap(vec![n1_addr]).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, n1.local_id());

    n1.stop().await;
    n2.stop().await;
}

/// Scenario 2: a value set on N1 (N2 only known peer) reaches N2's storage
/// under the SHA-1 digest key, and N2 can read it back.
#[tokio::test]
async fn set_reaches_the_only_known_peer() {
    let n1 = DhtServer::new(fast_config(), None, None);
    let n1_addr = n1.listen(loopback()).await.unwrap();

    let n2 = DhtServer::new(fast_config(), None, None);
    n2.listen(loopback()).await.unwrap();
    n2.bootstrap(vec![n1_addr]).await.unwrap();

    let payload = b"thirty-two-byte-bandwidth-blob!!".to_vec();
    assert!(n1.set("bandwidth-report-A", payload.clone()).await.unwrap());

    let fetched = n2.get("bandwidth-report-A").await.unwrap();
    assert_eq!(fetched, Some(payload));

    n1.stop().await;
    n2.stop().await;
}

/// Scenario 3: a three-node chain N1<->N2<->N3 where N1 does not directly
/// know N3. `N1.get` for a key stored only on N3 still succeeds via the
/// iterative crawl through N2, and N1 learns about N3 along the way.
#[tokio::test]
async fn get_crosses_a_three_node_chain() {
    let n1 = DhtServer::new(fast_config(), None, None);
    let n1_addr = n1.listen(loopback()).await.unwrap();

    let n2 = DhtServer::new(fast_config(), None, None);
    let n2_addr = n2.listen(loopback()).await.unwrap();

    let n3 = DhtServer::new(fast_config(), None, None);
    let n3_addr = n3.listen(loopback()).await.unwrap();

    // n2 knows both ends; n1 initially knows only n2.
    n2.bootstrap(vec![n1_addr]).await.unwrap();
    n2.bootstrap(vec![n3_addr]).await.unwrap();
    n1.bootstrap(vec![n2_addr]).await.unwrap();

    let payload = b"stored-only-on-n3".to_vec();
    assert!(n3.set("chain-key", payload.clone()).await.unwrap());

    let fetched = n1.get("chain-key").await.unwrap();
    assert_eq!(fetched, Some(payload));

    n1.stop().await;
    n2.stop().await;
    n3.stop().await;
}

/// Scenario 6: TTL expiry. After `set`, waiting past the TTL without a
/// republish causes a local `get` to return absent (culled on access).
#[tokio::test]
async fn value_expires_after_ttl() {
    let mut config = fast_config();
    config.value_ttl = Duration::from_millis(50);
    let n1 = DhtServer::new(config, None, None);
    n1.listen(loopback()).await.unwrap();

    let n2 = DhtServer::new(config, None, None);
    let n2_addr = n2.listen(loopback()).await.unwrap();
    n1.bootstrap(vec![n2_addr]).await.unwrap();

    assert!(n1.set("short-lived", b"gone-soon".to_vec()).await.unwrap());
    assert_eq!(n1.get("short-lived").await.unwrap(), Some(b"gone-soon".to_vec()));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(n2.get("short-lived").await.unwrap(), None);

    n1.stop().await;
    n2.stop().await;
}

/// Boundary: an empty routing table returns absent/false rather than
/// erroring.
#[tokio::test]
async fn empty_network_returns_absent_and_false() {
    let n1 = DhtServer::new(fast_config(), None, None);
    n1.listen(loopback()).await.unwrap();

    assert_eq!(n1.get("nothing").await.unwrap(), None);
    assert!(!n1.set("nothing", b"x".to_vec()).await.unwrap());

    n1.stop().await;
}
