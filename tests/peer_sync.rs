//! Multi-node behaviour with nodes wired together in-process.

use async_trait::async_trait;
use certchain::blockchain::Block;
use certchain::config::Config;
use certchain::credit::CreditToken;
use certchain::error::{ChainError, Result};
use certchain::node::{CertNode, NodeState};
use certchain::persistence::InMemoryPersistence;
use certchain::sync::PeerTransport;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Routes peer calls straight to the node registered under a URL.
#[derive(Default)]
struct LocalNetwork {
    nodes: RwLock<HashMap<String, Arc<CertNode>>>,
}

impl LocalNetwork {
    fn node(&self, url: &str) -> Result<Arc<CertNode>> {
        self.nodes
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| ChainError::NetworkError(format!("{} unreachable", url)))
    }
}

struct LocalTransport(Arc<LocalNetwork>);

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>> {
        Ok(self.0.node(peer)?.chain_snapshot().await.0)
    }

    async fn submit_block(&self, peer: &str, block: &Block) -> Result<bool> {
        Ok(self.0.node(peer)?.accept_block_from_peer(block.clone()).await)
    }

    async fn fetch_wallet_tokens(&self, peer: &str, wallet_id: &str) -> Result<Vec<CreditToken>> {
        Ok(self.0.node(peer)?.wallet_tokens(wallet_id).await)
    }

    async fn submit_wallet_tokens(&self, peer: &str, wallet_id: &str, tokens: &[CreditToken]) -> Result<bool> {
        let node = self.0.node(peer)?;
        Ok(node.receive_wallet_update(wallet_id, tokens.to_vec()).await.updated)
    }
}

fn spawn_node(network: &Arc<LocalNetwork>, url: &str, seeds: &[&str]) -> Arc<CertNode> {
    let mut config = Config::default();
    config.node.node_id = url.trim_start_matches("http://").to_string();
    config.node.public_url = url.to_string();
    config.network.seed_nodes = seeds.iter().map(|s| s.to_string()).collect();
    config.network.peer_timeout = Duration::from_secs(2);

    let node = CertNode::with_parts(
        config,
        Arc::new(InMemoryPersistence::new()),
        Arc::new(LocalTransport(network.clone())),
    );
    network.nodes.write().insert(url.to_string(), node.clone());
    node
}

#[tokio::test]
async fn test_sealed_blocks_replay_credit_operations_on_peers() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let network = Arc::new(LocalNetwork::default());
        let a = spawn_node(&network, "http://node-a", &["http://node-b"]);
        let b = spawn_node(&network, "http://node-b", &["http://node-a"]);

        a.issue_tokens("alice", 3, None).await;
        let (block, broadcast) = a.seal_and_broadcast().await.unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(broadcast.delivered, 1);
        assert_eq!(b.chain_snapshot().await.1, 2);
        assert_eq!(b.wallet_balance("alice").await, 3);

        a.submit_certificate(json!({"id": "cert-1", "student": {"id": "alice"}}), Some("alice"))
            .await
            .unwrap();
        a.seal_and_broadcast().await.unwrap();

        assert_eq!(b.chain_snapshot().await.0, a.chain_snapshot().await.0);
        assert_eq!(b.wallet_balance("alice").await, 2);
        assert_eq!(b.certificates_for_student("alice").await.len(), 1);

        // The same block again is not a valid successor any more.
        assert!(!b.accept_block_from_peer(block).await);
        assert_eq!(b.wallet_balance("alice").await, 2);
    })
    .await
    .expect("test_sealed_blocks_replay_credit_operations_on_peers timed out");
}

#[tokio::test]
async fn test_resolve_adopts_longer_chain_and_replays_ledger() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let network = Arc::new(LocalNetwork::default());
        let a = spawn_node(&network, "http://node-a", &[]);
        let b = spawn_node(&network, "http://node-b", &[]);

        b.issue_tokens("bob", 2, None).await;
        b.seal_block_now().await.unwrap();
        b.transfer_tokens("bob", "carol", 1).await.unwrap();
        b.seal_block_now().await.unwrap();

        a.append_certificate_entry(json!({"id": "local-only"})).await;
        a.seal_block_now().await.unwrap();

        assert!(!a.resolve_conflicts().await, "no peers known yet");

        a.register_peers(&["http://node-b".to_string()]);
        assert!(a.resolve_conflicts().await);
        assert_eq!(a.state().await, NodeState::Ready);

        let (chain, len) = a.chain_snapshot().await;
        assert_eq!(len, 3);
        assert_eq!(chain, b.chain_snapshot().await.0);
        assert_eq!(a.wallet_balance("bob").await, 1);
        assert_eq!(a.wallet_balance("carol").await, 1);

        // Equal length now: nothing to adopt.
        assert!(!a.resolve_conflicts().await);
    })
    .await
    .expect("test_resolve_adopts_longer_chain_and_replays_ledger timed out");
}

#[tokio::test]
async fn test_unreachable_peer_does_not_block_progress() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let network = Arc::new(LocalNetwork::default());
        let a = spawn_node(&network, "http://node-a", &["http://ghost", "http://node-b"]);
        let b = spawn_node(&network, "http://node-b", &[]);

        a.issue_tokens("erin", 1, None).await;
        let (_, broadcast) = a.seal_and_broadcast().await.unwrap();
        assert_eq!(broadcast.attempted, 2);
        assert_eq!(broadcast.delivered, 1);
        assert_eq!(broadcast.failed_peers, vec!["http://ghost".to_string()]);
        assert_eq!(b.wallet_balance("erin").await, 1);

        a.resolve_conflicts().await;
        a.resolve_conflicts().await;
        let ghost = a.peers().peer_info("http://ghost").unwrap();
        assert_eq!(ghost.consecutive_failures, 3);
        assert!(ghost.is_unreliable());
        assert!(!a.peers().peer_info("http://node-b").unwrap().is_unreliable());
        // Unreliable peers stay registered.
        assert_eq!(a.peers().len(), 2);
        assert_eq!(a.state().await, NodeState::Ready);
    })
    .await
    .expect("test_unreachable_peer_does_not_block_progress timed out");
}

#[tokio::test]
async fn test_wallet_views_merge_only_when_peer_holds_more() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let network = Arc::new(LocalNetwork::default());
        let a = spawn_node(&network, "http://node-a", &["http://node-b"]);
        let b = spawn_node(&network, "http://node-b", &["http://node-a"]);

        a.purchase_credits("dave", 3, Some("card".to_string())).await;
        assert_eq!(b.sync_wallet_with_peers("dave").await, 3);
        assert_eq!(b.wallet_balance("dave").await, 3);
        assert_eq!(a.sync_wallet_with_peers("dave").await, 0);

        a.purchase_credits("dave", 2, None).await;
        let pushed = a.broadcast_wallet_update("dave").await;
        assert_eq!(pushed.delivered, 1);
        assert_eq!(b.wallet_balance("dave").await, 5);

        // B spends locally; A's view (same size) does not overwrite it.
        b.submit_certificate(json!({"id": "c-1"}), Some("dave")).await.unwrap();
        let pushed = a.broadcast_wallet_update("dave").await;
        assert_eq!(pushed.rejected, 1);
        assert_eq!(b.wallet_balance("dave").await, 4);
    })
    .await
    .expect("test_wallet_views_merge_only_when_peer_holds_more timed out");
}
