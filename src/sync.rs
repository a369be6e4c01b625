//! Peer synchronization for CertChain
//!
//! This module provides the network half of multi-node operation:
//! - The peer wire contract (`PeerTransport`) and its HTTP implementation
//! - The peer registry with per-peer failure tracking
//! - Best-effort fan-out for block broadcast, wallet sync and chain fetches
//!
//! Decisions that need local state (which chain to adopt, whether a peer's
//! wallet view is worth merging) are exposed as plain functions so the node
//! can apply them under its own locks.

use crate::blockchain::{Block, Blockchain};
use crate::credit::CreditToken;
use crate::error::{ChainError, Result};
use crate::persistence::Persistence;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------
// Wire shapes
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainResponse {
    pub chain: Vec<Block>,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSubmission {
    pub block: Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSubmissionResponse {
    pub accepted: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTokensResponse {
    pub wallet_id: String,
    pub token_count: usize,
    pub tokens: Vec<CreditToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletUpdateRequest {
    pub tokens: Vec<CreditToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletUpdateResponse {
    pub wallet_id: String,
    pub updated: bool,
    pub merged: usize,
}

/// The four calls a node makes against another node.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>>;
    /// Returns whether the peer appended the block.
    async fn submit_block(&self, peer: &str, block: &Block) -> Result<bool>;
    async fn fetch_wallet_tokens(&self, peer: &str, wallet_id: &str) -> Result<Vec<CreditToken>>;
    /// Returns whether the peer merged anything.
    async fn submit_wallet_tokens(&self, peer: &str, wallet_id: &str, tokens: &[CreditToken]) -> Result<bool>;
}

/// JSON over HTTP, matching the routes served by the `api` module.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(peer: &str, path: &str) -> String {
        format!("{}{}", peer.trim_end_matches('/'), path)
    }

    /// `{peer}/credits/{wallet_id}/{action}` with the wallet id encoded as a
    /// single path segment.
    fn wallet_url(peer: &str, wallet_id: &str, action: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(peer)
            .map_err(|e| ChainError::NetworkError(format!("Invalid peer URL {}: {}", peer, e)))?;
        url.path_segments_mut()
            .map_err(|_| ChainError::NetworkError(format!("Peer URL {} cannot carry a path", peer)))?
            .pop_if_empty()
            .extend(["credits", wallet_id, action]);
        Ok(url)
    }
}

fn status_error(peer: &str, status: reqwest::StatusCode) -> ChainError {
    ChainError::NetworkError(format!("{} answered {}", peer, status))
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>> {
        let response = self.client.get(Self::url(peer, "/chain")).send().await?;
        if !response.status().is_success() {
            return Err(status_error(peer, response.status()));
        }
        let body: ChainResponse = response.json().await?;
        Ok(body.chain)
    }

    async fn submit_block(&self, peer: &str, block: &Block) -> Result<bool> {
        let response = self
            .client
            .post(Self::url(peer, "/block"))
            .json(&BlockSubmission { block: block.clone() })
            .send()
            .await?;
        // A rejected block comes back as 400 with the same body shape.
        if response.status().is_server_error() {
            return Err(status_error(peer, response.status()));
        }
        let body: BlockSubmissionResponse = response.json().await?;
        Ok(body.accepted)
    }

    async fn fetch_wallet_tokens(&self, peer: &str, wallet_id: &str) -> Result<Vec<CreditToken>> {
        let response = self
            .client
            .get(Self::wallet_url(peer, wallet_id, "sync")?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(peer, response.status()));
        }
        let body: WalletTokensResponse = response.json().await?;
        Ok(body.tokens)
    }

    async fn submit_wallet_tokens(&self, peer: &str, wallet_id: &str, tokens: &[CreditToken]) -> Result<bool> {
        let response = self
            .client
            .post(Self::wallet_url(peer, wallet_id, "update")?)
            .json(&WalletUpdateRequest { tokens: tokens.to_vec() })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(peer, response.status()));
        }
        let body: WalletUpdateResponse = response.json().await?;
        Ok(body.updated)
    }
}

// ----------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------

/// Peer tracking information
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub url: String,
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
}

impl PeerInfo {
    fn new(url: String) -> Self {
        Self {
            url,
            consecutive_failures: 0,
            last_success: None,
        }
    }

    /// Unreliable peers are still contacted; the flag is informational.
    pub fn is_unreliable(&self) -> bool {
        self.consecutive_failures >= 3
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Ordered set of peer base URLs, persisted on every change.
pub struct PeerRegistry {
    self_url: String,
    peers: RwLock<Vec<PeerInfo>>,
    persistence: Arc<dyn Persistence>,
}

impl PeerRegistry {
    /// Registry holding the peers found in `persistence`.
    pub fn load(self_url: &str, persistence: Arc<dyn Persistence>) -> Self {
        let registry = Self {
            self_url: normalize_url(self_url),
            peers: RwLock::new(Vec::new()),
            persistence,
        };
        match registry.persistence.load_peers() {
            Ok(stored) => {
                let added = registry.insert_all(&stored);
                if added > 0 {
                    info!("Loaded {} peers from store", added);
                }
            }
            Err(e) => warn!("Error loading peers: {}", e),
        }
        registry
    }

    /// Add `urls`, skipping ourselves and known peers. Returns how many
    /// were new.
    pub fn register(&self, urls: &[String]) -> usize {
        let added = self.insert_all(urls);
        if added > 0 {
            self.save();
        }
        added
    }

    fn insert_all(&self, urls: &[String]) -> usize {
        let mut peers = self.peers.write();
        let mut added = 0;
        for url in urls.iter().map(|u| normalize_url(u)) {
            if url.is_empty() || url == self.self_url || peers.iter().any(|p| p.url == url) {
                continue;
            }
            peers.push(PeerInfo::new(url));
            added += 1;
        }
        added
    }

    pub fn urls(&self) -> Vec<String> {
        self.peers.read().iter().map(|p| p.url.clone()).collect()
    }

    pub fn peer_info(&self, url: &str) -> Option<PeerInfo> {
        let url = normalize_url(url);
        self.peers.read().iter().find(|p| p.url == url).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn record_success(&self, url: &str) {
        if let Some(peer) = self.peers.write().iter_mut().find(|p| p.url == url) {
            peer.consecutive_failures = 0;
            peer.last_success = Some(Instant::now());
        }
    }

    pub fn record_failure(&self, url: &str) {
        if let Some(peer) = self.peers.write().iter_mut().find(|p| p.url == url) {
            peer.consecutive_failures += 1;
            if peer.consecutive_failures == 3 {
                warn!(peer = %url, "Peer marked as unreliable");
            }
        }
    }

    pub fn save(&self) {
        if let Err(e) = self.persistence.save_peers(&self.urls()) {
            warn!("Error saving peers: {}", e);
        }
    }
}

// ----------------------------------------------------------------------
// Fan-out
// ----------------------------------------------------------------------

/// Delivery telemetry for one fan-out. Never used for control flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastResult {
    pub attempted: usize,
    /// Peers that took the payload.
    pub delivered: usize,
    /// Peers that answered but declined it.
    pub rejected: usize,
    pub failed: usize,
    pub failed_peers: Vec<String>,
}

impl BroadcastResult {
    fn from_outcomes(outcomes: Vec<(String, Result<bool>)>) -> Self {
        let mut result = BroadcastResult {
            attempted: outcomes.len(),
            ..Default::default()
        };
        for (peer, outcome) in outcomes {
            match outcome {
                Ok(true) => result.delivered += 1,
                Ok(false) => result.rejected += 1,
                Err(_) => {
                    result.failed += 1;
                    result.failed_peers.push(peer);
                }
            }
        }
        result
    }
}

pub struct PeerSynchronizer {
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
}

impl PeerSynchronizer {
    pub fn new(registry: Arc<PeerRegistry>, transport: Arc<dyn PeerTransport>, timeout: Duration) -> Self {
        Self {
            registry,
            transport,
            timeout,
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Run `call` against every registered peer concurrently, each under its
    /// own timeout, and wait for all of them. One peer failing never aborts
    /// the others.
    async fn fan_out<T, F, Fut>(&self, call: F) -> Vec<(String, Result<T>)>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn PeerTransport>, String) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for peer in self.registry.urls() {
            let request = call(self.transport.clone(), peer.clone());
            let limit = self.timeout;
            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(limit, request).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ChainError::NetworkError(format!(
                        "no answer within {}",
                        humantime::format_duration(limit)
                    ))),
                };
                (peer, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer, outcome)) => {
                    match &outcome {
                        Ok(_) => self.registry.record_success(&peer),
                        Err(e) => {
                            warn!(peer = %peer, "Peer call failed: {}", e);
                            self.registry.record_failure(&peer);
                        }
                    }
                    outcomes.push((peer, outcome));
                }
                Err(e) => warn!("Peer task aborted: {}", e),
            }
        }
        outcomes
    }

    pub async fn broadcast_block(&self, block: &Block) -> BroadcastResult {
        let block = Arc::new(block.clone());
        let index = block.index;
        let outcomes = self
            .fan_out(move |transport, peer| {
                let block = block.clone();
                async move { transport.submit_block(&peer, &block).await }
            })
            .await;

        let result = BroadcastResult::from_outcomes(outcomes);
        info!(
            index,
            attempted = result.attempted,
            delivered = result.delivered,
            failed = result.failed,
            "Block broadcast finished"
        );
        result
    }

    pub async fn broadcast_wallet_update(&self, wallet_id: &str, tokens: Vec<CreditToken>) -> BroadcastResult {
        let wallet: Arc<str> = Arc::from(wallet_id);
        let tokens = Arc::new(tokens);
        let outcomes = self
            .fan_out(move |transport, peer| {
                let wallet = wallet.clone();
                let tokens = tokens.clone();
                async move { transport.submit_wallet_tokens(&peer, &wallet, &tokens).await }
            })
            .await;

        let result = BroadcastResult::from_outcomes(outcomes);
        debug!(wallet = %wallet_id, delivered = result.delivered, failed = result.failed, "Wallet update broadcast finished");
        result
    }

    /// Every reachable peer's view of `wallet_id`.
    pub async fn fetch_wallet_views(&self, wallet_id: &str) -> Vec<(String, Vec<CreditToken>)> {
        let wallet: Arc<str> = Arc::from(wallet_id);
        self.fan_out(move |transport, peer| {
            let wallet = wallet.clone();
            async move { transport.fetch_wallet_tokens(&peer, &wallet).await }
        })
        .await
        .into_iter()
        .filter_map(|(peer, outcome)| outcome.ok().map(|tokens| (peer, tokens)))
        .collect()
    }

    /// Every reachable peer's full chain.
    pub async fn fetch_chains(&self) -> Vec<(String, Vec<Block>)> {
        self.fan_out(|transport, peer| async move { transport.fetch_chain(&peer).await })
            .await
            .into_iter()
            .filter_map(|(peer, outcome)| outcome.ok().map(|chain| (peer, chain)))
            .collect()
    }
}

/// Longest candidate that is valid against `local` and strictly longer than
/// it. Ties keep the first candidate seen.
pub fn select_longest_valid_chain(local: &Blockchain, candidates: Vec<(String, Vec<Block>)>) -> Option<(String, Vec<Block>)> {
    let mut best: Option<(String, Vec<Block>)> = None;
    let mut best_len = local.len();
    for (peer, chain) in candidates {
        if chain.len() <= best_len {
            continue;
        }
        if !local.is_valid_chain(&chain) {
            warn!(peer = %peer, length = chain.len(), "Peer offered an invalid chain");
            continue;
        }
        best_len = chain.len();
        best = Some((peer, chain));
    }
    best
}

/// A peer's wallet view is merged only when it holds strictly more tokens
/// than the local view.
pub fn should_merge_wallet_view(local_count: usize, peer_count: usize) -> bool {
    peer_count > local_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use std::collections::HashMap;

    /// Canned answers per peer; unknown peers fail, "slow" peers hang.
    #[derive(Default)]
    struct ScriptedTransport {
        chains: HashMap<String, Vec<Block>>,
        wallets: HashMap<String, Vec<CreditToken>>,
        slow: Vec<String>,
    }

    impl ScriptedTransport {
        async fn gate(&self, peer: &str) -> Result<()> {
            if self.slow.iter().any(|p| p == peer) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>> {
            self.gate(peer).await?;
            self.chains
                .get(peer)
                .cloned()
                .ok_or_else(|| ChainError::NetworkError("connection refused".to_string()))
        }

        async fn submit_block(&self, peer: &str, _block: &Block) -> Result<bool> {
            self.gate(peer).await?;
            match self.chains.get(peer) {
                Some(chain) => Ok(chain.len() < 5),
                None => Err(ChainError::NetworkError("connection refused".to_string())),
            }
        }

        async fn fetch_wallet_tokens(&self, peer: &str, _wallet_id: &str) -> Result<Vec<CreditToken>> {
            self.gate(peer).await?;
            self.wallets
                .get(peer)
                .cloned()
                .ok_or_else(|| ChainError::NetworkError("connection refused".to_string()))
        }

        async fn submit_wallet_tokens(&self, peer: &str, _wallet_id: &str, _tokens: &[CreditToken]) -> Result<bool> {
            self.gate(peer).await?;
            Ok(self.wallets.contains_key(peer))
        }
    }

    fn registry(urls: &[&str]) -> Arc<PeerRegistry> {
        let registry = Arc::new(PeerRegistry::load(
            "http://self:3000",
            Arc::new(InMemoryPersistence::new()),
        ));
        registry.register(&urls.iter().map(|u| u.to_string()).collect::<Vec<_>>());
        registry
    }

    fn longer_chain(extra: usize) -> Vec<Block> {
        let mut chain = Blockchain::new();
        for i in 0..extra {
            chain.append_certificate(serde_json::json!({ "n": i }));
            chain.seal_block();
        }
        chain.blocks().to_vec()
    }

    #[test]
    fn test_registry_skips_self_and_duplicates() {
        let store = Arc::new(InMemoryPersistence::new());
        let registry = PeerRegistry::load("http://self:3000/", store.clone());
        let added = registry.register(&[
            "http://a:3001".to_string(),
            "http://a:3001/".to_string(),
            "http://self:3000".to_string(),
            "http://b:3002".to_string(),
        ]);
        assert_eq!(added, 2);
        assert_eq!(registry.urls(), vec!["http://a:3001", "http://b:3002"]);

        // Persisted and reloaded in order.
        let reloaded = PeerRegistry::load("http://self:3000", store);
        assert_eq!(reloaded.urls(), registry.urls());
    }

    #[test]
    fn test_failures_mark_peer_unreliable_without_eviction() {
        let registry = registry(&["http://a:3001"]);
        for _ in 0..3 {
            registry.record_failure("http://a:3001");
        }
        assert!(registry.peer_info("http://a:3001").unwrap().is_unreliable());
        assert_eq!(registry.len(), 1);

        registry.record_success("http://a:3001");
        assert!(!registry.peer_info("http://a:3001").unwrap().is_unreliable());
    }

    #[tokio::test]
    async fn test_broadcast_survives_unreachable_and_slow_peers() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut transport = ScriptedTransport::default();
            transport.chains.insert("http://a:3001".to_string(), longer_chain(0));
            transport.chains.insert("http://slow:3003".to_string(), longer_chain(0));
            transport.slow.push("http://slow:3003".to_string());

            let sync = PeerSynchronizer::new(
                registry(&["http://a:3001", "http://down:3002", "http://slow:3003"]),
                Arc::new(transport),
                Duration::from_millis(200),
            );

            let block = Blockchain::create_genesis_block();
            let result = sync.broadcast_block(&block).await;
            assert_eq!(result.attempted, 3);
            assert_eq!(result.delivered, 1);
            assert_eq!(result.failed, 2);
            assert!(result.failed_peers.contains(&"http://down:3002".to_string()));
        })
        .await
        .expect("test_broadcast_survives_unreachable_and_slow_peers timed out");
    }

    #[tokio::test]
    async fn test_fetch_chains_and_select_longest_valid() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut forged = longer_chain(4);
            forged[2].previous_hash = "f".repeat(64);

            let mut transport = ScriptedTransport::default();
            transport.chains.insert("http://a:3001".to_string(), longer_chain(2));
            transport.chains.insert("http://b:3002".to_string(), longer_chain(3));
            transport.chains.insert("http://c:3003".to_string(), forged);

            let sync = PeerSynchronizer::new(
                registry(&["http://a:3001", "http://b:3002", "http://c:3003"]),
                Arc::new(transport),
                Duration::from_secs(1),
            );

            let chains = sync.fetch_chains().await;
            assert_eq!(chains.len(), 3);

            let local = Blockchain::new();
            let (peer, chain) = select_longest_valid_chain(&local, chains).unwrap();
            assert_eq!(peer, "http://b:3002");
            assert_eq!(chain.len(), 4);
        })
        .await
        .expect("test_fetch_chains_and_select_longest_valid timed out");
    }

    #[test]
    fn test_select_ignores_equal_length() {
        let local = Blockchain::new();
        let candidates = vec![("http://a".to_string(), local.blocks().to_vec())];
        assert!(select_longest_valid_chain(&local, candidates).is_none());
    }

    #[tokio::test]
    async fn test_fetch_wallet_views_drops_failures() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut transport = ScriptedTransport::default();
            transport
                .wallets
                .insert("http://a:3001".to_string(), vec![CreditToken::new("S1001".to_string())]);

            let sync = PeerSynchronizer::new(
                registry(&["http://a:3001", "http://down:3002"]),
                Arc::new(transport),
                Duration::from_secs(1),
            );
            let views = sync.fetch_wallet_views("S1001").await;
            assert_eq!(views.len(), 1);
            assert_eq!(views[0].1.len(), 1);

            let result = sync.broadcast_wallet_update("S1001", Vec::new()).await;
            assert_eq!(result.delivered, 1);
            assert_eq!(result.failed, 1);
        })
        .await
        .expect("test_fetch_wallet_views_drops_failures timed out");
    }

    #[test]
    fn test_merge_rule_is_strictly_larger() {
        assert!(should_merge_wallet_view(2, 3));
        assert!(!should_merge_wallet_view(3, 3));
        assert!(!should_merge_wallet_view(4, 3));
    }

    #[test]
    fn test_wallet_url_keeps_id_in_one_segment() {
        let url = HttpTransport::wallet_url("http://peer-a:3001/", "S1001", "sync").unwrap();
        assert_eq!(url.as_str(), "http://peer-a:3001/credits/S1001/sync");

        let url = HttpTransport::wallet_url("http://peer-a:3001", "a/b?c#d", "update").unwrap();
        assert_eq!(url.as_str(), "http://peer-a:3001/credits/a%2Fb%3Fc%23d/update");
        assert_eq!(url.path_segments().unwrap().count(), 3);

        assert!(HttpTransport::wallet_url("not a url", "S1001", "sync").is_err());
    }
}
