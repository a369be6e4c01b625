//! The node: one explicitly owned state object shared by every request task.
//!
//! Lock order, everywhere: wallet locks (sorted by id), then the ledger,
//! then the chain, then the bank. Chain notifications are drained while the
//! ledger write lock is held so each block's credit operations are applied
//! exactly once.

use crate::blockchain::{Block, Blockchain, ChainEvent, StudentCertificate};
use crate::config::Config;
use crate::credit::{
    BankStats, BankTransaction, CreditBank, CreditGrant, CreditLedger, CreditSpend, CreditToken, LedgerInfo,
    TransferOutcome,
};
use crate::error::{ChainError, Result};
use crate::persistence::{open_store, Persistence};
use crate::sync::{
    select_longest_valid_chain, should_merge_wallet_view, BroadcastResult, HttpTransport, PeerRegistry,
    PeerSynchronizer, PeerTransport, WalletUpdateResponse,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Degraded,
}

/// Outcome of submitting a certificate.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateReceipt {
    /// Index of the block the certificate will land in once sealed.
    pub block_index: u64,
    pub credit_transaction: Option<CreditSpend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletSummary {
    pub wallet_id: String,
    pub balance: usize,
    pub tokens_available: usize,
    pub tokens_total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub state: NodeState,
    pub timestamp: String,
    pub node_id: String,
    pub public_url: String,
    pub uptime_secs: u64,
    pub blocks: usize,
    pub pending_entries: usize,
    pub credits: LedgerInfo,
    pub peers: Vec<String>,
}

pub struct CertNode {
    config: Config,
    chain: RwLock<Blockchain>,
    ledger: RwLock<CreditLedger>,
    bank: Mutex<CreditBank>,
    wallet_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    sync: PeerSynchronizer,
    state: RwLock<NodeState>,
    started_at: Instant,
}

impl CertNode {
    /// Open the configured store and talk to peers over HTTP.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        let persistence = open_store(&config.storage, &config.node.node_id)?;
        let transport = Arc::new(HttpTransport::new(config.network.peer_timeout)?);
        Ok(Self::with_parts(config, persistence, transport))
    }

    /// Build a node from explicit parts. Loads the chain, then the ledger
    /// snapshot; the ledger is rebuilt from the chain when the snapshot is
    /// empty or a rebuild is requested.
    pub fn with_parts(
        config: Config,
        persistence: Arc<dyn Persistence>,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        info!(node_id = %config.node.node_id, "Initializing node");

        let mut chain = Blockchain::new_with_persistence(persistence.clone());
        chain.load_from_store();
        // Loading replays nothing into the ledger; the snapshot or the
        // rebuild below covers those blocks.
        chain.drain_events();

        let mut ledger = CreditLedger::load(persistence.clone());
        if config.storage.reset_ledger {
            warn!("Ledger reset requested - resetting credit ledger and chain");
            match ledger.reset() {
                Ok(Some(backup)) => info!("Previous ledger backed up to: {}", backup),
                Ok(None) => {}
                Err(e) => error!("Error resetting ledger: {}", e),
            }
            chain.reset_to_genesis();
        } else if config.storage.rebuild_ledger_on_start || ledger.total_tokens() == 0 {
            ledger.rebuild_from_chain(chain.blocks());
        } else {
            info!("Credit ledger already contains {} tokens", ledger.total_tokens());
        }

        let bank = CreditBank::load(persistence.clone());

        let registry = Arc::new(PeerRegistry::load(&config.node.public_url, persistence));
        let seeded = registry.register(&config.network.seed_nodes);
        if seeded > 0 {
            info!("Added {} seed nodes from configuration", seeded);
        }
        let sync = PeerSynchronizer::new(registry, transport, config.network.peer_timeout);

        Arc::new(CertNode {
            config,
            chain: RwLock::new(chain),
            ledger: RwLock::new(ledger),
            bank: Mutex::new(bank),
            wallet_locks: parking_lot::Mutex::new(HashMap::new()),
            sync,
            state: RwLock::new(NodeState::Ready),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        self.sync.registry()
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    async fn set_state(&self, state: NodeState) {
        let mut current = self.state.write().await;
        if *current != state {
            debug!(from = ?*current, to = ?state, "Node state changed");
            *current = state;
        }
    }

    async fn lock_wallets(&self, wallets: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<&str> = wallets.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let locks: Vec<Arc<Mutex<()>>> = {
            let mut table = self.wallet_locks.lock();
            ids.iter()
                .map(|id| table.entry(id.to_string()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    fn apply_chain_events(ledger: &mut CreditLedger, chain: &Blockchain) {
        for event in chain.drain_events() {
            match event {
                ChainEvent::BlockAdded(block) => debug!(index = block.index, "Block added"),
                ChainEvent::CreditOperations {
                    block_index,
                    operations,
                } => {
                    info!("Processing {} credit operations from block {}", operations.len(), block_index);
                    ledger.apply_chain_operations(&operations);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Chain
    // ------------------------------------------------------------------

    pub async fn append_certificate_entry(&self, certificate: serde_json::Value) -> u64 {
        self.chain.write().await.append_certificate(certificate)
    }

    /// Pay for and queue a certificate. Without a wallet the certificate is
    /// queued free of charge.
    pub async fn submit_certificate(
        &self,
        certificate: serde_json::Value,
        wallet_id: Option<&str>,
    ) -> Result<CertificateReceipt> {
        let Some(wallet_id) = wallet_id else {
            let block_index = self.append_certificate_entry(certificate).await;
            return Ok(CertificateReceipt {
                block_index,
                credit_transaction: None,
            });
        };

        let certificate_ref = certificate
            .get("id")
            .or_else(|| certificate.get("certificateId"))
            .and_then(|v| v.as_str())
            .map(String::from);

        let _guards = self.lock_wallets(&[wallet_id]).await;
        let mut ledger = self.ledger.write().await;
        let mut chain = self.chain.write().await;
        let mut bank = self.bank.lock().await;

        let spend = bank.spend_credits(
            &mut ledger,
            wallet_id,
            self.config.chain.certificate_cost,
            certificate_ref,
            Some(&mut *chain),
        )?;
        let block_index = chain.append_certificate(certificate);
        Ok(CertificateReceipt {
            block_index,
            credit_transaction: Some(spend),
        })
    }

    pub async fn spend_credits_for_certificate(
        &self,
        wallet_id: &str,
        cost: usize,
        certificate_ref: Option<String>,
    ) -> Result<CreditSpend> {
        let _guards = self.lock_wallets(&[wallet_id]).await;
        let mut ledger = self.ledger.write().await;
        let mut chain = self.chain.write().await;
        let mut bank = self.bank.lock().await;
        bank.spend_credits(&mut ledger, wallet_id, cost, certificate_ref, Some(&mut *chain))
    }

    pub async fn seal_block_now(&self) -> Result<Block> {
        let mut ledger = self.ledger.write().await;
        let mut chain = self.chain.write().await;
        if chain.pending_len() == 0 {
            return Err(ChainError::EmptyPendingBuffer);
        }
        let block = chain.seal_block();
        Self::apply_chain_events(&mut ledger, &chain);
        Ok(block)
    }

    /// Seal, then broadcast with no lock held.
    pub async fn seal_and_broadcast(&self) -> Result<(Block, BroadcastResult)> {
        let block = self.seal_block_now().await?;
        let broadcast = self.sync.broadcast_block(&block).await;
        Ok((block, broadcast))
    }

    pub async fn accept_block_from_peer(&self, block: Block) -> bool {
        let mut ledger = self.ledger.write().await;
        let mut chain = self.chain.write().await;
        let accepted = chain.add_existing_block(block);
        Self::apply_chain_events(&mut ledger, &chain);
        accepted
    }

    pub async fn chain_snapshot(&self) -> (Vec<Block>, usize) {
        let chain = self.chain.read().await;
        (chain.blocks().to_vec(), chain.len())
    }

    pub async fn is_chain_valid(&self, candidate: &[Block]) -> bool {
        self.chain.read().await.is_valid_chain(candidate)
    }

    pub async fn get_block(&self, index: u64) -> Option<Block> {
        self.chain.read().await.get_block(index).cloned()
    }

    pub async fn pending_len(&self) -> usize {
        self.chain.read().await.pending_len()
    }

    pub async fn certificates_for_student(&self, student_id: &str) -> Vec<StudentCertificate> {
        self.chain.read().await.certificates_for_student(student_id)
    }

    /// Administrative: back to genesis. The ledger is left as it is.
    pub async fn reset_chain(&self) -> Block {
        let _ledger = self.ledger.write().await;
        self.chain.write().await.reset_to_genesis()
    }

    // ------------------------------------------------------------------
    // Credits
    // ------------------------------------------------------------------

    pub async fn wallet_balance(&self, wallet_id: &str) -> usize {
        self.ledger.read().await.get_balance(wallet_id)
    }

    pub async fn wallet_tokens(&self, wallet_id: &str) -> Vec<CreditToken> {
        self.ledger.read().await.get_wallet_tokens(wallet_id)
    }

    pub async fn wallet_summary(&self, wallet_id: &str) -> WalletSummary {
        let ledger = self.ledger.read().await;
        let tokens_available = ledger.get_available_tokens(wallet_id).len();
        WalletSummary {
            wallet_id: wallet_id.to_string(),
            balance: ledger.get_balance(wallet_id),
            tokens_available,
            tokens_total: ledger.get_wallet_tokens(wallet_id).len(),
        }
    }

    pub async fn wallets(&self) -> Vec<WalletSummary> {
        let ids = self.ledger.read().await.wallet_ids();
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            summaries.push(self.wallet_summary(&id).await);
        }
        summaries
    }

    pub async fn register_wallet(&self, wallet_id: &str) -> bool {
        let _guards = self.lock_wallets(&[wallet_id]).await;
        self.ledger.write().await.register_wallet(wallet_id)
    }

    /// Administrative issue, recorded on chain and in the audit log.
    pub async fn issue_tokens(&self, wallet_id: &str, count: usize, reason: Option<String>) -> CreditGrant {
        let _guards = self.lock_wallets(&[wallet_id]).await;
        let mut ledger = self.ledger.write().await;
        let mut chain = self.chain.write().await;
        let mut bank = self.bank.lock().await;
        bank.issue_credits(&mut ledger, wallet_id, count, reason, Some(&mut *chain))
    }

    pub async fn purchase_credits(
        &self,
        wallet_id: &str,
        amount: usize,
        payment_reference: Option<String>,
    ) -> CreditGrant {
        let _guards = self.lock_wallets(&[wallet_id]).await;
        let mut ledger = self.ledger.write().await;
        let mut chain = self.chain.write().await;
        let mut bank = self.bank.lock().await;
        bank.purchase_credits(&mut ledger, wallet_id, amount, payment_reference, Some(&mut *chain))
    }

    pub async fn transfer_tokens(&self, from_wallet: &str, to_wallet: &str, amount: usize) -> Result<TransferOutcome> {
        let _guards = self.lock_wallets(&[from_wallet, to_wallet]).await;
        let mut ledger = self.ledger.write().await;
        let mut chain = self.chain.write().await;
        ledger.transfer_tokens(from_wallet, to_wallet, amount, Some(&mut *chain))
    }

    /// Unconditional additive merge of `tokens` into `wallet_id`.
    pub async fn sync_wallet_from_peer(&self, wallet_id: &str, tokens: Vec<CreditToken>) -> usize {
        let _guards = self.lock_wallets(&[wallet_id]).await;
        self.ledger.write().await.sync_wallet_from_peer(wallet_id, tokens)
    }

    /// Inbound push from a peer: merged only when the pushed set is larger
    /// than ours.
    pub async fn receive_wallet_update(&self, wallet_id: &str, tokens: Vec<CreditToken>) -> WalletUpdateResponse {
        let _guards = self.lock_wallets(&[wallet_id]).await;
        let mut ledger = self.ledger.write().await;
        let local_count = ledger.get_wallet_tokens(wallet_id).len();
        let updated = should_merge_wallet_view(local_count, tokens.len());
        let merged = if updated {
            info!(wallet = %wallet_id, tokens = tokens.len(), "Updated wallet from peer");
            ledger.sync_wallet_from_peer(wallet_id, tokens)
        } else {
            0
        };
        WalletUpdateResponse {
            wallet_id: wallet_id.to_string(),
            updated,
            merged,
        }
    }

    pub async fn rebuild_ledger_from_chain(&self) -> LedgerInfo {
        let mut ledger = self.ledger.write().await;
        let chain = self.chain.read().await;
        ledger.rebuild_from_chain(chain.blocks());
        ledger.ledger_info()
    }

    pub async fn ledger_info(&self) -> LedgerInfo {
        self.ledger.read().await.ledger_info()
    }

    pub async fn bank_stats(&self) -> BankStats {
        let ledger = self.ledger.read().await;
        self.bank.lock().await.bank_stats(&ledger)
    }

    pub async fn transaction_history(&self, wallet_id: Option<&str>) -> Vec<BankTransaction> {
        self.bank.lock().await.transaction_history(wallet_id)
    }

    /// Administrative: drop every token after backing up the snapshot.
    pub async fn reset_credits(&self) -> Result<Option<String>> {
        self.ledger.write().await.reset()
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    pub fn register_peers(&self, urls: &[String]) -> usize {
        self.peers().register(urls)
    }

    /// Pull every peer's view of `wallet_id` and merge the views that hold
    /// more tokens than we do. Returns the number of tokens added.
    pub async fn sync_wallet_with_peers(&self, wallet_id: &str) -> usize {
        if self.peers().is_empty() {
            return 0;
        }
        let views = self.sync.fetch_wallet_views(wallet_id).await;

        let _guards = self.lock_wallets(&[wallet_id]).await;
        let mut ledger = self.ledger.write().await;
        let mut merged = 0;
        for (peer, tokens) in views {
            let local_count = ledger.get_wallet_tokens(wallet_id).len();
            if should_merge_wallet_view(local_count, tokens.len()) {
                info!(wallet = %wallet_id, peer = %peer, tokens = tokens.len(), "Syncing wallet from peer");
                merged += ledger.sync_wallet_from_peer(wallet_id, tokens);
            }
        }
        merged
    }

    pub async fn broadcast_wallet_update(&self, wallet_id: &str) -> BroadcastResult {
        if self.peers().is_empty() {
            return BroadcastResult::default();
        }
        let tokens = self.wallet_tokens(wallet_id).await;
        self.sync.broadcast_wallet_update(wallet_id, tokens).await
    }

    /// Adopt the longest valid peer chain that is longer than ours.
    pub async fn resolve_conflicts(&self) -> bool {
        if self.peers().is_empty() {
            return false;
        }
        self.set_state(NodeState::Syncing).await;
        let chains = self.sync.fetch_chains().await;
        let reachable = chains.len();

        let replaced = {
            let mut ledger = self.ledger.write().await;
            let mut chain = self.chain.write().await;
            let replaced = match select_longest_valid_chain(&chain, chains) {
                Some((peer, candidate)) => {
                    info!(peer = %peer, length = candidate.len(), "Adopting longer chain from peer");
                    chain.replace_chain(candidate)
                }
                None => false,
            };
            Self::apply_chain_events(&mut ledger, &chain);
            replaced
        };

        if reachable == 0 {
            warn!("No peer reachable during chain resolution");
            self.set_state(NodeState::Degraded).await;
        } else {
            self.set_state(NodeState::Ready).await;
        }
        replaced
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn health(&self) -> HealthReport {
        let (blocks, pending_entries) = {
            let chain = self.chain.read().await;
            (chain.len(), chain.pending_len())
        };
        HealthReport {
            status: "UP",
            state: self.state().await,
            timestamp: chrono::Utc::now().to_rfc3339(),
            node_id: self.config.node.node_id.clone(),
            public_url: self.config.node.public_url.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            blocks,
            pending_entries,
            credits: self.ledger_info().await,
            peers: self.peers().urls(),
        }
    }

    /// Periodic sealing and chain resolution.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let block_interval = self.config.chain.block_interval;
        let resolve_interval = self.config.network.resolve_interval;
        info!(
            "Block generation interval set to {}",
            humantime::format_duration(block_interval)
        );

        let sealer = {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = delayed_interval(block_interval);
                loop {
                    ticker.tick().await;
                    match node.seal_and_broadcast().await {
                        Ok((block, _)) => info!("New block created: {}", block.index),
                        Err(ChainError::EmptyPendingBuffer) => debug!("No pending entries to add to a new block"),
                        Err(e) => warn!("Periodic seal failed: {}", e),
                    }
                }
            })
        };

        let resolver = {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = delayed_interval(resolve_interval);
                loop {
                    ticker.tick().await;
                    if node.resolve_conflicts().await {
                        info!("Local chain replaced during periodic resolution");
                    }
                }
            })
        };

        vec![sealer, resolver]
    }

    pub fn shutdown(&self) {
        info!("Shutting down node...");
        self.peers().save();
        info!("Saved peer information");
    }
}

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{CreditOperation, Entry};
    use crate::persistence::InMemoryPersistence;
    use async_trait::async_trait;
    use serde_json::json;

    struct OfflineTransport;

    #[async_trait]
    impl PeerTransport for OfflineTransport {
        async fn fetch_chain(&self, _peer: &str) -> Result<Vec<Block>> {
            Err(ChainError::NetworkError("offline".to_string()))
        }
        async fn submit_block(&self, _peer: &str, _block: &Block) -> Result<bool> {
            Err(ChainError::NetworkError("offline".to_string()))
        }
        async fn fetch_wallet_tokens(&self, _peer: &str, _wallet_id: &str) -> Result<Vec<CreditToken>> {
            Err(ChainError::NetworkError("offline".to_string()))
        }
        async fn submit_wallet_tokens(&self, _peer: &str, _wallet_id: &str, _tokens: &[CreditToken]) -> Result<bool> {
            Err(ChainError::NetworkError("offline".to_string()))
        }
    }

    fn node_with(store: Arc<InMemoryPersistence>, config: Config) -> Arc<CertNode> {
        CertNode::with_parts(config, store, Arc::new(OfflineTransport))
    }

    fn node() -> Arc<CertNode> {
        node_with(Arc::new(InMemoryPersistence::new()), Config::default())
    }

    #[tokio::test]
    async fn test_end_to_end_alice_scenario() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node();
            let genesis = node.get_block(0).await.unwrap();

            node.issue_tokens("alice", 3, None).await;
            let spend = node
                .spend_credits_for_certificate("alice", 2, Some("cert-1".to_string()))
                .await
                .unwrap();
            assert_eq!(spend.new_balance, 1);
            assert_eq!(spend.spent_token_ids.len(), 2);

            node.append_certificate_entry(json!({"id": "cert-1", "student": {"id": "alice"}}))
                .await;
            let block = node.seal_block_now().await.unwrap();

            assert_eq!(block.previous_hash, genesis.hash);
            assert!(node.is_chain_valid(&[genesis, block.clone()]).await);
            let spends = block
                .credit_operations()
                .into_iter()
                .filter(|op| op.operation == CreditOperation::Spend)
                .count();
            assert_eq!(spends, 2);
            assert_eq!(node.wallet_balance("alice").await, 1);
        })
        .await
        .expect("test_end_to_end_alice_scenario timed out");
    }

    #[tokio::test]
    async fn test_submit_certificate_requires_credits() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node();
            let err = node
                .submit_certificate(json!({"id": "c-1"}), Some("broke"))
                .await
                .unwrap_err();
            assert_eq!(err, ChainError::InsufficientCredits { available: 0, required: 1 });
            assert_eq!(node.pending_len().await, 0);

            node.purchase_credits("S1001", 1, Some("card".to_string())).await;
            let receipt = node
                .submit_certificate(json!({"id": "c-2"}), Some("S1001"))
                .await
                .unwrap();
            assert_eq!(receipt.block_index, 1);
            assert_eq!(receipt.credit_transaction.unwrap().new_balance, 0);

            // Free certificates need no wallet.
            let receipt = node.submit_certificate(json!({"id": "c-3"}), None).await.unwrap();
            assert!(receipt.credit_transaction.is_none());
        })
        .await
        .expect("test_submit_certificate_requires_credits timed out");
    }

    #[tokio::test]
    async fn test_seal_empty_buffer_fails() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node();
            assert_eq!(node.seal_block_now().await.unwrap_err(), ChainError::EmptyPendingBuffer);
            assert_eq!(node.chain_snapshot().await.1, 1);
        })
        .await
        .expect("test_seal_empty_buffer_fails timed out");
    }

    #[tokio::test]
    async fn test_restart_uses_snapshot_or_rebuilds() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let store = Arc::new(InMemoryPersistence::new());
            {
                let node = node_with(store.clone(), Config::default());
                node.issue_tokens("alice", 4, None).await;
                node.transfer_tokens("alice", "bob", 1).await.unwrap();
                node.seal_block_now().await.unwrap();
            }

            let restarted = node_with(store.clone(), Config::default());
            assert_eq!(restarted.chain_snapshot().await.1, 2);
            assert_eq!(restarted.wallet_balance("alice").await, 3);
            assert_eq!(restarted.wallet_balance("bob").await, 1);

            // Without a snapshot the chain is replayed.
            store.save_tokens(&[]).unwrap();
            let rebuilt = node_with(store, Config::default());
            assert_eq!(rebuilt.wallet_balance("alice").await, 3);
            assert_eq!(rebuilt.wallet_balance("bob").await, 1);
        })
        .await
        .expect("test_restart_uses_snapshot_or_rebuilds timed out");
    }

    #[tokio::test]
    async fn test_reset_ledger_on_start() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let store = Arc::new(InMemoryPersistence::new());
            {
                let node = node_with(store.clone(), Config::default());
                node.issue_tokens("alice", 2, None).await;
                node.seal_block_now().await.unwrap();
            }

            let mut config = Config::default();
            config.storage.reset_ledger = true;
            let node = node_with(store.clone(), config);
            assert_eq!(node.wallet_balance("alice").await, 0);
            assert_eq!(node.chain_snapshot().await.1, 1);
            assert_eq!(store.backup_count(), 1);
        })
        .await
        .expect("test_reset_ledger_on_start timed out");
    }

    #[tokio::test]
    async fn test_inbound_wallet_update_needs_larger_set() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node();
            node.issue_tokens("alice", 2, None).await;

            let smaller = vec![CreditToken::new("alice".to_string())];
            let response = node.receive_wallet_update("alice", smaller).await;
            assert!(!response.updated);
            assert_eq!(node.wallet_balance("alice").await, 2);

            let mut larger = node.wallet_tokens("alice").await;
            larger.push(CreditToken::new("alice".to_string()));
            let response = node.receive_wallet_update("alice", larger).await;
            assert!(response.updated);
            assert_eq!(response.merged, 1);
            assert_eq!(node.wallet_balance("alice").await, 3);
        })
        .await
        .expect("test_inbound_wallet_update_needs_larger_set timed out");
    }

    #[tokio::test]
    async fn test_unreachable_peers_degrade_but_never_fail() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node();
            node.register_peers(&["http://nowhere:1".to_string()]);

            assert!(!node.resolve_conflicts().await);
            assert_eq!(node.state().await, NodeState::Degraded);
            assert_eq!(node.sync_wallet_with_peers("alice").await, 0);

            node.append_certificate_entry(json!({"id": "x"})).await;
            let (_, broadcast) = node.seal_and_broadcast().await.unwrap();
            assert_eq!(broadcast.attempted, 1);
            assert_eq!(broadcast.failed, 1);
        })
        .await
        .expect("test_unreachable_peers_degrade_but_never_fail timed out");
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_never_lost() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let node = node();
            let mut tasks = Vec::new();
            for i in 0..50 {
                let node = node.clone();
                tasks.push(tokio::spawn(async move {
                    node.append_certificate_entry(json!({ "id": i })).await;
                    if i % 10 == 0 {
                        let _ = node.seal_block_now().await;
                    }
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
            let _ = node.seal_block_now().await;

            let (blocks, _) = node.chain_snapshot().await;
            let certificates = blocks
                .iter()
                .skip(1)
                .flat_map(|b| b.data.iter())
                .filter(|e| matches!(e, Entry::Certificate(_)))
                .count();
            assert_eq!(certificates, 50);
            assert_eq!(node.pending_len().await, 0);
        })
        .await
        .expect("test_concurrent_appends_are_never_lost timed out");
    }

    #[tokio::test]
    async fn test_bank_history_through_node() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let node = node();
            node.purchase_credits("S1001", 3, None).await;
            node.issue_tokens("S2002", 1, Some("welcome".to_string())).await;
            node.submit_certificate(json!({"id": "c"}), Some("S1001")).await.unwrap();

            assert_eq!(node.transaction_history(Some("S1001")).await.len(), 2);
            let stats = node.bank_stats().await;
            assert_eq!(stats.transactions.total, 3);
            assert_eq!(stats.tokens.active_tokens, 3);

            let wallets = node.wallets().await;
            assert_eq!(wallets.len(), 2);
            assert_eq!(wallets[0].wallet_id, "S1001");
            assert_eq!(wallets[0].balance, 2);
        })
        .await
        .expect("test_bank_history_through_node timed out");
    }
}
