//! Authoritative wallet to token mapping.
//!
//! Every mutating operation ends with a full snapshot write to the configured
//! store. A failed write is logged and the in-memory change stays applied.

use crate::blockchain::{Block, CreditOperation, CreditOperationEntry};
use crate::credit::token::CreditToken;
use crate::error::{ChainError, Result};
use crate::persistence::{InMemoryPersistence, Persistence};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receiver of credit operations that must be recorded on chain.
pub trait OperationSink {
    fn record(&mut self, operation: CreditOperation, token: &CreditToken);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpendOutcome {
    pub spent_token_ids: Vec<String>,
    pub new_balance: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    pub transferred_token_ids: Vec<String>,
    pub from_balance: usize,
    pub to_balance: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerInfo {
    pub total_tokens: usize,
    pub active_tokens: usize,
    pub spent_tokens: usize,
    pub wallet_count: usize,
    pub wallet_balances: BTreeMap<String, usize>,
}

pub struct CreditLedger {
    tokens: HashMap<String, CreditToken>,
    /// Token ids ordered by issue timestamp, ties by insertion.
    issuance_order: Vec<String>,
    wallet_tokens: HashMap<String, HashSet<String>>,
    persistence: Arc<dyn Persistence>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::with_persistence(Arc::new(InMemoryPersistence::new()))
    }

    /// Empty ledger writing its snapshots to `persistence`.
    pub fn with_persistence(persistence: Arc<dyn Persistence>) -> Self {
        CreditLedger {
            tokens: HashMap::new(),
            issuance_order: Vec::new(),
            wallet_tokens: HashMap::new(),
            persistence,
        }
    }

    /// Ledger restored from the stored snapshot; empty when none exists or
    /// it cannot be read.
    pub fn load(persistence: Arc<dyn Persistence>) -> Self {
        let mut ledger = Self::with_persistence(persistence);
        match ledger.persistence.load_tokens() {
            Ok(tokens) => {
                for token in tokens {
                    ledger.insert_token(token);
                }
                info!("Loaded {} credit tokens from ledger", ledger.tokens.len());
            }
            Err(e) => warn!("Error loading credit ledger, starting empty: {}", e),
        }
        ledger
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn token(&self, token_id: &str) -> Option<&CreditToken> {
        self.tokens.get(token_id)
    }

    /// All tokens owned by `wallet_id`, spent or not, in issuance order.
    pub fn get_wallet_tokens(&self, wallet_id: &str) -> Vec<CreditToken> {
        self.owned_ids(wallet_id)
            .filter_map(|id| self.tokens.get(id))
            .cloned()
            .collect()
    }

    pub fn get_available_tokens(&self, wallet_id: &str) -> Vec<CreditToken> {
        self.owned_ids(wallet_id)
            .filter_map(|id| self.tokens.get(id))
            .filter(|t| !t.spent)
            .cloned()
            .collect()
    }

    pub fn get_balance(&self, wallet_id: &str) -> usize {
        self.owned_ids(wallet_id)
            .filter_map(|id| self.tokens.get(id))
            .filter(|t| !t.spent)
            .count()
    }

    pub fn active_token_count(&self) -> usize {
        self.tokens.values().filter(|t| !t.spent).count()
    }

    pub fn total_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn wallet_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.wallet_tokens.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_wallet(&self, wallet_id: &str) -> bool {
        self.wallet_tokens.contains_key(wallet_id)
    }

    pub fn ledger_info(&self) -> LedgerInfo {
        let active_tokens = self.active_token_count();
        let wallet_balances = self
            .wallet_tokens
            .keys()
            .map(|wallet| (wallet.clone(), self.get_balance(wallet)))
            .collect();

        LedgerInfo {
            total_tokens: self.tokens.len(),
            active_tokens,
            spent_tokens: self.tokens.len() - active_tokens,
            wallet_count: self.wallet_tokens.len(),
            wallet_balances,
        }
    }

    /// Token table in issuance order, as written to the store.
    pub fn snapshot(&self) -> Vec<CreditToken> {
        self.issuance_order
            .iter()
            .filter_map(|id| self.tokens.get(id))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Live operations
    // ------------------------------------------------------------------

    /// Mint `count` fresh tokens for `wallet_id`. Each mint is recorded as an
    /// ISSUE operation when a sink is supplied.
    pub fn issue_tokens(
        &mut self,
        wallet_id: &str,
        count: usize,
        mut sink: Option<&mut dyn OperationSink>,
    ) -> Vec<CreditToken> {
        let mut issued = Vec::new();
        for _ in 0..count {
            let token = CreditToken::new(wallet_id.to_string());
            self.insert_token(token.clone());
            if let Some(sink) = sink.as_deref_mut() {
                sink.record(CreditOperation::Issue, &token);
            }
            issued.push(token);
        }
        self.wallet_tokens.entry(wallet_id.to_string()).or_default();

        info!(wallet = %wallet_id, count, "Issued credit tokens");
        self.persist();
        issued
    }

    /// Spend the `amount` oldest unspent tokens of `wallet_id`.
    pub fn spend_tokens(
        &mut self,
        wallet_id: &str,
        amount: usize,
        certificate_ref: Option<String>,
        mut sink: Option<&mut dyn OperationSink>,
    ) -> Result<SpendOutcome> {
        let available = self.get_balance(wallet_id);
        if available < amount {
            return Err(ChainError::InsufficientCredits {
                available,
                required: amount,
            });
        }

        let selected = self.oldest_unspent(wallet_id, amount);
        for token_id in &selected {
            let token = self
                .tokens
                .get_mut(token_id)
                .ok_or_else(|| ChainError::TokenNotFound(token_id.clone()))?;
            token.mark_spent(certificate_ref.clone())?;
            if let Some(sink) = sink.as_deref_mut() {
                sink.record(CreditOperation::Spend, token);
            }
        }

        self.persist();
        let new_balance = self.get_balance(wallet_id);
        info!(wallet = %wallet_id, amount, new_balance, "Spent credit tokens");
        Ok(SpendOutcome {
            spent_token_ids: selected,
            new_balance,
        })
    }

    /// Move the `amount` oldest unspent tokens of `from_wallet` to
    /// `to_wallet`. The destination is not required to exist beforehand.
    pub fn transfer_tokens(
        &mut self,
        from_wallet: &str,
        to_wallet: &str,
        amount: usize,
        mut sink: Option<&mut dyn OperationSink>,
    ) -> Result<TransferOutcome> {
        if from_wallet == to_wallet {
            return Err(ChainError::InvalidInput(
                "Source and destination wallets must differ".to_string(),
            ));
        }

        let available = self.get_balance(from_wallet);
        if available < amount {
            return Err(ChainError::InsufficientTokens {
                available,
                required: amount,
            });
        }

        let selected = self.oldest_unspent(from_wallet, amount);
        for token_id in &selected {
            let token = self
                .tokens
                .get_mut(token_id)
                .ok_or_else(|| ChainError::TokenNotFound(token_id.clone()))?;
            token.transfer(to_wallet)?;
            if let Some(sink) = sink.as_deref_mut() {
                sink.record(CreditOperation::Transfer, token);
            }
            if let Some(owned) = self.wallet_tokens.get_mut(from_wallet) {
                owned.remove(token_id);
            }
            self.wallet_tokens
                .entry(to_wallet.to_string())
                .or_default()
                .insert(token_id.clone());
        }

        self.persist();
        info!(from = %from_wallet, to = %to_wallet, amount, "Transferred credit tokens");
        Ok(TransferOutcome {
            transferred_token_ids: selected,
            from_balance: self.get_balance(from_wallet),
            to_balance: self.get_balance(to_wallet),
        })
    }

    /// Create an empty owned-set for `wallet_id`. Returns `false` when the
    /// wallet is already known.
    pub fn register_wallet(&mut self, wallet_id: &str) -> bool {
        if self.wallet_tokens.contains_key(wallet_id) {
            return false;
        }
        self.wallet_tokens.insert(wallet_id.to_string(), HashSet::new());
        self.persist();
        true
    }

    /// Drop every token. The previous snapshot is backed up first.
    pub fn reset(&mut self) -> Result<Option<String>> {
        let backup = self.persistence.backup_tokens()?;
        self.tokens.clear();
        self.issuance_order.clear();
        self.wallet_tokens.clear();
        self.persist();
        info!("Credit ledger has been reset to empty state");
        Ok(backup)
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Reset and replay every credit operation of every non-genesis block.
    pub fn rebuild_from_chain(&mut self, blocks: &[Block]) {
        info!("Rebuilding token state from chain data...");
        self.tokens.clear();
        self.issuance_order.clear();
        self.wallet_tokens.clear();

        for block in blocks.iter().filter(|b| b.index != 0) {
            for operation in block.credit_operations() {
                self.apply_chain_operation(&operation);
            }
        }

        info!(
            "Rebuilt token state: {} tokens in {} wallets",
            self.tokens.len(),
            self.wallet_tokens.len()
        );
        self.persist();
    }

    /// Apply the operations of one accepted block and persist once.
    pub fn apply_chain_operations(&mut self, operations: &[CreditOperationEntry]) {
        for operation in operations {
            self.apply_chain_operation(operation);
        }
        self.persist();
    }

    /// Replay one recorded operation. Replaying the same operation twice
    /// leaves the ledger unchanged.
    pub fn apply_chain_operation(&mut self, entry: &CreditOperationEntry) {
        let recorded = &entry.token_data;
        match entry.operation {
            CreditOperation::Issue => {
                if !self.tokens.contains_key(&recorded.token_id) {
                    self.insert_token(recorded.clone());
                }
            }
            CreditOperation::Transfer => {
                let Some(token) = self.tokens.get_mut(&recorded.token_id) else {
                    debug!(token_id = %recorded.token_id, "TRANSFER for unknown token ignored");
                    return;
                };
                let current_owner = std::mem::replace(
                    &mut token.owner_wallet_id,
                    recorded.owner_wallet_id.clone(),
                );
                token.transfer_history = recorded.transfer_history.clone();

                let mut previous = vec![current_owner];
                if let Some(prior) = recorded.previous_owner() {
                    previous.push(prior.to_string());
                }
                for wallet in previous {
                    if wallet != recorded.owner_wallet_id {
                        if let Some(owned) = self.wallet_tokens.get_mut(&wallet) {
                            owned.remove(&recorded.token_id);
                        }
                    }
                }
                self.wallet_tokens
                    .entry(recorded.owner_wallet_id.clone())
                    .or_default()
                    .insert(recorded.token_id.clone());
            }
            CreditOperation::Spend => {
                let Some(token) = self.tokens.get_mut(&recorded.token_id) else {
                    debug!(token_id = %recorded.token_id, "SPEND for unknown token ignored");
                    return;
                };
                if !token.spent {
                    token.spent = true;
                    token.spent_on = recorded.spent_on.clone();
                    token.spent_timestamp = recorded.spent_timestamp;
                }
            }
        }
    }

    /// Additive merge of a peer's view of `wallet_id`. Tokens already known
    /// locally are never replaced or removed. Peer records are not checked
    /// against the chain. Returns the number of tokens added.
    ///
    /// Unknown tokens owned by a different wallet are skipped rather than
    /// added, so a wallet update can only grow the wallet it names and each
    /// token stays in exactly one owned set.
    pub fn sync_wallet_from_peer(&mut self, wallet_id: &str, peer_tokens: Vec<CreditToken>) -> usize {
        let mut merged = 0;
        for token in peer_tokens {
            if self.tokens.contains_key(&token.token_id) {
                continue;
            }
            if token.owner_wallet_id != wallet_id {
                warn!(
                    wallet = %wallet_id,
                    token_id = %token.token_id,
                    owner = %token.owner_wallet_id,
                    "Skipping peer token owned by another wallet"
                );
                continue;
            }
            self.insert_token(token);
            merged += 1;
        }

        if merged > 0 {
            info!(wallet = %wallet_id, merged, "Merged wallet tokens from peer");
            self.persist();
        }
        merged
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn owned_ids<'a>(&'a self, wallet_id: &str) -> impl Iterator<Item = &'a String> + 'a {
        let owned = self.wallet_tokens.get(wallet_id);
        self.issuance_order
            .iter()
            .filter(move |id| owned.is_some_and(|set| set.contains(*id)))
    }

    fn oldest_unspent(&self, wallet_id: &str, amount: usize) -> Vec<String> {
        self.owned_ids(wallet_id)
            .filter(|id| self.tokens.get(*id).is_some_and(|t| !t.spent))
            .take(amount)
            .cloned()
            .collect()
    }

    fn insert_token(&mut self, token: CreditToken) {
        let position = self.issuance_order.partition_point(|id| {
            self.tokens
                .get(id)
                .is_some_and(|existing| existing.issue_timestamp <= token.issue_timestamp)
        });
        self.issuance_order.insert(position, token.token_id.clone());
        self.wallet_tokens
            .entry(token.owner_wallet_id.clone())
            .or_default()
            .insert(token.token_id.clone());
        self.tokens.insert(token.token_id.clone(), token);
    }

    fn persist(&self) {
        if let Err(e) = self.persistence.save_tokens(&self.snapshot()) {
            warn!("Error saving credit ledger: {}", e);
        }
    }
}

impl Default for CreditLedger {
    fn default() -> Self {
        Self::new()
    }
}
