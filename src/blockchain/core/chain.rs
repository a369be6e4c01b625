use crate::blockchain::core::block::{Block, CertificateEntry, CreditOperation, CreditOperationEntry, Entry};
use crate::blockchain::core::validation::{validate_chain, validate_successor};
use crate::credit::{CreditToken, OperationSink};
use crate::persistence::{InMemoryPersistence, Persistence};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fixed genesis timestamp (April 1, 2021 00:00:00 UTC). Every node derives
/// the same genesis hash from it.
pub const GENESIS_TIMESTAMP: u64 = 1617235200000;
pub const GENESIS_HEADLINE: &str =
    "Apr 01, 2021 - CertChain established for secure certificate verification";
pub const GENESIS_PREVIOUS_HASH: &str = "0";

pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Notifications raised whenever a block joins the chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    BlockAdded(Block),
    CreditOperations {
        block_index: u64,
        operations: Vec<CreditOperationEntry>,
    },
}

/// A certificate found on chain together with its location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentCertificate {
    pub certificate: serde_json::Value,
    pub timestamp: u64,
    pub block_index: u64,
    pub block_hash: String,
}

pub struct Blockchain {
    blocks: Vec<Block>,
    pending: Vec<Entry>,
    persistence: Arc<dyn Persistence>,
    events_tx: Sender<ChainEvent>,
    events_rx: Receiver<ChainEvent>,
}

impl Blockchain {
    /// Create a new `Blockchain` using an in-memory persistence backend.
    pub fn new() -> Self {
        Self::new_with_persistence(Arc::new(InMemoryPersistence::new()))
    }

    /// Create a genesis-only chain writing its blocks to `persistence`.
    pub fn new_with_persistence(persistence: Arc<dyn Persistence>) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let genesis = Self::create_genesis_block();
        info!(hash = %genesis.hash, "Genesis block created");

        let chain = Blockchain {
            blocks: vec![genesis],
            pending: Vec::new(),
            persistence,
            events_tx,
            events_rx,
        };
        chain.persist_block(chain.genesis());
        chain
    }

    /// The genesis block is built from constants only, so independently
    /// started nodes agree on its hash.
    pub fn create_genesis_block() -> Block {
        let data = vec![Entry::Certificate(CertificateEntry {
            certificate: json!({
                "type": "genesis",
                "headline": GENESIS_HEADLINE,
                "timestamp": GENESIS_TIMESTAMP,
            }),
            timestamp: GENESIS_TIMESTAMP,
        })];
        Block::new(0, GENESIS_TIMESTAMP, data, GENESIS_PREVIOUS_HASH.to_string(), None)
    }

    pub fn genesis(&self) -> &Block {
        &self.blocks[0]
    }

    pub fn latest_block(&self) -> &Block {
        // The chain always holds at least the genesis block.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn get_block(&self, index: u64) -> Option<&Block> {
        self.blocks.get(index as usize)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn pending_entries(&self) -> &[Entry] {
        &self.pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Receiver for chain notifications. Every event is delivered to exactly
    /// one receiver.
    pub fn events(&self) -> Receiver<ChainEvent> {
        self.events_rx.clone()
    }

    /// Take every notification raised so far.
    pub fn drain_events(&self) -> Vec<ChainEvent> {
        self.events_rx.try_iter().collect()
    }

    /// Queue an entry for the next block. Returns the index of the block the
    /// entry will land in once sealed.
    pub fn append_pending(&mut self, entry: Entry) -> u64 {
        self.pending.push(entry);
        self.blocks.len() as u64
    }

    pub fn append_certificate(&mut self, certificate: serde_json::Value) -> u64 {
        self.append_pending(Entry::Certificate(CertificateEntry {
            certificate,
            timestamp: now_millis(),
        }))
    }

    pub fn record_credit_operation(&mut self, operation: CreditOperation, token: &CreditToken) -> u64 {
        debug!(%operation, token_id = %token.token_id, "Added credit operation to pending entries");
        self.append_pending(Entry::CreditOperation(CreditOperationEntry {
            operation,
            token_data: token.clone(),
            timestamp: now_millis(),
        }))
    }

    /// Snapshot the pending buffer into a new block on top of the chain. The
    /// buffer is taken and cleared in the same step.
    pub fn seal_block(&mut self) -> Block {
        let previous = self.latest_block();
        let index = previous.index + 1;
        let previous_hash = previous.hash.clone();
        let data = std::mem::take(&mut self.pending);

        let block = Block::new(index, now_millis(), data, previous_hash, None);
        info!(index = block.index, hash = %block.hash, previous_hash = %block.previous_hash, entries = block.data.len(), "Sealed new block");

        self.blocks.push(block.clone());
        self.persist_block(&block);
        self.notify(&block);
        block
    }

    /// Append a block produced elsewhere. Returns `false` and leaves the
    /// chain untouched when the block does not extend the local tip.
    pub fn add_existing_block(&mut self, block: Block) -> bool {
        if let Err(e) = validate_successor(self.latest_block(), &block) {
            warn!(index = block.index, "Rejected block: {}", e);
            return false;
        }

        self.blocks.push(block.clone());
        self.persist_block(&block);
        self.notify(&block);
        true
    }

    pub fn is_valid_chain(&self, candidate: &[Block]) -> bool {
        match validate_chain(candidate, &self.genesis().hash) {
            Ok(()) => true,
            Err(e) => {
                warn!("Rejected candidate chain: {}", e);
                false
            }
        }
    }

    /// Adopt `candidate` when it is strictly longer than the local chain and
    /// valid. The pending buffer is kept. Notifications are raised for every
    /// adopted block that was not already part of the local chain.
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> bool {
        if candidate.len() <= self.blocks.len() {
            debug!(
                local = self.blocks.len(),
                candidate = candidate.len(),
                "Candidate chain is not longer than ours"
            );
            return false;
        }
        if !self.is_valid_chain(&candidate) {
            return false;
        }

        let fork = self
            .blocks
            .iter()
            .zip(candidate.iter())
            .take_while(|(ours, theirs)| ours.hash == theirs.hash)
            .count();
        let orphaned = self.blocks.len() - fork;
        if orphaned > 0 {
            warn!(orphaned, fork_index = fork, "Local blocks orphaned by chain replacement");
        }

        self.blocks = candidate;
        for block in &self.blocks[fork..] {
            self.persist_block(block);
            self.notify(block);
        }
        info!(length = self.blocks.len(), "Local chain replaced by longer valid chain");
        true
    }

    /// Truncate to the genesis block and clear the pending buffer. Also
    /// clears persisted blocks so a restart does not resurrect them.
    pub fn reset_to_genesis(&mut self) -> Block {
        self.blocks.truncate(1);
        self.pending.clear();
        if let Err(e) = self.persistence.clear_blocks() {
            warn!("Failed to clear persisted blocks: {}", e);
        }
        self.persist_block(self.genesis());
        info!("Chain reset to genesis block");
        self.genesis().clone()
    }

    /// Re-validate persisted blocks on top of genesis in ascending index
    /// order. Loading stops at the first block that does not extend the chain.
    pub fn load_from_store(&mut self) -> usize {
        let stored = match self.persistence.load_blocks() {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!("Failed to load blocks from store: {}. Starting with genesis block.", e);
                return 0;
            }
        };

        let mut loaded = 0;
        for block in stored {
            if block.index == 0 {
                if block.hash != self.genesis().hash {
                    warn!(stored = %block.hash, ours = %self.genesis().hash, "Stored genesis block does not match");
                    break;
                }
                continue;
            }
            if !self.add_existing_block(block) {
                break;
            }
            loaded += 1;
        }

        info!("Loaded {} blocks from store", loaded);
        loaded
    }

    pub fn certificates_for_student(&self, student_id: &str) -> Vec<StudentCertificate> {
        let mut found = Vec::new();
        for block in self.blocks.iter().skip(1) {
            for entry in block.data.iter().filter_map(Entry::as_certificate) {
                let student = &entry.certificate["student"];
                let matches = student["id"].as_str() == Some(student_id)
                    || student["fullName"].as_str() == Some(student_id);
                if matches {
                    found.push(StudentCertificate {
                        certificate: entry.certificate.clone(),
                        timestamp: entry.timestamp,
                        block_index: block.index,
                        block_hash: block.hash.clone(),
                    });
                }
            }
        }
        found
    }

    fn persist_block(&self, block: &Block) {
        if let Err(e) = self.persistence.save_block(block) {
            warn!(index = block.index, "Failed to persist block: {}", e);
        }
    }

    fn notify(&self, block: &Block) {
        // A closed channel only means nobody listens.
        let _ = self.events_tx.send(ChainEvent::BlockAdded(block.clone()));

        let operations = block.credit_operations();
        if !operations.is_empty() {
            debug!(index = block.index, count = operations.len(), "Block carries credit operations");
            let _ = self.events_tx.send(ChainEvent::CreditOperations {
                block_index: block.index,
                operations,
            });
        }
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationSink for Blockchain {
    fn record(&mut self, operation: CreditOperation, token: &CreditToken) {
        self.record_credit_operation(operation, token);
    }
}
