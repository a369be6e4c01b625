use crate::credit::CreditToken;
use crate::hash::calculate_hash;
use serde::{Deserialize, Serialize};

/// Kind of credit operation recorded on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditOperation {
    Issue,
    Transfer,
    Spend,
}

impl std::fmt::Display for CreditOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreditOperation::Issue => write!(f, "ISSUE"),
            CreditOperation::Transfer => write!(f, "TRANSFER"),
            CreditOperation::Spend => write!(f, "SPEND"),
        }
    }
}

/// A certificate anchored on chain. The payload is opaque to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateEntry {
    pub certificate: serde_json::Value,
    pub timestamp: u64,
}

/// Snapshot of a token taken right after a credit operation was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditOperationEntry {
    pub operation: CreditOperation,
    pub token_data: CreditToken,
    pub timestamp: u64,
}

/// One element of a block's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Entry {
    Certificate(CertificateEntry),
    CreditOperation(CreditOperationEntry),
}

impl Entry {
    pub fn as_credit_operation(&self) -> Option<&CreditOperationEntry> {
        match self {
            Entry::CreditOperation(op) => Some(op),
            Entry::Certificate(_) => None,
        }
    }

    pub fn as_certificate(&self) -> Option<&CertificateEntry> {
        match self {
            Entry::Certificate(cert) => Some(cert),
            Entry::CreditOperation(_) => None,
        }
    }
}

/// An immutable ledger page linked to its predecessor by hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    pub data: Vec<Entry>,
    pub previous_hash: String,
    pub hash: String,
}

impl Block {
    /// Build a block. When `hash` is `None` it is computed from the other
    /// fields; a supplied hash is trusted as-is and checked by `is_valid`.
    pub fn new(
        index: u64,
        timestamp: u64,
        data: Vec<Entry>,
        previous_hash: String,
        hash: Option<String>,
    ) -> Self {
        let hash = hash.unwrap_or_else(|| calculate_hash(index, timestamp, &data, &previous_hash));
        Block {
            index,
            timestamp,
            data,
            previous_hash,
            hash,
        }
    }

    pub fn calculate_hash(&self) -> String {
        calculate_hash(self.index, self.timestamp, &self.data, &self.previous_hash)
    }

    pub fn is_valid(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Credit operations embedded in this block, in entry order.
    pub fn credit_operations(&self) -> Vec<CreditOperationEntry> {
        self.data
            .iter()
            .filter_map(Entry::as_credit_operation)
            .cloned()
            .collect()
    }
}
