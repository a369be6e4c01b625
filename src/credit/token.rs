//! Credit token: a single, indivisible unit of spend authority.

use crate::blockchain::now_millis;
use crate::error::ChainError;
use crate::hash::sha256_hex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub from_wallet_id: String,
    pub to_wallet_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditToken {
    pub token_id: String,
    pub owner_wallet_id: String,
    pub issue_timestamp: u64,
    pub spent: bool,
    pub spent_on: Option<String>,
    pub spent_timestamp: Option<u64>,
    #[serde(default)]
    pub transfer_history: Vec<TransferRecord>,
}

/// 128 random bits, hex encoded.
pub fn generate_token_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

impl CreditToken {
    pub fn new(owner_wallet_id: String) -> Self {
        Self::with_timestamp(owner_wallet_id, now_millis())
    }

    pub fn with_timestamp(owner_wallet_id: String, issue_timestamp: u64) -> Self {
        CreditToken {
            token_id: generate_token_id(),
            owner_wallet_id,
            issue_timestamp,
            spent: false,
            spent_on: None,
            spent_timestamp: None,
            transfer_history: Vec::new(),
        }
    }

    /// Identity digest over id, owner and issue time.
    pub fn token_hash(&self) -> String {
        sha256_hex(&format!(
            "{}:{}:{}",
            self.token_id, self.owner_wallet_id, self.issue_timestamp
        ))
    }

    /// One-way transition to the spent state.
    pub fn mark_spent(&mut self, certificate_ref: Option<String>) -> Result<(), ChainError> {
        if self.spent {
            return Err(ChainError::AlreadySpent(self.token_id.clone()));
        }
        self.spent = true;
        self.spent_on = certificate_ref;
        self.spent_timestamp = Some(now_millis());
        Ok(())
    }

    pub fn transfer(&mut self, new_owner: &str) -> Result<(), ChainError> {
        if self.spent {
            return Err(ChainError::AlreadySpent(self.token_id.clone()));
        }
        self.transfer_history.push(TransferRecord {
            from_wallet_id: self.owner_wallet_id.clone(),
            to_wallet_id: new_owner.to_string(),
            timestamp: now_millis(),
        });
        self.owner_wallet_id = new_owner.to_string();
        Ok(())
    }

    pub fn verify_ownership(&self, wallet_id: &str) -> bool {
        !self.spent && self.owner_wallet_id == wallet_id
    }

    /// Owner before the most recent transfer, if any.
    pub fn previous_owner(&self) -> Option<&str> {
        self.transfer_history
            .last()
            .map(|record| record.from_wallet_id.as_str())
    }
}
