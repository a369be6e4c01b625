//! Bank-level audit trail on top of the credit ledger.
//!
//! The bank does not own the ledger: callers pass the ledger (and the chain
//! as operation sink) they already hold locked, and the bank appends one
//! audit record per purchase, issue or spend.

use crate::credit::ledger::{CreditLedger, LedgerInfo, OperationSink, SpendOutcome};
use crate::credit::token::{generate_token_id, CreditToken};
use crate::error::Result;
use crate::persistence::Persistence;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

fn signed(amount: usize) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BankTransactionType {
    Purchase,
    Issue,
    Spend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BankTransactionType,
    pub wallet_id: String,
    /// Negative for spends.
    pub amount: i64,
    pub token_ids: Vec<String>,
    /// RFC 3339.
    pub timestamp: String,
    pub balance_after: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
}

/// Result of a purchase or an administrative issue.
#[derive(Debug, Clone, Serialize)]
pub struct CreditGrant {
    pub transaction: BankTransaction,
    pub tokens: Vec<CreditToken>,
    pub new_balance: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditSpend {
    pub transaction: BankTransaction,
    pub spent_token_ids: Vec<String>,
    pub new_balance: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionCounts {
    pub total: usize,
    pub purchases: usize,
    pub issues: usize,
    pub spends: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BankStats {
    pub transactions: TransactionCounts,
    pub tokens: LedgerInfo,
    pub total_volume: i64,
}

pub struct CreditBank {
    transactions: Vec<BankTransaction>,
    persistence: Arc<dyn Persistence>,
}

impl CreditBank {
    /// Bank with the audit history found in `persistence`.
    pub fn load(persistence: Arc<dyn Persistence>) -> Self {
        let transactions = match persistence.load_audit() {
            Ok(transactions) => transactions,
            Err(e) => {
                warn!("Error loading transactions: {}", e);
                Vec::new()
            }
        };
        CreditBank {
            transactions,
            persistence,
        }
    }

    pub fn purchase_credits(
        &mut self,
        ledger: &mut CreditLedger,
        wallet_id: &str,
        amount: usize,
        payment_reference: Option<String>,
        sink: Option<&mut dyn OperationSink>,
    ) -> CreditGrant {
        let tokens = ledger.issue_tokens(wallet_id, amount, sink);
        let mut transaction = self.new_record(BankTransactionType::Purchase, wallet_id, signed(amount), &tokens, ledger);
        transaction.payment_reference = payment_reference;
        self.append(transaction.clone());

        CreditGrant {
            transaction,
            tokens,
            new_balance: ledger.get_balance(wallet_id),
        }
    }

    /// Free credits granted by an administrator.
    pub fn issue_credits(
        &mut self,
        ledger: &mut CreditLedger,
        wallet_id: &str,
        amount: usize,
        reason: Option<String>,
        sink: Option<&mut dyn OperationSink>,
    ) -> CreditGrant {
        let tokens = ledger.issue_tokens(wallet_id, amount, sink);
        let mut transaction = self.new_record(BankTransactionType::Issue, wallet_id, signed(amount), &tokens, ledger);
        transaction.reason = reason;
        self.append(transaction.clone());

        CreditGrant {
            transaction,
            tokens,
            new_balance: ledger.get_balance(wallet_id),
        }
    }

    /// Spend through the ledger; nothing is logged when the spend fails.
    pub fn spend_credits(
        &mut self,
        ledger: &mut CreditLedger,
        wallet_id: &str,
        amount: usize,
        certificate_id: Option<String>,
        sink: Option<&mut dyn OperationSink>,
    ) -> Result<CreditSpend> {
        let SpendOutcome {
            spent_token_ids,
            new_balance,
        } = ledger.spend_tokens(wallet_id, amount, certificate_id.clone(), sink)?;

        let transaction = BankTransaction {
            id: generate_token_id(),
            kind: BankTransactionType::Spend,
            wallet_id: wallet_id.to_string(),
            amount: -signed(amount),
            token_ids: spent_token_ids.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            balance_after: new_balance,
            payment_reference: None,
            reason: None,
            certificate_id,
        };
        self.append(transaction.clone());

        Ok(CreditSpend {
            transaction,
            spent_token_ids,
            new_balance,
        })
    }

    /// All records, or only those of `wallet_id`.
    pub fn transaction_history(&self, wallet_id: Option<&str>) -> Vec<BankTransaction> {
        match wallet_id {
            Some(wallet) => self
                .transactions
                .iter()
                .filter(|tx| tx.wallet_id == wallet)
                .cloned()
                .collect(),
            None => self.transactions.clone(),
        }
    }

    pub fn bank_stats(&self, ledger: &CreditLedger) -> BankStats {
        let count = |kind: BankTransactionType| self.transactions.iter().filter(|tx| tx.kind == kind).count();
        BankStats {
            transactions: TransactionCounts {
                total: self.transactions.len(),
                purchases: count(BankTransactionType::Purchase),
                issues: count(BankTransactionType::Issue),
                spends: count(BankTransactionType::Spend),
            },
            tokens: ledger.ledger_info(),
            total_volume: self.transactions.iter().map(|tx| tx.amount.max(0)).sum(),
        }
    }

    fn new_record(
        &self,
        kind: BankTransactionType,
        wallet_id: &str,
        amount: i64,
        tokens: &[CreditToken],
        ledger: &CreditLedger,
    ) -> BankTransaction {
        BankTransaction {
            id: generate_token_id(),
            kind,
            wallet_id: wallet_id.to_string(),
            amount,
            token_ids: tokens.iter().map(|t| t.token_id.clone()).collect(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            balance_after: ledger.get_balance(wallet_id),
            payment_reference: None,
            reason: None,
            certificate_id: None,
        }
    }

    fn append(&mut self, transaction: BankTransaction) {
        info!(kind = ?transaction.kind, wallet = %transaction.wallet_id, amount = transaction.amount, "Bank transaction recorded");
        if let Err(e) = self.persistence.append_audit(&transaction) {
            warn!("Error saving transaction {}: {}", transaction.id, e);
        }
        self.transactions.push(transaction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChainError;
    use crate::persistence::InMemoryPersistence;

    fn bank() -> (CreditBank, CreditLedger, Arc<InMemoryPersistence>) {
        let store = Arc::new(InMemoryPersistence::new());
        (
            CreditBank::load(store.clone()),
            CreditLedger::with_persistence(store.clone()),
            store,
        )
    }

    #[test]
    fn test_purchase_records_audit_entry() {
        let (mut bank, mut ledger, _) = bank();
        let grant = bank.purchase_credits(&mut ledger, "S1001", 4, Some("card-42".to_string()), None);

        assert_eq!(grant.tokens.len(), 4);
        assert_eq!(grant.new_balance, 4);
        assert_eq!(grant.transaction.kind, BankTransactionType::Purchase);
        assert_eq!(grant.transaction.balance_after, 4);
        assert_eq!(grant.transaction.token_ids.len(), 4);
        assert_eq!(grant.transaction.payment_reference.as_deref(), Some("card-42"));
    }

    #[test]
    fn test_failed_spend_is_not_logged() {
        let (mut bank, mut ledger, _) = bank();
        bank.issue_credits(&mut ledger, "S1001", 1, Some("welcome".to_string()), None);

        let err = bank
            .spend_credits(&mut ledger, "S1001", 2, Some("cert-1".to_string()), None)
            .unwrap_err();
        assert_eq!(err, ChainError::InsufficientCredits { available: 1, required: 2 });
        assert_eq!(bank.transaction_history(None).len(), 1);
    }

    #[test]
    fn test_history_and_stats() {
        let (mut bank, mut ledger, store) = bank();
        bank.purchase_credits(&mut ledger, "S1001", 5, None, None);
        bank.issue_credits(&mut ledger, "S2002", 2, None, None);
        let spend = bank
            .spend_credits(&mut ledger, "S1001", 2, Some("cert-7".to_string()), None)
            .unwrap();
        assert_eq!(spend.transaction.amount, -2);
        assert_eq!(spend.new_balance, 3);

        assert_eq!(bank.transaction_history(Some("S1001")).len(), 2);
        assert_eq!(bank.transaction_history(Some("S2002")).len(), 1);

        let stats = bank.bank_stats(&ledger);
        assert_eq!(
            stats.transactions,
            TransactionCounts { total: 3, purchases: 1, issues: 1, spends: 1 }
        );
        assert_eq!(stats.total_volume, 7);
        assert_eq!(stats.tokens.active_tokens, 5);

        // History survives a reload from the same store.
        let reloaded = CreditBank::load(store);
        assert_eq!(reloaded.transaction_history(None), bank.transaction_history(None));
    }

    #[test]
    fn test_audit_record_wire_shape() {
        let (mut bank, mut ledger, _) = bank();
        let grant = bank.issue_credits(&mut ledger, "S1001", 1, Some("promo".to_string()), None);
        let value = serde_json::to_value(&grant.transaction).unwrap();
        assert_eq!(value["type"], "ISSUE");
        assert_eq!(value["reason"], "promo");
        assert!(value.get("certificate_id").is_none());
    }
}
