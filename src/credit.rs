// Credit economy: tokens, the wallet ledger and the bank-level audit log.

pub mod bank;
pub mod ledger;
pub mod token;

pub use bank::*;
pub use ledger::*;
pub use token::*;
