//! Chain entities: transactions, blocks and the persisted state objects.

pub mod account;
pub mod block;
pub mod tokens;
pub mod transaction;

pub use account::{Account, Contract};
pub use block::{Block, Header, TrimmedBlock};
pub use tokens::{Nep17Transfer, TokenBalance, TokenBalances, TransferLog};
pub use transaction::{Attribute, Input, Transaction};
