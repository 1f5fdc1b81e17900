pub mod models;
pub mod service;

pub use models::{
    BalanceDetail, ConsumeOutcome, CorrelationKey, EntrySource, EntryType, GrantOutcome,
    LedgerEntry, LedgerError,
};
pub use service::LedgerService;
