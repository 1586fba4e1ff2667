pub mod amount;
pub mod config;
pub mod csv;
pub mod engine;
pub mod model;

pub use amount::Amount;
pub use config::EngineConfig;
pub use engine::{Engine, EngineError, RunSummary};
pub use model::{
    Account, AccountId, Rejection, RejectionKind, Transfer, TransferKey, TransferRequest,
    TransferStatus,
};
