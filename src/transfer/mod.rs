//! CPU to GPU transfers
//!
//! The orchestrator decides how each copy travels; the executor records and
//! submits the device commands.

pub mod context;
pub mod executor;
pub mod orchestrator;

pub use context::StagingContext;
pub use executor::{AsyncTransfer, CommandExecutor, QueueManager, TransferId, TransferState};
pub use orchestrator::{TransferOrchestrator, TransferRequest};
