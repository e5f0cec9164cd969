pub mod orchestrator;
pub mod refunds;
pub mod scheduler;
pub mod transactions;
pub mod treasury;
