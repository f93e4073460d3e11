//! Billing orchestration
//!
//! The subscription + order state machine: activation (first charge),
//! queue-driven recurring charges, dunning for recoverable failures, and
//! terminal cancellation.

pub mod activation;
pub mod classifier;
pub mod dunning;
pub mod processor;

pub use activation::ActivationOrchestrator;
pub use classifier::{classify, Classification, FailureCode, FailureKind};
pub use dunning::DunningSchedule;
pub use processor::{Disposition, PaymentProcessor, ProcessorConfig};
