pub mod cipher;
pub mod client;
pub mod error;
pub mod keypool;
pub mod orchestrator;
pub mod parser;
pub mod planner;
pub mod transformer;

pub use cipher::{PlainCipher, SecretCipher};
pub use client::{Judge0Client, JudgeApi};
pub use error::{JudgeError, OrchestrationError, PlanError, TransformError};
pub use keypool::{FailureReason, KeyPool, Reservation};
pub use orchestrator::{ExecutionOrchestrator, OrchestratorConfig};
pub use planner::{Batch, BatchPlanner};
pub use transformer::CodeTransformer;
