//! Domain types shared by the store and the engine.

pub mod attempt;
pub mod job;
pub mod profile;
pub mod prover;

pub use attempt::{
    AttemptOutcome, AttemptOutput, ExecutionAttempt, FaultCause, OutcomeKind, ResourceUsage,
};
pub use job::{Job, JobPriority, JobSpec, JobStatus, PayloadRef};
pub use profile::{SecurityPolicy, SecurityProfile};
pub use prover::ProverKind;
