pub mod engine;
pub mod store;
pub mod types;

pub use engine::{Builder, FsmContext, FsmEngine, QueueRegistry};
pub use store::FsmStore;
pub use types::{Req, RetryPolicy, RunStatus, StartOptions, StepOutcome};
