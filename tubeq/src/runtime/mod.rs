/// Builder for constructing dispatcher instances.
pub mod builder;
/// The reservation loop and its shutdown token.
pub mod supervisor;
/// Dispatch loop settings.
pub mod worker;

pub use builder::ConsumerDispatcherBuilder;
pub use supervisor::{ConsumerDispatcher, DispatchOutcome, DispatchReport, ShutdownToken, DEFAULT_TUBE};
pub use worker::{WorkerConfig, MIN_IDLE_WAIT_MS};
