pub mod config;
pub mod driver;
pub mod epics;
pub mod error;
pub mod event_bus;
pub mod health;
pub mod lifecycle;
pub mod prompt;
pub mod review;
pub mod scheduler;
pub mod supervisor;

pub use config::{ConfigOverrides, ConsumeConfig, HealthConfig};
pub use driver::{AgentDriver, AgentEvent, DriverRegistry, Invocation, InvocationContext};
pub use epics::EpicController;
pub use error::{FuelError, Result};
pub use event_bus::EventBus;
pub use health::HealthTracker;
pub use scheduler::{DaemonCommand, Scheduler};
pub use supervisor::{Completion, RunOutcome, SpawnSpec, Supervisor};
