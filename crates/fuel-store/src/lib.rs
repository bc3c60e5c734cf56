pub mod error;
pub mod queue;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{NewTask, RunPatch, Store, TaskPatch};
