use thiserror::Error;

use fuel_store::StoreError;

#[derive(Error, Debug)]
pub enum FuelError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("mirror error: {0}")]
    Mirror(String),

    // Fatal variants stop the daemon; the shutdown path still runs.
    #[error("another consume daemon is running (pid {0})")]
    PidFileLockHeld(u32),

    #[error("port in use: {0}")]
    PortInUse(String),

    #[error("store corrupted: {0}")]
    StoreCorrupted(String),
}

impl FuelError {
    /// Fatal errors trigger graceful shutdown rather than a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FuelError::PidFileLockHeld(_)
                | FuelError::PortInUse(_)
                | FuelError::StoreCorrupted(_)
        ) || matches!(self, FuelError::Store(StoreError::Corrupted(_)))
    }
}

pub type Result<T> = std::result::Result<T, FuelError>;
