//! Error types for nfp-controller.

use thiserror::Error;

use crate::model::WorkerId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// An optional collaborator hook is not implemented. Never fatal: the
    /// controller logs it and moves on.
    #[error("hook not implemented: {0}")]
    HookAbsent(&'static str),

    #[error("no such worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("worker {0} is no longer accepting events")]
    WorkerUnavailable(WorkerId),

    #[error("poll inbox is full")]
    PollInboxFull,

    #[error("registration is closed once the controller has started")]
    RegistrationClosed,

    #[error("controller already started")]
    AlreadyStarted,

    #[error("unknown module kind: {0}")]
    UnknownModule(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the tolerated "hook not implemented" case.
    pub fn is_hook_absent(&self) -> bool {
        matches!(self, Error::HookAbsent(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
