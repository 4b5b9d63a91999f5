use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IsochError {
    #[error("prerequisite state is missing")]
    NotReady,
    #[error("timed out waiting for external clock")]
    Timeout,
    #[error("DMA resources unavailable or out of constraint")]
    NoResources,
    #[error("invalid argument")]
    BadArgument,
    #[error("requested configuration is not supported")]
    Unsupported,
    #[error("another session holds the engine")]
    Busy,
    #[error("hardware context reported dead")]
    Dead,
    #[error("internal engine fault")]
    Internal,
}

pub type Result<T> = std::result::Result<T, IsochError>;
