use thiserror::Error;

pub type TailResult<T> = Result<T, TailError>;

#[derive(Debug, Error)]
pub enum TailError {
    /// The caller's cancellation signal fired.
    #[error("log stream canceled")]
    Canceled,

    /// The receiving end of the sink was dropped.
    #[error("log sink closed")]
    SinkClosed,

    #[error("log read failed: {0}")]
    Io(#[from] std::io::Error),
}
