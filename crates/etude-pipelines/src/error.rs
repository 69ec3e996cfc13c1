use thiserror::Error;

/// Errors raised by the pipe adapters.
///
/// Everything except `Canceled` and `Io` is a contract violation by the
/// caller and is not worth retrying.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("no data has been read yet; call read() before advance_to()")]
    NoDataRead,

    #[error("cannot advance past the end of the buffer returned by get_memory()")]
    AdvancePastBuffer,

    #[error("position is outside the buffered range or consumed is past examined")]
    InvalidPosition,

    #[error("reading is not allowed after the reader was completed")]
    ReadingAfterCompleted,

    #[error("writing is not allowed after the writer was completed")]
    WritingAfterCompleted,

    #[error("the operation was canceled")]
    Canceled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipeError {
    /// Whether this error is the caller's own cancellation surfacing.
    pub fn is_canceled(&self) -> bool {
        matches!(self, PipeError::Canceled)
    }
}
