//! Pooled segment buffers and cancellable pipe adapters over tokio streams.
//!
//! [`StreamPipeReader`] turns an [`AsyncRead`](tokio::io::AsyncRead) into a
//! buffered reader with consumed/examined watermarks, [`StreamPipeWriter`]
//! turns an [`AsyncWrite`](tokio::io::AsyncWrite) into a buffered writer that
//! hands out memory and flushes it in order. Both rent their segments from a
//! private [`BlockPool`].

pub mod cancel;
pub mod error;
pub mod pool;
pub mod reader;
pub mod segment;
pub mod sequence;
pub mod writer;

pub use cancel::PipeCanceller;
pub use error::PipeError;
pub use pool::{BlockPool, DEFAULT_BLOCK_SIZE};
pub use reader::{ReadResult, StreamPipeReader, StreamPipeReaderOptions};
pub use segment::{BufferSegment, SegmentChain};
pub use sequence::{ReadOnlySequence, SequencePosition};
pub use writer::{FlushResult, StreamPipeWriter, StreamPipeWriterOptions};
