//! Pipe reader over a tokio [`AsyncRead`].
//!
//! The reader buffers stream data into pooled segments and hands the caller
//! a [`ReadOnlySequence`] over everything not yet consumed. The caller then
//! reports two watermarks through [`StreamPipeReader::advance_to_examined`]:
//! `consumed` (bytes it is done with, released right away) and `examined`
//! (bytes it has looked at). When a parser examined everything and still
//! needs more, the next [`read`](StreamPipeReader::read) goes to the stream
//! instead of handing back the same leftover bytes.
//!
//! ```rust,ignore
//! let mut reader = StreamPipeReader::new(stream);
//! loop {
//!     let result = reader.read().await?;
//!     let buffer = result.buffer();
//!     match buffer.find(b'\n') {
//!         Some(eol) => {
//!             handle_line(&buffer.to_vec()[..]);
//!             reader.advance_to(eol)?;
//!         }
//!         None if result.is_completed() => break,
//!         None => reader.advance_to_examined(buffer.start(), buffer.end())?,
//!     }
//! }
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::cancel::PipeCanceller;
use crate::error::PipeError;
use crate::pool::{BlockPool, DEFAULT_BLOCK_SIZE};
use crate::segment::{BufferSegment, SegmentChain};
use crate::sequence::{ReadOnlySequence, SequencePosition};

/// Tuning knobs for [`StreamPipeReader`].
#[derive(Debug, Clone)]
pub struct StreamPipeReaderOptions {
    /// Size of each pooled segment.
    pub buffer_size: usize,
    /// A new tail segment is allocated when the current one has less room
    /// than this.
    pub minimum_read_size: usize,
    /// Keep the stream usable after [`StreamPipeReader::complete`].
    pub leave_open: bool,
}

impl Default for StreamPipeReaderOptions {
    fn default() -> Self {
        StreamPipeReaderOptions {
            buffer_size: DEFAULT_BLOCK_SIZE,
            minimum_read_size: 1024,
            leave_open: false,
        }
    }
}

/// The outcome of one read.
#[derive(Debug, Clone, Copy)]
pub struct ReadResult<'a> {
    buffer: ReadOnlySequence<'a>,
    is_canceled: bool,
    is_completed: bool,
}

impl<'a> ReadResult<'a> {
    #[inline]
    pub fn buffer(&self) -> ReadOnlySequence<'a> {
        self.buffer
    }

    /// The read was interrupted by [`PipeCanceller::cancel`].
    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.is_canceled
    }

    /// The stream reached its end; no more data will arrive.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.is_completed
    }
}

/// Buffered, cancellable reader with consumed/examined semantics.
pub struct StreamPipeReader<R> {
    stream: R,
    options: StreamPipeReaderOptions,
    pool: BlockPool,
    chain: SegmentChain,
    canceller: PipeCanceller,
    examined_everything: bool,
    has_read: bool,
    stream_completed: bool,
    completed: bool,
}

impl<R> StreamPipeReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R) -> Self {
        Self::with_options(stream, StreamPipeReaderOptions::default())
    }

    pub fn with_options(stream: R, options: StreamPipeReaderOptions) -> Self {
        assert!(
            options.minimum_read_size <= options.buffer_size,
            "minimum read size cannot exceed the buffer size"
        );
        StreamPipeReader {
            stream,
            pool: BlockPool::new(options.buffer_size),
            options,
            chain: SegmentChain::new(),
            canceller: PipeCanceller::new(),
            examined_everything: false,
            has_read: false,
            stream_completed: false,
            completed: false,
        }
    }

    /// Handle used to interrupt a pending read from elsewhere.
    pub fn canceller(&self) -> PipeCanceller {
        self.canceller.clone()
    }

    /// Interrupt the pending read, or the next one if none is pending.
    pub fn cancel_pending_read(&self) {
        self.canceller.cancel();
    }

    /// Bytes buffered and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.chain.buffered()
    }

    /// Blocks rented from this reader's pool.
    pub fn rented_blocks(&self) -> usize {
        self.pool.outstanding()
    }

    pub async fn read(&mut self) -> Result<ReadResult<'_>, PipeError> {
        self.read_inner(None).await
    }

    /// Read, failing with [`PipeError::Canceled`] if `token` fires first.
    pub async fn read_with_token(
        &mut self,
        token: &CancellationToken,
    ) -> Result<ReadResult<'_>, PipeError> {
        self.read_inner(Some(token)).await
    }

    async fn read_inner(
        &mut self,
        token: Option<&CancellationToken>,
    ) -> Result<ReadResult<'_>, PipeError> {
        if self.completed {
            return Err(PipeError::ReadingAfterCompleted);
        }
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(PipeError::Canceled);
        }
        self.has_read = true;

        let internal = self.canceller.token();
        if internal.is_cancelled() {
            self.canceller.reset_if_cancelled();
            return Ok(self.result(true));
        }
        if self.stream_completed || (self.chain.buffered() > 0 && !self.examined_everything) {
            return Ok(self.result(false));
        }

        let Self {
            stream,
            chain,
            pool,
            options,
            ..
        } = self;
        let target = ensure_read_tail(chain, pool, options);

        let outcome = match token {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(PipeError::Canceled),
                    _ = internal.cancelled() => Ok(None),
                    read = stream.read(target) => read.map(Some).map_err(PipeError::from),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = internal.cancelled() => Ok(None),
                    read = stream.read(target) => read.map(Some).map_err(PipeError::from),
                }
            }
        };

        let is_canceled = match outcome? {
            Some(0) => {
                self.stream_completed = true;
                false
            }
            Some(n) => {
                if let Some(tail) = self.chain.tail_mut() {
                    let end = tail.end() + n;
                    tail.set_end(end);
                }
                self.examined_everything = false;
                false
            }
            None => {
                self.canceller.reset_if_cancelled();
                true
            }
        };
        tracing::trace!(buffered = self.chain.buffered(), is_canceled, "pipe read");
        self.release_empty_tail();
        Ok(self.result(is_canceled))
    }

    /// Return whatever is buffered without touching the stream.
    ///
    /// `Ok(None)` means nothing is available right now.
    pub fn try_read(&mut self) -> Result<Option<ReadResult<'_>>, PipeError> {
        if self.completed {
            return Err(PipeError::ReadingAfterCompleted);
        }
        if self.canceller.token().is_cancelled() {
            self.canceller.reset_if_cancelled();
            self.has_read = true;
            return Ok(Some(self.result(true)));
        }
        if self.chain.buffered() > 0 && !self.examined_everything {
            self.has_read = true;
            return Ok(Some(self.result(false)));
        }
        if self.stream_completed {
            self.has_read = true;
            return Ok(Some(self.result(false)));
        }
        Ok(None)
    }

    /// Mark everything up to `consumed` as both consumed and examined.
    pub fn advance_to(&mut self, consumed: SequencePosition) -> Result<(), PipeError> {
        self.advance_to_examined(consumed, consumed)
    }

    /// Release bytes before `consumed` and remember how far the caller looked.
    pub fn advance_to_examined(
        &mut self,
        consumed: SequencePosition,
        examined: SequencePosition,
    ) -> Result<(), PipeError> {
        if self.completed {
            return Err(PipeError::ReadingAfterCompleted);
        }
        if !self.has_read {
            return Err(PipeError::NoDataRead);
        }

        let start = self.chain.start_index();
        let end = self.chain.end_index();
        let (consumed, examined) = (consumed.offset(), examined.offset());
        if consumed < start || consumed > examined || examined > end {
            return Err(PipeError::InvalidPosition);
        }

        self.examined_everything = examined == end && end > consumed;
        self.chain
            .consume((consumed - start) as usize, &mut self.pool, true);
        Ok(())
    }

    /// Stop reading and release every buffered segment.
    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.chain.release_all(&mut self.pool);
    }

    /// Copy the rest of the stream, buffered bytes first, into `destination`.
    pub async fn copy_to<W>(&mut self, destination: &mut W) -> Result<u64, PipeError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut copied = 0u64;
        loop {
            let result = self.read().await?;
            let buffer = result.buffer();
            for chunk in buffer.chunks() {
                destination.write_all(chunk).await?;
            }
            copied += buffer.len() as u64;
            let end = buffer.end();
            let done = result.is_completed() || result.is_canceled();
            self.advance_to(end)?;
            if done {
                break;
            }
        }
        destination.flush().await?;
        Ok(copied)
    }

    /// Give the stream back. Buffered bytes are dropped.
    pub fn into_inner(mut self) -> R {
        self.complete();
        self.stream
    }

    fn result(&self, is_canceled: bool) -> ReadResult<'_> {
        let buffer = if self.chain.is_empty() {
            ReadOnlySequence::empty(self.chain.start_index())
        } else {
            ReadOnlySequence::new(&self.chain)
        };
        ReadResult {
            buffer,
            is_canceled,
            is_completed: self.stream_completed,
        }
    }

    /// A tail that received nothing is not kept around between reads.
    fn release_empty_tail(&mut self) {
        if self.chain.segment_count() == 1 && self.chain.buffered() == 0 {
            self.chain.consume(0, &mut self.pool, true);
        }
    }
}

/// Make sure the tail has at least `minimum_read_size` free bytes and return
/// that free region.
fn ensure_read_tail<'c>(
    chain: &'c mut SegmentChain,
    pool: &mut BlockPool,
    options: &StreamPipeReaderOptions,
) -> &'c mut [u8] {
    let needs_segment = chain
        .tail()
        .is_none_or(|tail| tail.writable() < options.minimum_read_size);
    if needs_segment {
        let mut segment = BufferSegment::new();
        segment.set_memory(pool.rent(options.buffer_size), 0, 0);
        chain.append(segment);
    }
    match chain.tail_mut() {
        Some(tail) => tail.available_memory(),
        None => &mut [],
    }
}

impl<R> std::fmt::Debug for StreamPipeReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipeReader")
            .field("buffered", &self.chain.buffered())
            .field("examined_everything", &self.examined_everything)
            .field("stream_completed", &self.stream_completed)
            .field("completed", &self.completed)
            .finish()
    }
}
