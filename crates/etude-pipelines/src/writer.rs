//! Pipe writer over a tokio [`AsyncWrite`].
//!
//! Callers ask for memory with [`StreamPipeWriter::get_memory`], fill some
//! prefix of it, commit that prefix with [`StreamPipeWriter::advance`], and
//! eventually [`flush`](StreamPipeWriter::flush) everything committed to the
//! stream in order. Segments come from a private pool and go back to it as
//! soon as their bytes have reached the stream.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::cancel::PipeCanceller;
use crate::error::PipeError;
use crate::pool::{BlockPool, DEFAULT_BLOCK_SIZE};
use crate::segment::{BufferSegment, SegmentChain};

/// Tuning knobs for [`StreamPipeWriter`].
#[derive(Debug, Clone)]
pub struct StreamPipeWriterOptions {
    /// Smallest segment handed out by `get_memory`.
    pub minimum_buffer_size: usize,
    /// Keep the stream open after [`StreamPipeWriter::complete`].
    pub leave_open: bool,
}

impl Default for StreamPipeWriterOptions {
    fn default() -> Self {
        StreamPipeWriterOptions {
            minimum_buffer_size: DEFAULT_BLOCK_SIZE,
            leave_open: false,
        }
    }
}

/// The outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub is_canceled: bool,
    pub is_completed: bool,
}

/// Buffered, cancellable writer.
pub struct StreamPipeWriter<W> {
    stream: W,
    options: StreamPipeWriterOptions,
    pool: BlockPool,
    chain: SegmentChain,
    canceller: PipeCanceller,
    /// Length of the region returned by the last `get_memory`.
    last_memory_len: usize,
    completed: bool,
}

impl<W> StreamPipeWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(stream: W) -> Self {
        Self::with_options(stream, StreamPipeWriterOptions::default())
    }

    pub fn with_options(stream: W, options: StreamPipeWriterOptions) -> Self {
        StreamPipeWriter {
            stream,
            pool: BlockPool::new(options.minimum_buffer_size),
            options,
            chain: SegmentChain::new(),
            canceller: PipeCanceller::new(),
            last_memory_len: 0,
            completed: false,
        }
    }

    pub fn canceller(&self) -> PipeCanceller {
        self.canceller.clone()
    }

    /// Interrupt the pending flush, or the next one if none is pending.
    pub fn cancel_pending_flush(&self) {
        self.canceller.cancel();
    }

    /// Committed bytes not yet written to the stream.
    pub fn buffered_bytes(&self) -> usize {
        self.chain.buffered()
    }

    /// Blocks rented from this writer's pool.
    pub fn rented_blocks(&self) -> usize {
        self.pool.outstanding()
    }

    /// Writable memory of at least `max(size_hint, 1)` bytes.
    ///
    /// A new segment is attached when the tail has less room than that. An
    /// empty tail is swapped out rather than kept around.
    pub fn get_memory(&mut self, size_hint: usize) -> Result<&mut [u8], PipeError> {
        if self.completed {
            return Err(PipeError::WritingAfterCompleted);
        }
        let wanted = size_hint.max(1);
        if let Some(tail) = self.chain.tail_mut() {
            if tail.is_empty() {
                tail.rewind();
            }
        }
        let tail_fits = self.chain.tail().is_some_and(|tail| tail.writable() >= wanted);
        if !tail_fits {
            if self.chain.segment_count() == 1 && self.chain.buffered() == 0 {
                self.chain.consume(0, &mut self.pool, true);
            }
            let mut segment = BufferSegment::new();
            segment.set_memory(self.pool.rent(wanted.max(self.options.minimum_buffer_size)), 0, 0);
            self.chain.append(segment);
        }

        let memory = match self.chain.tail_mut() {
            Some(tail) => tail.available_memory(),
            None => &mut [],
        };
        self.last_memory_len = memory.len();
        Ok(memory)
    }

    /// Same as [`get_memory`](Self::get_memory); the region is a plain slice
    /// either way.
    pub fn get_span(&mut self, size_hint: usize) -> Result<&mut [u8], PipeError> {
        self.get_memory(size_hint)
    }

    /// Commit `count` bytes of the region returned by the last `get_memory`.
    pub fn advance(&mut self, count: usize) -> Result<(), PipeError> {
        if self.completed {
            return Err(PipeError::WritingAfterCompleted);
        }
        if count > self.last_memory_len {
            return Err(PipeError::AdvancePastBuffer);
        }
        if count == 0 {
            return Ok(());
        }
        if let Some(tail) = self.chain.tail_mut() {
            let end = tail.end() + count;
            tail.set_end(end);
        }
        self.last_memory_len -= count;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<FlushResult, PipeError> {
        self.flush_inner(None).await
    }

    /// Flush, failing with [`PipeError::Canceled`] if `token` fires first.
    pub async fn flush_with_token(
        &mut self,
        token: &CancellationToken,
    ) -> Result<FlushResult, PipeError> {
        self.flush_inner(Some(token)).await
    }

    async fn flush_inner(
        &mut self,
        token: Option<&CancellationToken>,
    ) -> Result<FlushResult, PipeError> {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(PipeError::Canceled);
        }
        let internal = self.canceller.token();
        if internal.is_cancelled() {
            self.canceller.reset_if_cancelled();
            return Ok(FlushResult {
                is_canceled: true,
                is_completed: false,
            });
        }
        // Nothing committed: the stream is never touched.
        if self.chain.buffered() == 0 {
            return Ok(FlushResult::default());
        }

        let Self {
            stream,
            chain,
            pool,
            ..
        } = self;

        loop {
            let segments = chain.segment_count();
            let Some(head) = chain.front_mut() else {
                break;
            };
            if head.is_empty() {
                if segments > 1 {
                    chain.release_head(pool);
                    continue;
                }
                head.rewind();
                break;
            }

            let written = match write_chunk(stream, head.memory(), token, &internal).await? {
                Some(n) => n,
                None => {
                    self.canceller.reset_if_cancelled();
                    return Ok(FlushResult {
                        is_canceled: true,
                        is_completed: false,
                    });
                }
            };
            if written == 0 {
                return Err(PipeError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            head.advance_start(written);
        }

        let flushed = match token {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(PipeError::Canceled),
                    _ = internal.cancelled() => None,
                    flushed = stream.flush() => Some(flushed),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = internal.cancelled() => None,
                    flushed = stream.flush() => Some(flushed),
                }
            }
        };
        match flushed {
            Some(flushed) => {
                flushed?;
                tracing::trace!("pipe flushed");
                Ok(FlushResult::default())
            }
            None => {
                self.canceller.reset_if_cancelled();
                Ok(FlushResult {
                    is_canceled: true,
                    is_completed: false,
                })
            }
        }
    }

    /// Copy `data` into the pipe and flush it.
    ///
    /// Empty input returns immediately without touching the stream.
    pub async fn write(&mut self, data: &[u8]) -> Result<FlushResult, PipeError> {
        if self.completed {
            return Err(PipeError::WritingAfterCompleted);
        }
        if data.is_empty() {
            return Ok(FlushResult::default());
        }
        let mut rest = data;
        while !rest.is_empty() {
            let memory = self.get_memory(rest.len().min(self.options.minimum_buffer_size))?;
            let n = memory.len().min(rest.len());
            memory[..n].copy_from_slice(&rest[..n]);
            self.advance(n)?;
            rest = &rest[n..];
        }
        self.flush().await
    }

    /// Flush what is left, release every segment and close the stream
    /// unless `leave_open` was set.
    pub async fn complete(&mut self) -> Result<(), PipeError> {
        if self.completed {
            return Ok(());
        }
        let flushed = self.flush().await;
        self.completed = true;
        self.chain.release_all(&mut self.pool);
        flushed?;
        if !self.options.leave_open {
            self.stream.shutdown().await?;
        }
        Ok(())
    }

    /// Give the stream back. Unflushed bytes are dropped.
    pub fn into_inner(self) -> W {
        self.stream
    }
}

/// Write one chunk, racing the caller token and the internal canceller.
///
/// `Ok(None)` means the internal canceller fired. A single `write` call is
/// cancel safe, so nothing is lost when another branch wins.
async fn write_chunk<W>(
    stream: &mut W,
    chunk: &[u8],
    token: Option<&CancellationToken>,
    internal: &CancellationToken,
) -> Result<Option<usize>, PipeError>
where
    W: AsyncWrite + Unpin,
{
    match token {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(PipeError::Canceled),
                _ = internal.cancelled() => Ok(None),
                written = stream.write(chunk) => Ok(Some(written?)),
            }
        }
        None => {
            tokio::select! {
                biased;
                _ = internal.cancelled() => Ok(None),
                written = stream.write(chunk) => Ok(Some(written?)),
            }
        }
    }
}

impl<W> std::fmt::Debug for StreamPipeWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipeWriter")
            .field("buffered", &self.chain.buffered())
            .field("completed", &self.completed)
            .finish()
    }
}
