//! Pipe adapters in front of axum bodies.
//!
//! ```rust,ignore
//! async fn numbers() -> Response {
//!     let (mut writer, body) = response_body_pipe();
//!     tokio::spawn(async move {
//!         for n in 0..100 {
//!             writer.write(format!("{n}\n").as_bytes()).await?;
//!         }
//!         writer.complete().await
//!     });
//!     Response::new(body)
//! }
//! ```

use std::io;

use axum::body::Body;
use etude_pipelines::{DEFAULT_BLOCK_SIZE, StreamPipeReader, StreamPipeWriter};
use futures_util::TryStreamExt;
use tokio::io::{AsyncRead, DuplexStream};
use tokio_util::io::{ReaderStream, StreamReader};

/// Read a request body through a [`StreamPipeReader`].
pub fn request_body_reader(body: Body) -> StreamPipeReader<impl AsyncRead + Unpin + Send> {
    let stream = body.into_data_stream().map_err(io::Error::other);
    StreamPipeReader::new(StreamReader::new(stream))
}

/// A [`StreamPipeWriter`] whose flushed bytes become a streaming response
/// body. The body ends when the writer is completed or dropped.
pub fn response_body_pipe() -> (StreamPipeWriter<DuplexStream>, Body) {
    let (sink, source) = tokio::io::duplex(DEFAULT_BLOCK_SIZE * 4);
    let body = Body::from_stream(ReaderStream::new(source));
    (StreamPipeWriter::new(sink), body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_request_body_reads_across_chunks() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"pipes")),
        ];
        let body = Body::from_stream(futures_util::stream::iter(chunks));
        let mut reader = request_body_reader(body);

        let mut collected = Vec::new();
        loop {
            let result = reader.read().await.unwrap();
            let buffer = result.buffer();
            collected.extend_from_slice(&buffer.to_vec());
            let completed = result.is_completed();
            let end = buffer.end();
            reader.advance_to(end).unwrap();
            if completed {
                break;
            }
        }
        assert_eq!(collected, b"hello pipes");
    }

    #[tokio::test]
    async fn test_response_pipe_streams_flushed_bytes() {
        let (mut writer, body) = response_body_pipe();
        let collect = tokio::spawn(async move { body.collect().await.unwrap().to_bytes() });

        writer.write(b"chunk one, ").await.unwrap();
        let memory = writer.get_memory(9).unwrap();
        memory[..9].copy_from_slice(b"chunk two");
        writer.advance(9).unwrap();
        writer.complete().await.unwrap();

        assert_eq!(collect.await.unwrap(), Bytes::from_static(b"chunk one, chunk two"));
    }
}
