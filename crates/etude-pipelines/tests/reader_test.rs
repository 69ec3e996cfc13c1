use std::time::Duration;

use etude_pipelines::{PipeError, StreamPipeReader, StreamPipeReaderOptions};
use tokio::io::{AsyncWriteExt, duplex};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_read_returns_buffered_data() {
    let (mut client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    client.write_all(b"hello").await.unwrap();

    let result = reader.read().await.unwrap();
    assert!(!result.is_canceled());
    assert!(!result.is_completed());
    assert_eq!(result.buffer().to_vec(), b"hello");
}

#[tokio::test]
async fn test_unexamined_data_is_returned_without_reading() {
    let (mut client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    client.write_all(b"GET ").await.unwrap();

    let result = reader.read().await.unwrap();
    let start = result.buffer().start();
    reader.advance_to_examined(start, start).unwrap();

    client.write_all(b"/ HTTP/1.1").await.unwrap();
    let result = reader.read().await.unwrap();
    assert_eq!(result.buffer().to_vec(), b"GET ");
}

#[tokio::test]
async fn test_examining_everything_forces_a_stream_read() {
    let (mut client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    client.write_all(b"hel").await.unwrap();

    let result = reader.read().await.unwrap();
    let buffer = result.buffer();
    let (start, end) = (buffer.start(), buffer.end());
    reader.advance_to_examined(start, end).unwrap();

    client.write_all(b"lo").await.unwrap();
    let result = reader.read().await.unwrap();
    assert_eq!(result.buffer().to_vec(), b"hello");
}

#[tokio::test]
async fn test_consumed_bytes_are_gone() {
    let (mut client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    client.write_all(b"line one\nline two").await.unwrap();

    let result = reader.read().await.unwrap();
    let buffer = result.buffer();
    let eol = buffer.find(b'\n').unwrap();
    let after = buffer.slice((eol.offset() - buffer.start().offset()) as usize + 1);
    let next = after.start();
    reader.advance_to(next).unwrap();

    let result = reader.read().await.unwrap();
    assert_eq!(result.buffer().to_vec(), b"line two");
    assert_eq!(reader.buffered(), 8);
}

#[tokio::test]
async fn test_data_spanning_segments_releases_blocks() {
    let (mut client, server) = duplex(64);
    let options = StreamPipeReaderOptions {
        buffer_size: 8,
        minimum_read_size: 4,
        leave_open: false,
    };
    let mut reader = StreamPipeReader::with_options(server, options);
    client.write_all(b"0123456789abcdefghij").await.unwrap();
    drop(client);

    loop {
        let result = reader.read().await.unwrap();
        let buffer = result.buffer();
        let (start, end) = (buffer.start(), buffer.end());
        if result.is_completed() {
            assert_eq!(buffer.len(), 20);
            assert_eq!(buffer.to_vec(), b"0123456789abcdefghij");
            assert!(buffer.chunks().count() >= 3);
            reader.advance_to(end).unwrap();
            break;
        }
        reader.advance_to_examined(start, end).unwrap();
    }

    assert_eq!(reader.buffered(), 0);
    assert_eq!(reader.rented_blocks(), 0);
}

#[tokio::test]
async fn test_end_of_stream_completes() {
    let mut reader = StreamPipeReader::new(&b""[..]);
    let result = reader.read().await.unwrap();
    assert!(result.is_completed());
    assert!(result.buffer().is_empty());
}

#[tokio::test]
async fn test_advance_before_read_fails() {
    let (_client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    let (mut other_client, other_server) = duplex(64);
    other_client.write_all(b"x").await.unwrap();
    let mut other = StreamPipeReader::new(other_server);
    let position = other.read().await.unwrap().buffer().start();

    let err = reader.advance_to(position).unwrap_err();
    assert!(matches!(err, PipeError::NoDataRead));
}

#[tokio::test]
async fn test_advance_outside_buffer_fails() {
    let (mut client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    client.write_all(b"abc").await.unwrap();

    let result = reader.read().await.unwrap();
    let buffer = result.buffer();
    let (start, end) = (buffer.start(), buffer.end());

    let err = reader.advance_to_examined(end, start).unwrap_err();
    assert!(matches!(err, PipeError::InvalidPosition));
}

#[tokio::test]
async fn test_read_after_complete_fails() {
    let (_client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    reader.complete();

    let err = reader.read().await.unwrap_err();
    assert!(matches!(err, PipeError::ReadingAfterCompleted));
}

#[tokio::test]
async fn test_cancel_pending_read_reports_canceled() {
    let (mut client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    let canceller = reader.canceller();

    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });
    let result = reader.read().await.unwrap();
    assert!(result.is_canceled());
    assert!(result.buffer().is_empty());
    cancel.await.unwrap();

    client.write_all(b"after").await.unwrap();
    let result = reader.read().await.unwrap();
    assert!(!result.is_canceled());
    assert_eq!(result.buffer().to_vec(), b"after");
}

#[tokio::test]
async fn test_cancel_before_read_applies_to_next_read() {
    let (_client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    reader.cancel_pending_read();

    let result = reader.read().await.unwrap();
    assert!(result.is_canceled());
}

#[tokio::test]
async fn test_caller_token_cancellation_is_an_error() {
    let (_client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });
    let err = reader.read_with_token(&token).await.unwrap_err();
    assert!(err.is_canceled());
}

#[tokio::test]
async fn test_try_read_never_waits() {
    let (mut client, server) = duplex(64);
    let mut reader = StreamPipeReader::new(server);
    assert!(reader.try_read().unwrap().is_none());

    client.write_all(b"ping").await.unwrap();
    reader.read().await.unwrap();
    let result = reader.try_read().unwrap().unwrap();
    assert_eq!(result.buffer().to_vec(), b"ping");
}

#[tokio::test]
async fn test_copy_to_drains_stream() {
    let source = b"the quick brown fox jumps over the lazy dog".repeat(200);
    let mut reader = StreamPipeReader::new(&source[..]);
    let mut sink = Vec::new();

    let copied = reader.copy_to(&mut sink).await.unwrap();
    assert_eq!(copied, source.len() as u64);
    assert_eq!(sink, source);
}
