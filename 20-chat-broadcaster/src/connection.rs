//! The minimal surface a session needs from a client connection.
//!
//! A [`Connection`] knows a default identity for its peer and splits into a
//! line reader and a line writer so the inbound and outbound duties can run
//! on separate tasks. [`StreamConnection`] covers any byte stream (TCP
//! sockets, in-memory pipes); the WebSocket adapter lives in [`crate::ws`].

use std::{future::Future, io};

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest inbound line (or WebSocket message) accepted from a client,
/// terminator included.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

pub trait Connection: Send + 'static {
    type Reader: LineReader;
    type Writer: LineWriter;

    /// Identity used when the client does not supply a usable name.
    fn peer(&self) -> &str;

    fn split(self) -> (Self::Reader, Self::Writer);
}

pub trait LineReader: Send + 'static {
    /// Next line without its terminator, or `None` once the peer is gone.
    fn read_line(&mut self) -> impl Future<Output = io::Result<Option<String>>> + Send;
}

pub trait LineWriter: Send + 'static {
    fn write_line(&mut self, line: &str) -> impl Future<Output = io::Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Newline-delimited text over a raw byte stream.
pub struct StreamConnection<S> {
    stream: S,
    peer: String,
}

impl<S> StreamConnection<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }
}

impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = StreamReader<ReadHalf<S>>;
    type Writer = StreamWriter<WriteHalf<S>>;

    fn peer(&self) -> &str {
        &self.peer
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (reader, writer) = tokio::io::split(self.stream);
        (
            StreamReader {
                inner: BufReader::new(reader),
            },
            StreamWriter { inner: writer },
        )
    }
}

pub struct StreamReader<R> {
    inner: BufReader<R>,
}

impl<R> LineReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        let bytes = (&mut self.inner)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes == MAX_LINE_BYTES && buf.last() != Some(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {MAX_LINE_BYTES} bytes"),
            ));
        }
        let line = String::from_utf8(buf)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
    }
}

pub struct StreamWriter<W> {
    inner: W,
}

impl<W> LineWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut encoded = Vec::with_capacity(line.len() + 1);
        encoded.extend_from_slice(line.as_bytes());
        encoded.push(b'\n');
        self.inner.write_all(&encoded).await?;
        self.inner.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reader_strips_terminators_and_reports_eof() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut reader, _writer) = StreamConnection::new(server, "peer").split();
        let (_, mut client_writer) = tokio::io::split(client);

        client_writer.write_all(b"hello\r\nworld\n\n").await.unwrap();
        client_writer.shutdown().await.unwrap();

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("world"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let (client, server) = tokio::io::duplex(2 * MAX_LINE_BYTES);
        let (mut reader, _writer) = StreamConnection::new(server, "peer").split();
        let (_, mut client_writer) = tokio::io::split(client);

        let flood = vec![b'a'; MAX_LINE_BYTES + 4_000];
        client_writer.write_all(&flood).await.unwrap();

        let err = reader.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted() {
        let (client, server) = tokio::io::duplex(2 * MAX_LINE_BYTES);
        let (mut reader, _writer) = StreamConnection::new(server, "peer").split();
        let (_, mut client_writer) = tokio::io::split(client);

        let mut line = vec![b'b'; MAX_LINE_BYTES - 1];
        line.push(b'\n');
        client_writer.write_all(&line).await.unwrap();

        let read = reader.read_line().await.unwrap().unwrap();
        assert_eq!(read.len(), MAX_LINE_BYTES - 1);
    }

    #[tokio::test]
    async fn writer_terminates_each_line() {
        let (client, server) = tokio::io::duplex(1024);
        let connection = StreamConnection::new(server, "10.0.0.1:4000");
        assert_eq!(connection.peer(), "10.0.0.1:4000");
        let (_reader, mut writer) = connection.split();

        writer.write_line("You are alice").await.unwrap();
        writer.close().await.unwrap();

        let mut client = BufReader::new(client);
        let mut received = String::new();
        client.read_line(&mut received).await.unwrap();
        assert_eq!(received, "You are alice\n");
    }
}
