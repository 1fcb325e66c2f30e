//! WebSocket adapter: text frames in, one text frame per outbound line.

use std::{collections::VecDeque, io, net::SocketAddr};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tracing::trace;

use crate::connection::{Connection, LineReader, LineWriter};

pub struct WsConnection {
    socket: WebSocket,
    peer: String,
}

impl WsConnection {
    pub fn new(socket: WebSocket, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer: peer.to_string(),
        }
    }
}

impl Connection for WsConnection {
    type Reader = WsReader;
    type Writer = WsWriter;

    fn peer(&self) -> &str {
        &self.peer
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.socket.split();
        (
            WsReader {
                stream,
                pending: VecDeque::new(),
            },
            WsWriter { sink },
        )
    }
}

pub struct WsReader {
    stream: SplitStream<WebSocket>,
    pending: VecDeque<String>,
}

impl LineReader for WsReader {
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }

            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => self.pending.extend(split_frame(&text)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(other)) => trace!(?other, "ignoring non-text frame"),
                Some(Err(err)) => return Err(io::Error::other(err)),
            }
        }
    }
}

/// A frame may carry several newline-separated lines; a single trailing
/// newline does not start another one.
fn split_frame(text: &str) -> impl Iterator<Item = String> + '_ {
    let body = text.strip_suffix('\n').unwrap_or(text);
    body.split('\n')
        .map(|line| line.trim_end_matches('\r').to_string())
}

pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

impl LineWriter for WsWriter {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.sink
            .send(Message::Text(line.to_string()))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.sink.close().await.map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::split_frame;

    #[test]
    fn frames_split_into_lines() {
        let lines: Vec<_> = split_frame("hi\r\nthere\n").collect();
        assert_eq!(lines, vec!["hi", "there"]);

        let single: Vec<_> = split_frame("no newline").collect();
        assert_eq!(single, vec!["no newline"]);

        let empty: Vec<_> = split_frame("").collect();
        assert_eq!(empty, vec![""]);
    }
}
