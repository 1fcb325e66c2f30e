use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn tcp_clients_chat_through_the_binary() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-broadcaster");

    let (mut server_child, mut server_stdout) = spawn_server(&binary).await?;
    let http_addr = read_banner_addr(&mut server_stdout, "listening at").await?;
    let tcp_addr = read_banner_addr(&mut server_stdout, "tcp listening at").await?;
    assert_ne!(http_addr, tcp_addr);

    // Drain additional server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let mut alice = ChatClient::join(&tcp_addr, "alice").await?;
    alice.expect("You are alice", "alice welcome").await?;

    let mut bob = ChatClient::join(&tcp_addr, "bob").await?;
    bob.expect("You are bob", "bob welcome").await?;
    bob.expect("alice is here.", "bob roster").await?;
    alice.expect("bob has arrived", "alice sees bob arrive").await?;

    alice.send_line("Hello from Alice").await?;
    alice.expect("alice: Hello from Alice", "alice echo").await?;
    bob.expect("alice: Hello from Alice", "bob hears alice").await?;

    bob.send_line("Hi Alice!").await?;
    alice.expect("bob: Hi Alice!", "alice hears bob").await?;
    bob.expect("bob: Hi Alice!", "bob echo").await?;

    // Bob hangs up without any goodbye.
    drop(bob);
    alice.expect("bob has left", "alice sees bob leave").await?;

    drop(alice);
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

struct ChatClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ChatClient {
    async fn join(addr: &str, name: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        client.send_line(name).await?;
        Ok(client)
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn expect(&mut self, expected: &str, description: &str) -> Result<()> {
        let line = read_line(&mut self.reader)
            .await
            .with_context(|| format!("{description}: failed to read line"))?
            .ok_or_else(|| anyhow!("{description}: stream closed"))?;
        if line != expected {
            return Err(anyhow!("{description}: expected '{expected}', got '{line}'"));
        }
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("127.0.0.1:0")
        .arg("--tcp-listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_banner_addr(reader: &mut BufReader<ChildStdout>, marker: &str) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("server did not emit listening address")?;
    if !line.contains(marker) {
        return Err(anyhow!("expected banner containing '{marker}', got: {line}"));
    }
    let addr = line
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("server banner missing socket: {line}"));
    }
    Ok(addr.to_string())
}

async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes_io = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}
