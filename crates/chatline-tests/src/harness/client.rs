use anyhow::{Context, Result, bail};
use chatline::protocol::{Command, Response};
use chatline::transport::{Endpoint, IpcReader, IpcWriter};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Raw line-protocol client for integration tests.
///
/// Unlike `DaemonClient` it keeps one connection open and lets tests write
/// arbitrary bytes, so framing can be exercised directly.
pub struct TestClient {
    reader: BufReader<IpcReader>,
    writer: IpcWriter,
}

impl TestClient {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let (reader, writer) = endpoint
            .connect()
            .await
            .with_context(|| format!("failed to connect to {endpoint}"))?;
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Write bytes exactly as given.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send one command as a single line.
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');
        self.send_raw(line.as_bytes()).await
    }

    /// Read the next response line. `None` means the daemon closed the connection.
    pub async fn next_response(&mut self) -> Result<Option<Response>> {
        let mut line = String::new();
        let n = tokio::time::timeout(RESPONSE_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .context("timed out waiting for a response")??;
        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') {
            bail!("response not newline-terminated: {line:?}");
        }
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }

    /// Send a command and read its response.
    pub async fn request(&mut self, command: &Command) -> Result<Response> {
        self.send(command).await?;
        match self.next_response().await? {
            Some(resp) => Ok(resp),
            None => bail!("daemon closed the connection"),
        }
    }

    /// Whether the daemon has closed this connection.
    pub async fn is_closed(&mut self) -> bool {
        matches!(self.next_response().await, Ok(None) | Err(_))
    }
}
