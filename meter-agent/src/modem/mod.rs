//! Text command channel to the cellular/GNSS module
//!
//! Line-oriented AT request/response:
//! - requests are terminated with CR/LF
//! - a response ends at `OK`, `ERROR`, `+CME ERROR: <code>` or the `>` data prompt
//! - every read is bounded by a deadline, a silent module yields `Status::Timeout`

use crate::config::ModemConfig;
use crate::error::{AgentError, Result};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use tracing::debug;

/// `+CME ERROR` code: engine initialized, no data yet
pub const CME_NO_DATA: u16 = 504;
/// `+CME ERROR` code: engine not started
pub const CME_NOT_STARTED: u16 = 505;

/// Final result of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    CmeError(u16),
    Prompt,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtResponse {
    pub command: String,
    /// Intermediate lines, echo and blank lines removed
    pub lines: Vec<String>,
    pub status: Status,
}

impl AtResponse {
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// First intermediate line starting with `prefix`, prefix stripped
    pub fn payload(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|line| line.strip_prefix(prefix))
            .map(str::trim)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Error => write!(f, "ERROR"),
            Status::CmeError(code) => write!(f, "+CME ERROR: {}", code),
            Status::Prompt => write!(f, ">"),
            Status::Timeout => write!(f, "<timeout>"),
        }
    }
}

impl fmt::Display for AtResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            write!(f, "{} | ", line)?;
        }
        write!(f, "{}", self.status)
    }
}

/// AT channel over any byte stream (serial port in production, duplex pipe in tests)
pub struct AtChannel<T> {
    io: T,
    buffer: Vec<u8>,
    timeout: Duration,
}

impl AtChannel<SerialStream> {
    /// Open the modem serial port (8N1)
    pub fn open(config: &ModemConfig) -> Result<Self> {
        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One);
        let stream = SerialStream::open(&builder)
            .map_err(|e| AgentError::Transport(format!("open {}: {}", config.port, e)))?;
        Ok(Self::new(stream, config.command_timeout()))
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AtChannel<T> {
    pub fn new(io: T, timeout: Duration) -> Self {
        Self {
            io,
            buffer: Vec::with_capacity(256),
            timeout,
        }
    }

    /// Send one line (a command, or a data body after the `>` prompt) and collect
    /// its response
    pub async fn command(&mut self, line: &str) -> Result<AtResponse> {
        // leftovers belong to an earlier, already settled exchange
        self.buffer.clear();

        debug!("AT >> {}", line);
        self.io.write_all(line.as_bytes()).await?;
        self.io.write_all(b"\r\n").await?;
        self.io.flush().await?;

        let response = self.read_response(line).await?;
        debug!("AT << {}", response);
        Ok(response)
    }

    async fn read_response(&mut self, sent: &str) -> Result<AtResponse> {
        let deadline = Instant::now() + self.timeout;
        let mut lines = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_string();

                if line.is_empty() || line == sent.trim() {
                    continue;
                }
                if let Some(status) = classify(&line) {
                    return Ok(AtResponse {
                        command: sent.to_string(),
                        lines,
                        status,
                    });
                }
                lines.push(line);
            }

            if String::from_utf8_lossy(&self.buffer).trim() == ">" {
                self.buffer.clear();
                return Ok(AtResponse {
                    command: sent.to_string(),
                    lines,
                    status: Status::Prompt,
                });
            }

            let read = match tokio::time::timeout_at(deadline, self.io.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => {
                    return Ok(AtResponse {
                        command: sent.to_string(),
                        lines,
                        status: Status::Timeout,
                    })
                }
            };
            if read == 0 {
                return Err(AgentError::Transport("modem channel closed".to_string()));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

fn classify(line: &str) -> Option<Status> {
    if line == "OK" {
        return Some(Status::Ok);
    }
    if let Some(code) = line.strip_prefix("+CME ERROR:") {
        return Some(
            code.trim()
                .parse()
                .map(Status::CmeError)
                .unwrap_or(Status::Error),
        );
    }
    if line == "ERROR" || line.contains("ERROR:") {
        return Some(Status::Error);
    }
    if line == ">" {
        return Some(Status::Prompt);
    }
    None
}
