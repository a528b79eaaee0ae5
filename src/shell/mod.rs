//! Line-oriented command channel to a target shell, e.g. a bootloader console on a serial port.
//!
//! A command is a single line. The target answers with any number of output lines
//! followed by a status line: `OK` on success, or `ERR` and an optional message on failure.

pub mod error;

use std::pin::Pin;

use async_trait::async_trait;
use bstr::ByteSlice;
use serial2_tokio::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::transport::Transport;
use crate::Result;

pub use error::Error;

const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
/// Longest command line the target shell buffers
pub const MAX_LINE: usize = 4096;

/// Command shell over any byte stream.
pub struct ShellTransport<S> {
    stream: BufReader<S>,
    timeout: std::time::Duration,
    last_command: String,
}

impl ShellTransport<SerialPort> {
    /// Open a serial port in raw mode at `baud_rate`, 8N1 without flow control, e.g. `/dev/ttyUSB0`.
    pub fn open_serial(path: impl AsRef<std::path::Path>, baud_rate: u32) -> Result<Self> {
        let port = SerialPort::open(path.as_ref(), |mut settings: Settings| {
            settings.set_raw();
            settings.set_baud_rate(baud_rate)?;
            settings.set_char_size(CharSize::Bits8);
            settings.set_stop_bits(StopBits::One);
            settings.set_parity(Parity::None);
            settings.set_flow_control(FlowControl::None);
            Ok(settings)
        })?;
        // stale bytes from before the port was opened
        port.discard_buffers()?;

        debug!("opened {} at {} baud", path.as_ref().display(), baud_rate);
        Ok(Self::new(port))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ShellTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            timeout: std::time::Duration::from_millis(DEFAULT_TIMEOUT_MS),
            last_command: String::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a command and collect its output lines. Fails with [`Error::CommandFailed`] on an `ERR` status.
    pub async fn run(&mut self, command: &str) -> Result<Vec<String>> {
        let output = self.transmit(command.as_bytes()).await?;
        Ok(ByteSlice::lines(output.as_slice()).map(|line| line.to_str_lossy().into_owned()).collect())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = vec![];
        let n = self.stream.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(Error::Eof.into());
        }
        if line.len() > MAX_LINE {
            return Err(Error::LineTooLong(line.len()).into());
        }
        Ok(line.trim().to_vec())
    }

    async fn read_reply(&mut self) -> Result<Vec<u8>> {
        let mut output: Vec<u8> = vec![];
        loop {
            let line = self.read_line().await?;
            if line.is_empty() || line == self.last_command.as_bytes() {
                // blank lines and the echo of the command
                continue;
            }
            if line == b"OK" {
                return Ok(output);
            }
            if line.starts_with_str("ERR") {
                let message = line[3..].trim().to_str_lossy().into_owned();
                warn!("{} -> ERR {}", self.last_command, message);
                return Err(Error::CommandFailed {
                    command: self.last_command.clone(),
                    message,
                }
                .into());
            }
            if !output.is_empty() {
                output.push(b'\n');
            }
            output.extend(line);
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Transport for ShellTransport<S> {
    async fn transmit(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let command = request.trim();
        if command.len() + 1 > MAX_LINE {
            return Err(Error::LineTooLong(command.len()).into());
        }
        self.last_command = command.to_str_lossy().into_owned();
        debug!("shell> {}", command.get(..64).unwrap_or(command).as_bstr());

        let mut line = command.to_vec();
        line.extend(b"\r\n");
        let stream = self.stream.get_mut();
        stream.write_all(&line).await?;
        stream.flush().await?;

        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.read_reply()).await?
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.read_reply()).await?
    }

    /// Discards buffered, unread output.
    async fn reset(&mut self) -> Result<()> {
        let buffered = self.stream.buffer().len();
        Pin::new(&mut self.stream).consume(buffered);
        self.last_command.clear();
        Ok(())
    }

    fn max_block_size(&self) -> usize {
        MAX_LINE
    }
}
