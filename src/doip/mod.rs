//! Diagnostics over Internet Protocol (DoIP) transport, implements the tester side of ISO 13400-2.
//! ## Example
//! ```rust
//! use ecutool::transport::Transport;
//!
//! async fn doip_example() {
//!     let config = ecutool::doip::DoIpConfig::from_address("192.168.0.10:13400").unwrap();
//!     let mut doip = ecutool::doip::DoIpTransport::new(config);
//!
//!     let response = doip.transmit(&[0x3e, 0x00]).await.unwrap();
//! }
//! ```

mod constants;
pub mod error;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::transport::Transport;
use crate::Result;

pub use constants::*;
pub use error::Error;

const DEFAULT_TIMEOUT_MS: u64 = 2000;
const MAX_PAYLOAD_LEN: usize = 0x10_0000;

/// Byte stream a DoIP connection runs on.
pub trait DoIpStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DoIpStream for T {}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DoIpConfig {
    /// `host:port` of the DoIP entity
    pub address: String,
    /// Logical address of this tester
    pub source_address: u16,
    /// Logical address of the target ECU
    pub target_address: u16,
    pub timeout: std::time::Duration,
    /// Largest diagnostic message accepted by the entity
    pub max_request: usize,
}

impl DoIpConfig {
    /// Configuration for `host:port`, or `host` on the default port.
    pub fn from_address(address: &str) -> Result<Self> {
        let address = address.trim();
        let address = match address.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() || port.parse::<u16>().is_err() {
                    return Err(Error::InvalidAddress(address.to_owned()).into());
                }
                address.to_owned()
            }
            None if !address.is_empty() => format!("{}:{}", address, DEFAULT_PORT),
            None => return Err(Error::InvalidAddress(address.to_owned()).into()),
        };

        Ok(Self {
            address,
            source_address: 0x0e80,
            target_address: 0x0001,
            timeout: std::time::Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_request: 0xffff,
        })
    }
}

/// UDS over DoIP. Connects lazily and activates routing before the first diagnostic message.
pub struct DoIpTransport {
    config: DoIpConfig,
    stream: Option<Box<dyn DoIpStream>>,
    activated: bool,
}

impl DoIpTransport {
    pub fn new(config: DoIpConfig) -> Self {
        Self {
            config,
            stream: None,
            activated: false,
        }
    }

    /// Run the protocol on an already established byte stream.
    pub fn with_stream(config: DoIpConfig, stream: impl DoIpStream + 'static) -> Self {
        Self {
            config,
            stream: Some(Box::new(stream)),
            activated: false,
        }
    }

    fn stream(&mut self) -> Result<&mut Box<dyn DoIpStream>> {
        self.stream.as_mut().ok_or(crate::Error::Closed)
    }

    async fn write_message(&mut self, payload_type: PayloadType, payload: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.push(PROTOCOL_VERSION);
        buf.push(!PROTOCOL_VERSION);
        buf.extend((payload_type as u16).to_be_bytes());
        buf.extend((payload.len() as u32).to_be_bytes());
        buf.extend(payload);

        let stream = self.stream()?;
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<(u16, Vec<u8>)> {
        let stream = self.stream()?;

        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;
        if header[0] != !header[1] {
            return Err(Error::InvalidHeader.into());
        }

        let payload_type = u16::from_be_bytes([header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(Error::InvalidHeader.into());
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok((payload_type, payload))
    }

    async fn activate_routing(&mut self) -> Result<()> {
        let mut payload = self.config.source_address.to_be_bytes().to_vec();
        payload.push(ACTIVATION_TYPE_DEFAULT);
        payload.extend([0u8; 4]);
        self.write_message(PayloadType::RoutingActivationRequest, &payload)
            .await?;

        let timeout = self.config.timeout;
        let (payload_type, payload) = tokio::time::timeout(timeout, self.read_message()).await??;
        match PayloadType::from(payload_type) {
            PayloadType::RoutingActivationResponse => {
                let code = *payload.get(4).ok_or(Error::InvalidHeader)?;
                if code == ACTIVATION_SUCCESS || code == ACTIVATION_CONFIRMATION_REQUIRED {
                    info!("DoIP routing activated on {}", self.config.address);
                    Ok(())
                } else {
                    Err(Error::RoutingActivationDenied(code).into())
                }
            }
            PayloadType::GenericNack => {
                Err(Error::GenericNack(payload.first().copied().unwrap_or(0)).into())
            }
            _ => Err(Error::UnexpectedPayload(payload_type).into()),
        }
    }

    /// Wait for the next diagnostic message from the target, acknowledging alive checks on the way.
    async fn wait_for_diagnostic(&mut self) -> Result<Vec<u8>> {
        loop {
            let (payload_type, payload) = self.read_message().await?;
            match PayloadType::from(payload_type) {
                PayloadType::DiagnosticMessage if payload.len() >= 4 => {
                    let source = u16::from_be_bytes([payload[0], payload[1]]);
                    if source != self.config.target_address {
                        debug!("Ignoring diagnostic message from {:#06x}", source);
                        continue;
                    }
                    let data = payload[4..].to_vec();
                    debug!("DoIP RX {}", hex::encode(&data[..data.len().min(16)]));
                    return Ok(data);
                }
                PayloadType::DiagnosticMessageAck => continue,
                PayloadType::DiagnosticMessageNack => {
                    let code = payload.get(4).copied().unwrap_or(0);
                    return Err(Error::DiagnosticNack(code).into());
                }
                PayloadType::AliveCheckRequest => {
                    let source = self.config.source_address.to_be_bytes();
                    self.write_message(PayloadType::AliveCheckResponse, &source)
                        .await?;
                }
                PayloadType::GenericNack => {
                    return Err(Error::GenericNack(payload.first().copied().unwrap_or(0)).into());
                }
                _ => warn!("Unexpected DoIP payload type {:#06x}", payload_type),
            }
        }
    }
}

#[async_trait]
impl Transport for DoIpTransport {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_none() {
            info!("Connecting to DoIP entity {}", self.config.address);
            let stream = tokio::time::timeout(self.config.timeout, TcpStream::connect(&self.config.address)).await??;
            stream.set_nodelay(true)?;
            self.stream = Some(Box::new(stream));
        }
        if !self.activated {
            self.activate_routing().await?;
            self.activated = true;
        }
        Ok(())
    }

    async fn transmit(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.open().await?;

        let mut payload = self.config.source_address.to_be_bytes().to_vec();
        payload.extend(self.config.target_address.to_be_bytes());
        payload.extend(request);
        self.write_message(PayloadType::DiagnosticMessage, &payload)
            .await?;

        let timeout = self.config.timeout;
        tokio::time::timeout(timeout, self.wait_for_diagnostic()).await?
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let timeout = self.config.timeout;
        tokio::time::timeout(timeout, self.wait_for_diagnostic()).await?
    }

    /// Drops the connection. The next transmit reconnects and activates routing again.
    async fn reset(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.activated = false;
        Ok(())
    }

    fn max_block_size(&self) -> usize {
        self.config.max_request
    }
}
