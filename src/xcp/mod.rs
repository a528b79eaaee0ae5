//! Universal Measurement and Calibration Protocol (XCP) master, with the CAN transport layer.
//! ## Example
//! ```rust
//! async fn xcp_example(bus: ecutool::can::BusHandle) {
//!     let transport = ecutool::xcp::XcpOnCan::from_bus(&bus, ecutool::xcp::XcpConfig::default());
//!     let mut xcp = ecutool::xcp::XcpClient::new(transport);
//!
//!     let info = xcp.connect(0x00).await.unwrap();
//!     println!("MAX_CTO: {}", info.max_cto);
//! }
//! ```

mod constants;
mod error;

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::Stream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::can::{AsyncCanAdapter, BusHandle, Frame, Identifier};
use crate::transport::Transport;
use crate::Result;

pub use constants::*;
pub use error::Error;

const DEFAULT_TIMEOUT_MS: u64 = 1000;
/// Command transfer object size of classic CAN
pub const DEFAULT_MAX_CTO: usize = 8;

type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

/// Identifiers and timing of an XCP on CAN link.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct XcpConfig {
    pub bus: u8,
    /// Master to slave (CMD) identifier
    pub tx_id: Identifier,
    /// Slave to master (RES/ERR) identifier
    pub rx_id: Identifier,
    pub timeout: std::time::Duration,
}

impl Default for XcpConfig {
    fn default() -> Self {
        Self {
            bus: 0,
            tx_id: Identifier::Standard(0x554),
            rx_id: Identifier::Standard(0x555),
            timeout: std::time::Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// XCP on CAN transport layer. Every command and every response is exactly one CAN frame.
pub struct XcpOnCan {
    adapter: Arc<AsyncCanAdapter>,
    bus: Option<BusHandle>,
    config: XcpConfig,
    max_cto: usize,
    /// Subscription of the last transmit, kept for [`Transport::receive`]
    rx: Mutex<Option<FrameStream>>,
}

impl XcpOnCan {
    pub fn new(adapter: Arc<AsyncCanAdapter>, config: XcpConfig) -> Self {
        Self {
            adapter,
            bus: None,
            config,
            max_cto: DEFAULT_MAX_CTO,
            rx: Mutex::new(None),
        }
    }

    pub fn from_bus(bus: &BusHandle, config: XcpConfig) -> Self {
        let adapter = Arc::new(AsyncCanAdapter::new(bus.clone()));
        Self {
            bus: Some(bus.clone()),
            ..Self::new(adapter, config)
        }
    }

    /// Command transfer object size, as announced by the last CONNECT.
    pub fn max_cto(&self) -> usize {
        self.max_cto
    }

    fn subscribe(&self) -> FrameStream {
        let rx_id = self.config.rx_id;
        Box::pin(
            self.adapter
                .recv_filter(move |frame| frame.id == rx_id && !frame.loopback),
        )
    }

    fn keep(&mut self, stream: FrameStream) {
        *self.rx.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(stream);
    }
}

async fn next_packet(timeout: std::time::Duration, stream: &mut FrameStream) -> Result<Vec<u8>> {
    let frame = tokio::time::timeout(timeout, stream.next())
        .await?
        .ok_or(crate::Error::Closed)?;
    debug!("XCP RX {}", hex::encode(&frame.data));
    Ok(frame.data)
}

#[async_trait]
impl Transport for XcpOnCan {
    async fn transmit(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        if request.len() > self.max_cto {
            return Err(Error::BlockTooLarge(request.len()).into());
        }

        let mut stream = self.subscribe();
        let frame = Frame::new(self.config.bus, self.config.tx_id, request)?;
        debug!("XCP TX {}", hex::encode(request));
        tokio::time::timeout(self.config.timeout, self.adapter.send(&frame)).await??;

        let response = next_packet(self.config.timeout, &mut stream).await;
        self.keep(stream);
        let response = response?;

        if request.first() == Some(&(CommandCode::Connect as u8))
            && response.first() == Some(&PID_RES)
            && response.len() >= 4
        {
            // Bounded by what a single CAN frame carries
            self.max_cto = (response[3] as usize).clamp(2, DEFAULT_MAX_CTO);
        }
        Ok(response)
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let pending = self.rx.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        let mut stream = match pending {
            Some(stream) => stream,
            None => self.subscribe(),
        };
        let response = next_packet(self.config.timeout, &mut stream).await;
        self.keep(stream);
        response
    }

    async fn reset(&mut self) -> Result<()> {
        *self.rx.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        self.max_cto = DEFAULT_MAX_CTO;
        if let Some(bus) = &self.bus {
            bus.reset()?;
        }
        Ok(())
    }

    fn max_block_size(&self) -> usize {
        self.max_cto
    }
}

/// Result of CONNECT
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub resource: u8,
    pub comm_mode_basic: u8,
    pub max_cto: u8,
    pub max_dto: u16,
}

/// XCP master. Wraps a [`Transport`] carrying one CTO per transmit.
pub struct XcpClient<T> {
    transport: T,
}

impl<T: Transport> XcpClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Largest command packet the slave accepts.
    pub fn max_cto(&self) -> usize {
        self.transport.max_block_size()
    }

    /// Send a raw command. Returns the response payload following the `0xFF` packet identifier.
    pub async fn command(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let response = self.transport.transmit(request).await?;
        match response.first() {
            Some(&pid) if pid == PID_RES => Ok(response[1..].to_vec()),
            Some(&pid) if pid == PID_ERR => {
                let code = response.get(1).copied().ok_or(Error::InvalidResponseLength)?;
                Err(Error::from_code(code).into())
            }
            Some(&pid) => Err(Error::InvalidPacketId(pid).into()),
            None => Err(Error::InvalidResponseLength.into()),
        }
    }

    /// CONNECT in the given mode, 0x00 for normal mode.
    pub async fn connect(&mut self, mode: u8) -> Result<ConnectInfo> {
        let resp = self.command(&[CommandCode::Connect as u8, mode]).await?;
        if resp.len() < 5 {
            return Err(Error::InvalidResponseLength.into());
        }
        let info = ConnectInfo {
            resource: resp[0],
            comm_mode_basic: resp[1],
            max_cto: resp[2],
            max_dto: u16::from_be_bytes([resp[3], resp[4]]),
        };
        info!("XCP connected, MAX_CTO {} MAX_DTO {}", info.max_cto, info.max_dto);
        Ok(info)
    }

    /// GET_SEED for a single resource. Returns the seed, whose announced length must fit the packet.
    pub async fn get_seed(&mut self, resource: Resource) -> Result<Vec<u8>> {
        let resp = self
            .command(&[CommandCode::GetSeed as u8, 0x00, resource as u8])
            .await?;
        let len = *resp.first().ok_or(Error::InvalidResponseLength)? as usize;
        if resp.len() < len + 1 {
            return Err(Error::InvalidResponseLength.into());
        }
        Ok(resp[1..len + 1].to_vec())
    }

    /// UNLOCK with a key that fits in one packet. Returns the current resource protection status.
    pub async fn unlock(&mut self, key: &[u8]) -> Result<u8> {
        if key.len() + 2 > self.max_cto() {
            return Err(Error::BlockTooLarge(key.len()).into());
        }
        let mut request = vec![CommandCode::Unlock as u8, key.len() as u8];
        request.extend(key);
        let resp = self.command(&request).await?;
        Ok(resp.first().copied().unwrap_or(0))
    }

    pub async fn program_start(&mut self) -> Result<()> {
        self.command(&[CommandCode::ProgramStart as u8]).await?;
        Ok(())
    }

    /// SET_MTA, the memory transfer address used by the following DOWNLOAD/UPLOAD/PROGRAM_CLEAR.
    pub async fn set_mta(&mut self, extension: AddressExtension, address: u32) -> Result<()> {
        let mut request = vec![CommandCode::SetMta as u8, 0x00, 0x00, extension as u8];
        request.extend(address.to_be_bytes());
        self.command(&request).await?;
        Ok(())
    }

    /// DOWNLOAD one block at the MTA, which the slave post-increments.
    pub async fn download(&mut self, data: &[u8]) -> Result<()> {
        if data.len() + 2 > self.max_cto() {
            return Err(Error::BlockTooLarge(data.len()).into());
        }
        let mut request = vec![CommandCode::Download as u8, data.len() as u8];
        request.extend(data);
        self.command(&request).await?;
        Ok(())
    }

    /// UPLOAD `size` bytes from the MTA.
    pub async fn upload(&mut self, size: usize) -> Result<Vec<u8>> {
        if size + 1 > self.max_cto() {
            return Err(Error::BlockTooLarge(size).into());
        }
        let resp = self
            .command(&[CommandCode::Upload as u8, size as u8])
            .await?;
        if resp.len() < size {
            return Err(Error::InvalidResponseLength.into());
        }
        Ok(resp[..size].to_vec())
    }

    /// PROGRAM_CLEAR `length` bytes starting at the MTA, in absolute access mode.
    pub async fn program_clear(&mut self, length: u32) -> Result<()> {
        let mut request = vec![CommandCode::ProgramClear as u8, 0x00, 0x00, 0x00];
        request.extend(length.to_be_bytes());
        self.command(&request).await?;
        Ok(())
    }

    pub async fn program_reset(&mut self) -> Result<()> {
        self.command(&[CommandCode::ProgramReset as u8]).await?;
        Ok(())
    }
}
