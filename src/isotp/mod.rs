//! ISO 15765-2 transport (ISO-TP): segments packets of up to 4095 bytes into CAN or CAN FD frames.
//! ## Example:
//! ```rust
//! use ecutool::transport::Transport;
//!
//! async fn isotp_example(bus: ecutool::can::BusHandle) {
//!    let config = ecutool::isotp::IsoTPConfig::new(0, ecutool::can::Identifier::Standard(0x7a1));
//!    let mut isotp = ecutool::isotp::IsoTPAdapter::from_bus(&bus, config);
//!
//!    let response = isotp.transmit(&[0x3e, 0x00]).await.unwrap();
//! }
//! ```

mod constants;
pub mod error;
mod types;

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use crate::can::{padded_len, AsyncCanAdapter, BusHandle, Frame, Identifier};
use crate::error::Error;
use crate::isotp::constants::{FlowStatus, FrameType};
use crate::transport::Transport;
use crate::Result;

pub use types::FlowControlConfig;

use async_trait::async_trait;
use futures::stream::Stream;
use tokio_stream::StreamExt;
use tracing::debug;

const DEFAULT_TIMEOUT_MS: u64 = 1000;
/// Largest payload addressable by the 12 bit first frame length.
pub const MAX_PAYLOAD: usize = 4095;

type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

/// Addressing and timing of one ISO-TP link.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsoTPConfig {
    pub bus: u8,
    /// Transmit ID
    pub tx_id: Identifier,
    /// Receive ID
    pub rx_id: Identifier,
    /// Transmit Data Length, 8 for classic CAN, up to 64 for CAN-FD
    pub tx_dl: usize,
    /// Fill byte for short frames
    pub padding: u8,
    /// Longest wait for the next frame of a packet
    pub timeout: std::time::Duration,
}

impl IsoTPConfig {
    pub fn new(bus: u8, id: Identifier) -> Self {
        let tx_id = id;
        let rx_id = match id {
            Identifier::Standard(id) => Identifier::Standard(id + 8),
            Identifier::Extended(id) => {
                let bytes = id.to_be_bytes();
                let id = u32::from_be_bytes([bytes[0], bytes[1], bytes[3], bytes[2]]); // Swap last two bytes
                Identifier::Extended(id)
            }
        };
        Self::with_ids(bus, tx_id, rx_id)
    }

    /// Configuration for an explicit request/response identifier pair.
    pub fn with_ids(bus: u8, tx_id: Identifier, rx_id: Identifier) -> Self {
        Self {
            bus,
            tx_id,
            rx_id,
            tx_dl: 8,
            padding: 0xaa,
            timeout: std::time::Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Largest payload that still fits in a single frame.
    fn max_sf_dl(&self) -> usize {
        if self.tx_dl > 8 {
            self.tx_dl - 2
        } else {
            self.tx_dl - 1
        }
    }
}

/// Wraps a CAN adapter to provide a simple interface for sending and receiving ISO-TP frames.
pub struct IsoTPAdapter {
    adapter: Arc<AsyncCanAdapter>,
    bus: Option<BusHandle>,
    config: IsoTPConfig,
    /// Subscription of the last transmit, kept for [`Transport::receive`]
    rx: Mutex<Option<FrameStream>>,
}

impl IsoTPAdapter {
    /// Share an existing async adapter, e.g. to run several links on one bus.
    pub fn new(adapter: Arc<AsyncCanAdapter>, config: IsoTPConfig) -> Self {
        Self {
            adapter,
            bus: None,
            config,
            rx: Mutex::new(None),
        }
    }

    /// Create an adapter on a bus handle. [`Transport::reset`] will also reset the bus.
    pub fn from_bus(bus: &BusHandle, config: IsoTPConfig) -> Self {
        let adapter = Arc::new(AsyncCanAdapter::new(bus.clone()));
        Self {
            bus: Some(bus.clone()),
            ..Self::new(adapter, config)
        }
    }

    pub fn config(&self) -> &IsoTPConfig {
        &self.config
    }

    fn subscribe(&self) -> FrameStream {
        let rx_id = self.config.rx_id;
        Box::pin(
            self.adapter
                .recv_filter(move |frame| frame.id == rx_id && !frame.loopback),
        )
    }

    fn pad(&self, data: &mut Vec<u8>) {
        let len = if self.config.tx_dl > 8 {
            padded_len(data.len()).unwrap_or(self.config.tx_dl).max(8)
        } else {
            self.config.tx_dl
        };
        data.resize(len.max(data.len()), self.config.padding);
    }

    async fn send_frame(&self, buf: &[u8]) -> Result<()> {
        let frame = Frame::new(self.config.bus, self.config.tx_id, buf)?;
        tokio::time::timeout(self.config.timeout, self.adapter.send(&frame)).await?
    }

    async fn next_frame(&self, stream: &mut FrameStream) -> Result<Frame> {
        let frame = tokio::time::timeout(self.config.timeout, stream.next())
            .await?
            .ok_or(Error::Closed)?;
        if frame.data.is_empty() {
            return Err(error::Error::MalformedFrame.into());
        }
        Ok(frame)
    }

    async fn send_single_frame(&self, data: &[u8]) -> Result<()> {
        let mut buf = if data.len() <= 7 {
            vec![FrameType::Single as u8 | data.len() as u8]
        } else {
            // CAN-FD escape sequence, length in the second byte
            vec![FrameType::Single as u8, data.len() as u8]
        };
        buf.extend(data);
        self.pad(&mut buf);

        debug!("TX SF, length: {} data {}", data.len(), hex::encode(&buf));
        self.send_frame(&buf).await
    }

    async fn send_first_frame(&self, data: &[u8]) -> Result<()> {
        // 12 bit length, checked against MAX_PAYLOAD by the caller
        let [high, low] = (data.len() as u16).to_be_bytes();
        let mut buf = vec![FrameType::First as u8 | (high & 0x0f), low];
        buf.extend(&data[..self.config.tx_dl - 2]);

        debug!("TX FF, length {}: {}", data.len(), hex::encode(&buf));
        self.send_frame(&buf).await
    }

    async fn send_consecutive_frame(&self, chunk: &[u8], index: u8) -> Result<()> {
        let mut buf = vec![FrameType::Consecutive as u8 | (index & 0x0f)];
        buf.extend(chunk);
        self.pad(&mut buf);

        debug!("TX CF {}", hex::encode(&buf));
        self.send_frame(&buf).await
    }

    /// Wait for a flow control frame that allows sending, skipping WAIT frames.
    async fn recv_flow_control(&self, stream: &mut FrameStream) -> Result<FlowControlConfig> {
        loop {
            let frame = self.next_frame(stream).await?;
            if FrameType::from(frame.data[0]) != FrameType::FlowControl {
                return Err(error::Error::FlowControl.into());
            }
            debug!("RX FC, data {}", hex::encode(&frame.data));

            match FlowStatus::from(frame.data[0]) {
                FlowStatus::ContinueToSend => return FlowControlConfig::try_from(&frame),
                FlowStatus::Wait => continue,
                FlowStatus::Overflow | FlowStatus::Unknown => return Err(error::Error::FlowControl.into()),
            }
        }
    }

    async fn send_multiple(&self, data: &[u8], stream: &mut FrameStream) -> Result<()> {
        self.send_first_frame(data).await?;
        let mut fc = self.recv_flow_control(stream).await?;

        let chunks = data[self.config.tx_dl - 2..].chunks(self.config.tx_dl - 1);
        let mut sent_in_block: usize = 0;
        // Sequence numbers start at 1 after the first frame and wrap to 0
        let indices = (1..=0x0fu8).chain((0..=0x0f).cycle());
        for (i, (chunk, index)) in chunks.zip(indices).enumerate() {
            if fc.block_size > 0 && sent_in_block == fc.block_size as usize {
                fc = self.recv_flow_control(stream).await?;
                sent_in_block = 0;
            }
            if i > 0 && !fc.separation_time_min.is_zero() {
                tokio::time::sleep(fc.separation_time_min).await;
            }
            self.send_consecutive_frame(chunk, index).await?;
            sent_in_block += 1;
        }

        Ok(())
    }

    /// Send an ISO-TP packet of up to 4095 bytes. Flow control frames are read from `stream`.
    async fn send_with(&self, data: &[u8], stream: &mut FrameStream) -> Result<()> {
        debug!("TX {}", hex::encode(data));

        if data.len() <= self.config.max_sf_dl() {
            self.send_single_frame(data).await
        } else if data.len() <= MAX_PAYLOAD {
            self.send_multiple(data, stream).await
        } else {
            Err(error::Error::DataTooLarge.into())
        }
    }

    /// Flow control answering a first frame: continue to send, no block limit, no separation time.
    async fn send_flow_control(&self) -> Result<()> {
        let mut buf = vec![FrameType::FlowControl as u8 | FlowStatus::ContinueToSend as u8, 0x00, 0x00];
        self.pad(&mut buf);
        debug!("TX FC {}", hex::encode(&buf));
        self.send_frame(&buf).await
    }

    /// Receive a single ISO-TP packet from the provided CAN stream. Flow control frames on the stream are skipped.
    async fn recv_from_stream(&self, stream: &mut FrameStream) -> Result<Vec<u8>> {
        let mut packet: Option<Reassembly> = None;

        loop {
            let frame = self.next_frame(stream).await?;
            let pci = frame.data[0];

            match FrameType::from(pci) {
                FrameType::Single => {
                    let payload = single_frame_payload(&frame.data)?;
                    debug!("RX SF {}", hex::encode(payload));
                    return Ok(payload.to_vec());
                }
                FrameType::First => {
                    let [_, low, ref first @ ..] = frame.data[..] else {
                        return Err(error::Error::MalformedFrame.into());
                    };
                    let len = (((pci & 0x0f) as usize) << 8) | low as usize;
                    debug!("RX FF, length {}: {}", len, hex::encode(&frame.data));
                    packet = Some(Reassembly::new(len, first));
                    self.send_flow_control().await?;
                }
                FrameType::Consecutive => {
                    let reassembly = packet.as_mut().ok_or(error::Error::OutOfOrder)?;
                    debug!("RX CF {}", hex::encode(&frame.data));
                    reassembly.push(pci & 0x0f, &frame.data[1..])?;
                }
                FrameType::FlowControl => continue,
                FrameType::Unknown => return Err(error::Error::UnknownFrameType.into()),
            }

            match packet.take() {
                Some(done) if done.is_complete() => {
                    debug!("RX {}", hex::encode(&done.data));
                    return Ok(done.data);
                }
                pending => packet = pending,
            }
        }
    }

    /// Send an ISO-TP packet without waiting for a response. Returns [`Error::Timeout`] if the ECU is not responding in time with flow control messages.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let mut stream = self.subscribe();
        self.send_with(data, &mut stream).await
    }

    /// Receive the next ISO-TP packet. Returns [`Error::Timeout`] if the timeout is exceeded between individual ISO-TP frames. Note the total time to receive a packet may be longer than the timeout.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        let mut stream = self.subscribe();
        self.recv_from_stream(&mut stream).await
    }
}

#[async_trait]
impl Transport for IsoTPAdapter {
    async fn transmit(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        // Subscribe before sending so a fast response is not missed
        let mut stream = self.subscribe();
        self.send_with(request, &mut stream).await?;
        let response = self.recv_from_stream(&mut stream).await;
        *self.rx.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(stream);
        response
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        let pending = self.rx.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        let mut stream = match pending {
            Some(stream) => stream,
            None => self.subscribe(),
        };
        let response = self.recv_from_stream(&mut stream).await;
        *self.rx.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(stream);
        response
    }

    async fn reset(&mut self) -> Result<()> {
        *self.rx.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        if let Some(bus) = &self.bus {
            bus.reset()?;
        }
        Ok(())
    }

    fn max_block_size(&self) -> usize {
        MAX_PAYLOAD
    }
}

/// Payload of a single frame. With CAN FD the PCI length is 0 and the length moves to the second byte.
fn single_frame_payload(data: &[u8]) -> Result<&[u8]> {
    let (start, len) = match data[0] & 0x0f {
        0 if data.len() > 8 => (2, data[1] as usize),
        0 => return Err(error::Error::MalformedFrame.into()),
        len => (1, len as usize),
    };
    data.get(start..start + len)
        .ok_or_else(|| error::Error::MalformedFrame.into())
}

/// Multi-frame packet being reassembled.
struct Reassembly {
    len: usize,
    data: Vec<u8>,
    next_index: u8,
}

impl Reassembly {
    fn new(len: usize, first: &[u8]) -> Self {
        Self {
            len,
            data: first[..first.len().min(len)].to_vec(),
            next_index: 1,
        }
    }

    /// Append a consecutive frame. Padding past the announced length is dropped.
    fn push(&mut self, index: u8, payload: &[u8]) -> Result<()> {
        if index != self.next_index {
            return Err(error::Error::OutOfOrder.into());
        }
        let take = (self.len - self.data.len()).min(payload.len());
        self.data.extend(&payload[..take]);
        self.next_index = (self.next_index + 1) & 0x0f;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.data.len() >= self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::VirtualBus;

    /// ECU side of an ISO-TP link that answers every request with its reverse.
    fn spawn_reverse_echo(medium: &VirtualBus, tx_dl: usize) {
        let ecu_bus = BusHandle::new(0, medium.endpoint(0));
        let mut config = IsoTPConfig::with_ids(0, Identifier::Standard(0x7a9), Identifier::Standard(0x7a1));
        config.tx_dl = tx_dl;
        let ecu = IsoTPAdapter::from_bus(&ecu_bus, config);
        let mut stream = ecu.subscribe();
        tokio::spawn(async move {
            while let Ok(request) = ecu.recv_from_stream(&mut stream).await {
                let response: Vec<u8> = request.into_iter().rev().collect();
                if ecu.send_with(&response, &mut stream).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn roundtrip(len: usize, tx_dl: usize) {
        let medium = VirtualBus::new();
        spawn_reverse_echo(&medium, tx_dl);

        let bus = BusHandle::new(0, medium.endpoint(0));
        let mut config = IsoTPConfig::new(0, Identifier::Standard(0x7a1));
        config.tx_dl = tx_dl;
        let mut isotp = IsoTPAdapter::from_bus(&bus, config);

        let request: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let response = isotp.transmit(&request).await.unwrap();

        let expected: Vec<u8> = request.into_iter().rev().collect();
        assert_eq!(response, expected);
    }

    #[tokio::test]
    async fn single_frame() {
        roundtrip(7, 8).await;
    }

    #[tokio::test]
    async fn multi_frame_with_index_overflow() {
        roundtrip(256, 8).await;
    }

    #[tokio::test]
    async fn fd_single_frame_escape() {
        roundtrip(40, 64).await;
    }

    #[tokio::test]
    async fn fd_multi_frame() {
        roundtrip(300, 64).await;
    }

    #[tokio::test]
    async fn data_too_large() {
        let medium = VirtualBus::new();
        let bus = BusHandle::new(0, medium.endpoint(0));
        let isotp = IsoTPAdapter::from_bus(&bus, IsoTPConfig::new(0, 0x7a1.into()));

        let result = isotp.send(&[0; MAX_PAYLOAD + 1]).await;
        assert!(matches!(result, Err(Error::IsoTPError(error::Error::DataTooLarge))));
    }

    #[tokio::test]
    async fn timeout_without_ecu() {
        let medium = VirtualBus::new();
        let bus = BusHandle::new(0, medium.endpoint(0));
        let mut config = IsoTPConfig::new(0, 0x7a1.into());
        config.timeout = std::time::Duration::from_millis(20);
        let mut isotp = IsoTPAdapter::from_bus(&bus, config);

        assert!(matches!(isotp.transmit(&[0x3e, 0x00]).await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn closed_bus_fails_the_transmit() {
        let medium = VirtualBus::new();
        let bus = BusHandle::new(0, medium.endpoint(0));
        let mut config = IsoTPConfig::new(0, 0x7a1.into());
        config.timeout = std::time::Duration::from_millis(20);
        let mut isotp = IsoTPAdapter::from_bus(&bus, config);
        bus.close();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), isotp.transmit(&[0x3e, 0x00])).await;
        assert!(matches!(result, Ok(Err(Error::Closed | Error::Timeout))));
    }

    #[test]
    fn single_frame_payloads() {
        assert_eq!(single_frame_payload(&[0x03, 0x22, 0xf1, 0x90, 0xaa]).unwrap(), &[0x22, 0xf1, 0x90]);
        assert!(single_frame_payload(&[0x00, 0x01, 0xaa]).is_err());
        assert!(single_frame_payload(&[0x07, 0x01]).is_err());

        let mut fd = vec![0x00, 0x0a];
        fd.resize(12, 0x55);
        assert_eq!(single_frame_payload(&fd).unwrap(), &[0x55; 10]);
    }

    #[test]
    fn reassembly_checks_sequence() {
        let mut packet = Reassembly::new(14, &[0, 1, 2, 3, 4, 5]);
        assert!(packet.push(2, &[0; 7]).is_err());

        let mut packet = Reassembly::new(14, &[0, 1, 2, 3, 4, 5]);
        packet.push(1, &[6, 7, 8, 9, 10, 11, 12]).unwrap();
        assert!(!packet.is_complete());
        packet.push(2, &[13, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]).unwrap();
        assert!(packet.is_complete());
        assert_eq!(packet.data, (0..14).collect::<Vec<u8>>());
    }
}
