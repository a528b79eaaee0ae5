//! Unified Diagnostic Services (UDS) Client, implements ISO 14229
//! ## Example
//! ```rust
//! use ecutool::transport::Transport;
//!
//! async fn uds_example(bus: ecutool::can::BusHandle) {
//!     let config = ecutool::isotp::IsoTPConfig::new(0, ecutool::can::Identifier::Standard(0x7a1));
//!     let isotp = ecutool::isotp::IsoTPAdapter::from_bus(&bus, config);
//!     let mut uds = ecutool::uds::UDSClient::new(isotp);
//!
//!     uds.tester_present().await.unwrap();
//!     let seed = uds.security_access(0x01, None).await.unwrap();
//!
//!     println!("Seed: {}", hex::encode(seed));
//! }
//! ```

mod constants;
mod error;
mod types;

use crate::transport::Transport;
use crate::Result;
pub use constants::*;
pub use error::{Error, NegativeResponseCode};
pub use types::*;

use tracing::{debug, info};

/// UDS Client. Wraps a [`Transport`] to provide a simple interface for making UDS calls.
pub struct UDSClient<T> {
    transport: T,
}

impl<T: Transport> UDSClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Send a request and validate the answer. The positive response SID and the echoed sub function are checked,
    /// negative responses become [`Error::NegativeResponse`] and ResponsePending is waited through. Returns the
    /// response data after the SID and sub function.
    pub async fn request(&mut self, sid: u8, sub_function: Option<u8>, data: Option<&[u8]>) -> Result<Vec<u8>> {
        let request: Vec<u8> = std::iter::once(sid)
            .chain(sub_function)
            .chain(data.unwrap_or_default().iter().copied())
            .collect();

        let service = ServiceIdentifier::from_repr(sid);
        debug!("UDS {:?} request {}", service, hex::encode(&request[..request.len().min(16)]));
        let mut response = self.transport.transmit(&request).await?;

        while let [NEGATIVE_RESPONSE, _, code, ..] = response[..] {
            if NegativeResponseCode::from_repr(code) != Some(NegativeResponseCode::ResponsePending) {
                return Err(Error::negative(code).into());
            }
            info!("UDS {:?} response pending", service);
            response = self.transport.receive().await?;
        }

        let header = 1 + sub_function.map_or(0, |_| 1);
        match (response.first(), sub_function) {
            (None, _) | (Some(&NEGATIVE_RESPONSE), _) => Err(Error::InvalidResponseLength.into()),
            (Some(&echo), _) if echo != sid | POSITIVE_RESPONSE => Err(Error::InvalidServiceId(echo).into()),
            (_, Some(sub_function)) => match response.get(1) {
                Some(&echo) if echo == sub_function => Ok(response[header..].to_vec()),
                Some(&echo) => Err(Error::InvalidSubFunction(echo).into()),
                None => Err(Error::InvalidResponseLength.into()),
            },
            (_, None) => Ok(response[header..].to_vec()),
        }
    }

    /// 0x10 - Diagnostic Session Control. The ECU may announce its P2 timing in the response.
    pub async fn diagnostic_session_control(&mut self, session: SessionType) -> Result<Option<SessionParameterRecord>> {
        let record = self
            .request(ServiceIdentifier::DiagnosticSessionControl as u8, Some(session as u8), None)
            .await?;
        Ok(SessionParameterRecord::parse(&record))
    }

    /// 0x11 - ECU Reset. Returns the power down time for [`ResetType::EnableRapidPowerShutDown`].
    pub async fn ecu_reset(&mut self, reset: ResetType) -> Result<Option<u8>> {
        let response = self
            .request(ServiceIdentifier::EcuReset as u8, Some(reset as u8), None)
            .await?;
        Ok(match response[..] {
            [power_down_time] => Some(power_down_time),
            _ => None,
        })
    }

    /// 0x27 - Security Access. Odd `access_type` values are used to request a seed, even values to send a key.
    pub async fn security_access(&mut self, access_type: u8, data: Option<&[u8]>) -> Result<Vec<u8>> {
        self.request(ServiceIdentifier::SecurityAccess as u8, Some(access_type), data)
            .await
    }

    /// 0x3E - Tester Present
    pub async fn tester_present(&mut self) -> Result<()> {
        self.request(ServiceIdentifier::TesterPresent as u8, Some(0x00), None)
            .await
            .map(|_| ())
    }

    /// 0x31 - Routine Control. The ECU echoes `routine` and may append status bytes, which are returned.
    pub async fn routine_control(
        &mut self,
        control: RoutineControlType,
        routine: u16,
        data: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let mut record = routine.to_be_bytes().to_vec();
        record.extend(data.unwrap_or_default());

        let response = self
            .request(ServiceIdentifier::RoutineControl as u8, Some(control as u8), Some(&record))
            .await?;

        match response.split_first_chunk::<2>() {
            Some((echo, _)) if u16::from_be_bytes(*echo) != routine => {
                Err(Error::InvalidDataIdentifier(u16::from_be_bytes(*echo)).into())
            }
            Some((_, status)) => Ok(non_empty(status)),
            None => Err(Error::InvalidResponseLength.into()),
        }
    }

    /// Shared layout of RequestDownload and RequestUpload: format, 32 bit address and size, optional memory identifier.
    /// The response announces the maximum block length in a variable number of bytes, or nothing.
    async fn request_transfer(&mut self, sid: ServiceIdentifier, data_format: u8, region: MemoryRegion) -> Result<Option<usize>> {
        let mut request = vec![data_format, ADDRESS_AND_LENGTH_FORMAT_32];
        request.extend(region.address.to_be_bytes());
        request.extend(region.size.to_be_bytes());
        request.extend(region.identifier);

        let response = self.request(sid as u8, None, Some(&request)).await?;
        let Some((&format, length)) = response.split_first() else {
            return Ok(None);
        };

        let width = (format >> 4) as usize;
        if !(1..=std::mem::size_of::<usize>()).contains(&width) || length.len() != width {
            return Err(Error::InvalidResponseLength.into());
        }
        Ok(Some(length.iter().fold(0, |block, &byte| block << 8 | byte as usize)))
    }

    /// 0x34 - Request Download. Returns the block length the ECU accepts per TransferData, if announced.
    pub async fn request_download(&mut self, data_format: u8, region: MemoryRegion) -> Result<Option<usize>> {
        self.request_transfer(ServiceIdentifier::RequestDownload, data_format, region)
            .await
    }

    /// 0x35 - Request Upload
    pub async fn request_upload(&mut self, data_format: u8, region: MemoryRegion) -> Result<Option<usize>> {
        self.request_transfer(ServiceIdentifier::RequestUpload, data_format, region)
            .await
    }

    /// 0x36 - Transfer Data. The ECU must echo `counter`. Downloads carry the block in `data`, uploads get it in the response.
    pub async fn transfer_data(&mut self, counter: u8, data: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let mut request = vec![counter];
        request.extend(data.unwrap_or_default());

        let response = self
            .request(ServiceIdentifier::TransferData as u8, None, Some(&request))
            .await?;

        match response.split_first() {
            Some((&echo, _)) if echo != counter => Err(Error::InvalidBlockSequenceCounter(echo).into()),
            Some((_, block)) => Ok(non_empty(block)),
            None => Err(Error::InvalidResponseLength.into()),
        }
    }

    /// 0x37 - Request Transfer Exit. Optional `data` and response, e.g. a checksum.
    pub async fn request_transfer_exit(&mut self, data: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let response = self
            .request(ServiceIdentifier::RequestTransferExit as u8, None, data)
            .await?;
        Ok(non_empty(&response))
    }
}

fn non_empty(data: &[u8]) -> Option<Vec<u8>> {
    (!data.is_empty()).then(|| data.to_vec())
}
