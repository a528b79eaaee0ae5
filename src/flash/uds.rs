use async_trait::async_trait;
use tracing::debug;

use crate::flash::programmer::{Memory, Programmer, Reporter, Session};
use crate::flash::types::{round_up, BlockSequenceCounter, ProtocolFamily};
use crate::transport::Transport;
use crate::uds::{MemoryRegion, RoutineControlType, SessionType, UDSClient};
use crate::Result;

const EXTENDED_KEY_MASK: u32 = 0x7893_4673;
const PROGRAMMING_KEY_MASK: u32 = 0x9458_6792;

const ROUTINE_ERASE: u16 = 0xff01;
const ROUTINE_LAUNCH: u16 = 0xff03;
/// Trailing byte of the erase routine
const ERASE_APPLICATION: u8 = 0xff;

const FLASH_DRIVER_ID: u8 = 0xfd;
const APPLICATION_ID: u8 = 0xff;

/// Uploads are requested in multiples of this
const READ_GRANULARITY: usize = 4;
/// Transport bytes reserved per TransferData beyond the payload
const TRANSFER_OVERHEAD: usize = 5;
/// TransferData header: SID, counter and the two address bytes
const TRANSFER_HEADER: usize = 4;

fn identifier(memory: Memory) -> u8 {
    match memory {
        Memory::FlashDriver => FLASH_DRIVER_ID,
        Memory::Application => APPLICATION_ID,
    }
}

/// Programs a bootloader speaking UDS.
pub struct UdsProgrammer<T> {
    client: UDSClient<T>,
    write_granularity: usize,
    capacity: usize,
}

impl<T: Transport> UdsProgrammer<T> {
    /// `capacity` is the largest request the transport carries, `write_granularity` the flash programming unit.
    pub fn new(transport: T, capacity: usize, write_granularity: usize) -> Self {
        Self {
            client: UDSClient::new(transport),
            write_granularity: write_granularity.max(1),
            capacity,
        }
    }

    /// Payload bytes per TransferData, a multiple of the write granularity.
    pub fn block_size(&self) -> usize {
        self.fit(self.capacity.saturating_sub(TRANSFER_OVERHEAD))
    }

    /// Payload bytes per TransferData once the ECU announced its maxNumberOfBlockLength, which counts the whole request.
    fn negotiated_block_size(&self, max_block_length: Option<usize>) -> usize {
        match max_block_length {
            Some(length) => self.fit(length.saturating_sub(TRANSFER_HEADER)).min(self.block_size()),
            None => self.block_size(),
        }
    }

    /// Round down to the write granularity, never below one unit.
    fn fit(&self, len: usize) -> usize {
        (len / self.write_granularity * self.write_granularity).max(self.write_granularity)
    }
}

#[async_trait]
impl<T: Transport> Programmer for UdsProgrammer<T> {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Uds
    }

    fn relative_driver_addresses(&self) -> bool {
        true
    }

    async fn open(&mut self) -> Result<()> {
        self.client.transport().open().await
    }

    async fn enter_session(&mut self, session: Session) -> Result<()> {
        let session_type = match session {
            Session::Extended => SessionType::ExtendedDiagnostic,
            Session::Programming => SessionType::Programming,
        };
        self.client.diagnostic_session_control(session_type).await?;
        Ok(())
    }

    async fn unlock(&mut self, session: Session, reporter: &mut Reporter) -> Result<()> {
        let (level, mask) = match session {
            Session::Extended => (0x01, EXTENDED_KEY_MASK),
            Session::Programming => (0x03, PROGRAMMING_KEY_MASK),
        };

        let seed = self.client.security_access(level, None).await?;
        let seed: [u8; 4] = seed
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or(crate::uds::Error::InvalidResponseLength)?;
        let seed = u32::from_be_bytes(seed);
        let key = seed ^ mask;

        reporter.info(format!(" send key {:X} from seed {:X}", key, seed));
        self.client.security_access(level + 1, Some(&key.to_be_bytes())).await?;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.client.transport().reset().await
    }

    async fn erase(&mut self, address: u32, length: u32) -> Result<()> {
        let mut data = address.to_be_bytes().to_vec();
        data.extend(length.to_be_bytes());
        data.push(ERASE_APPLICATION);
        self.client
            .routine_control(RoutineControlType::Start, ROUTINE_ERASE, Some(&data))
            .await?;
        Ok(())
    }

    async fn download(&mut self, memory: Memory, address: u32, data: &[u8], reporter: &mut Reporter) -> Result<()> {
        let id = identifier(memory);
        let region = MemoryRegion {
            address,
            size: round_up(data.len(), self.write_granularity) as u32,
            identifier: Some(id),
        };
        reporter.info(format!(" request download {:#x}, {} bytes", address, data.len()));
        let max_block_length = self.client.request_download(0x00, region).await?;
        let block_size = self.negotiated_block_size(max_block_length);
        debug!("download in blocks of {} bytes", block_size);

        let mut counter = BlockSequenceCounter::new();
        for chunk in data.chunks(block_size) {
            let padded = round_up(chunk.len(), self.write_granularity);
            let mut block = vec![0x00, id];
            block.extend(chunk);
            block.resize(2 + padded, 0xff);

            let bsc = counter.next().unwrap_or(1);
            debug!("transfer block {} with {} bytes", bsc, padded);
            self.client.transfer_data(bsc, Some(&block)).await?;
            reporter.advance(padded);
        }

        self.client.request_transfer_exit(None).await?;
        Ok(())
    }

    async fn upload(&mut self, memory: Memory, address: u32, size: usize, reporter: &mut Reporter) -> Result<Vec<u8>> {
        let id = identifier(memory);
        let region = MemoryRegion {
            address,
            size: round_up(size, READ_GRANULARITY) as u32,
            identifier: Some(id),
        };
        reporter.info(format!(" request upload {:#x}, {} bytes", address, size));
        self.client.request_upload(0x00, region).await?;

        let mut data = Vec::with_capacity(size);
        let mut counter = BlockSequenceCounter::new();
        while data.len() < size {
            let bsc = counter.next().unwrap_or(1);
            let block = self
                .client
                .transfer_data(bsc, Some(&[0x00, id]))
                .await?
                .ok_or(crate::uds::Error::InvalidResponseLength)?;
            reporter.advance(block.len());
            data.extend(block);
        }

        self.client.request_transfer_exit(None).await?;
        data.truncate(size);
        Ok(data)
    }

    async fn launch(&mut self) -> Result<()> {
        self.client
            .routine_control(RoutineControlType::Start, ROUTINE_LAUNCH, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[tokio::test]
    async fn unlock_programming_session() {
        let transport = MockTransport::new(4096, |request| match request {
            [0x27, 0x03] => vec![vec![0x67, 0x03, 0x12, 0x34, 0x56, 0x78]],
            [0x27, 0x04, ..] => vec![vec![0x67, 0x04]],
            _ => vec![],
        });
        let requests = transport.requests.clone();
        let mut programmer = UdsProgrammer::new(transport, 4096, 8);

        programmer
            .unlock(Session::Programming, &mut Reporter::default())
            .await
            .unwrap();
        let key = (0x1234_5678u32 ^ PROGRAMMING_KEY_MASK).to_be_bytes();
        assert_eq!(requests.lock().unwrap()[1], [&[0x27, 0x04][..], &key[..]].concat());
    }

    #[tokio::test]
    async fn short_seed_is_rejected() {
        let transport = MockTransport::new(4096, |_| vec![vec![0x67, 0x01, 0x12]]);
        let mut programmer = UdsProgrammer::new(transport, 4096, 8);
        assert!(programmer
            .unlock(Session::Extended, &mut Reporter::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn download_pads_last_block() {
        let transport = MockTransport::new(4096, |request| match request[0] {
            0x34 => vec![vec![0x74]],
            0x36 => vec![vec![0x76, request[1]]],
            0x37 => vec![vec![0x77]],
            _ => vec![],
        });
        let requests = transport.requests.clone();
        // 21 payload bytes per block, rounded down to 16
        let mut programmer = UdsProgrammer::new(transport, 26, 8);
        assert_eq!(programmer.block_size(), 16);

        let data: Vec<u8> = (0..20).collect();
        programmer
            .download(Memory::Application, 0x0800_0000, &data, &mut Reporter::default())
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        assert_eq!(
            requests[0],
            vec![0x34, 0x00, 0x44, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0xff]
        );
        assert_eq!(&requests[1][..4], &[0x36, 0x01, 0x00, 0xff]);
        assert_eq!(requests[1].len(), 4 + 16);
        assert_eq!(&requests[2][..4], &[0x36, 0x02, 0x00, 0xff]);
        assert_eq!(&requests[2][4..], &[16, 17, 18, 19, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(requests[3], vec![0x37]);
    }

    #[tokio::test]
    async fn download_honours_announced_block_length() {
        let transport = MockTransport::new(4096, |request| match request[0] {
            0x34 => vec![vec![0x74, 0x10, 0x20]],
            0x36 => vec![vec![0x76, request[1]]],
            0x37 => vec![vec![0x77]],
            _ => vec![],
        });
        let requests = transport.requests.clone();
        let mut programmer = UdsProgrammer::new(transport, 4096, 8);
        assert_eq!(programmer.block_size(), 4088);

        let data = vec![0x3c; 100];
        programmer
            .download(Memory::Application, 0x0800_0000, &data, &mut Reporter::default())
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        let blocks: Vec<&Vec<u8>> = requests.iter().filter(|r| r[0] == 0x36).collect();
        assert!(blocks.iter().all(|r| r.len() <= 0x20));
        // 28 byte frames rounded down to 24, the last one padded
        assert_eq!(blocks.len(), 5);
        assert_eq!(blocks[0].len(), 4 + 24);
        assert_eq!(&blocks[4][4..], &[0x3c, 0x3c, 0x3c, 0x3c, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(blocks.iter().map(|r| r[1]).collect::<Vec<u8>>(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn counter_mismatch_aborts_download() {
        let transport = MockTransport::new(4096, |request| match request[0] {
            0x34 => vec![vec![0x74]],
            0x36 => vec![vec![0x76, request[1].wrapping_add(1)]],
            _ => vec![vec![0x77]],
        });
        let requests = transport.requests.clone();
        let mut programmer = UdsProgrammer::new(transport, 4096, 8);

        let result = programmer
            .download(Memory::FlashDriver, 0, &[0u8; 64], &mut Reporter::default())
            .await;
        assert!(result.is_err());
        // No transfer exit after the failed block
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upload_collects_blocks() {
        let transport = MockTransport::new(4096, |request| match request[0] {
            0x35 => vec![vec![0x75]],
            0x36 => vec![vec![0x76, request[1], 1, 2, 3, 4]],
            0x37 => vec![vec![0x77]],
            _ => vec![],
        });
        let requests = transport.requests.clone();
        let mut programmer = UdsProgrammer::new(transport, 4096, 8);

        let data = programmer
            .upload(Memory::FlashDriver, 0x100, 6, &mut Reporter::default())
            .await
            .unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 1, 2]);

        let requests = requests.lock().unwrap();
        // size rounded up to the read granularity
        assert_eq!(&requests[0][7..], &[0x00, 0x00, 0x00, 0x08, 0xfd]);
        assert_eq!(requests[1], vec![0x36, 0x01, 0x00, 0xfd]);
        assert_eq!(requests[2], vec![0x36, 0x02, 0x00, 0xfd]);
    }

    #[tokio::test]
    async fn erase_and_launch_routines() {
        let transport = MockTransport::new(4096, |request| match request {
            [0x31, 0x01, 0xff, 0x01, ..] => vec![vec![0x71, 0x01, 0xff, 0x01]],
            [0x31, 0x01, 0xff, 0x03] => vec![vec![0x71, 0x01, 0xff, 0x03]],
            _ => vec![],
        });
        let requests = transport.requests.clone();
        let mut programmer = UdsProgrammer::new(transport, 4096, 8);

        programmer.erase(0x0800_0000, 0x2000).await.unwrap();
        programmer.launch().await.unwrap();
        assert_eq!(
            requests.lock().unwrap()[0],
            vec![0x31, 0x01, 0xff, 0x01, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00, 0xff]
        );
    }
}
