use async_trait::async_trait;

use crate::flash::programmer::{Memory, Programmer, Reporter};
use crate::flash::types::{round_up, ProtocolFamily};
use crate::transport::Transport;
use crate::Result;

/// Data bytes per command line, bounded by the line buffer of the target shell
const BLOCK_SIZE: usize = 2000;

/// Programs a target through its command shell: `load` and `write` take an address and hex data, `erase` an address and length.
pub struct ShellProgrammer<T> {
    transport: T,
    write_granularity: usize,
}

impl<T: Transport> ShellProgrammer<T> {
    pub fn new(transport: T, write_granularity: usize) -> Self {
        Self {
            transport,
            write_granularity: write_granularity.max(1),
        }
    }

    async fn command(&mut self, command: &str) -> Result<()> {
        self.transport.transmit(command.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> Programmer for ShellProgrammer<T> {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Cmd
    }

    async fn open(&mut self) -> Result<()> {
        self.transport.open().await
    }

    async fn reset(&mut self) -> Result<()> {
        self.transport.reset().await
    }

    async fn erase(&mut self, address: u32, length: u32) -> Result<()> {
        self.command(&format!("erase {:#x} {:#x}", address, length)).await
    }

    async fn download(&mut self, memory: Memory, address: u32, data: &[u8], reporter: &mut Reporter) -> Result<()> {
        let verb = match memory {
            Memory::FlashDriver => "load",
            Memory::Application => "write",
        };

        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let mut block = chunk.to_vec();
            block.resize(round_up(chunk.len(), self.write_granularity), 0xff);

            let offset = (i * BLOCK_SIZE) as u32;
            let command = format!("{} {:#x} {}", verb, address.wrapping_add(offset), hex::encode_upper(&block));
            self.command(&command).await?;
            reporter.advance(block.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[tokio::test]
    async fn commands() {
        let transport = MockTransport::new(4096, |_| vec![vec![]]);
        let requests = transport.requests.clone();
        let mut programmer = ShellProgrammer::new(transport, 8);

        programmer.erase(0x8000, 0x800).await.unwrap();
        programmer
            .download(Memory::FlashDriver, 0x2000_0000, &[0x12, 0xab, 0x00], &mut Reporter::default())
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests[0], b"erase 0x8000 0x800".to_vec());
        assert_eq!(requests[1], b"load 0x20000000 12AB00FFFFFFFFFF".to_vec());
    }

    #[tokio::test]
    async fn long_sections_are_split() {
        let transport = MockTransport::new(4096, |_| vec![vec![]]);
        let requests = transport.requests.clone();
        let mut programmer = ShellProgrammer::new(transport, 8);

        programmer
            .download(Memory::Application, 0x1000, &[0x55; 2004], &mut Reporter::default())
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].starts_with(b"write 0x1000 5555"));
        assert_eq!(requests[0].len(), "write 0x1000 ".len() + 4000);
        assert_eq!(
            requests[1],
            format!("write 0x17d0 {}{}", "55".repeat(4), "FF".repeat(4)).into_bytes()
        );
    }

    #[tokio::test]
    async fn failed_command_aborts() {
        let transport = MockTransport::new(4096, |_| vec![]);
        let requests = transport.requests.clone();
        let mut programmer = ShellProgrammer::new(transport, 8);

        let result = programmer
            .download(Memory::Application, 0, &[0u8; 4000], &mut Reporter::default())
            .await;
        assert!(result.is_err());
        assert_eq!(requests.lock().unwrap().len(), 1);
    }
}
