use async_trait::async_trait;

use crate::flash::programmer::{Memory, Programmer, Reporter, Session};
use crate::flash::types::ProtocolFamily;
use crate::transport::Transport;
use crate::xcp::{AddressExtension, Resource, XcpClient};
use crate::Result;

const SEED_LEN: usize = 4;

fn extension(memory: Memory) -> AddressExtension {
    match memory {
        Memory::FlashDriver => AddressExtension::Ram,
        Memory::Application => AddressExtension::Flash,
    }
}

/// Programs a slave through the XCP programming commands. The seed of every resource is accepted as its own key.
pub struct XcpProgrammer<T> {
    client: XcpClient<T>,
}

impl<T: Transport> XcpProgrammer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            client: XcpClient::new(transport),
        }
    }

    async fn unlock_resource(&mut self, resource: Resource, reporter: &mut Reporter) -> Result<()> {
        reporter.info(format!(" == unlock {:?} ==", resource));
        let seed = self.client.get_seed(resource).await?;
        if seed.len() != SEED_LEN {
            return Err(crate::xcp::Error::InvalidSeedLength(seed.len() as u8).into());
        }
        self.client.unlock(&seed).await?;
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> Programmer for XcpProgrammer<T> {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Xcp
    }

    async fn open(&mut self) -> Result<()> {
        self.client.transport().open().await
    }

    async fn enter_session(&mut self, session: Session) -> Result<()> {
        match session {
            Session::Programming => {
                self.client.connect(0x00).await?;
                Ok(())
            }
            Session::Extended => Err(crate::flash::Error::Unsupported(crate::flash::StepKind::EnterExtendSession).into()),
        }
    }

    async fn unlock(&mut self, session: Session, reporter: &mut Reporter) -> Result<()> {
        if session == Session::Extended {
            return Err(crate::flash::Error::Unsupported(crate::flash::StepKind::SecurityExtdsAccess).into());
        }
        self.unlock_resource(Resource::Pgm, reporter).await?;
        self.unlock_resource(Resource::CalPag, reporter).await?;
        reporter.info(" program start");
        self.client.program_start().await
    }

    async fn reset(&mut self) -> Result<()> {
        self.client.transport().reset().await
    }

    async fn erase(&mut self, address: u32, length: u32) -> Result<()> {
        self.client.set_mta(AddressExtension::Flash, address).await?;
        self.client.program_clear(length).await
    }

    async fn download(&mut self, memory: Memory, address: u32, data: &[u8], reporter: &mut Reporter) -> Result<()> {
        reporter.info(format!(" set MTA address {:#x}, type {}", address, extension(memory) as u8));
        self.client.set_mta(extension(memory), address).await?;

        let block = self.client.max_cto().saturating_sub(2).max(1);
        for chunk in data.chunks(block) {
            self.client.download(chunk).await?;
            reporter.advance(chunk.len());
        }
        Ok(())
    }

    async fn upload(&mut self, memory: Memory, address: u32, size: usize, reporter: &mut Reporter) -> Result<Vec<u8>> {
        reporter.info(format!(" set MTA address {:#x}, type {}", address, extension(memory) as u8));
        self.client.set_mta(extension(memory), address).await?;

        let block = self.client.max_cto().saturating_sub(1).max(1);
        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let n = block.min(size - data.len());
            data.extend(self.client.upload(n).await?);
            reporter.advance(n);
        }
        Ok(data)
    }

    async fn launch(&mut self) -> Result<()> {
        self.client.program_reset().await
    }
}
