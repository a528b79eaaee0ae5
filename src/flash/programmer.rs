//! Protocol specific primitives the flash state machine is built from.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::flash::error::Error;
use crate::flash::types::ProtocolFamily;
use crate::flash::StepKind;
use crate::Result;

/// Status observed by a front-end while a run progresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// Human readable status line
    Info(String),
    /// Cumulative progress in percent
    Progress(u8),
}

/// Emits [`FlashEvent`]s and tracks the bytes transferred against the total of the run.
#[derive(Debug, Default)]
pub struct Reporter {
    events: Option<mpsc::UnboundedSender<FlashEvent>>,
    total: usize,
    done: usize,
}

impl Reporter {
    pub fn new(events: Option<mpsc::UnboundedSender<FlashEvent>>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub(crate) fn start(&mut self, total: usize) {
        self.total = total;
        self.done = 0;
    }

    fn send(&self, event: FlashEvent) {
        if let Some(events) = &self.events {
            // Nobody listening is fine
            let _ = events.send(event);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.send(FlashEvent::Info(message));
    }

    /// Account for `bytes` more transferred bytes.
    pub fn advance(&mut self, bytes: usize) {
        self.done += bytes;
        let percent = match self.total {
            0 => 100,
            total => (self.done * 100 / total).min(100),
        };
        self.send(FlashEvent::Progress(percent as u8));
    }

    pub(crate) fn finish(&self) {
        self.send(FlashEvent::Progress(100));
    }
}

/// Target memory of a transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Memory {
    /// RAM the flash driver is loaded into
    FlashDriver,
    Application,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Session {
    Extended,
    Programming,
}

/// One implementation per protocol family. Operations a family has no step for keep the default, which fails with [`Error::Unsupported`].
#[async_trait]
pub trait Programmer: Send {
    fn family(&self) -> ProtocolFamily;

    /// Flash driver sections are addressed relative to the first one.
    fn relative_driver_addresses(&self) -> bool {
        false
    }

    /// Establish the connection before the first step.
    async fn open(&mut self) -> Result<()>;

    async fn enter_session(&mut self, session: Session) -> Result<()> {
        Err(Error::Unsupported(match session {
            Session::Extended => StepKind::EnterExtendSession,
            Session::Programming => StepKind::EnterProgramSession,
        })
        .into())
    }

    async fn unlock(&mut self, session: Session, _reporter: &mut Reporter) -> Result<()> {
        Err(Error::Unsupported(match session {
            Session::Extended => StepKind::SecurityExtdsAccess,
            Session::Programming => StepKind::SecurityPrgsAccess,
        })
        .into())
    }

    /// Bring the transport back to a clean state.
    async fn reset(&mut self) -> Result<()>;

    async fn erase(&mut self, address: u32, length: u32) -> Result<()>;

    async fn download(&mut self, memory: Memory, address: u32, data: &[u8], reporter: &mut Reporter) -> Result<()>;

    /// Read `size` bytes back. A short result means the target returned less.
    async fn upload(&mut self, memory: Memory, _address: u32, _size: usize, _reporter: &mut Reporter) -> Result<Vec<u8>> {
        Err(Error::Unsupported(match memory {
            Memory::FlashDriver => StepKind::CheckFlashDriver,
            Memory::Application => StepKind::CheckApplication,
        })
        .into())
    }

    async fn launch(&mut self) -> Result<()> {
        Err(Error::Unsupported(StepKind::LaunchApplication).into())
    }
}
