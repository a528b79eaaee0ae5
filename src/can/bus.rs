//! Explicit handle to one CAN bus. Replaces any notion of a process wide default bus: every runtime and transport is constructed with the handle it should talk to.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::can::{CanAdapter, Frame, Identifier};
use crate::error::Error;
use crate::Result;

use tracing::debug;

/// Frames kept per identifier before the oldest ones are dropped.
const MAILBOX_DEPTH: usize = 64;

struct Inner {
    adapter: Option<Box<dyn CanAdapter + Send>>,
    mailboxes: HashMap<Identifier, VecDeque<Frame>>,
}

impl Inner {
    fn adapter(&mut self) -> Result<&mut (dyn CanAdapter + Send + 'static)> {
        self.adapter.as_deref_mut().ok_or(Error::Closed)
    }

    /// Move everything the adapter has into the per identifier mailboxes.
    fn poll(&mut self) -> Result<()> {
        let frames = self.adapter()?.recv()?;
        for frame in frames.into_iter().filter(|f| !f.loopback) {
            let mailbox = self.mailboxes.entry(frame.id).or_default();
            if mailbox.len() == MAILBOX_DEPTH {
                mailbox.pop_front();
            }
            mailbox.push_back(frame);
        }
        Ok(())
    }
}

/// Cloneable handle to a CAN adapter. All clones share the adapter, and the handle itself implements [`CanAdapter`] so it can be wrapped by [`crate::can::AsyncCanAdapter`].
///
/// Frames are either consumed per identifier through [`BusHandle::read`], or in bulk through [`CanAdapter::recv`]. Mixing both consumers on one bus splits the traffic between them, so a flash session and a signal runtime should not share a bus at the same time.
#[derive(Clone)]
pub struct BusHandle {
    bus: u8,
    inner: Arc<Mutex<Inner>>,
}

impl BusHandle {
    pub fn new<T: CanAdapter + Send + 'static>(bus: u8, adapter: T) -> Self {
        Self {
            bus,
            inner: Arc::new(Mutex::new(Inner {
                adapter: Some(Box::new(adapter)),
                mailboxes: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bus index stamped on outgoing frames.
    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn is_open(&self) -> bool {
        self.lock().adapter.is_some()
    }

    /// Send one frame with the given identifier.
    pub fn write(&self, id: Identifier, data: &[u8]) -> Result<()> {
        let frame = Frame::new(self.bus, id, data)?;
        debug!("bus {} TX {:?}", self.bus, frame);

        let mut queue = VecDeque::from([frame]);
        self.lock().adapter()?.send(&mut queue)?;
        if queue.is_empty() {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Return the oldest unread frame with the given identifier, if any arrived.
    pub fn read(&self, id: Identifier) -> Result<Option<Frame>> {
        let mut inner = self.lock();
        inner.poll()?;
        Ok(inner.mailboxes.get_mut(&id).and_then(VecDeque::pop_front))
    }

    /// Drop all buffered frames and reset the adapter.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.mailboxes.clear();
        inner.adapter()?.reset()
    }

    /// Release the adapter. Every later operation on any clone fails with [`Error::Closed`].
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.adapter = None;
        inner.mailboxes.clear();
    }
}

impl CanAdapter for BusHandle {
    fn send(&mut self, frames: &mut VecDeque<Frame>) -> Result<()> {
        for frame in frames.iter_mut() {
            frame.bus = self.bus;
        }
        self.lock().adapter()?.send(frames)
    }

    fn recv(&mut self) -> Result<Vec<Frame>> {
        let mut inner = self.lock();
        let mut frames: Vec<Frame> = inner.mailboxes.drain().flat_map(|(_, q)| q).collect();
        frames.extend(inner.adapter()?.recv()?);
        Ok(frames)
    }

    fn reset(&mut self) -> Result<()> {
        BusHandle::reset(self)
    }
}
