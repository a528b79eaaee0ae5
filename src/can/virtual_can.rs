//! In-memory CAN medium. Every endpoint sees the frames sent by all other endpoints, and gets its own frames echoed back as loopback, like a real adapter with `recv_own_msgs` enabled.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::can::{CanAdapter, Frame};
use crate::Result;

type Queue = Arc<Mutex<VecDeque<Frame>>>;

/// Shared medium. Cheap to clone, all clones refer to the same bus.
#[derive(Clone, Default)]
pub struct VirtualBus {
    endpoints: Arc<Mutex<Vec<Weak<Mutex<VecDeque<Frame>>>>>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new adapter to the medium. Frames received by it carry `bus` as bus index.
    pub fn endpoint(&self, bus: u8) -> VirtualCan {
        let rx: Queue = Arc::new(Mutex::new(VecDeque::new()));
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&rx));

        VirtualCan {
            bus,
            medium: self.clone(),
            rx,
        }
    }

    fn broadcast(&self, sender: &Queue, frame: &Frame) {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        endpoints.retain(|e| e.strong_count() > 0);

        for endpoint in endpoints.iter().filter_map(Weak::upgrade) {
            let mut copy = frame.clone();
            copy.loopback = Arc::ptr_eq(&endpoint, sender);
            endpoint
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(copy);
        }
    }
}

/// [`CanAdapter`] attached to a [`VirtualBus`].
pub struct VirtualCan {
    bus: u8,
    medium: VirtualBus,
    rx: Queue,
}

impl CanAdapter for VirtualCan {
    fn send(&mut self, frames: &mut VecDeque<Frame>) -> Result<()> {
        while let Some(mut frame) = frames.pop_front() {
            frame.bus = self.bus;
            frame.loopback = false;
            self.medium.broadcast(&self.rx, &frame);
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<Frame>> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rx.drain(..).collect())
    }

    fn reset(&mut self) -> Result<()> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}
