use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::signal::bitbuffer::mask;
use crate::signal::database::SignalSpec;

/// Token returned by [`Signal::register`], used to unregister the observer again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObserverId(usize);

/// Live value of one signal. The value is always kept masked to the signal width.
#[derive(Debug)]
pub struct Signal {
    spec: SignalSpec,
    mask: u32,
    value: AtomicU32,
    observers: Mutex<Vec<(ObserverId, mpsc::UnboundedSender<u32>)>>,
    next_observer: AtomicUsize,
}

impl Signal {
    pub fn new(spec: SignalSpec) -> Self {
        Self {
            mask: mask(spec.size),
            spec,
            value: AtomicU32::new(0),
            observers: Mutex::new(vec![]),
            next_observer: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    pub fn min(&self) -> u32 {
        0
    }

    pub fn max(&self) -> u32 {
        self.mask
    }

    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Relaxed) & self.mask
    }

    /// Raw value scaled by the database factor and offset.
    pub fn physical(&self) -> f64 {
        self.value() as f64 * self.spec.factor + self.spec.offset
    }

    /// Store the masked value and push it to every observer before returning.
    pub fn set_value(&self, value: u32) {
        let value = value & self.mask;
        self.value.store(value, Ordering::Relaxed);

        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        // Observers whose receiving end is gone are forgotten
        observers.retain(|(_, tx)| tx.send(value).is_ok());
    }

    pub fn register(&self, observer: mpsc::UnboundedSender<u32>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Returns false if the observer was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let len = observers.len();
        observers.retain(|(observer, _)| *observer != id);
        observers.len() != len
    }

    /// Register a fresh channel and return its receiving end.
    pub fn subscribe(&self) -> (ObserverId, mpsc::UnboundedReceiver<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(tx), rx)
    }
}
