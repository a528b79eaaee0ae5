use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::can::{BusHandle, Identifier};
use crate::signal::bitbuffer::BitBuffer;
use crate::signal::database::MessageSpec;
use crate::signal::value::Signal;

/// Runtime state of one frame: its signals, payload and transmit schedule.
#[derive(Debug)]
pub struct FrameState {
    spec: MessageSpec,
    id: Identifier,
    transmit: bool,
    signals: Vec<Arc<Signal>>,
    payload: Mutex<BitBuffer>,
    period: AtomicI64,
    last_fire: Mutex<Instant>,
}

impl FrameState {
    /// `transmit` is false for frames the host only listens to.
    pub fn new(spec: MessageSpec, transmit: bool) -> Self {
        let signals = spec
            .signals
            .iter()
            .map(|signal| Arc::new(Signal::new(signal.clone())))
            .collect();
        Self {
            id: Identifier::from(spec.id),
            payload: Mutex::new(BitBuffer::new(spec.length)),
            period: AtomicI64::new(spec.period()),
            last_fire: Mutex::new(Instant::now()),
            transmit,
            signals,
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    pub fn is_transmit(&self) -> bool {
        self.transmit
    }

    pub fn signals(&self) -> &[Arc<Signal>] {
        &self.signals
    }

    pub fn signal(&self, name: &str) -> Option<&Arc<Signal>> {
        self.signals.iter().find(|signal| signal.name() == name)
    }

    /// Period in milliseconds. Zero or negative disables transmission.
    pub fn period(&self) -> i64 {
        self.period.load(Ordering::Relaxed)
    }

    pub fn set_period(&self, period: i64) {
        self.period.store(period, Ordering::Relaxed);
    }

    pub fn payload(&self) -> Vec<u8> {
        self.payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_bytes()
            .to_vec()
    }

    pub(crate) fn restart_timer(&self, now: Instant) {
        *self.last_fire.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    /// Encode every signal into the payload and send it. A failed write is logged and retried next period.
    pub fn transmit(&self, bus: &BusHandle) {
        let data = {
            let mut payload = self.payload.lock().unwrap_or_else(PoisonError::into_inner);
            for signal in &self.signals {
                let spec = signal.spec();
                if let Err(e) = payload.set(spec.endian, spec.start, spec.size, signal.value()) {
                    warn!("{}.{}: {}", self.spec.name, spec.name, e);
                }
            }
            payload.as_bytes().to_vec()
        };

        if let Err(e) = bus.write(self.id, &data) {
            warn!("cansend can{} {:?}#{} failed: {}", bus.bus(), self.id, hex::encode(&data), e);
        }
    }

    /// Send the frame if its period elapsed since the last send. Returns true if it was sent.
    pub fn process_tx(&self, now: Instant, bus: &BusHandle) -> bool {
        let period = self.period();
        if !self.transmit || period <= 0 {
            return false;
        }

        {
            let mut last_fire = self.last_fire.lock().unwrap_or_else(PoisonError::into_inner);
            if now.saturating_duration_since(*last_fire) < Duration::from_millis(period as u64) {
                return false;
            }
            // Measured from now, so a late tick shifts all later sends
            *last_fire = now;
        }

        self.transmit(bus);
        true
    }

    /// Decode the latest received frame, if any, into the signals and notify their observers.
    pub fn process_rx(&self, bus: &BusHandle) -> bool {
        let frame = match bus.read(self.id) {
            Ok(Some(frame)) => frame,
            Ok(None) => return false,
            Err(e) => {
                debug!("canread can{} {:?} failed: {}", bus.bus(), self.id, e);
                return false;
            }
        };

        let values: Vec<(usize, u32)> = {
            let mut payload = self.payload.lock().unwrap_or_else(PoisonError::into_inner);
            payload.replace(&frame.data);
            self.signals
                .iter()
                .enumerate()
                .filter_map(|(i, signal)| {
                    let spec = signal.spec();
                    match payload.get(spec.endian, spec.start, spec.size) {
                        Ok(value) => Some((i, value)),
                        Err(e) => {
                            warn!("{}.{}: {}", self.spec.name, spec.name, e);
                            None
                        }
                    }
                })
                .collect()
        };

        for (i, value) in values {
            self.signals[i].set_value(value);
        }
        true
    }
}
