//! Signal runtime: packs signal values into CAN frames according to a database, sends them periodically and decodes received frames back into signals.
//! ## Example
//! ```rust
//! use ecutool::signal::{Database, Network};
//!
//! fn signal_example(database: &Database, bus: ecutool::can::BusHandle) {
//!     let mut network = Network::new(database, bus).unwrap();
//!     network.start();
//!
//!     let speed = network.lookup("VehicleSpeed").unwrap();
//!     speed.set_value(120);
//!     let (_, mut updates) = network.lookup("EngineRpm").unwrap().subscribe();
//!
//!     network.stop();
//! }
//! ```

mod bitbuffer;
mod database;
pub mod error;
mod frame;
mod value;

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::can::BusHandle;
use crate::Result;

pub use bitbuffer::{mask, BitBuffer, FILL, MAX_LEN};
pub use database::{Database, Endian, MessageSpec, SignalSpec, DEFAULT_PERIOD_MS};
pub use error::Error;
pub use frame::FrameState;
pub use value::{ObserverId, Signal};

/// Node name of the ECU under test. Frames it sends are only received, never simulated.
pub const DEFAULT_ECU_NODE: &str = "AS";
const TICK: Duration = Duration::from_millis(1);

/// Typed handle to one signal, obtained once through [`Network::lookup`].
#[derive(Debug, Clone)]
pub struct SignalHandle {
    frame: Arc<FrameState>,
    signal: Arc<Signal>,
}

impl SignalHandle {
    /// Frame carrying the signal.
    pub fn frame(&self) -> &FrameState {
        &self.frame
    }
}

impl Deref for SignalHandle {
    type Target = Signal;

    fn deref(&self) -> &Signal {
        &self.signal
    }
}

/// Owns the frames of one bus and the background thread driving them.
pub struct Network {
    frames: Arc<Vec<Arc<FrameState>>>,
    bus: BusHandle,
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Network {
    /// Build the runtime for `database` with [`DEFAULT_ECU_NODE`] as the ECU under test.
    pub fn new(database: &Database, bus: BusHandle) -> Result<Self> {
        Self::with_ecu_node(database, bus, DEFAULT_ECU_NODE)
    }

    /// Build the runtime. Frames sent by `ecu_node` are only decoded, all others are also transmitted.
    pub fn with_ecu_node(database: &Database, bus: BusHandle, ecu_node: &str) -> Result<Self> {
        database.validate()?;

        let frames = database
            .messages
            .iter()
            .map(|message| Arc::new(FrameState::new(message.clone(), message.node != ecu_node)))
            .collect();

        Ok(Self {
            frames: Arc::new(frames),
            bus,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    pub fn frames(&self) -> impl Iterator<Item = &Arc<FrameState>> {
        self.frames.iter()
    }

    pub fn frame(&self, name: &str) -> Option<&Arc<FrameState>> {
        self.frames.iter().find(|frame| frame.name() == name)
    }

    /// Find a signal by bare name, or as `frame.signal`. Bare names resolve to the first frame carrying them.
    pub fn lookup(&self, name: &str) -> Option<SignalHandle> {
        if let Some((frame_name, signal_name)) = name.split_once('.') {
            if let Some(frame) = self.frame(frame_name) {
                return frame.signal(signal_name).map(|signal| SignalHandle {
                    frame: frame.clone(),
                    signal: signal.clone(),
                });
            }
        }

        self.frames.iter().find_map(|frame| {
            frame.signal(name).map(|signal| SignalHandle {
                frame: frame.clone(),
                signal: signal.clone(),
            })
        })
    }

    pub fn get(&self, name: &str) -> Result<u32> {
        let signal = self
            .lookup(name)
            .ok_or_else(|| Error::UnknownSignal(name.to_owned()))?;
        Ok(signal.value())
    }

    /// Set a signal value. It goes out with the next transmission of its frame.
    pub fn set(&self, name: &str, value: u32) -> Result<()> {
        let signal = self
            .lookup(name)
            .ok_or_else(|| Error::UnknownSignal(name.to_owned()))?;
        signal.set_value(value);
        Ok(())
    }

    pub fn period(&self, frame: &str) -> Result<i64> {
        let frame = self
            .frame(frame)
            .ok_or_else(|| Error::UnknownFrame(frame.to_owned()))?;
        Ok(frame.period())
    }

    /// Change the transmit period of a frame in milliseconds, 0 disables it.
    pub fn set_period(&self, frame: &str, period: i64) -> Result<()> {
        let frame = self
            .frame(frame)
            .ok_or_else(|| Error::UnknownFrame(frame.to_owned()))?;
        frame.set_period(period);
        Ok(())
    }

    /// Run one pass over all frames: transmit what is due, then decode what arrived.
    pub fn tick(&self, now: Instant) {
        process(&self.frames, &self.bus, now);
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Start the background thread. Does nothing if it is already running.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let frames = self.frames.clone();
        let bus = self.bus.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        info!("Starting signal runtime with {} frames on bus {}", frames.len(), bus.bus());
        self.handle = Some(std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                process(&frames, &bus, Instant::now());
                std::thread::sleep(TICK);
            }
            debug!("Signal runtime stopped");
        }));
    }

    /// Ask the background thread to stop and wait for it. The frame being processed completes first.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Signal runtime thread panicked");
            }
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.stop();
    }
}

fn process(frames: &[Arc<FrameState>], bus: &BusHandle, now: Instant) {
    for frame in frames {
        frame.process_tx(now, bus);
        frame.process_rx(bus);
    }
}
