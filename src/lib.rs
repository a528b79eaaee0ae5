//! # ecutool
//! Automotive middleware for talking to ECUs over CAN. The crate has two halves: a signal runtime that keeps a
//! database of frames alive on a bus, and a flashloader that reprograms an ECU over UDS, XCP or a command shell.
//!
//! ## Signal Runtime Example
//!
//! Frames are packed from named signals and sent with their database period. Received frames are decoded back
//! into signals, and every observer of a signal is notified.
//!
//! ```rust
//! use ecutool::can::{BusHandle, VirtualBus};
//! use ecutool::signal::{Database, Endian, MessageSpec, Network, SignalSpec};
//!
//! fn runtime_example() {
//!     let database = Database {
//!         messages: vec![MessageSpec {
//!             name: "Engine".to_owned(),
//!             id: 0x120,
//!             length: 8,
//!             period: Some(20),
//!             node: "Tester".to_owned(),
//!             signals: vec![SignalSpec::new("Rpm", 7, 16, Endian::Big)],
//!         }],
//!     };
//!
//!     let medium = VirtualBus::new();
//!     let mut network = Network::new(&database, BusHandle::new(0, medium.endpoint(0))).unwrap();
//!     network.set("Rpm", 3000).unwrap();
//!     network.start();
//! }
//! ```
//!
//! ## Flashloader Example
//!
//! The transport variant selects the protocol. The first failing step aborts the run.
//!
//! ```rust
//! use ecutool::flash::{connect, FlashLoader, TargetConfig, TransportVariant};
//!
//! async fn flash_example(bus: ecutool::can::BusHandle) {
//!     let config = TargetConfig::new(TransportVariant::XcpOnCan, "app.s19");
//!     let mut loader = FlashLoader::new(config.clone(), connect(&config, Some(&bus)).unwrap());
//!     let mut events = loader.subscribe();
//!
//!     let handle = loader.spawn();
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     handle.join().unwrap().unwrap();
//! }
//! ```
//!
//! ## Supported transports
//!  - UDS over ISO-TP on CAN and CAN FD
//!  - UDS over DoIP (ISO 13400)
//!  - XCP on CAN
//!  - Line based command shell on a serial device
//!

pub mod can;
pub mod doip;
mod error;
pub mod flash;
pub mod image;
pub mod isotp;
pub mod shell;
pub mod signal;
pub mod transport;
pub mod uds;
pub mod xcp;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
