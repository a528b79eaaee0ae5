//! Runs a small network on a virtual bus. A simulated ECU answers the lamp command with its status,
//! and every change of the status signal is printed.
use std::time::Duration;

use ecutool::can::{BusHandle, Identifier, VirtualBus};
use ecutool::signal::{Database, Endian, MessageSpec, Network, SignalSpec};

fn database() -> Database {
    Database {
        messages: vec![
            MessageSpec {
                name: "BodyCmd".to_owned(),
                id: 0x200,
                length: 8,
                period: Some(100),
                node: "Tester".to_owned(),
                signals: vec![SignalSpec::new("Lamp", 0, 2, Endian::Little)],
            },
            MessageSpec {
                name: "BodyStatus".to_owned(),
                id: 0x201,
                length: 8,
                period: None,
                node: "AS".to_owned(),
                signals: vec![
                    SignalSpec::new("LampState", 0, 2, Endian::Little),
                    SignalSpec::new("Counter", 15, 8, Endian::Big),
                ],
            },
        ],
    }
}

#[tokio::main]
async fn main() -> ecutool::Result<()> {
    tracing_subscriber::fmt::init();

    let medium = VirtualBus::new();
    let ecu = BusHandle::new(0, medium.endpoint(0));
    std::thread::spawn(move || {
        let mut counter = 0u8;
        loop {
            if let Ok(Some(frame)) = ecu.read(Identifier::Standard(0x200)) {
                counter = counter.wrapping_add(1);
                let status = [frame.data[0] & 0x03, counter, 0, 0, 0, 0, 0, 0];
                if ecu.write(Identifier::Standard(0x201), &status).is_err() {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    let mut network = Network::new(&database(), BusHandle::new(0, medium.endpoint(0)))?;
    let lamp_state = network.lookup("LampState").ok_or(ecutool::Error::NotFound)?;
    let (_, mut updates) = lamp_state.subscribe();
    network.start();

    for lamp in [1, 2, 3, 0] {
        network.set("Lamp", lamp)?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(value) = updates.try_recv() {
            println!("LampState = {} (counter {})", value, network.get("Counter")?);
        }
    }

    network.stop();
    Ok(())
}
