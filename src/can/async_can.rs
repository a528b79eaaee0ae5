//! Async front of a blocking [`CanAdapter`]. A pump thread owns the adapter, tokio channels connect it to tasks.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::can::{CanAdapter, Frame, Identifier};
use crate::error::Error;
use async_stream::stream;
use futures::stream::Stream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

const TX_QUEUE_LEN: usize = 128;
const RX_QUEUE_LEN: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

type Completion = oneshot::Sender<()>;

/// State of the pump thread. A send completes once its loopback copy comes back from the adapter.
struct Pump<T> {
    adapter: T,
    outgoing: VecDeque<Frame>,
    /// Sent frames waiting for their loopback, per bus and identifier in send order
    in_flight: HashMap<(u8, Identifier), VecDeque<(Frame, Completion)>>,
}

impl<T: CanAdapter> Pump<T> {
    fn complete(&mut self, echo: &Frame) {
        let waiting = self.in_flight.get_mut(&(echo.bus, echo.id)).and_then(VecDeque::pop_front);
        match waiting {
            Some((sent, done)) => {
                if sent.data != echo.data {
                    warn!("Loopback out of order on bus {}: {:?}", echo.bus, echo);
                }
                let _ = done.send(());
            }
            None => debug!("Loopback without pending send: {:?}", echo),
        }
    }

    fn poll_rx(&mut self, rx: &broadcast::Sender<Frame>) -> Result<(), Error> {
        for frame in self.adapter.recv()? {
            debug!("RX {:?}", frame);
            if frame.loopback {
                self.complete(&frame);
            }
            // No subscribers is not an error
            let _ = rx.send(frame);
        }
        Ok(())
    }

    fn flush_tx(&mut self, tx: &mut mpsc::Receiver<(Frame, Completion)>) -> Result<(), Error> {
        while let Ok((frame, done)) = tx.try_recv() {
            debug!("TX {:?}", frame);
            self.in_flight
                .entry((frame.bus, frame.id))
                .or_default()
                .push_back((frame.clone(), done));
            self.outgoing.push_back(frame);
        }

        if self.outgoing.is_empty() {
            return Ok(());
        }
        let sent = self.adapter.send(&mut self.outgoing);
        if sent.is_err() {
            self.fail_pending();
        }
        sent
    }

    /// Drop every frame waiting to be sent or looped back. Their senders resolve with [`Error::Closed`].
    fn fail_pending(&mut self) {
        self.outgoing.clear();
        self.in_flight.clear();
    }

    fn run(
        mut self,
        mut shutdown: oneshot::Receiver<()>,
        rx: broadcast::Sender<Frame>,
        mut tx: mpsc::Receiver<(Frame, Completion)>,
    ) {
        while shutdown.try_recv().is_err() {
            match self.poll_rx(&rx).and_then(|()| self.flush_tx(&mut tx)) {
                Ok(()) => {}
                Err(Error::Closed) => {
                    warn!("CAN adapter closed, stopping pump");
                    break;
                }
                Err(e) => warn!("CAN adapter error: {}", e),
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        debug!("CAN pump stopped");
    }
}

/// Async wrapper around a [`CanAdapter`]. The adapter moves to a background thread, so no runtime is needed to create one.
pub struct AsyncCanAdapter {
    pump: Option<std::thread::JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    rx: broadcast::Receiver<Frame>,
    tx: mpsc::Sender<(Frame, Completion)>,
}

impl AsyncCanAdapter {
    pub fn new<T: CanAdapter + Send + Sync + 'static>(adapter: T) -> Self {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (tx, tx_rx) = mpsc::channel(TX_QUEUE_LEN);
        let (rx_tx, rx) = broadcast::channel(RX_QUEUE_LEN);

        let pump = Pump {
            adapter,
            outgoing: VecDeque::new(),
            in_flight: HashMap::new(),
        };
        let handle = std::thread::spawn(move || pump.run(shutdown_rx, rx_tx, tx_rx));

        Self {
            pump: Some(handle),
            shutdown: Some(shutdown),
            rx,
            tx,
        }
    }

    /// Send one frame. Resolves when the adapter reports the frame back as loopback, i.e. it left the device queue.
    /// Fails with [`Error::Closed`] when the adapter rejected the frame or the pump stopped. Callers bound the wait
    /// for the loopback with their own timeout.
    pub async fn send(&self, frame: &Frame) -> Result<(), Error> {
        let (done, sent) = oneshot::channel();
        self.tx.send((frame.clone(), done)).await.map_err(|_| Error::Closed)?;
        sent.await.map_err(|_| Error::Closed)
    }

    /// Every frame seen from now on, loopback included.
    pub fn recv(&self) -> impl Stream<Item = Frame> {
        self.recv_filter(|_| true)
    }

    /// Frames seen from now on that pass `filter`. A lagging subscriber skips what it missed.
    pub fn recv_filter(&self, filter: impl Fn(&Frame) -> bool) -> impl Stream<Item = Frame> {
        let mut rx = self.rx.resubscribe();

        Box::pin(stream! {
            loop {
                match rx.recv().await {
                    Ok(frame) if filter(&frame) => {
                        yield frame;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for AsyncCanAdapter {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::{BusHandle, VirtualBus};
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn send_resolves_and_peer_receives() {
        let bus = VirtualBus::new();
        let a = AsyncCanAdapter::new(bus.endpoint(0));
        let b = AsyncCanAdapter::new(bus.endpoint(0));

        let stream = b
            .recv_filter(|f| !f.loopback)
            .timeout(std::time::Duration::from_millis(500));
        tokio::pin!(stream);

        let frame = Frame::new(0, 0x123.into(), &[1, 2, 3]).unwrap();
        a.send(&frame).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn sender_sees_its_loopback() {
        let bus = VirtualBus::new();
        let a = AsyncCanAdapter::new(bus.endpoint(0));

        let stream = a.recv().timeout(std::time::Duration::from_millis(500));
        tokio::pin!(stream);

        let frame = Frame::new(0, 0x7e0.into(), &[0x02, 0x3e, 0x00]).unwrap();
        a.send(&frame).await.unwrap();

        let echo = stream.next().await.unwrap().unwrap();
        assert!(echo.loopback);
        assert_eq!(echo.data, frame.data);
    }

    #[tokio::test]
    async fn closed_adapter_fails_the_send() {
        let medium = VirtualBus::new();
        let bus = BusHandle::new(0, medium.endpoint(0));
        let adapter = AsyncCanAdapter::new(bus.clone());
        bus.close();

        let frame = Frame::new(0, 0x7e0.into(), &[0x02, 0x3e, 0x00]).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), adapter.send(&frame)).await;
        assert!(matches!(result, Ok(Err(Error::Closed))));
        // the pump is gone, later sends fail right away
        assert!(matches!(adapter.send(&frame).await, Err(Error::Closed)));
    }
}
