//! Request/response transport shared by all diagnostic and calibration protocols.

use async_trait::async_trait;

use crate::Result;

/// A request/response channel to one ECU. Implemented by ISO-TP, DoIP, XCP on CAN and the shell command channel.
///
/// Implementations enforce their own per request timeout and return [`crate::Error::Timeout`] when it expires.
#[async_trait]
pub trait Transport: Send {
    /// Establish the connection. Transports without a handshake return `Ok` immediately.
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Send a request and wait for the first response.
    async fn transmit(&mut self, request: &[u8]) -> Result<Vec<u8>>;

    /// Wait for a further response to the last request, e.g. after a "response pending" reply.
    async fn receive(&mut self) -> Result<Vec<u8>>;

    /// Bring the transport back to a clean state: drop stale responses and reset the underlying link.
    async fn reset(&mut self) -> Result<()>;

    /// Largest request, in bytes, that fits in a single transmit.
    fn max_block_size(&self) -> usize;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn transmit(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        (**self).transmit(request).await
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        (**self).receive().await
    }

    async fn reset(&mut self) -> Result<()> {
        (**self).reset().await
    }

    fn max_block_size(&self) -> usize {
        (**self).max_block_size()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type Handler = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

    /// In-memory ECU. The handler returns the responses to a request: the first is
    /// returned by `transmit`, the rest are queued for `receive`. No response is a timeout.
    pub(crate) struct MockTransport {
        handler: Handler,
        pending: VecDeque<Vec<u8>>,
        pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
        pub resets: Arc<Mutex<usize>>,
        block_size: usize,
    }

    impl MockTransport {
        pub(crate) fn new(block_size: usize, handler: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) -> Self {
            Self {
                handler: Box::new(handler),
                pending: VecDeque::new(),
                requests: Arc::new(Mutex::new(vec![])),
                resets: Arc::new(Mutex::new(0)),
                block_size,
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn transmit(&mut self, request: &[u8]) -> Result<Vec<u8>> {
            self.requests.lock().unwrap().push(request.to_vec());
            self.pending = (self.handler)(request).into();
            self.pending.pop_front().ok_or(crate::Error::Timeout)
        }

        async fn receive(&mut self) -> Result<Vec<u8>> {
            self.pending.pop_front().ok_or(crate::Error::Timeout)
        }

        async fn reset(&mut self) -> Result<()> {
            self.pending.clear();
            *self.resets.lock().unwrap() += 1;
            Ok(())
        }

        fn max_block_size(&self) -> usize {
            self.block_size
        }
    }
}
