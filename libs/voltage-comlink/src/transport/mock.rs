//! In-memory transport for tests
//!
//! Every write is recorded and handed to an optional responder closure whose
//! output becomes readable input. The [`MockHandle`] stays with the test after
//! the transport has been moved into an engine.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::{Transport, TransportError, TransportKind, TransportResult};

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    fail_io: bool,
    rx: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
    io_ops: u64,
    open_attempts: u64,
    read_delay: Duration,
}

/// Test-side control of a [`MockTransport`]
#[derive(Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Install the function that answers written frames
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Queue bytes for the reader without a preceding write
    pub fn push_input(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes.iter().copied());
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Make reads and writes fail as if the link dropped
    pub fn set_fail_io(&self, fail: bool) {
        self.state.lock().fail_io = fail;
    }

    /// Latency added to every read, like a slow device
    pub fn set_read_delay(&self, delay: Duration) {
        self.state.lock().read_delay = delay;
    }

    /// Reads and writes performed so far
    pub fn io_ops(&self) -> u64 {
        self.state.lock().io_ops
    }

    pub fn open_attempts(&self) -> u64 {
        self.state.lock().open_attempts
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

/// Scriptable transport
pub struct MockTransport {
    handle: MockHandle,
}

impl MockTransport {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn open(&mut self) -> TransportResult<()> {
        let mut state = self.handle.state.lock();
        state.open_attempts += 1;
        if state.fail_open {
            return Err(TransportError::ConnectionFailed("mock open refused".into()));
        }
        state.open = true;
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> TransportResult<()> {
        let delay = self.handle.state.lock().read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay.min(timeout)).await;
        }
        {
            let mut state = self.handle.state.lock();
            state.io_ops += 1;
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            if state.fail_io {
                state.open = false;
                return Err(TransportError::ConnectionLost("mock link down".into()));
            }
            if state.rx.len() >= buf.len() {
                for slot in buf.iter_mut() {
                    *slot = state.rx.pop_front().unwrap_or_default();
                }
                return Ok(());
            }
            // partial input is consumed like a real line would
            state.rx.clear();
        }
        tokio::time::sleep(timeout).await;
        Err(TransportError::Timeout(timeout))
    }

    async fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        let mut state = self.handle.state.lock();
        state.io_ops += 1;
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if state.fail_io {
            state.open = false;
            return Err(TransportError::ConnectionLost("mock link down".into()));
        }
        state.written.push(data.to_vec());
        let reply = state.responder.as_mut().and_then(|respond| respond(data));
        if let Some(reply) = reply {
            state.rx.extend(reply);
        }
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.handle.state.lock().open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.state.lock().open
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_responder_feeds_reader() {
        let (mut transport, handle) = MockTransport::new();
        handle.set_responder(|req| Some(req.iter().rev().copied().collect()));

        transport.open().await.unwrap();
        transport.write(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 3];
        transport
            .read_exact(&mut buf, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(buf, [3, 2, 1]);
        assert_eq!(handle.io_ops(), 2);
        assert_eq!(handle.written(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_short_input_times_out() {
        let (mut transport, handle) = MockTransport::new();
        transport.open().await.unwrap();
        handle.push_input(&[1]);
        let mut buf = [0u8; 2];
        let err = transport
            .read_exact(&mut buf, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_failures() {
        let (mut transport, handle) = MockTransport::new();
        handle.set_fail_open(true);
        assert!(transport.open().await.is_err());
        handle.set_fail_open(false);
        transport.open().await.unwrap();
        assert_eq!(handle.open_attempts(), 2);

        handle.set_fail_io(true);
        assert!(matches!(
            transport.write(&[0]).await,
            Err(TransportError::ConnectionLost(_))
        ));
        assert!(!transport.is_open());
    }
}
