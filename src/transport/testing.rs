//! In-memory transport for multiplexer tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

use super::{ConnectionState, Transport};

#[derive(Debug)]
struct MockState {
    state: ConnectionState,
    buffered: usize,
    written: Vec<String>,
    close_calls: usize,
}

/// Records every write; state and buffer occupancy are set by the test.
#[derive(Debug, Clone)]
pub(crate) struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                state,
                buffered: 0,
                written: Vec::new(),
                close_calls: 0,
            })),
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn set_buffered(&self, bytes: usize) {
        self.inner.lock().buffered = bytes;
    }

    pub(crate) fn written(&self) -> Vec<String> {
        self.inner.lock().written.clone()
    }

    pub(crate) fn written_values(&self) -> Vec<serde_json::Value> {
        self.written()
            .iter()
            .map(|f| serde_json::from_str(f).expect("frame is json"))
            .collect()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.inner.lock().close_calls
    }
}

impl Transport for MockTransport {
    fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    fn buffered_amount(&self) -> usize {
        self.inner.lock().buffered
    }

    fn write(&self, frame: String) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return Err(Error::NotConnected);
        }
        inner.written.push(frame);
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.close_calls += 1;
        inner.state = ConnectionState::Closed;
    }
}
