//! In-memory `RawConn` pair for testing and in-process plumbing.
//!
//! `MemConn::pair()` returns two connected ends. Writes never block (the
//! buffer is unbounded); reads block until data arrives, the read timeout
//! elapses, or either end is shut down.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::raw_conn::RawConn;

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

/// One direction of the pair.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

/// One end of an in-memory duplex stream.
pub struct MemConn {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    read_timeout: Arc<Mutex<Option<Duration>>>,
}

impl MemConn {
    /// Create two connected ends.
    pub fn pair() -> (MemConn, MemConn) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let a = MemConn {
            rx: Arc::clone(&b_to_a),
            tx: Arc::clone(&a_to_b),
            read_timeout: Arc::default(),
        };
        let b = MemConn {
            rx: a_to_b,
            tx: b_to_a,
            read_timeout: Arc::default(),
        };
        (a, b)
    }

    fn read_timeout(&self) -> Option<Duration> {
        *self.read_timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Read for MemConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.read_timeout().map(|t| Instant::now() + t);
        let mut state = self.rx.lock();
        while state.data.is_empty() && !state.closed {
            state = match deadline {
                None => self.rx.ready.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                    }
                    self.rx
                        .ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        let n = buf.len().min(state.data.len());
        for (dst, src) in buf.iter_mut().zip(state.data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MemConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.tx.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        state.data.extend(buf);
        drop(state);
        self.tx.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RawConn for MemConn {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        if timeout == Some(Duration::ZERO) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero timeout"));
        }
        *self.read_timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
        Ok(())
    }

    // Writes never block.
    fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        self.rx.close();
        self.tx.close();
        Ok(())
    }

    fn try_clone_conn(&self) -> io::Result<Box<dyn RawConn>> {
        Ok(Box::new(MemConn {
            rx: Arc::clone(&self.rx),
            tx: Arc::clone(&self.tx),
            read_timeout: Arc::clone(&self.read_timeout),
        }))
    }
}

impl Drop for MemConn {
    fn drop(&mut self) {
        // The last handle to an end closes it so the peer sees EOF.
        if Arc::strong_count(&self.read_timeout) == 1 {
            self.rx.close();
            self.tx.close();
        }
    }
}
