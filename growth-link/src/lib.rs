//! The bottom of the transport stack: a blocking, cancellable byte-stream
//! link.
//!
//! This plays the role that a raw SPI/UART register interface plays under
//! `drv-sprot-api`, except here the link is a real operating-system serial
//! port (or, in tests, an in-memory double) rather than a memory-mapped
//! peripheral, since the DAQ host runs as an ordinary process rather than a
//! Hubris task.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("link is closed")]
    Closed,
}

/// Contract for the byte-stream link underneath the SSDTP framer.
///
/// `recv` may return a short read (including zero bytes on a timeout);
/// callers that need an exact count should use [`ByteLink::recv_exact`].
/// `cancel_recv` must be safe to call from a thread other than the one
/// blocked in `recv`, and must cause that `recv` (current or next) to
/// return `Ok(0)` promptly.
pub trait ByteLink: Send + Sync {
    fn send(&self, bytes: &[u8]) -> Result<(), LinkError>;
    fn recv(&self, buf: &mut [u8]) -> Result<usize, LinkError>;
    fn set_timeout(&self, timeout: Duration) -> Result<(), LinkError>;
    fn cancel_recv(&self);
    fn close(&self) -> Result<(), LinkError>;

    /// Reports whether `close` has been called on this link. Distinguishes
    /// a closed link's `Ok(0)` from `recv` (terminal) from an ordinary
    /// timeout's `Ok(0)` (try again), for callers like the SSDTP framer
    /// that otherwise cannot tell the two apart.
    fn is_closed(&self) -> bool;

    /// Loops `recv` until `buf` is completely filled, closed, or cancelled.
    /// Returns the number of bytes actually placed in `buf`; a short count
    /// means the link was closed or cancelled mid-read.
    fn recv_exact(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.recv(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// A real serial port, grounded on the `serialport` crate (used for
/// host-to-device UART communication in the `tock-tock` host tooling).
/// `serialport` has no first-class read
/// cancellation, so `cancel_recv` is implemented with a shared flag that
/// `recv` rechecks every time its (short) per-call timeout elapses; this is
/// invisible to callers, who only ever observe "recv returned 0".
pub struct SerialByteLink {
    port: Mutex<Box<dyn serialport::SerialPort>>,
    cancelled: Arc<AtomicBool>,
    closed: AtomicBool,
    poll_quantum: Duration,
}

impl SerialByteLink {
    /// Opens `path` at 230400 8N1, matching the GROWTH FY2015 ADC board's
    /// fixed UART configuration (spec section 6).
    pub fn open(path: &str) -> Result<Self, LinkError> {
        let port = serialport::new(path, 230_400)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(20))
            .open()?;
        Ok(SerialByteLink {
            port: Mutex::new(port),
            cancelled: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            poll_quantum: Duration::from_millis(20),
        })
    }
}

impl ByteLink for SerialByteLink {
    fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut port = self.port.lock().unwrap();
        port.write_all(bytes)?;
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(0);
        }
        if self.cancelled.swap(false, Ordering::AcqRel) {
            trace!("recv observed cancellation, returning 0 bytes");
            return Ok(0);
        }
        let mut port = self.port.lock().unwrap();
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn set_timeout(&self, timeout: Duration) -> Result<(), LinkError> {
        // `recv` polls in `poll_quantum` slices regardless, so the
        // underlying port timeout stays short; only the logical contract
        // (how long a caller is willing to wait across many `recv` calls)
        // changes, and that is layered on top by the RMAP initiator.
        let mut port = self.port.lock().unwrap();
        port.set_timeout(timeout.min(self.poll_quantum))?;
        Ok(())
    }

    fn cancel_recv(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn close(&self) -> Result<(), LinkError> {
        self.closed.store(true, Ordering::Release);
        self.cancelled.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// An in-memory, two-pipe byte link used throughout the test suite in place
/// of real hardware. Tests script both directions independently and can
/// drop, delay, or corrupt bytes before handing them to the link.
pub struct InMemoryByteLink {
    inbox: Mutex<VecDeque<u8>>,
    not_empty: Condvar,
    outbox: Mutex<VecDeque<u8>>,
    cancelled: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Default for InMemoryByteLink {
    fn default() -> Self {
        InMemoryByteLink {
            inbox: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            outbox: Mutex::new(VecDeque::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        }
    }
}

impl InMemoryByteLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-side injection: make bytes available to the next `recv` calls,
    /// as if they had arrived over the wire.
    pub fn push_inbound(&self, bytes: &[u8]) {
        let mut q = self.inbox.lock().unwrap();
        q.extend(bytes.iter().copied());
        self.not_empty.notify_all();
    }

    /// Test-side inspection: bytes this link's owner has sent out.
    pub fn take_outbound(&self) -> Vec<u8> {
        let mut q = self.outbox.lock().unwrap();
        q.drain(..).collect()
    }
}

impl ByteLink for InMemoryByteLink {
    fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        self.outbox.lock().unwrap().extend(bytes.iter().copied());
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut q = self.inbox.lock().unwrap();
        loop {
            if self.cancelled.swap(false, Ordering::AcqRel) {
                return Ok(0);
            }
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            if !q.is_empty() {
                let n = buf.len().min(q.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = q.pop_front().unwrap();
                }
                return Ok(n);
            }
            let (guard, timeout) = self
                .not_empty
                .wait_timeout(q, Duration::from_millis(20))
                .unwrap();
            q = guard;
            if timeout.timed_out() {
                // give the caller (and the cancellation flag) another look
                continue;
            }
        }
    }

    fn set_timeout(&self, _timeout: Duration) -> Result<(), LinkError> {
        Ok(())
    }

    fn cancel_recv(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.not_empty.notify_all();
    }

    fn close(&self) -> Result<(), LinkError> {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_all();
        warn!("in-memory link closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn recv_returns_pushed_bytes() {
        let link = InMemoryByteLink::new();
        link.push_inbound(&[1, 2, 3]);
        let mut buf = [0u8; 8];
        let n = link.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }

    #[test]
    fn recv_exact_blocks_across_multiple_pushes() {
        let link = Arc::new(InMemoryByteLink::new());
        let l2 = link.clone();
        let writer = thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(10));
            l2.push_inbound(&[0xAA, 0xBB]);
            thread::sleep(StdDuration::from_millis(10));
            l2.push_inbound(&[0xCC, 0xDD]);
        });
        let mut buf = [0u8; 4];
        let n = link.recv_exact(&mut buf).unwrap();
        writer.join().unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn cancel_recv_from_another_thread_unblocks_recv() {
        let link = Arc::new(InMemoryByteLink::new());
        let l2 = link.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(30));
            l2.cancel_recv();
        });
        let mut buf = [0u8; 4];
        let n = link.recv(&mut buf).unwrap();
        canceller.join().unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn close_unblocks_pending_recv() {
        let link = Arc::new(InMemoryByteLink::new());
        let l2 = link.clone();
        let closer = thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(30));
            l2.close().unwrap();
        });
        let mut buf = [0u8; 4];
        let n = link.recv(&mut buf).unwrap();
        closer.join().unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn is_closed_reflects_close_call() {
        let link = InMemoryByteLink::new();
        assert!(!link.is_closed());
        link.close().unwrap();
        assert!(link.is_closed());
    }

    #[test]
    fn send_is_visible_to_take_outbound() {
        let link = InMemoryByteLink::new();
        link.send(&[9, 9, 9]).unwrap();
        assert_eq!(link.take_outbound(), vec![9, 9, 9]);
    }
}
