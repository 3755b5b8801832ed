//! SSDTP (Simple Synchronous Data Transfer Protocol) framer.
//!
//! Segments and reassembles variable-length SpaceWire packets carried over a
//! byte-stream [`ByteLink`], preserving end-of-packet markers and forwarding
//! (but not surfacing) SpaceWire time-code control frames. This plays the
//! same role `lib-host-sp-messages`'s `Header`/checksum framing plays for a
//! SP-to-host control UART: a small, fixed header followed by a
//! length-prefixed body, reassembled before the payload above it ever sees a
//! byte.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use growth_link::ByteLink;
use tracing::{debug, trace, warn};

const HEADER_LEN: usize = 12;
const MAX_FRAGMENT_BODY: usize = 100 * 1024;

const FLAG_DATA_EOP: u8 = 0x00;
const FLAG_DATA_EEP: u8 = 0x01;
const FLAG_DATA_CONTINUED: u8 = 0x02;
const FLAG_TIME_CODE_SENT: u8 = 0x30;
const FLAG_TIME_CODE_GOT: u8 = 0x31;
const FLAG_TX_SPEED_CHANGE: u8 = 0x38;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EopKind {
    Eop,
    Eep,
}

#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    #[error("transport error: {0}")]
    Link(#[from] growth_link::LinkError),
    #[error("fragment body of {0} bytes exceeds the {MAX_FRAGMENT_BODY}-byte limit")]
    OversizedFragment(usize),
    #[error("unrecognised SSDTP flag byte 0x{0:02x}")]
    UnknownFlag(u8),
}

/// One reassembled logical packet, or the outcome of a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeCodeEvent {
    Sent { code: u8 },
    Got { code: u8 },
    TxSpeedChange { value: u8 },
}

pub struct SsdtpFramer<L: ByteLink> {
    link: Arc<L>,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
    cancel: Arc<AtomicBool>,
}

impl<L: ByteLink> SsdtpFramer<L> {
    pub fn new(link: Arc<L>) -> Self {
        SsdtpFramer {
            link,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send and receive use independent locks, so a sender never blocks
    /// behind a receiver stuck waiting on the link (spec: "send and receive
    /// have independent mutexes; they may proceed in parallel").
    pub fn send(&self, payload: &[u8], eop: EopKind) -> Result<(), FramerError> {
        if payload.len() > MAX_FRAGMENT_BODY {
            return Err(FramerError::OversizedFragment(payload.len()));
        }
        let _guard = self.send_lock.lock().unwrap();
        let flag = match eop {
            EopKind::Eop => FLAG_DATA_EOP,
            EopKind::Eep => FLAG_DATA_EEP,
        };
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        push_header(&mut frame, flag, payload.len());
        frame.extend_from_slice(payload);
        self.link.send(&frame)?;
        trace!(len = payload.len(), ?eop, "ssdtp frame sent");
        Ok(())
    }

    /// Causes a `recv` that is currently blocked (or about to block) to
    /// return `Ok(None)` promptly, and unblocks the underlying link read so
    /// it does not have to wait out its own timeout first.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        self.link.cancel_recv();
    }

    /// Blocks until one complete logical packet is assembled, a control
    /// frame is consumed, or the framer is cancelled.
    ///
    /// Returns `Ok(None)` exactly when the link is closed/cancelled with no
    /// packet in hand; real protocol errors (oversized fragment, unknown
    /// flag) are returned as `Err`.
    pub fn recv(&self) -> Result<Option<(Vec<u8>, EopKind)>, FramerError> {
        let _guard = self.recv_lock.lock().unwrap();
        let mut reassembly: Vec<u8> = Vec::new();
        loop {
            let Some((flag, len)) = self.recv_header()? else {
                return Ok(None);
            };
            match flag {
                FLAG_DATA_EOP | FLAG_DATA_EEP | FLAG_DATA_CONTINUED => {
                    if len > MAX_FRAGMENT_BODY {
                        return Err(FramerError::OversizedFragment(len));
                    }
                    let mut body = vec![0u8; len];
                    let n = self.link.recv_exact(&mut body)?;
                    if n < len {
                        // link closed/cancelled mid-body; no complete packet.
                        return Ok(None);
                    }
                    reassembly.extend_from_slice(&body);
                    match flag {
                        FLAG_DATA_CONTINUED => continue,
                        FLAG_DATA_EOP => {
                            trace!(len = reassembly.len(), "ssdtp packet reassembled (EOP)");
                            return Ok(Some((reassembly, EopKind::Eop)));
                        }
                        _ => {
                            trace!(len = reassembly.len(), "ssdtp packet reassembled (EEP)");
                            return Ok(Some((reassembly, EopKind::Eep)));
                        }
                    }
                }
                FLAG_TIME_CODE_SENT | FLAG_TIME_CODE_GOT | FLAG_TX_SPEED_CHANGE => {
                    let mut body = [0u8; 2];
                    let n = self.link.recv_exact(&mut body)?;
                    if n < 2 {
                        return Ok(None);
                    }
                    let event = match flag {
                        FLAG_TIME_CODE_SENT => TimeCodeEvent::Sent { code: body[0] },
                        FLAG_TIME_CODE_GOT => TimeCodeEvent::Got { code: body[0] },
                        _ => TimeCodeEvent::TxSpeedChange { value: body[0] },
                    };
                    debug!(?event, "ssdtp control frame consumed");
                    continue;
                }
                other => {
                    warn!(flag = format!("0x{other:02x}"), "ssdtp unknown flag, treating as transport error");
                    return Err(FramerError::UnknownFlag(other));
                }
            }
        }
    }

    /// Reads one 12-byte SSDTP header, looping on ordinary timeout-zero
    /// reads. Returns `Ok(None)` as soon as the framer is cancelled or the
    /// underlying link reports closed, even if the link was closed directly
    /// via [`ByteLink::close`] without a paired [`SsdtpFramer::cancel`].
    fn recv_header(&self) -> Result<Option<(u8, usize)>, FramerError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        loop {
            if self.cancel.swap(false, Ordering::AcqRel) {
                return Ok(None);
            }
            let n = self.link.recv(&mut header[filled..])?;
            if n == 0 {
                if self.link.is_closed() {
                    return Ok(None);
                }
                // an ordinary link timeout; try again.
                continue;
            }
            filled += n;
            if filled == HEADER_LEN {
                let flag = header[0];
                let len = u64::from_be_bytes(header[4..12].try_into().unwrap()) as usize;
                return Ok(Some((flag, len)));
            }
        }
    }
}

fn push_header(buf: &mut Vec<u8>, flag: u8, len: usize) {
    buf.push(flag);
    buf.push(0x00);
    let len_bytes = (len as u64).to_be_bytes();
    // bytes 2..11 are a 10-byte-wide big-endian length; the value itself
    // never needs more than 8 bytes, so the top two are always zero.
    buf.push(0x00);
    buf.push(0x00);
    buf.extend_from_slice(&len_bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use growth_link::InMemoryByteLink;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn raw_frame(flag: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        push_header(&mut buf, flag, body.len());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn send_then_peer_sees_correct_header() {
        let link = Arc::new(InMemoryByteLink::new());
        let framer = SsdtpFramer::new(link.clone());
        framer.send(b"hello", EopKind::Eop).unwrap();
        let out = link.take_outbound();
        assert_eq!(out, raw_frame(FLAG_DATA_EOP, b"hello"));
    }

    #[test]
    fn recv_single_frame_eop() {
        let link = Arc::new(InMemoryByteLink::new());
        let framer = SsdtpFramer::new(link.clone());
        link.push_inbound(&raw_frame(FLAG_DATA_EOP, b"abc"));
        let (payload, eop) = framer.recv().unwrap().unwrap();
        assert_eq!(payload, b"abc");
        assert_eq!(eop, EopKind::Eop);
    }

    #[test]
    fn recv_single_frame_eep() {
        let link = Arc::new(InMemoryByteLink::new());
        let framer = SsdtpFramer::new(link.clone());
        link.push_inbound(&raw_frame(FLAG_DATA_EEP, b"x"));
        let (payload, eop) = framer.recv().unwrap().unwrap();
        assert_eq!(payload, b"x");
        assert_eq!(eop, EopKind::Eep);
    }

    #[test]
    fn fragmented_response_reassembles_in_order() {
        let link = Arc::new(InMemoryByteLink::new());
        let framer = SsdtpFramer::new(link.clone());
        let part1 = [1u8, 2, 3, 4, 5, 6, 7];
        let part2 = [8u8, 9, 10, 11, 12, 13, 14, 15, 16];
        link.push_inbound(&raw_frame(FLAG_DATA_CONTINUED, &part1));
        link.push_inbound(&raw_frame(FLAG_DATA_EOP, &part2));
        let (payload, eop) = framer.recv().unwrap().unwrap();
        assert_eq!(payload.len(), 16);
        assert_eq!(payload[..7], part1);
        assert_eq!(payload[7..], part2);
        assert_eq!(eop, EopKind::Eop);
    }

    #[test]
    fn time_code_control_frame_is_swallowed_not_emitted() {
        let link = Arc::new(InMemoryByteLink::new());
        let framer = SsdtpFramer::new(link.clone());
        link.push_inbound(&raw_frame(FLAG_TIME_CODE_GOT, &[7, 0]));
        link.push_inbound(&raw_frame(FLAG_DATA_EOP, b"after"));
        let (payload, _) = framer.recv().unwrap().unwrap();
        assert_eq!(payload, b"after");
    }

    #[test]
    fn oversized_fragment_is_rejected() {
        let link = Arc::new(InMemoryByteLink::new());
        let framer = SsdtpFramer::new(link.clone());
        let mut header = Vec::new();
        push_header(&mut header, FLAG_DATA_EOP, MAX_FRAGMENT_BODY + 1);
        link.push_inbound(&header);
        let err = framer.recv().unwrap_err();
        assert!(matches!(err, FramerError::OversizedFragment(_)));
    }

    #[test]
    fn unknown_flag_is_a_transport_error() {
        let link = Arc::new(InMemoryByteLink::new());
        let framer = SsdtpFramer::new(link.clone());
        link.push_inbound(&raw_frame(0x7f, &[]));
        let err = framer.recv().unwrap_err();
        assert!(matches!(err, FramerError::UnknownFlag(0x7f)));
    }

    #[test]
    fn cancel_from_another_thread_unblocks_recv() {
        let link = Arc::new(InMemoryByteLink::new());
        let framer = Arc::new(SsdtpFramer::new(link));
        let f2 = framer.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            f2.cancel();
        });
        let result = framer.recv().unwrap();
        canceller.join().unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn bare_link_close_unblocks_recv_without_framer_cancel() {
        // The link is closed directly via `ByteLink::close`, never through
        // `SsdtpFramer::cancel`/`cancel_recv` -- `recv` must still return
        // promptly rather than polling forever.
        let link = Arc::new(InMemoryByteLink::new());
        let framer = Arc::new(SsdtpFramer::new(link.clone()));
        let f2 = framer.clone();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            link.close().unwrap();
        });
        let result = f2.recv().unwrap();
        closer.join().unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn send_and_recv_use_independent_locks() {
        // A recv blocked waiting for data must not prevent a concurrent
        // send from completing.
        let link = Arc::new(InMemoryByteLink::new());
        let framer = Arc::new(SsdtpFramer::new(link.clone()));
        let f2 = framer.clone();
        let receiver = thread::spawn(move || f2.recv());
        thread::sleep(Duration::from_millis(20));
        framer.send(b"ping", EopKind::Eop).unwrap();
        assert_eq!(link.take_outbound(), raw_frame(FLAG_DATA_EOP, b"ping"));
        framer.cancel();
        receiver.join().unwrap().unwrap();
    }

    proptest::proptest! {
        #[test]
        fn concatenated_frames_reassemble_to_same_payloads(
            payloads in proptest::collection::vec(proptest::collection::vec(0u8..=255, 0..200), 1..10)
        ) {
            let link = Arc::new(InMemoryByteLink::new());
            let framer = SsdtpFramer::new(link.clone());
            for p in &payloads {
                link.push_inbound(&raw_frame(FLAG_DATA_EOP, p));
            }
            for expected in &payloads {
                let (payload, eop) = framer.recv().unwrap().unwrap();
                proptest::prop_assert_eq!(&payload, expected);
                proptest::prop_assert_eq!(eop, EopKind::Eop);
            }
        }
    }
}
