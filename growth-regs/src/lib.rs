//! Typed FPGA register access on top of an RMAP initiator: 16/32/48-bit
//! reads/writes with a fixed retry discipline, plus the hardware-semaphore
//! RAII lock used to serialise acquisition start/stop against the FPGA.
//!
//! Grounded the same way `drv-sprot-api`'s higher-level helpers sit on top
//! of its raw `Msg` pack/unpack: a thin typed layer that never touches the
//! wire format directly, only the transaction primitives underneath it.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use growth_link::ByteLink;
use growth_rmap_engine::{InitiatorError, RmapInitiator};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Number of attempts a register accessor makes before giving up, matching
/// this design's retry discipline for the register-access façade.
pub const MAX_RETRIES: u32 = 5;

/// Delay between retries on a timed-out register access.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("register access timed out after {0} attempts")]
    RetriesExhausted(u32),
    #[error(transparent)]
    Initiator(#[from] InitiatorError),
}

/// Configuration for retry/backoff and default per-call timeout, exposed so
/// an application can tune it without editing this crate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegisterAccessConfig {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RegisterAccessConfig {
    fn default() -> Self {
        RegisterAccessConfig {
            max_retries: MAX_RETRIES,
            retry_backoff: RETRY_BACKOFF,
            call_timeout: Duration::from_millis(1000),
        }
    }
}

/// A typed view over one RMAP target's register space.
pub struct RegisterAccess<L: ByteLink> {
    initiator: RmapInitiator<L>,
    config: RegisterAccessConfig,
}

impl<L: ByteLink + 'static> RegisterAccess<L> {
    pub fn new(initiator: RmapInitiator<L>, config: RegisterAccessConfig) -> Self {
        RegisterAccess { initiator, config }
    }

    fn retrying<T>(&self, mut op: impl FnMut() -> Result<T, InitiatorError>) -> Result<T, RegisterError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(InitiatorError::Timeout) if attempt < self.config.max_retries => {
                    debug!(attempt, "register access timed out, retrying");
                    thread::sleep(self.config.retry_backoff);
                }
                Err(InitiatorError::Timeout) => {
                    warn!(attempts = attempt, "register access exhausted retries");
                    return Err(RegisterError::RetriesExhausted(attempt));
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    pub fn read_bulk(&self, addr: u32, buf: &mut [u8]) -> Result<(), RegisterError> {
        self.retrying(|| self.initiator.read(addr, buf.len() as u32, buf, self.config.call_timeout))
    }

    /// Reads a 16-bit register in a single RMAP transaction.
    pub fn read16(&self, addr: u32) -> Result<u16, RegisterError> {
        let mut buf = [0u8; 2];
        self.read_bulk(addr, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Reads a 32-bit register as two sequential 16-bit RMAP reads: the
    /// first read returns the least-significant half, the second the
    /// most-significant half.
    pub fn read32(&self, addr: u32) -> Result<u32, RegisterError> {
        let lower = self.read16(addr)?;
        let upper = self.read16(addr + 2)?;
        Ok(((upper as u32) << 16) | lower as u32)
    }

    /// Reads a 48-bit register as three sequential 16-bit RMAP reads, in
    /// ascending order of significance.
    pub fn read48(&self, addr: u32) -> Result<u64, RegisterError> {
        let low = self.read16(addr)? as u64;
        let mid = self.read16(addr + 2)? as u64;
        let high = self.read16(addr + 4)? as u64;
        Ok((high << 32) | (mid << 16) | low)
    }

    pub fn write16(&self, addr: u32, value: u16) -> Result<(), RegisterError> {
        let bytes = value.to_be_bytes();
        self.retrying(|| self.initiator.write(addr, &bytes, self.config.call_timeout, None))
    }

    /// Writes a 32-bit value as two 16-bit halves, least-significant half
    /// first, matching the read-side byte order.
    pub fn write32(&self, addr: u32, value: u32) -> Result<(), RegisterError> {
        self.write16(addr, (value & 0xFFFF) as u16)?;
        self.write16(addr + 2, (value >> 16) as u16)
    }
}

const SEMAPHORE_REQUEST: u16 = 0xFFFF;
const SEMAPHORE_RELEASE: u16 = 0x0000;

#[derive(Debug, thiserror::Error)]
pub enum SemaphoreError {
    #[error("semaphore acquisition did not succeed within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Register(#[from] RegisterError),
}

/// Poll interval used while spin-waiting for the hardware semaphore
/// register to report a result.
pub const SEMAPHORE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default deadline for [`SemaphoreRegister::acquire`]; the original
/// acquisition loop had no deadline at all, which this design treats as an
/// omission rather than an intended behaviour (see design notes).
pub const SEMAPHORE_DEFAULT_DEADLINE: Duration = Duration::from_secs(2);

/// A one-bit hardware mutex realised as an FPGA register: writing
/// `0xFFFF` requests the lock, a non-zero readback means the request won,
/// and writing `0x0000` releases it.
pub struct SemaphoreRegister<L: ByteLink> {
    regs: Arc<RegisterAccess<L>>,
    addr: u32,
    deadline: Duration,
}

impl<L: ByteLink + 'static> SemaphoreRegister<L> {
    pub fn new(regs: Arc<RegisterAccess<L>>, addr: u32) -> Self {
        SemaphoreRegister {
            regs,
            addr,
            deadline: SEMAPHORE_DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Spins, sleeping [`SEMAPHORE_POLL_INTERVAL`] between attempts, until
    /// the request is won or `deadline` elapses.
    pub fn acquire(&self) -> Result<SemaphoreLock<'_, L>, SemaphoreError> {
        let start = Instant::now();
        loop {
            self.regs.write16(self.addr, SEMAPHORE_REQUEST)?;
            let readback = self.regs.read16(self.addr)?;
            if readback != 0 {
                return Ok(SemaphoreLock { semaphore: self });
            }
            if start.elapsed() >= self.deadline {
                return Err(SemaphoreError::Timeout(self.deadline));
            }
            thread::sleep(SEMAPHORE_POLL_INTERVAL);
        }
    }

    fn release(&self) -> Result<(), SemaphoreError> {
        let start = Instant::now();
        loop {
            self.regs.write16(self.addr, SEMAPHORE_RELEASE)?;
            let readback = self.regs.read16(self.addr)?;
            if readback == 0 {
                return Ok(());
            }
            if start.elapsed() >= self.deadline {
                return Err(SemaphoreError::Timeout(self.deadline));
            }
            thread::sleep(SEMAPHORE_POLL_INTERVAL);
        }
    }
}

/// RAII handle tying acquisition to a scoped region: any start/stop
/// sequence performed while this is held is mutually exclusive with other
/// holders, host-wide and FPGA-wide.
pub struct SemaphoreLock<'a, L: ByteLink + 'static> {
    semaphore: &'a SemaphoreRegister<L>,
}

impl<L: ByteLink + 'static> Drop for SemaphoreLock<'_, L> {
    fn drop(&mut self) {
        if let Err(e) = self.semaphore.release() {
            warn!(error = %e, "failed to release hardware semaphore on drop");
        }
    }
}

/// Decoded GPS time snapshot: the last NMEA-derived ASCII string the
/// receiver produced, paired with the FPGA's free-running time tag latched
/// at the moment that string was written into the register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpsSnapshot {
    pub gps_ascii: [u8; 14],
    pub fpga_time_tag: u64,
}

/// Decodes the 20-byte GPS time-register blob at `0x20000002..0x20000015`
/// into a [`GpsSnapshot`]: bytes `0..14` are the ASCII tag, bytes `14..20`
/// are the 48-bit time tag as a big-endian binary counter. Non-ASCII bytes
/// in the leading string are replaced with `?` rather than treated as a
/// decode failure -- a glitched receiver byte should not take down a GPS
/// snapshot that is otherwise informative.
pub fn decode_gps_snapshot(blob: &[u8; 20]) -> GpsSnapshot {
    let mut gps_ascii = [0u8; 14];
    for (dst, &src) in gps_ascii.iter_mut().zip(blob[0..14].iter()) {
        *dst = if src.is_ascii() { src } else { b'?' };
    }
    let fpga_time_tag = blob[14..20]
        .iter()
        .fold(0u64, |acc, &byte| (acc << 8) | byte as u64);
    GpsSnapshot {
        gps_ascii,
        fpga_time_tag,
    }
}
