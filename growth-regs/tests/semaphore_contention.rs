//! Two independent RMAP stacks contending for the same hardware semaphore.
//! Each stack gets its own in-memory link and
//! responder thread; the responders share one `Mutex<bool>` standing in for
//! the single FPGA register, so acquisition is arbitrated exactly the way
//! the hardware is described: an atomic single-holder test-and-set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use growth_link::InMemoryByteLink;
use growth_rmap_api::{parse, ParsedPacket, ReplyPacket, RmapStatus, RmapTarget};
use growth_rmap_engine::{RmapEngine, RmapInitiator};
use growth_regs::{RegisterAccess, RegisterAccessConfig, SemaphoreRegister};

const SEMAPHORE_ADDR: u32 = 0x0101_0004;

/// Pulls complete SSDTP frames out of an accumulator buffer as bytes become
/// available, the same header-then-body shape `growth_ssdtp` parses on the
/// real receive path.
fn next_frame(acc: &mut Vec<u8>) -> Option<Vec<u8>> {
    if acc.len() < 12 {
        return None;
    }
    let len = u64::from_be_bytes(acc[4..12].try_into().unwrap()) as usize;
    if acc.len() < 12 + len {
        return None;
    }
    let body = acc[12..12 + len].to_vec();
    acc.drain(..12 + len);
    Some(body)
}

fn push_frame(link: &InMemoryByteLink, body: &[u8]) {
    let mut frame = vec![0x00, 0x00, 0x00, 0x00];
    frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    frame.extend_from_slice(body);
    link.push_inbound(&frame);
}

/// Drives one side of the fake FPGA: answers every command this stack sends
/// with a reply, updating `shared` (the single hardware register) only when
/// this side currently holds it, exactly mirroring a real test-and-set
/// register that has no notion of "whose write is whose" beyond who already
/// owns the lock.
fn run_responder(link: Arc<InMemoryByteLink>, shared: Arc<Mutex<bool>>, stop: Arc<AtomicBool>) {
    let target = RmapTarget::default();
    let mut i_hold = false;
    let mut acc = Vec::new();
    while !stop.load(Ordering::Acquire) {
        let out = link.take_outbound();
        if out.is_empty() {
            thread::sleep(Duration::from_millis(2));
            continue;
        }
        acc.extend(out);
        while let Some(body) = next_frame(&mut acc) {
            let command = match parse(&body) {
                Ok(ParsedPacket::Command(c)) => c,
                _ => continue,
            };
            let tid = command.transaction_id;
            if command.instruction.write {
                let payload = command.payload.clone().unwrap();
                let value = u16::from_be_bytes([payload[0], payload[1]]);
                let mut locked = shared.lock().unwrap();
                if value != 0 {
                    if !*locked {
                        *locked = true;
                        i_hold = true;
                    }
                } else if i_hold {
                    *locked = false;
                    i_hold = false;
                }
                drop(locked);
                if command.instruction.reply {
                    let reply = ReplyPacket::write_reply(&target, tid, RmapStatus::Success);
                    push_frame(&link, &reply.serialize());
                }
            } else {
                let value: u16 = if i_hold { 0xBEEF } else { 0x0000 };
                let reply = ReplyPacket::read_reply(&target, tid, RmapStatus::Success, value.to_be_bytes().to_vec());
                push_frame(&link, &reply.serialize());
            }
        }
    }
}

fn build_stack() -> (Arc<InMemoryByteLink>, SemaphoreRegister<InMemoryByteLink>) {
    let link = Arc::new(InMemoryByteLink::new());
    let engine = RmapEngine::new(link.clone());
    let initiator = RmapInitiator::new(engine, RmapTarget::default());
    let regs = Arc::new(RegisterAccess::new(initiator, RegisterAccessConfig::default()));
    let semaphore = SemaphoreRegister::new(regs, SEMAPHORE_ADDR);
    (link, semaphore)
}

#[test]
fn exactly_one_acquisition_executes_at_a_time() {
    let shared = Arc::new(Mutex::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let (link_a, semaphore_a) = build_stack();
    let (link_b, semaphore_b) = build_stack();

    let responder_a = {
        let (link, shared, stop) = (link_a, shared.clone(), stop.clone());
        thread::spawn(move || run_responder(link, shared, stop))
    };
    let responder_b = {
        let (link, shared, stop) = (link_b, shared.clone(), stop.clone());
        thread::spawn(move || run_responder(link, shared, stop))
    };

    let active: Arc<Mutex<Option<&'static str>>> = Arc::new(Mutex::new(None));

    let run = |name: &'static str, semaphore: SemaphoreRegister<InMemoryByteLink>, active: Arc<Mutex<Option<&'static str>>>| {
        thread::spawn(move || {
            for _ in 0..5 {
                let lock = semaphore.acquire().expect("acquisition should not time out");
                {
                    let mut guard = active.lock().unwrap();
                    assert!(guard.is_none(), "two holders of the hardware semaphore at once");
                    *guard = Some(name);
                }
                thread::sleep(Duration::from_millis(3));
                {
                    let mut guard = active.lock().unwrap();
                    assert_eq!(*guard, Some(name));
                    *guard = None;
                }
                drop(lock);
            }
        })
    };

    let a = run("A", semaphore_a, active.clone());
    let b = run("B", semaphore_b, active.clone());

    a.join().unwrap();
    b.join().unwrap();
    stop.store(true, Ordering::Release);
    responder_a.join().unwrap();
    responder_b.join().unwrap();

    assert!(active.lock().unwrap().is_none());
}
