//! Top-level facade wiring the transport, RMAP, register-access and
//! decoder-pipeline crates into one running system.
//!
//! This crate plays the role an application's top-level task-spawn code
//! plays for a Hubris image: it owns no protocol logic of its own, only the
//! construction and lifetime of the pieces underneath it. The CLI, ZeroMQ
//! REPL, YAML config loader and archive file writer that would normally
//! drive this facade are out of scope, same as in the design this
//! crate implements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use growth_decoder::{
    BufferPool, DecoderPipeline, EventFifoProducer, EventPool, EventListPool, DEFAULT_CHUNK_SIZE,
};
use growth_link::ByteLink;
use growth_rmap_api::RmapTarget;
use growth_rmap_engine::{RmapEngine, RmapInitiator};
use growth_regs::{RegisterAccess, RegisterAccessConfig, SemaphoreRegister, SEMAPHORE_DEFAULT_DEADLINE};
use serde::{Deserialize, Serialize};

/// The FPGA start/stop hardware semaphore register.
pub const REG_START_STOP_SEMAPHORE: u32 = 0x0101_0004;

/// Every tunable the design calls out numerically, collected into one
/// serde-derivable, `Copy` struct so an (out-of-scope) YAML loader can
/// construct it without this crate knowing about YAML.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DaqConfig {
    pub register: RegisterAccessConfig,
    pub semaphore_addr: u32,
    pub semaphore_deadline: Duration,
    pub decoder_high_water_mark: usize,
    pub decoder_chunk_size: usize,
    pub decoder_poll_interval: Duration,
    pub byte_buffer_size: usize,
}

impl Default for DaqConfig {
    fn default() -> Self {
        DaqConfig {
            register: RegisterAccessConfig::default(),
            semaphore_addr: REG_START_STOP_SEMAPHORE,
            semaphore_deadline: SEMAPHORE_DEFAULT_DEADLINE,
            decoder_high_water_mark: 64,
            decoder_chunk_size: DEFAULT_CHUNK_SIZE,
            decoder_poll_interval: Duration::from_millis(100),
            byte_buffer_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// A fully wired DAQ core: one RMAP engine over one byte-link, a register
/// façade and hardware semaphore on top of it, and a decoder pipeline fed
/// by an event-FIFO producer.
pub struct DaqSystem<L: ByteLink> {
    engine: Arc<RmapEngine<L>>,
    regs: Arc<RegisterAccess<L>>,
    semaphore: SemaphoreRegister<L>,
    pipeline: Arc<DecoderPipeline>,
    producer: EventFifoProducer<L>,
}

impl<L: ByteLink + 'static> DaqSystem<L> {
    pub fn new(link: Arc<L>, target: RmapTarget, config: DaqConfig) -> Self {
        let engine = RmapEngine::new(link);
        let initiator = RmapInitiator::new(engine.clone(), target);
        let regs = Arc::new(RegisterAccess::new(initiator, config.register));
        let semaphore = SemaphoreRegister::new(regs.clone(), config.semaphore_addr).with_deadline(config.semaphore_deadline);

        let buffer_pool = Arc::new(BufferPool::new(config.byte_buffer_size));
        let event_pool = Arc::new(EventPool::new());
        let list_pool = Arc::new(EventListPool::new());
        let pipeline = DecoderPipeline::new(buffer_pool.clone(), event_pool, list_pool, config.decoder_high_water_mark);
        let producer = EventFifoProducer::new(regs.clone(), pipeline.clone(), buffer_pool)
            .with_poll_interval(config.decoder_poll_interval);

        DaqSystem {
            engine,
            regs,
            semaphore,
            pipeline,
            producer,
        }
    }

    pub fn registers(&self) -> &Arc<RegisterAccess<L>> {
        &self.regs
    }

    pub fn semaphore(&self) -> &SemaphoreRegister<L> {
        &self.semaphore
    }

    pub fn pipeline(&self) -> &Arc<DecoderPipeline> {
        &self.pipeline
    }

    pub fn engine(&self) -> &Arc<RmapEngine<L>> {
        &self.engine
    }

    /// Runs the event-FIFO producer's poll loop until `stop` is set,
    /// sleeping `poll_interval` between cycles that found nothing to read.
    pub fn run_producer_loop(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            match self.producer.poll_once() {
                Ok(0) => thread::sleep(self.producer.poll_interval()),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "event-fifo producer poll failed");
                    thread::sleep(self.producer.poll_interval());
                }
            }
        }
    }

    /// Shuts down the decoder pipeline and the RMAP engine. Idempotent,
    /// since both underlying `shutdown()` calls are.
    pub fn shutdown(&self) {
        self.pipeline.shutdown();
        self.engine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use growth_link::InMemoryByteLink;

    #[test]
    fn config_defaults_match_design_constants() {
        let config = DaqConfig::default();
        assert_eq!(config.register.max_retries, growth_regs::MAX_RETRIES);
        assert_eq!(config.semaphore_deadline, SEMAPHORE_DEFAULT_DEADLINE);
        assert_eq!(config.semaphore_addr, REG_START_STOP_SEMAPHORE);
    }

    #[test]
    fn system_wires_up_and_shuts_down_cleanly() {
        let link = Arc::new(InMemoryByteLink::new());
        let system = DaqSystem::new(link, RmapTarget::default(), DaqConfig::default());
        system.shutdown();
        system.shutdown(); // idempotent
    }
}
