pub mod pipeline;
pub mod ring;

pub use pipeline::{RxAudioPipeline, RxCipSummary, StreamProcessor};
pub use ring::RxDmaRing;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use isofire_ohci as ohci;
use tracing::{debug, info};

use crate::error::IsochError;
use crate::hw::{DmaMemory, OhciRegisters};
use crate::sync::ExternalSyncBridge;
use crate::timing::host_now_ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
}

/// Isochronous receive context: the IR descriptor ring plus the audio RX
/// pipeline, polled at watchdog cadence (and from the ISR, deduplicated).
pub struct RxContext {
    regs: Arc<dyn OhciRegisters>,
    dma: Box<dyn DmaMemory>,
    context_index: u8,
    channel: u8,
    state: RxState,

    ring: RxDmaRing,
    audio: RxAudioPipeline,
    poll_in_progress: AtomicBool,
}

impl RxContext {
    pub fn new(regs: Arc<dyn OhciRegisters>, dma: Box<dyn DmaMemory>, context_index: u8) -> RxContext {
        RxContext {
            regs,
            dma,
            context_index,
            channel: 0,
            state: RxState::Unconfigured,
            ring: RxDmaRing::new(),
            audio: RxAudioPipeline::new(),
            poll_in_progress: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn audio(&self) -> &RxAudioPipeline {
        &self.audio
    }

    pub fn set_shared_rx_queue(&mut self, base: *mut u8, bytes: u64) -> bool {
        self.audio.set_shared_rx_queue(base, bytes)
    }

    pub fn set_external_sync_bridge(&mut self, bridge: Option<Arc<ExternalSyncBridge>>) {
        self.audio.set_external_sync_bridge(bridge);
    }

    pub fn configure(&mut self, channel: u8) -> crate::error::Result<()> {
        if self.state == RxState::Running {
            return Err(IsochError::Busy);
        }
        self.channel = channel;
        self.ring.setup_rings(self.dma.as_mut())?;
        self.audio.configure_for_48k();
        self.state = RxState::Configured;
        debug!("ir: configured ch={}", channel);
        Ok(())
    }

    pub fn start(&mut self) -> crate::error::Result<()> {
        if self.state != RxState::Configured && self.state != RxState::Stopped {
            return Err(IsochError::NotReady);
        }
        if !self.ring.has_rings() {
            return Err(IsochError::NoResources);
        }

        self.ring.program(self.dma.as_ref());
        self.audio.on_start();
        self.ring.start(self.regs.as_ref(), self.context_index, self.channel);

        let ctrl = self.regs.read(ohci::ir_context_control_set(self.context_index));
        if ctrl & ohci::CONTEXT_DEAD != 0 {
            return Err(IsochError::Dead);
        }

        self.state = RxState::Running;
        info!("ir: started ch={}", self.channel);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.state != RxState::Running {
            return;
        }
        self.ring.stop(self.regs.as_ref(), self.context_index);
        self.audio.on_stop();
        self.state = RxState::Stopped;
        info!(
            "ir: stopped, {} packets ({} data)",
            self.audio.stream().packet_count(),
            self.audio.stream().sample_packet_count()
        );
    }

    /// Drain completed receive slots. Callable from the ISR and the 1 kHz
    /// watchdog; overlapping calls collapse to one.
    pub fn poll(&mut self) -> u32 {
        if self.state != RxState::Running {
            return 0;
        }
        if self.poll_in_progress.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let start = host_now_ns();
        let ring = &mut self.ring;
        let audio = &mut self.audio;
        let processed = ring.poll(self.regs.as_ref(), self.dma.as_ref(), self.context_index, |p| {
            audio.on_packet(p);
        });
        audio.on_poll_end(self.regs.as_ref(), processed, start);

        self.poll_in_progress.store(false, Ordering::Release);
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::CipBuilder;
    use crate::encoding::am824;
    use crate::hw::{SharedDmaMemory, SimOhci};
    use crate::shm::{SharedQueue, SharedRegion};

    fn data_packet(dbc: u8, events: u32) -> Vec<u8> {
        let builder = CipBuilder::new(5, 2);
        let (q0, q1) = builder.build(dbc, 0x2E00, false);
        let mut buf = vec![0u8; 8 + 8 + (events * 2 * 4) as usize];
        CipBuilder::write(&mut buf[8..], q0, q1);
        for i in 0..(events * 2) as usize {
            am824::write_quadlet(&mut buf[16 + i * 4..20 + i * 4], am824::encode(i as i32));
        }
        buf
    }

    #[test]
    fn duplex_rx_path_decodes_into_queue() {
        let bytes = SharedQueue::required_bytes(1024, 2);
        let region = SharedRegion::new(bytes as usize).unwrap();
        assert!(SharedQueue::initialize_in_place(region.base(), bytes, 1024, 2));
        let mut reader = SharedQueue::default();
        assert!(reader.attach(region.base(), bytes));

        let mem = SharedDmaMemory::new();
        let sim = Arc::new(SimOhci::new(mem.clone()));
        let mut ctx = RxContext::new(sim.clone(), Box::new(mem), 0);
        ctx.set_shared_rx_queue(region.base(), bytes);
        ctx.configure(9).unwrap();
        ctx.start().unwrap();

        let mut dbc = 0u8;
        for _ in 0..4 {
            assert!(sim.deliver_ir_packet(0, &data_packet(dbc, 8)));
            dbc = dbc.wrapping_add(8);
        }
        assert_eq!(ctx.poll(), 4);
        assert_eq!(reader.fill_level_frames(), 32);
        assert_eq!(ctx.audio().stream().discontinuity_count(), 0);

        ctx.stop();
        assert_eq!(ctx.state(), RxState::Stopped);
    }
}
