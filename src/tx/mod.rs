pub mod layout;
pub mod pipeline;
pub mod recovery;
pub mod ring;
pub mod slab;
pub mod verifier;

pub use pipeline::TxAudioPipeline;
pub use recovery::RecoveryController;
pub use ring::{AudioInjector, CaptureHook, PacketProvider, TxDmaRing};
pub use slab::DescriptorSlab;
pub use verifier::{TxVerifier, VerifierInputs};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use isofire_ohci as ohci;
use tracing::{debug, error, info, warn};

use crate::config::{StreamMode, TxBufferProfile, ZeroCopyRegion};
use crate::error::IsochError;
use crate::hw::{DmaMemory, OhciRegisters};
use crate::sync::ExternalSyncBridge;
use crate::timing::host_now_ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
}

const IRQ_STALL_THRESHOLD_TICKS: u32 = 2;

/// Isochronous transmit context: owns the DMA ring engine and the audio
/// pipeline, drives refills from interrupts with a 1 kHz watchdog behind
/// them, and services verifier-requested recoveries.
pub struct TxContext {
    regs: Arc<dyn OhciRegisters>,
    dma: Box<dyn DmaMemory>,
    context_index: u8,
    channel: u8,
    state: TxState,

    ring: TxDmaRing,
    audio: TxAudioPipeline,
    verifier: Arc<TxVerifier>,
    recovery: Arc<RecoveryController>,

    packets_assembled: u64,
    data_packets: u64,
    no_data_packets: u64,
    tick_count: u64,
    last_underrun_count: u64,

    interrupt_count: AtomicU64,
    last_interrupt_seen: u64,
    irq_stall_ticks: u32,
    refill_in_progress: AtomicBool,
    irq_watchdog_kicks: AtomicU64,

    refill_latency_buckets: [AtomicU64; 4],
    max_refill_latency_us: AtomicU32,
}

impl TxContext {
    pub fn new(
        regs: Arc<dyn OhciRegisters>,
        dma: Box<dyn DmaMemory>,
        context_index: u8,
        profile: TxBufferProfile,
    ) -> TxContext {
        let recovery = Arc::new(RecoveryController::default());
        TxContext {
            regs,
            dma,
            context_index,
            channel: 0,
            state: TxState::Unconfigured,
            ring: TxDmaRing::new(),
            audio: TxAudioPipeline::new(profile),
            verifier: Arc::new(TxVerifier::new(recovery.clone())),
            recovery,
            packets_assembled: 0,
            data_packets: 0,
            no_data_packets: 0,
            tick_count: 0,
            last_underrun_count: 0,
            interrupt_count: AtomicU64::new(0),
            last_interrupt_seen: 0,
            irq_stall_ticks: 0,
            refill_in_progress: AtomicBool::new(false),
            irq_watchdog_kicks: AtomicU64::new(0),
            refill_latency_buckets: Default::default(),
            max_refill_latency_us: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn verifier(&self) -> &Arc<TxVerifier> {
        &self.verifier
    }

    pub fn recovery(&self) -> &Arc<RecoveryController> {
        &self.recovery
    }

    pub fn audio(&self) -> &TxAudioPipeline {
        &self.audio
    }

    pub fn ring(&self) -> &TxDmaRing {
        &self.ring
    }

    pub fn interrupt_count(&self) -> u64 {
        self.interrupt_count.load(Ordering::Relaxed)
    }

    pub fn irq_watchdog_kicks(&self) -> u64 {
        self.irq_watchdog_kicks.load(Ordering::Relaxed)
    }

    pub fn refill_latency_buckets(&self) -> [u64; 4] {
        [
            self.refill_latency_buckets[0].load(Ordering::Relaxed),
            self.refill_latency_buckets[1].load(Ordering::Relaxed),
            self.refill_latency_buckets[2].load(Ordering::Relaxed),
            self.refill_latency_buckets[3].load(Ordering::Relaxed),
        ]
    }

    pub fn packets_assembled(&self) -> u64 {
        self.packets_assembled
    }

    pub fn set_shared_tx_queue(&mut self, base: *mut u8, bytes: u64) {
        self.audio.set_shared_tx_queue(base, bytes);
    }

    pub fn set_zero_copy_buffer(&mut self, region: Option<ZeroCopyRegion>) {
        self.audio.set_zero_copy_buffer(region);
    }

    pub fn set_external_sync_bridge(&mut self, bridge: Option<Arc<ExternalSyncBridge>>) {
        self.audio.set_external_sync_bridge(bridge);
    }

    pub fn shared_tx_fill_frames(&self) -> u32 {
        self.audio.shared_tx_fill_frames()
    }

    pub fn shared_tx_capacity_frames(&self) -> u32 {
        self.audio.shared_tx_capacity_frames()
    }

    pub fn configure(
        &mut self,
        channel: u8,
        sid: u8,
        stream_mode: StreamMode,
        pcm_channels: u32,
        am824_slots: u32,
    ) -> crate::error::Result<()> {
        if self.state != TxState::Unconfigured && self.state != TxState::Stopped {
            return Err(IsochError::Busy);
        }

        self.channel = channel;
        self.ring.set_channel(channel);
        self.audio
            .configure(sid, stream_mode, pcm_channels, am824_slots)?;
        self.ring.setup_rings(self.dma.as_mut())?;

        self.state = TxState::Configured;
        debug!(
            "it: configured ch={} sid={} pcm={} dbs={}",
            channel,
            sid,
            self.audio.pcm_channels(),
            self.audio.am824_slots()
        );
        Ok(())
    }

    pub fn start(&mut self) -> crate::error::Result<()> {
        if self.state != TxState::Configured && self.state != TxState::Stopped {
            return Err(IsochError::NotReady);
        }
        if !self.ring.has_rings() {
            return Err(IsochError::NoResources);
        }

        self.packets_assembled = 0;
        self.data_packets = 0;
        self.no_data_packets = 0;
        self.tick_count = 0;
        self.last_underrun_count = 0;
        self.interrupt_count.store(0, Ordering::Relaxed);
        self.last_interrupt_seen = 0;
        self.irq_stall_ticks = 0;
        self.refill_in_progress.store(false, Ordering::Release);
        for bucket in &self.refill_latency_buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.max_refill_latency_us.store(0, Ordering::Relaxed);
        self.irq_watchdog_kicks.store(0, Ordering::Relaxed);

        self.ring.reset_for_start();
        self.audio.reset_for_start();
        self.verifier
            .reset_for_start(self.audio.frames_per_data_packet() as u8);

        self.ring.seed_cycle_tracking(self.regs.as_ref());
        self.audio.set_cycle_tracking_valid(true);

        if self.audio.shared_tx_valid() && !self.audio.zero_copy_enabled() {
            self.audio.pre_prime_from_shared_queue();
        }

        self.ring.slab().debug_fill(0xDE);
        let stats = self.ring.prime(self.dma.as_ref(), &mut self.audio);
        self.packets_assembled += stats.packets_assembled;
        self.data_packets += stats.data_packets;
        self.no_data_packets += stats.no_data_packets;
        info!(
            "it: ring primed {} packets ({} data, {} no-data)",
            stats.packets_assembled, stats.data_packets, stats.no_data_packets
        );

        let min_prime = self.audio.profile().min_prime_data_packets;
        if min_prime > 0 && stats.data_packets < min_prime as u64 {
            warn!(
                "it: prime produced only {} DATA packets (minimum {}), audio may click at start",
                stats.data_packets, min_prime
            );
        }

        let desc_iova = self.ring.slab().descriptor_base_iova();
        let cmd_ptr = ohci::command_ptr(desc_iova, layout::BLOCKS_PER_PACKET as u8);
        self.regs
            .write(ohci::it_command_ptr(self.context_index), cmd_ptr);
        self.regs.write(
            ohci::it_context_control_clear(self.context_index),
            ohci::CONTEXT_WRITABLE_BITS,
        );

        self.regs.write(ohci::ISO_XMIT_INT_EVENT_CLEAR, 0xFFFF_FFFF);
        self.regs
            .write(ohci::ISO_XMIT_INT_MASK_SET, 1 << self.context_index);
        self.regs.write(ohci::INT_MASK_SET, ohci::INT_ISOCH_TX);

        self.regs.write(
            ohci::it_context_control_set(self.context_index),
            ohci::CONTEXT_RUN,
        );

        let ctrl = self.regs.read(ohci::it_context_control_set(self.context_index));
        if ctrl & ohci::CONTEXT_DEAD != 0 {
            error!("it: context dead immediately after start, event={:#04x}",
                ohci::context_event_code(ctrl));
            return Err(IsochError::Dead);
        }

        self.state = TxState::Running;
        info!("it: started ch={} cmd_ptr={:#010x}", self.channel, cmd_ptr);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.state == TxState::Running {
            self.regs.write(
                ohci::it_context_control_clear(self.context_index),
                ohci::CONTEXT_RUN,
            );
            self.regs
                .write(ohci::ISO_XMIT_INT_MASK_CLEAR, 1 << self.context_index);
            self.state = TxState::Stopped;
            self.refill_in_progress.store(false, Ordering::Release);
            info!(
                "it: stopped, {} packets ({} data / {} no-data), irqs={}",
                self.packets_assembled,
                self.data_packets,
                self.no_data_packets,
                self.interrupt_count.load(Ordering::Relaxed)
            );
        }
        self.verifier.shutdown();
    }

    fn do_refill_once(&mut self) {
        if self.state != TxState::Running {
            return;
        }

        self.audio.on_refill_tick_pre_hw();

        let capture: Option<&dyn CaptureHook> = Some(self.verifier.as_ref());
        let outcome = self.ring.refill(
            self.regs.as_ref(),
            self.dma.as_ref(),
            self.context_index,
            &mut self.audio,
            capture,
        );
        if !outcome.ok {
            return;
        }
        self.packets_assembled += outcome.packets_filled;
        self.data_packets += outcome.data_packets;
        self.no_data_packets += outcome.no_data_packets;
    }

    fn record_refill_latency(&self, start_ns: u64) {
        let us = (host_now_ns().saturating_sub(start_ns) / 1000) as u32;
        let bucket = match us {
            0..50 => 0,
            50..200 => 1,
            200..500 => 2,
            _ => 3,
        };
        self.refill_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        let mut prev = self.max_refill_latency_us.load(Ordering::Relaxed);
        while us > prev {
            match self.max_refill_latency_us.compare_exchange_weak(
                prev,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => prev = v,
            }
        }
    }

    /// Interrupt service path: one deduplicated refill.
    pub fn handle_interrupt(&mut self) {
        if self.state != TxState::Running {
            return;
        }
        self.interrupt_count.fetch_add(1, Ordering::Relaxed);

        if self.refill_in_progress.swap(true, Ordering::AcqRel) {
            return;
        }
        let start = host_now_ns();
        self.do_refill_once();
        self.refill_in_progress.store(false, Ordering::Release);
        self.record_refill_latency(start);
    }

    /// 1 kHz watchdog tick: refill when interrupts stall, re-arm the
    /// context, run the adaptive-fill window, emit periodic diagnostics.
    pub fn poll(&mut self) {
        if self.state != TxState::Running {
            return;
        }
        self.tick_count += 1;

        let irq_now = self.interrupt_count.load(Ordering::Relaxed);
        if irq_now != self.last_interrupt_seen {
            self.last_interrupt_seen = irq_now;
            self.irq_stall_ticks = 0;
        } else {
            self.irq_stall_ticks += 1;
        }

        if self.irq_stall_ticks >= IRQ_STALL_THRESHOLD_TICKS {
            if !self.refill_in_progress.swap(true, Ordering::AcqRel) {
                let start = host_now_ns();
                self.do_refill_once();
                self.refill_in_progress.store(false, Ordering::Release);
                self.record_refill_latency(start);
            }
            self.ring.wake_if_idle(self.regs.as_ref(), self.context_index);
            self.irq_watchdog_kicks.fetch_add(1, Ordering::Relaxed);
            self.irq_stall_ticks = 0;
        }

        self.audio.on_poll_tick_1ms();

        if self.tick_count == 1 || self.tick_count % 1000 == 0 {
            let underrun_now = self
                .audio
                .assembler()
                .underrun_diag()
                .underrun_count
                .load(Ordering::Relaxed);
            let delta = underrun_now - self.last_underrun_count;
            self.last_underrun_count = underrun_now;
            if delta > 0 {
                warn!(
                    "it: underrun {} packets (total {}) rb_fill={} tx_fill={}",
                    delta,
                    underrun_now,
                    self.audio.assembler().buffer_fill_level(),
                    self.audio.shared_tx_fill_frames()
                );
            }
        }
    }

    /// Snapshot the inputs and kick the verifier task (deduplicated there).
    pub fn kick_verifier(&self) {
        if self.state != TxState::Running {
            return;
        }
        let audio_counters = self.audio.counters();
        let ring_counters = self.ring.counters();
        self.verifier.kick(VerifierInputs {
            frames_per_packet: self.audio.frames_per_data_packet(),
            pcm_channels: self.audio.pcm_channels(),
            am824_slots: self.audio.am824_slots(),
            zero_copy_enabled: self.audio.zero_copy_enabled(),
            shared_tx_queue_valid: self.audio.shared_tx_valid(),
            shared_tx_fill_frames: self.audio.shared_tx_fill_frames(),
            audio_inject_cursor_resets: audio_counters
                .audio_inject_cursor_resets
                .load(Ordering::Relaxed),
            audio_inject_missed_packets: audio_counters
                .audio_inject_missed_packets
                .load(Ordering::Relaxed),
            underrun_silenced_packets: audio_counters
                .underrun_silenced_packets
                .load(Ordering::Relaxed),
            critical_gap_events: ring_counters.critical_gap_events.load(Ordering::Relaxed),
            dbc_discontinuities: self.audio.dbc_discontinuities(),
        });
    }

    /// Consume a granted recovery: full stop/start with the consumed reason
    /// mask logged against a restart sequence id.
    pub fn service_recovery(&mut self) {
        if self.state != TxState::Running {
            return;
        }
        let now = host_now_ns();
        let Some(reasons) = self.recovery.try_begin(now) else {
            return;
        };

        let restart_index = self.recovery.restart_count() + 1;
        warn!(
            "it: recovery restart idx={} reasons={:#04x} (label={} cip={} dbc={} overwrite={} inject={})",
            restart_index,
            reasons,
            reasons & recovery::REASON_INVALID_LABEL != 0,
            reasons & recovery::REASON_CIP_ANOMALY != 0,
            reasons & recovery::REASON_DBC_DISCONTINUITY != 0,
            reasons & recovery::REASON_UNCOMPLETED_OVERWRITE != 0,
            reasons & recovery::REASON_INJECT_MISS != 0
        );

        self.stop();
        let result = self.start();
        if let Err(e) = result {
            error!("it: recovery restart failed ({e}), will retry");
        }
        self.recovery.complete(now, reasons, result.is_ok());
    }

    /// Also restart when the hardware context faults outright.
    pub fn check_dead_context(&mut self) {
        if self.state != TxState::Running {
            return;
        }
        let ctrl = self.regs.read(ohci::it_context_control_set(self.context_index));
        if ctrl & ohci::CONTEXT_DEAD != 0 {
            warn!(
                "it: context dead (event={:#04x}), restarting",
                ohci::context_event_code(ctrl)
            );
            self.stop();
            if let Err(e) = self.start() {
                error!("it: restart after dead context failed ({e})");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TX_PROFILE_A;
    use crate::hw::{SharedDmaMemory, SimOhci};
    use crate::shm::{SharedQueue, SharedRegion};

    fn tx_setup() -> (SharedRegion, SharedQueue, Arc<SimOhci>, TxContext) {
        let bytes = SharedQueue::required_bytes(4096, 2);
        let region = SharedRegion::new(bytes as usize).unwrap();
        assert!(SharedQueue::initialize_in_place(region.base(), bytes, 4096, 2));
        let mut producer = SharedQueue::default();
        assert!(producer.attach(region.base(), bytes));

        let mem = SharedDmaMemory::new();
        let sim = Arc::new(SimOhci::new(mem.clone()));
        let mut ctx = TxContext::new(sim.clone(), Box::new(mem), 0, TX_PROFILE_A);
        ctx.set_shared_tx_queue(region.base(), bytes);
        ctx.configure(1, 0x3D, StreamMode::Blocking, 0, 0).unwrap();
        (region, producer, sim, ctx)
    }

    #[test]
    fn start_programs_and_runs_the_context() {
        let (_region, _producer, sim, mut ctx) = tx_setup();
        ctx.start().unwrap();
        assert_eq!(ctx.state(), TxState::Running);

        let ctrl = sim.read(ohci::it_context_control_set(0));
        assert!(ctrl & ohci::CONTEXT_RUN != 0);
        let cmd = sim.read(ohci::it_command_ptr(0));
        assert_eq!(ohci::command_ptr_z(cmd), 3);
        assert_eq!(ctx.packets_assembled(), 200);
    }

    #[test]
    fn interrupt_refills_after_consumption() {
        let (_region, producer, sim, mut ctx) = tx_setup();
        producer.write(&vec![9i32; 2 * 1024], 1024);
        ctx.start().unwrap();

        sim.consume_it_packets(0, 16);
        ctx.handle_interrupt();
        assert_eq!(ctx.interrupt_count(), 1);
        // 200 primed + 12 refilled (16 consumed, write-ahead ceiling 196).
        assert_eq!(ctx.packets_assembled(), 212);
    }

    #[test]
    fn watchdog_kicks_when_interrupts_stall() {
        let (_region, _producer, sim, mut ctx) = tx_setup();
        ctx.start().unwrap();
        sim.consume_it_packets(0, 8);

        ctx.poll();
        assert_eq!(ctx.irq_watchdog_kicks(), 0);
        ctx.poll();
        assert_eq!(ctx.irq_watchdog_kicks(), 1);
        assert!(ctx.packets_assembled() > 200);
    }

    #[test]
    fn stop_is_idempotent() {
        let (_region, _producer, sim, mut ctx) = tx_setup();
        ctx.start().unwrap();
        ctx.stop();
        assert_eq!(ctx.state(), TxState::Stopped);
        assert_eq!(sim.read(ohci::it_context_control_set(0)) & ohci::CONTEXT_RUN, 0);
        ctx.stop();
        assert_eq!(ctx.state(), TxState::Stopped);
    }

    #[test]
    fn recovery_restarts_the_engine() {
        let (_region, _producer, _sim, mut ctx) = tx_setup();
        ctx.start().unwrap();

        ctx.recovery().request(recovery::REASON_CIP_ANOMALY);
        ctx.service_recovery();
        assert_eq!(ctx.state(), TxState::Running);
        assert_eq!(ctx.recovery().restart_count(), 1);
    }

    #[test]
    fn dead_context_triggers_restart() {
        let (_region, _producer, sim, mut ctx) = tx_setup();
        ctx.start().unwrap();
        sim.mark_it_dead(0);
        // Stop clears Run, which also clears the Dead fault; the restart
        // then reprograms and re-runs the ring.
        ctx.check_dead_context();
        assert_eq!(ctx.state(), TxState::Running);
    }
}
