use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::config::{
    MAX_AM824_SLOTS, MAX_PCM_CHANNELS, StreamMode, TRANSFER_CHUNK_FRAMES, TxBufferProfile,
    ZeroCopyRegion,
};
use crate::encoding::assembler::{MAX_FRAMES_PER_PACKET, encode_pcm_frames};
use crate::encoding::cip::{CIP_HEADER_BYTES, SYT_NO_INFO};
use crate::encoding::{AssembledPacket, PacketAssembler, SytGenerator};
use crate::error::IsochError;
use crate::shm::SharedQueue;
use crate::sync::{ExternalSyncBridge, ExternalSyncDiscipline};
use crate::timing::host_now_ns;
use crate::tx::layout;
use crate::tx::ring::{AudioInjector, PacketProvider};
use crate::tx::slab::DescriptorSlab;

#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub resync_applied: AtomicU64,
    pub stale_frames_dropped: AtomicU64,
    pub legacy_pump_moved_frames: AtomicU64,
    pub legacy_pump_skipped: AtomicU64,
    pub exit_zero_refill: AtomicU64,
    pub underrun_silenced_packets: AtomicU64,
    pub audio_inject_cursor_resets: AtomicU64,
    pub audio_inject_missed_packets: AtomicU64,
    pub rb_low_events: AtomicU64,
    pub txq_low_events: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
struct AdaptiveFill {
    base_target: u32,
    current_target: u32,
    max_target: u32,
    underruns_in_window: u32,
    window_tick_count: u32,
    clean_windows: u32,
    last_combined_underruns: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct FillLevelAlert {
    rb_low: bool,
    txq_low: bool,
}

#[derive(Debug, Default)]
struct DbcContinuityTracker {
    last_dbc: u8,
    last_data_block_count: u8,
    first_packet: bool,
    discontinuities: AtomicU64,
}

/// Audio semantics for the IT path: owns the packet assembler, the shared TX
/// queue attachment, the SYT generator and its external-sync discipline, and
/// the near-hardware injection cursor. Serves the ring engine as both packet
/// provider and injector.
pub struct TxAudioPipeline {
    assembler: PacketAssembler,
    shared_tx: SharedQueue,
    zero_copy: Option<ZeroCopyRegion>,
    bridge: Option<Arc<ExternalSyncBridge>>,
    discipline: ExternalSyncDiscipline,
    syt: SytGenerator,
    cycle_tracking_valid: bool,

    profile: TxBufferProfile,
    stream_mode: StreamMode,
    audio_write_index: u32,
    adaptive: AdaptiveFill,
    alerts: FillLevelAlert,
    dbc_tracker: DbcContinuityTracker,
    counters: PipelineCounters,
}

impl TxAudioPipeline {
    pub fn new(profile: TxBufferProfile) -> TxAudioPipeline {
        TxAudioPipeline {
            assembler: PacketAssembler::new(2, 0),
            shared_tx: SharedQueue::default(),
            zero_copy: None,
            bridge: None,
            discipline: ExternalSyncDiscipline::default(),
            syt: SytGenerator::default(),
            cycle_tracking_valid: false,
            profile,
            stream_mode: StreamMode::Blocking,
            audio_write_index: 0,
            adaptive: AdaptiveFill::default(),
            alerts: FillLevelAlert::default(),
            dbc_tracker: DbcContinuityTracker::default(),
            counters: PipelineCounters::default(),
        }
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.counters
    }

    pub fn assembler(&self) -> &PacketAssembler {
        &self.assembler
    }

    pub fn profile(&self) -> &TxBufferProfile {
        &self.profile
    }

    pub fn dbc_discontinuities(&self) -> u64 {
        self.dbc_tracker.discontinuities.load(Ordering::Relaxed)
    }

    pub fn frames_per_data_packet(&self) -> u32 {
        self.assembler.frames_per_data_packet()
    }

    pub fn pcm_channels(&self) -> u32 {
        self.assembler.pcm_channels()
    }

    pub fn am824_slots(&self) -> u32 {
        self.assembler.am824_slots()
    }

    pub fn adaptive_fill_target(&self) -> u32 {
        self.adaptive.current_target
    }

    pub fn set_shared_tx_queue(&mut self, base: *mut u8, bytes: u64) {
        if base.is_null() || bytes == 0 {
            self.shared_tx.detach();
            debug!("it: shared TX queue detached");
            return;
        }
        if self.shared_tx.attach(base, bytes) {
            // Consumer-owned flush: drop stale backlog on (re)attach.
            self.shared_tx.consumer_drop_queued_frames();
            debug!(
                "it: shared TX queue attached capacity={} frames",
                self.shared_tx.capacity_frames()
            );
        } else {
            warn!("it: failed to attach shared TX queue");
            self.shared_tx.detach();
        }
    }

    pub fn shared_tx_valid(&self) -> bool {
        self.shared_tx.is_valid()
    }

    pub fn shared_tx_fill_frames(&self) -> u32 {
        self.shared_tx.fill_level_frames()
    }

    pub fn shared_tx_capacity_frames(&self) -> u32 {
        self.shared_tx.capacity_frames()
    }

    pub fn set_external_sync_bridge(&mut self, bridge: Option<Arc<ExternalSyncBridge>>) {
        self.bridge = bridge;
        self.discipline.reset();
    }

    pub fn set_zero_copy_buffer(&mut self, region: Option<ZeroCopyRegion>) {
        match region {
            Some(r) if !r.base.is_null() && r.bytes > 0 && r.frames > 0 => {
                self.assembler
                    .set_zero_copy_source(r.base as *const i32, r.frames);
                self.zero_copy = Some(r);
                debug!("it: zero-copy enabled frames={}", r.frames);
            }
            _ => {
                self.assembler.set_zero_copy_source(std::ptr::null(), 0);
                self.zero_copy = None;
                debug!("it: zero-copy disabled, using shared TX queue");
            }
        }
    }

    pub fn zero_copy_enabled(&self) -> bool {
        self.zero_copy.is_some()
    }

    pub fn set_cycle_tracking_valid(&mut self, valid: bool) {
        self.cycle_tracking_valid = valid;
    }

    /// Resolve channel geometry against the attached queue and reset the
    /// assembler for the requested mode.
    pub fn configure(
        &mut self,
        sid: u8,
        stream_mode: StreamMode,
        requested_channels: u32,
        requested_am824_slots: u32,
    ) -> Result<(), IsochError> {
        if !self.shared_tx.is_valid() {
            warn!("it: configure failed, shared TX queue missing");
            return Err(IsochError::NotReady);
        }

        let queue_channels = self.shared_tx.channels() as u32;
        if queue_channels == 0 || queue_channels > MAX_PCM_CHANNELS {
            return Err(IsochError::BadArgument);
        }
        if requested_channels != 0 && requested_channels != queue_channels {
            warn!(
                "it: configure failed, requested {} channels but queue carries {}",
                requested_channels, queue_channels
            );
            return Err(IsochError::BadArgument);
        }

        let mut am824_slots = queue_channels;
        if requested_am824_slots != 0 {
            if requested_am824_slots < queue_channels {
                return Err(IsochError::BadArgument);
            }
            if requested_am824_slots > MAX_AM824_SLOTS {
                return Err(IsochError::Unsupported);
            }
            am824_slots = requested_am824_slots;
        }

        self.assembler.reconfigure(queue_channels, am824_slots, sid);
        self.stream_mode = stream_mode;
        self.assembler.set_stream_mode(stream_mode);

        debug!(
            "it: geometry pcm={} dbs={} midi_slots={} frames_per_data={} packet_bytes={}",
            queue_channels,
            am824_slots,
            am824_slots - queue_channels,
            self.assembler.frames_per_data_packet(),
            self.assembler.data_packet_size()
        );
        Ok(())
    }

    pub fn reset_for_start(&mut self) {
        self.assembler.reset();
        self.assembler.set_stream_mode(self.stream_mode);
        self.discipline.reset();

        self.counters = PipelineCounters::default();
        self.alerts = FillLevelAlert::default();

        self.adaptive = AdaptiveFill {
            base_target: self.profile.legacy_rb_target_frames,
            current_target: self.profile.legacy_rb_target_frames,
            max_target: self.profile.legacy_rb_target_frames * 4,
            ..Default::default()
        };

        self.audio_write_index = 0;

        self.dbc_tracker = DbcContinuityTracker {
            first_packet: true,
            ..Default::default()
        };

        self.syt.initialize(48_000.0);
        self.cycle_tracking_valid = false;
    }

    /// Drain startup frames from the shared queue into the assembler ring,
    /// bounded by the profile limit, in fixed chunks.
    pub fn pre_prime_from_shared_queue(&mut self) {
        if !self.shared_tx.is_valid() || self.zero_copy.is_some() {
            return;
        }

        let limit = self.profile.startup_prime_limit_frames;
        let mut remaining = limit;
        let mut transferred = 0u32;
        let mut chunk_count = 0u32;
        let mut buf = [0i32; (TRANSFER_CHUNK_FRAMES * MAX_PCM_CHANNELS) as usize];

        while self.shared_tx.fill_level_frames() > 0 {
            if limit != 0 && remaining == 0 {
                break;
            }
            let mut to_read = self.shared_tx.fill_level_frames().min(TRANSFER_CHUNK_FRAMES);
            if limit != 0 {
                to_read = to_read.min(remaining);
            }
            let read = self.shared_tx.read(&mut buf, to_read);
            if read == 0 {
                break;
            }
            if chunk_count < 3 {
                debug!(
                    "it: pre-prime chunk[{}] read={} first={:#010x}",
                    chunk_count, read, buf[0] as u32
                );
            }
            chunk_count += 1;

            let written = self.assembler.ring().write(&buf, read);
            transferred += written;
            if limit != 0 {
                remaining = remaining.saturating_sub(written);
            }
            if written < read {
                break;
            }
        }

        debug!(
            "it: pre-prime transferred {} frames (ring fill={} limit={})",
            transferred,
            self.assembler.buffer_fill_level(),
            limit
        );
    }

    /// Runs at the top of every refill tick, before any hardware access:
    /// apply pending resyncs, pump the shared queue toward the adaptive
    /// target, raise low-water alerts with hysteresis.
    pub fn on_refill_tick_pre_hw(&mut self) {
        if self.shared_tx.is_valid() && self.shared_tx.consumer_apply_pending_resync() {
            self.counters.resync_applied.fetch_add(1, Ordering::Relaxed);
        }

        if self.zero_copy.is_some() || !self.shared_tx.is_valid() {
            return;
        }

        let target = self.adaptive.current_target;
        let rb_fill = self.assembler.buffer_fill_level();
        let mut pumped = 0u32;
        let mut skipped = true;

        if rb_fill < target {
            skipped = false;
            let mut want = target - rb_fill;
            let mut chunks = 0u32;
            let mut buf = [0i32; (TRANSFER_CHUNK_FRAMES * MAX_PCM_CHANNELS) as usize];

            while want > 0 && chunks < self.profile.legacy_max_chunks_per_refill {
                let q_fill = self.shared_tx.fill_level_frames();
                if q_fill == 0 {
                    break;
                }
                let rb_space = self.assembler.ring().available_space();
                if rb_space == 0 {
                    break;
                }
                let to_read = want.min(q_fill).min(rb_space).min(TRANSFER_CHUNK_FRAMES);
                let read = self.shared_tx.read(&mut buf, to_read);
                if read == 0 {
                    break;
                }
                let written = self.assembler.ring().write(&buf, read);
                pumped += written;
                if written < read {
                    break;
                }
                want -= written;
                chunks += 1;
                if self.assembler.buffer_fill_level() >= self.profile.legacy_rb_max_frames {
                    break;
                }
            }
        }

        if skipped {
            self.counters.legacy_pump_skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters
                .legacy_pump_moved_frames
                .fetch_add(pumped as u64, Ordering::Relaxed);
        }

        // Low-water alerts at 5%, recover at 10%.
        let rb_cap = self.assembler.ring().capacity();
        let rb_now = self.assembler.buffer_fill_level();
        if !self.alerts.rb_low && rb_now < rb_cap / 20 {
            self.alerts.rb_low = true;
            self.counters.rb_low_events.fetch_add(1, Ordering::Relaxed);
        } else if self.alerts.rb_low && rb_now >= rb_cap / 10 {
            self.alerts.rb_low = false;
        }

        let txq_cap = self.shared_tx.capacity_frames();
        let txq_now = self.shared_tx.fill_level_frames();
        if !self.alerts.txq_low && txq_now < txq_cap / 20 {
            self.alerts.txq_low = true;
            self.counters.txq_low_events.fetch_add(1, Ordering::Relaxed);
        } else if self.alerts.txq_low && txq_now >= txq_cap / 10 {
            self.alerts.txq_low = false;
        }
    }

    /// 1 ms poll tick: adaptive-fill escalation/decay over one-second
    /// windows (non-zero-copy only).
    pub fn on_poll_tick_1ms(&mut self) {
        if self.zero_copy.is_some() || !self.shared_tx.is_valid() {
            return;
        }

        self.adaptive.window_tick_count += 1;

        let combined = self.counters.exit_zero_refill.load(Ordering::Relaxed)
            + self
                .assembler
                .underrun_diag()
                .underrun_count
                .load(Ordering::Relaxed);
        if combined > self.adaptive.last_combined_underruns {
            self.adaptive.underruns_in_window +=
                (combined - self.adaptive.last_combined_underruns) as u32;
            self.adaptive.last_combined_underruns = combined;
        }

        if self.adaptive.window_tick_count < 1000 {
            return;
        }

        if self.adaptive.underruns_in_window >= 3 {
            let new_target = (self.adaptive.current_target + 128).min(self.adaptive.max_target);
            if new_target != self.adaptive.current_target {
                warn!(
                    "it: adaptive fill escalate {} -> {} (underruns={})",
                    self.adaptive.current_target, new_target, self.adaptive.underruns_in_window
                );
                self.adaptive.current_target = new_target;
            }
            self.adaptive.clean_windows = 0;
        } else if self.adaptive.underruns_in_window == 0 {
            self.adaptive.clean_windows += 1;
            if self.adaptive.clean_windows >= 10
                && self.adaptive.current_target > self.adaptive.base_target
            {
                let new_target = if self.adaptive.current_target > self.adaptive.base_target + 64 {
                    self.adaptive.current_target - 64
                } else {
                    self.adaptive.base_target
                };
                debug!(
                    "it: adaptive fill decay {} -> {}",
                    self.adaptive.current_target, new_target
                );
                self.adaptive.current_target = new_target;
            }
        } else {
            self.adaptive.clean_windows = 0;
        }

        self.adaptive.window_tick_count = 0;
        self.adaptive.underruns_in_window = 0;
    }

    fn compute_data_syt(&mut self, transmit_cycle: u32) -> u16 {
        if !self.syt.is_valid() || !self.cycle_tracking_valid {
            return SYT_NO_INFO;
        }
        let tx_syt = self
            .syt
            .compute(transmit_cycle, self.assembler.frames_per_data_packet());

        let rx_syt = self
            .bridge
            .as_ref()
            .and_then(|b| b.fresh_rx_syt(host_now_ns()));
        let enabled = rx_syt.is_some();
        let result = self
            .discipline
            .update(enabled, tx_syt, rx_syt.unwrap_or(SYT_NO_INFO));
        if enabled && result.correction_ticks != 0 {
            self.syt.nudge(result.correction_ticks);
        }
        tx_syt
    }

    fn track_dbc_continuity(&mut self, pkt: &AssembledPacket) {
        if !pkt.is_data {
            return;
        }
        let samples = self.assembler.frames_per_data_packet() as u8;
        if !self.dbc_tracker.first_packet {
            let expected = self
                .dbc_tracker
                .last_dbc
                .wrapping_add(self.dbc_tracker.last_data_block_count);
            if pkt.dbc != expected {
                self.dbc_tracker.discontinuities.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.dbc_tracker.last_dbc = pkt.dbc;
        self.dbc_tracker.last_data_block_count = samples;
        self.dbc_tracker.first_packet = false;
    }
}

impl PacketProvider for TxAudioPipeline {
    fn next_silent_packet(&mut self, transmit_cycle: u32) -> AssembledPacket {
        let syt = if self.assembler.next_is_data() {
            self.compute_data_syt(transmit_cycle)
        } else {
            SYT_NO_INFO
        };

        let pkt = self.assembler.assemble_next(syt, true);
        self.track_dbc_continuity(&pkt);
        pkt
    }
}

impl AudioInjector for TxAudioPipeline {
    fn inject_near_hw(&mut self, hw_packet_index: u32, slab: &DescriptorSlab) {
        let num_packets = layout::NUM_PACKETS;
        let zero_copy_sync = self.zero_copy.is_some() && self.shared_tx.is_valid();
        let zc_capacity = self.zero_copy.map(|z| z.frames).unwrap_or(0);

        let audio_target = (hw_packet_index + layout::AUDIO_WRITE_AHEAD) % num_packets;

        // A scheduling stall left the cursor behind hardware: snap forward.
        let dist_behind = (hw_packet_index + num_packets - self.audio_write_index) % num_packets;
        if dist_behind > 0 && dist_behind < num_packets / 2 {
            self.counters
                .audio_inject_cursor_resets
                .fetch_add(1, Ordering::Relaxed);
            self.counters
                .audio_inject_missed_packets
                .fetch_add(dist_behind as u64, Ordering::Relaxed);
            self.audio_write_index = hw_packet_index;
        }

        let mut to_inject = (audio_target + num_packets - self.audio_write_index) % num_packets;
        to_inject = to_inject.min(layout::AUDIO_WRITE_AHEAD);
        if to_inject == 0 {
            return;
        }

        let frames = self.assembler.frames_per_data_packet();
        let pcm = self.assembler.pcm_channels();
        let slots = self.assembler.am824_slots();
        let mut samples = [0i32; (MAX_FRAMES_PER_PACKET * MAX_AM824_SLOTS) as usize];

        for i in 0..to_inject {
            let idx = (self.audio_write_index + i) % num_packets;
            let last = slab.read_descriptor(idx * layout::BLOCKS_PER_PACKET + 2);
            let req_count = last.req_count() as u32;
            if req_count <= CIP_HEADER_BYTES {
                continue; // NO-DATA cycle
            }

            let frames_read;
            if zero_copy_sync {
                let mut fill_before = self.shared_tx.fill_level_frames();

                // Queue lag beyond the zero-copy window means the payload was
                // already overwritten; drop the stale backlog.
                if fill_before > zc_capacity {
                    let dropped = self.shared_tx.consume_frames(fill_before - zc_capacity);
                    self.counters
                        .stale_frames_dropped
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                    fill_before -= dropped;
                }

                let read_abs = self.shared_tx.read_index_frames();
                let phase = self.shared_tx.zero_copy_phase_frames() % zc_capacity;
                self.assembler
                    .set_zero_copy_read_position((read_abs.wrapping_add(phase)) % zc_capacity);

                let zc = self.zero_copy.expect("zero-copy state checked above");
                let zc_base = zc.base as *const i32;
                let zc_pos = self.assembler.zero_copy_read_position();
                for f in 0..frames {
                    let frame_idx = (zc_pos + f) % zc_capacity;
                    for ch in 0..pcm {
                        samples[(f * pcm + ch) as usize] =
                            unsafe { *zc_base.add((frame_idx * pcm + ch) as usize) };
                    }
                }
                self.assembler
                    .set_zero_copy_read_position((zc_pos + frames) % zc_capacity);
                frames_read = frames;

                let consumed = self.shared_tx.consume_frames(frames);
                if consumed < frames || fill_before < frames {
                    self.counters.exit_zero_refill.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .underrun_silenced_packets
                        .fetch_add(1, Ordering::Relaxed);
                    self.assembler.record_underrun(fill_before, frames, consumed, 0, 0);
                    continue; // leave the silent payload in place
                }
            } else {
                frames_read = self
                    .assembler
                    .ring()
                    .read(&mut samples[..(frames * pcm) as usize], frames);
            }

            if frames_read < frames {
                samples[(frames_read * pcm) as usize..(frames * pcm) as usize].fill(0);
            }

            let payload = slab.payload_bytes(idx);
            encode_pcm_frames(
                &samples,
                frames,
                pcm,
                slots,
                &mut payload[CIP_HEADER_BYTES as usize..],
            );
        }

        self.audio_write_index = audio_target;
        std::sync::atomic::fence(Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TX_PROFILE_A;
    use crate::encoding::am824;
    use crate::hw::SharedDmaMemory;
    use crate::shm::SharedRegion;

    fn queue_region(capacity: u32, channels: u16) -> (SharedRegion, SharedQueue) {
        let bytes = SharedQueue::required_bytes(capacity, channels);
        let region = SharedRegion::new(bytes as usize).unwrap();
        assert!(SharedQueue::initialize_in_place(
            region.base(),
            bytes,
            capacity,
            channels
        ));
        let mut producer = SharedQueue::default();
        assert!(producer.attach(region.base(), bytes));
        (region, producer)
    }

    fn configured_pipeline(region: &SharedRegion) -> TxAudioPipeline {
        let mut p = TxAudioPipeline::new(TX_PROFILE_A);
        p.set_shared_tx_queue(region.base(), region.len() as u64);
        p.configure(0x3D, StreamMode::Blocking, 0, 0).unwrap();
        p.reset_for_start();
        p
    }

    #[test]
    fn configure_validates_channel_geometry() {
        let (region, _producer) = queue_region(256, 2);
        let mut p = TxAudioPipeline::new(TX_PROFILE_A);

        assert_eq!(
            p.configure(0, StreamMode::Blocking, 0, 0),
            Err(IsochError::NotReady)
        );

        p.set_shared_tx_queue(region.base(), region.len() as u64);
        assert_eq!(
            p.configure(0, StreamMode::Blocking, 4, 0),
            Err(IsochError::BadArgument)
        );
        assert_eq!(
            p.configure(0, StreamMode::Blocking, 2, 1),
            Err(IsochError::BadArgument)
        );
        assert_eq!(
            p.configure(0, StreamMode::Blocking, 2, 64),
            Err(IsochError::Unsupported)
        );
        assert!(p.configure(0, StreamMode::Blocking, 2, 8).is_ok());
        assert_eq!(p.am824_slots(), 8);
        assert_eq!(p.pcm_channels(), 2);
    }

    #[test]
    fn pre_prime_respects_profile_limit() {
        let (region, producer) = queue_region(4096, 2);
        let mut p = configured_pipeline(&region);
        let frames = vec![3i32; 2 * 2048];
        producer.write(&frames, 2048);

        p.pre_prime_from_shared_queue();
        assert_eq!(
            p.assembler().buffer_fill_level(),
            TX_PROFILE_A.startup_prime_limit_frames
        );
    }

    #[test]
    fn refill_pump_targets_adaptive_fill() {
        let (region, producer) = queue_region(4096, 2);
        let mut p = configured_pipeline(&region);
        let frames = vec![5i32; 2 * 4096];
        producer.write(&frames, 4096);

        p.on_refill_tick_pre_hw();
        assert_eq!(p.assembler().buffer_fill_level(), p.adaptive_fill_target());
    }

    #[test]
    fn resync_request_is_applied_on_tick() {
        let (region, producer) = queue_region(4096, 2);
        let mut p = configured_pipeline(&region);
        producer.write(&vec![1i32; 2 * 100], 100);
        producer.producer_request_consumer_resync();
        p.on_refill_tick_pre_hw();
        assert_eq!(p.counters().resync_applied.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn provider_tracks_dbc_continuity() {
        let (region, _producer) = queue_region(256, 2);
        let mut p = configured_pipeline(&region);
        p.set_cycle_tracking_valid(true);
        for cycle in 0..64 {
            p.next_silent_packet(cycle);
        }
        assert_eq!(p.dbc_discontinuities(), 0);
    }

    #[test]
    fn provider_syt_requires_cycle_tracking() {
        let (region, _producer) = queue_region(256, 2);
        let mut p = configured_pipeline(&region);
        // Cycle 0 is NO-DATA under blocking cadence; cycle 1 is DATA.
        let no_data = p.next_silent_packet(0);
        assert!(!no_data.is_data);
        let data = p.next_silent_packet(1);
        assert!(data.is_data);
        let cip = crate::encoding::CipFields::parse_bytes(&data.data);
        assert_eq!(cip.syt, SYT_NO_INFO);

        p.reset_for_start();
        p.set_cycle_tracking_valid(true);
        p.next_silent_packet(0);
        let data = p.next_silent_packet(1);
        let cip = crate::encoding::CipFields::parse_bytes(&data.data);
        assert_ne!(cip.syt, SYT_NO_INFO);
    }

    fn primed_slab(p: &mut TxAudioPipeline) -> (SharedDmaMemory, DescriptorSlab) {
        let mut mem = SharedDmaMemory::new();
        let slab = DescriptorSlab::allocate(&mut mem).unwrap();
        // Hand-prime the slot descriptors the injector inspects.
        let mut cycle = 0u32;
        for idx in 0..layout::NUM_PACKETS {
            let pkt = p.next_silent_packet(cycle);
            cycle += 1;
            let payload = slab.payload_bytes(idx);
            payload[..pkt.size as usize].copy_from_slice(&pkt.data[..pkt.size as usize]);
            let d = isofire_ohci::Descriptor {
                control: isofire_ohci::output_last_control(0, pkt.size as u16),
                data_address: slab.payload_iova(idx),
                branch: 0,
                status: 0,
            };
            slab.write_descriptor(idx * layout::BLOCKS_PER_PACKET + 2, &d);
        }
        (mem, slab)
    }

    #[test]
    fn injection_writes_audio_into_window() {
        let (region, producer) = queue_region(4096, 2);
        let mut p = configured_pipeline(&region);
        let (_mem, slab) = primed_slab(&mut p);

        let frames: Vec<i32> = (0..2 * 512).collect();
        producer.write(&frames, 512);
        p.on_refill_tick_pre_hw();

        p.inject_near_hw(0, &slab);

        // Every DATA slot in (0, AUDIO_WRITE_AHEAD] now carries ring audio.
        let mut injected = 0;
        for idx in 1..=layout::AUDIO_WRITE_AHEAD {
            let last = slab.read_descriptor(idx * layout::BLOCKS_PER_PACKET + 2);
            if last.req_count() as u32 <= CIP_HEADER_BYTES {
                continue;
            }
            let payload = slab.payload_bytes(idx);
            let q = am824::read_quadlet(&payload[8..12]);
            assert_eq!(am824::label(q), am824::AM824_LABEL_MBLA);
            if am824::decode(q) != Some(0) {
                injected += 1;
            }
        }
        assert!(injected > 0);
    }

    #[test]
    fn injection_cursor_recovers_from_stall() {
        let (region, producer) = queue_region(4096, 2);
        let mut p = configured_pipeline(&region);
        let (_mem, slab) = primed_slab(&mut p);
        producer.write(&vec![1i32; 2 * 2048], 2048);
        p.on_refill_tick_pre_hw();

        p.inject_near_hw(0, &slab);
        assert_eq!(
            p.counters().audio_inject_cursor_resets.load(Ordering::Relaxed),
            0
        );

        // Hardware advanced 40 packets between refills (stall).
        p.inject_near_hw(40, &slab);
        assert_eq!(
            p.counters().audio_inject_cursor_resets.load(Ordering::Relaxed),
            1
        );
        assert_eq!(
            p.counters().audio_inject_missed_packets.load(Ordering::Relaxed),
            24
        );
        // Cursor still lands a full window ahead of hardware.
        assert_eq!(p.audio_write_index, (40 + layout::AUDIO_WRITE_AHEAD) % layout::NUM_PACKETS);
    }

    #[test]
    fn zero_copy_underrun_leaves_silence() {
        let (region, producer) = queue_region(4096, 2);
        let mut p = TxAudioPipeline::new(TX_PROFILE_A);
        p.set_shared_tx_queue(region.base(), region.len() as u64);
        p.configure(0, StreamMode::Blocking, 0, 0).unwrap();

        let zc_frames = 1024u32;
        let zc_store = vec![7i32; (zc_frames * 2) as usize];
        p.set_zero_copy_buffer(Some(ZeroCopyRegion {
            base: zc_store.as_ptr() as *mut u8,
            bytes: (zc_frames * 2 * 4) as u64,
            frames: zc_frames,
        }));
        p.reset_for_start();

        let (_mem, slab) = primed_slab(&mut p);

        // Empty queue: every DATA slot records an underrun and stays silent.
        p.inject_near_hw(0, &slab);
        assert!(p.counters().exit_zero_refill.load(Ordering::Relaxed) > 0);

        // With published frames the same path consumes them.
        let before = p.counters().exit_zero_refill.load(Ordering::Relaxed);
        producer.publish_frames(512);
        p.inject_near_hw(32, &slab);
        assert_eq!(p.counters().exit_zero_refill.load(Ordering::Relaxed), before);
        assert!(producer.fill_level_frames() < 512);
    }

    #[test]
    fn zero_copy_drops_stale_backlog() {
        let (region, producer) = queue_region(4096, 2);
        let mut p = TxAudioPipeline::new(TX_PROFILE_A);
        p.set_shared_tx_queue(region.base(), region.len() as u64);
        p.configure(0, StreamMode::Blocking, 0, 0).unwrap();
        let zc_frames = 256u32;
        let zc_store = vec![0i32; (zc_frames * 2) as usize];
        p.set_zero_copy_buffer(Some(ZeroCopyRegion {
            base: zc_store.as_ptr() as *mut u8,
            bytes: (zc_frames * 2 * 4) as u64,
            frames: zc_frames,
        }));
        p.reset_for_start();
        let (_mem, slab) = primed_slab(&mut p);

        producer.publish_frames(1024); // way past the 256-frame window
        p.inject_near_hw(0, &slab);
        assert!(p.counters().stale_frames_dropped.load(Ordering::Relaxed) >= 1024 - 256);
    }

    #[test]
    fn adaptive_fill_escalates_and_decays() {
        let (region, _producer) = queue_region(4096, 2);
        let mut p = configured_pipeline(&region);
        let base = p.adaptive_fill_target();

        // Three underruns inside one window escalate the target.
        for _ in 0..3 {
            p.counters().exit_zero_refill.fetch_add(1, Ordering::Relaxed);
        }
        for _ in 0..1000 {
            p.on_poll_tick_1ms();
        }
        assert_eq!(p.adaptive_fill_target(), base + 128);

        // Ten clean seconds decay back toward base.
        for _ in 0..10_000 {
            p.on_poll_tick_1ms();
        }
        assert!(p.adaptive_fill_target() <= base + 64);
    }
}
