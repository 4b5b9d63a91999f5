use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::config::{MAX_AM824_SLOTS, MAX_PCM_CHANNELS};
use crate::encoding::am824;
use crate::encoding::cip::CipHeader;
use crate::hw::OhciRegisters;
use crate::shm::SharedQueue;
use crate::sync::{ExternalSyncBridge, ExternalSyncClockState};
use crate::timing::{delta_fw_nanos, host_now_ns};

/// Receive buffer prefix in packet-per-buffer mode: timestamp quadlet plus
/// the isochronous header.
pub const ISOCH_HEADER_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct RxCipSummary {
    pub has_valid_cip: bool,
    pub syt: u16,
    pub fdf: u8,
    pub dbs: u8,
}

/// Validates received isochronous packets and fans decoded PCM frames out
/// to the shared RX queue. DBC continuity and the usual stream statistics
/// are tracked as atomics so the stats surface never takes a lock.
pub struct StreamProcessor {
    packet_count: AtomicU64,
    sample_packet_count: AtomicU64,
    empty_packet_count: AtomicU64,
    error_count: AtomicU64,
    discontinuity_count: AtomicU64,

    last_dbc: AtomicU8,
    last_syt: AtomicU16,
    last_data_block_count: AtomicU8,
    last_cip_dbs: AtomicU8,
    last_cip_fdf: AtomicU8,
    last_cip_sid: AtomicU8,

    latency_buckets: [AtomicU64; 4],
    last_poll_latency_us: AtomicU32,
    last_poll_packets: AtomicU32,

    last_unsupported_wire_dbs: AtomicU8,

    shared_rx: SharedQueue,
    event_samples: [i32; MAX_PCM_CHANNELS as usize],
}

impl StreamProcessor {
    pub fn new() -> StreamProcessor {
        StreamProcessor {
            packet_count: AtomicU64::new(0),
            sample_packet_count: AtomicU64::new(0),
            empty_packet_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            discontinuity_count: AtomicU64::new(0),
            last_dbc: AtomicU8::new(0),
            last_syt: AtomicU16::new(0xFFFF),
            last_data_block_count: AtomicU8::new(0),
            last_cip_dbs: AtomicU8::new(0),
            last_cip_fdf: AtomicU8::new(0),
            last_cip_sid: AtomicU8::new(0),
            latency_buckets: Default::default(),
            last_poll_latency_us: AtomicU32::new(0),
            last_poll_packets: AtomicU32::new(0),
            last_unsupported_wire_dbs: AtomicU8::new(0),
            shared_rx: SharedQueue::default(),
            event_samples: [0i32; MAX_PCM_CHANNELS as usize],
        }
    }

    pub fn set_shared_rx_queue(&mut self, base: *mut u8, bytes: u64) -> bool {
        if base.is_null() || bytes == 0 {
            self.shared_rx.detach();
            debug!("ir: shared RX queue detached");
            return false;
        }
        if self.shared_rx.attach(base, bytes) {
            debug!(
                "ir: shared RX queue attached capacity={} frames",
                self.shared_rx.capacity_frames()
            );
            true
        } else {
            warn!("ir: failed to attach shared RX queue");
            self.shared_rx.detach();
            false
        }
    }

    pub fn shared_rx(&self) -> &SharedQueue {
        &self.shared_rx
    }

    /// Process one receive buffer (isoch prefix + CIP + AM824 payload).
    pub fn process_packet(&mut self, payload: &[u8]) -> RxCipSummary {
        let mut summary = RxCipSummary {
            syt: 0xFFFF,
            ..Default::default()
        };
        if payload.len() < ISOCH_HEADER_BYTES + 8 {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return summary;
        }

        let cip_bytes = &payload[ISOCH_HEADER_BYTES..];
        let Some(header) = CipHeader::decode_bytes(cip_bytes) else {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return summary;
        };

        let packet_number = self.packet_count.fetch_add(1, Ordering::Relaxed) + 1;

        summary.has_valid_cip = true;
        summary.syt = header.syt;
        summary.fdf = header.fdf;
        summary.dbs = header.data_block_size;

        let expected = self
            .last_dbc
            .load(Ordering::Relaxed)
            .wrapping_add(self.last_data_block_count.load(Ordering::Relaxed));
        if packet_number > 1 && header.data_block_counter != expected {
            self.discontinuity_count.fetch_add(1, Ordering::Relaxed);
        }

        self.last_dbc.store(header.data_block_counter, Ordering::Relaxed);
        self.last_syt.store(header.syt, Ordering::Relaxed);
        self.last_cip_dbs.store(header.data_block_size, Ordering::Relaxed);
        self.last_cip_fdf.store(header.fdf, Ordering::Relaxed);
        self.last_cip_sid.store(header.source_node_id, Ordering::Relaxed);

        let payload_bytes = cip_bytes.len() - 8;
        let dbs_bytes = header.data_block_size as usize * 4;
        if dbs_bytes == 0 {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return summary;
        }
        let event_count = payload_bytes / dbs_bytes;
        self.last_data_block_count
            .store(event_count as u8, Ordering::Relaxed);
        if payload_bytes % dbs_bytes != 0 {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }

        if event_count == 0 {
            self.empty_packet_count.fetch_add(1, Ordering::Relaxed);
            return summary;
        }
        self.sample_packet_count.fetch_add(1, Ordering::Relaxed);

        let wire_slots = header.data_block_size as usize;
        if wire_slots > MAX_AM824_SLOTS as usize {
            // CIP/DBC continuity still tracked above; decode would walk
            // outside the staging frame.
            self.error_count.fetch_add(1, Ordering::Relaxed);
            let prev = self
                .last_unsupported_wire_dbs
                .swap(header.data_block_size, Ordering::Relaxed);
            if prev != header.data_block_size {
                warn!(
                    "ir: unsupported wire DBS {} (max {}), skipping decode",
                    header.data_block_size, MAX_AM824_SLOTS
                );
            }
            return summary;
        }

        let queue_channels = self.shared_rx.channels() as usize;
        let mut decode_slots = wire_slots.min(MAX_PCM_CHANNELS as usize);
        if queue_channels > 0 {
            decode_slots = decode_slots.min(queue_channels);
        }
        let queue_write_safe =
            !self.shared_rx.is_valid() || queue_channels <= MAX_PCM_CHANNELS as usize;

        let quadlets = &cip_bytes[8..];
        for event in 0..event_count {
            self.event_samples.fill(0);
            for ch in 0..decode_slots {
                let off = (event * wire_slots + ch) * 4;
                let q = am824::read_quadlet(&quadlets[off..off + 4]);
                if let Some(sample) = am824::decode(q) {
                    self.event_samples[ch] = sample;
                }
                // MIDI and unknown labels stay zero in the PCM frame.
            }
            if self.shared_rx.is_valid() {
                if queue_write_safe {
                    self.shared_rx.write(&self.event_samples, 1);
                } else {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        summary
    }

    pub fn record_poll_latency(&self, microseconds: u64, packets: u32) {
        self.last_poll_latency_us
            .store(microseconds as u32, Ordering::Relaxed);
        self.last_poll_packets.store(packets, Ordering::Relaxed);
        let bucket = match microseconds {
            0..100 => 0,
            100..500 => 1,
            500..1000 => 2,
            _ => 3,
        };
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn log_statistics(&self) {
        info!(
            "ir: stats pkts={} data={} empty={} errs={} discont={} | cip sid={} dbs={} fdf={:#04x} syt={:#06x} dbc={:#04x}",
            self.packet_count.load(Ordering::Relaxed),
            self.sample_packet_count.load(Ordering::Relaxed),
            self.empty_packet_count.load(Ordering::Relaxed),
            self.error_count.load(Ordering::Relaxed),
            self.discontinuity_count.load(Ordering::Relaxed),
            self.last_cip_sid.load(Ordering::Relaxed),
            self.last_cip_dbs.load(Ordering::Relaxed),
            self.last_cip_fdf.load(Ordering::Relaxed),
            self.last_syt.load(Ordering::Relaxed),
            self.last_dbc.load(Ordering::Relaxed),
        );
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }

    pub fn sample_packet_count(&self) -> u64 {
        self.sample_packet_count.load(Ordering::Relaxed)
    }

    pub fn empty_packet_count(&self) -> u64 {
        self.empty_packet_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn discontinuity_count(&self) -> u64 {
        self.discontinuity_count.load(Ordering::Relaxed)
    }

    pub fn latency_buckets(&self) -> [u64; 4] {
        [
            self.latency_buckets[0].load(Ordering::Relaxed),
            self.latency_buckets[1].load(Ordering::Relaxed),
            self.latency_buckets[2].load(Ordering::Relaxed),
            self.latency_buckets[3].load(Ordering::Relaxed),
        ]
    }

    pub fn reset(&mut self) {
        self.packet_count.store(0, Ordering::Relaxed);
        self.sample_packet_count.store(0, Ordering::Relaxed);
        self.empty_packet_count.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
        self.discontinuity_count.store(0, Ordering::Relaxed);
        self.last_dbc.store(0, Ordering::Relaxed);
        self.last_syt.store(0xFFFF, Ordering::Relaxed);
        self.last_data_block_count.store(0, Ordering::Relaxed);
        self.last_unsupported_wire_dbs.store(0, Ordering::Relaxed);
        for bucket in &self.latency_buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.last_poll_latency_us.store(0, Ordering::Relaxed);
        self.last_poll_packets.store(0, Ordering::Relaxed);
    }
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct CycleTimeCorrelation {
    prev_cycle_timer: u32,
    prev_host_ns: u64,
    has_previous: bool,
    polls_since_update: u32,
}

/// Audio RX pipeline: CIP/AM824 decode into the shared RX queue, the
/// external-sync observer, and the ~1 Hz cycle-time/host-clock correlation
/// published as a Q8 rate hint.
pub struct RxAudioPipeline {
    stream: StreamProcessor,
    bridge: Option<Arc<ExternalSyncBridge>>,
    clock_state: ExternalSyncClockState,
    corr: CycleTimeCorrelation,
    sample_rate: f64,
}

impl RxAudioPipeline {
    pub fn new() -> RxAudioPipeline {
        RxAudioPipeline {
            stream: StreamProcessor::new(),
            bridge: None,
            clock_state: ExternalSyncClockState::default(),
            corr: CycleTimeCorrelation::default(),
            sample_rate: 48_000.0,
        }
    }

    pub fn stream(&self) -> &StreamProcessor {
        &self.stream
    }

    pub fn configure_for_48k(&mut self) {
        self.corr = CycleTimeCorrelation::default();
        self.sample_rate = 48_000.0;
    }

    pub fn set_shared_rx_queue(&mut self, base: *mut u8, bytes: u64) -> bool {
        self.stream.set_shared_rx_queue(base, bytes)
    }

    pub fn set_external_sync_bridge(&mut self, bridge: Option<Arc<ExternalSyncBridge>>) {
        if let Some(b) = &bridge {
            b.reset();
        }
        self.bridge = bridge;
        self.clock_state.reset();
    }

    pub fn on_start(&mut self) {
        self.stream.reset();
        if let Some(b) = &self.bridge {
            b.reset();
            b.active.store(true, Ordering::Release);
        }
        self.clock_state.reset();
    }

    pub fn on_stop(&mut self) {
        self.stream.log_statistics();
        if let Some(b) = &self.bridge {
            b.reset();
        }
        self.clock_state.reset();
    }

    pub fn on_packet(&mut self, payload: &[u8]) {
        let summary = self.stream.process_packet(payload);

        let Some(bridge) = self.bridge.clone() else {
            return;
        };

        if !summary.has_valid_cip {
            self.clock_state.reset();
            return;
        }

        let (transition, seq) = self.clock_state.observe_sample(
            &bridge,
            host_now_ns(),
            summary.syt,
            summary.fdf,
            summary.dbs,
        );
        if transition {
            info!(
                "ir: syt clock established syt={:#06x} fdf={:#04x} dbs={} seq={}",
                summary.syt, summary.fdf, summary.dbs, seq
            );
            bridge.clock_established.store(true, Ordering::Release);
        }
    }

    /// End of one poll pass: latency accounting, the periodic cycle-time
    /// correlation, and stale handling for the sync bridge.
    pub fn on_poll_end(
        &mut self,
        regs: &dyn OhciRegisters,
        packets_processed: u32,
        poll_start_ns: u64,
    ) {
        let now = host_now_ns();
        if packets_processed > 0 {
            self.stream
                .record_poll_latency(now.saturating_sub(poll_start_ns) / 1000, packets_processed);
        }

        self.corr.polls_since_update += 1;
        if self.corr.polls_since_update >= 1000 {
            let ct = regs.read_cycle_timer();
            if self.corr.has_previous {
                let d_fw = delta_fw_nanos(ct, self.corr.prev_cycle_timer);
                let d_host = now as i64 - self.corr.prev_host_ns as i64;
                if d_fw > 0 && d_host > 0 {
                    let ratio = d_host as f64 / d_fw as f64;
                    let nanos_per_sample = ratio * (1e9 / self.sample_rate);
                    let q8 = (nanos_per_sample * 256.0 + 0.5) as u32;
                    self.stream.shared_rx().set_corr_host_ns_per_sample_q8(q8);
                    debug!("ir: cycle correlation q8={q8} ratio={ratio:.6}");
                }
            }
            self.corr.prev_cycle_timer = ct;
            self.corr.prev_host_ns = now;
            self.corr.has_previous = true;
            self.corr.polls_since_update = 0;
        }

        if let Some(bridge) = &self.bridge {
            self.clock_state.handle_stale(bridge, now);
        }
    }
}

impl Default for RxAudioPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::CipBuilder;
    use crate::shm::SharedRegion;
    use crate::sync::FDF_48K;

    fn rx_packet(dbs: u8, dbc: u8, syt: u16, events: u32, sample_base: i32) -> Vec<u8> {
        let builder = CipBuilder::new(5, dbs);
        let (q0, q1) = builder.build(dbc, syt, false);
        let mut buf = vec![0u8; ISOCH_HEADER_BYTES + 8 + (events * dbs as u32 * 4) as usize];
        CipBuilder::write(&mut buf[ISOCH_HEADER_BYTES..], q0, q1);
        for e in 0..events {
            for s in 0..dbs as u32 {
                let off = ISOCH_HEADER_BYTES + 8 + ((e * dbs as u32 + s) * 4) as usize;
                am824::write_quadlet(
                    &mut buf[off..off + 4],
                    am824::encode(sample_base + (e * dbs as u32 + s) as i32),
                );
            }
        }
        buf
    }

    fn rx_queue(channels: u16) -> (SharedRegion, SharedQueue) {
        let bytes = SharedQueue::required_bytes(1024, channels);
        let region = SharedRegion::new(bytes as usize).unwrap();
        assert!(SharedQueue::initialize_in_place(
            region.base(),
            bytes,
            1024,
            channels
        ));
        let mut reader = SharedQueue::default();
        assert!(reader.attach(region.base(), bytes));
        (region, reader)
    }

    #[test]
    fn decoded_events_reach_the_rx_queue() {
        let (region, reader) = rx_queue(2);
        let mut p = RxAudioPipeline::new();
        p.set_shared_rx_queue(region.base(), region.len() as u64);
        p.on_start();

        let pkt = rx_packet(2, 0, 0x2E00, 8, 100);
        p.on_packet(&pkt);

        assert_eq!(reader.fill_level_frames(), 8);
        let mut out = vec![0i32; 16];
        reader.read(&mut out, 8);
        assert_eq!(out[0], 100);
        assert_eq!(out[1], 101);
        assert_eq!(out[15], 115);
        assert_eq!(p.stream().sample_packet_count(), 1);
    }

    #[test]
    fn short_and_invalid_packets_count_errors() {
        let mut p = RxAudioPipeline::new();
        p.on_start();
        p.on_packet(&[0u8; 10]);
        assert_eq!(p.stream().error_count(), 1);

        // EOH violation in Q1.
        let mut pkt = rx_packet(2, 0, 0x1000, 2, 0);
        pkt[ISOCH_HEADER_BYTES + 4] = 0x00;
        p.on_packet(&pkt);
        assert_eq!(p.stream().error_count(), 2);
    }

    #[test]
    fn dbc_discontinuities_are_counted() {
        let mut p = RxAudioPipeline::new();
        p.on_start();
        p.on_packet(&rx_packet(2, 0x00, 0x1000, 8, 0));
        p.on_packet(&rx_packet(2, 0x08, 0x1000, 8, 0));
        assert_eq!(p.stream().discontinuity_count(), 0);
        p.on_packet(&rx_packet(2, 0x20, 0x1000, 8, 0)); // expected 0x10
        assert_eq!(p.stream().discontinuity_count(), 1);
    }

    #[test]
    fn oversized_wire_dbs_skips_decode() {
        let (region, reader) = rx_queue(2);
        let mut p = RxAudioPipeline::new();
        p.set_shared_rx_queue(region.base(), region.len() as u64);
        p.on_start();

        let pkt = rx_packet(40, 0, 0x1000, 2, 0);
        p.on_packet(&pkt);
        assert_eq!(reader.fill_level_frames(), 0);
        assert_eq!(p.stream().error_count(), 1);
    }

    #[test]
    fn sixteen_valid_packets_establish_the_clock() {
        let bridge = Arc::new(ExternalSyncBridge::default());
        let mut p = RxAudioPipeline::new();
        p.set_external_sync_bridge(Some(bridge.clone()));
        p.on_start();

        let mut dbc = 0u8;
        for _ in 0..16 {
            p.on_packet(&rx_packet(2, dbc, 0x2E00, 8, 0));
            dbc = dbc.wrapping_add(8);
        }
        assert!(bridge.clock_established.load(Ordering::Acquire));
        assert_eq!(
            crate::sync::unpack_fdf(bridge.last_packed_rx.load(Ordering::Acquire)),
            FDF_48K
        );
    }

    #[test]
    fn poll_end_publishes_q8_after_correlation_window() {
        use crate::hw::{SharedDmaMemory, SimOhci};

        let (region, reader) = rx_queue(2);
        let mut p = RxAudioPipeline::new();
        p.set_shared_rx_queue(region.base(), region.len() as u64);
        p.on_start();

        let sim = SimOhci::new(SharedDmaMemory::new());
        // First window establishes the baseline.
        for _ in 0..1000 {
            p.on_poll_end(&sim, 0, 0);
        }
        assert_eq!(reader.corr_host_ns_per_sample_q8(), 0);

        // Move the bus clock forward so the second window sees a positive
        // FireWire delta alongside the host-time delta.
        sim.advance_cycles(8000);
        for _ in 0..1000 {
            p.on_poll_end(&sim, 0, 0);
        }
        assert!(reader.corr_host_ns_per_sample_q8() > 0);
    }
}
