use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};
use std::sync::{Arc, Mutex};

use isofire_ohci::Descriptor;
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::encoding::am824;
use crate::encoding::cip::{CIP_HEADER_BYTES, CipFields, FDF_SFC_48K, FMT_AM824, SYT_NO_INFO};
use crate::timing::host_now_ns;
use crate::tx::layout;
use crate::tx::recovery::{self, RecoveryController};
use crate::tx::ring::CaptureHook;

/// Most audio quadlets a DATA packet can carry (8 frames x 32 slots).
const MAX_AUDIO_QUADLETS: usize = 256;
const TRACE_CAPACITY: u32 = 1024;
const MAX_ENTRIES_PER_RUN: u32 = 64;
const LOG_INTERVAL_NS: u64 = 1_000_000_000;

#[derive(Clone, Copy)]
struct TraceEntry {
    packet_index: u32,
    hw_packet_index: u32,
    last_desc_control: u32,
    last_desc_status: u32,
    cip_q0: u32,
    cip_q1: u32,
    req_count: u16,
    audio_quadlet_count: u16,
    audio: [u32; MAX_AUDIO_QUADLETS],
}

impl Default for TraceEntry {
    fn default() -> Self {
        TraceEntry {
            packet_index: 0,
            hw_packet_index: 0,
            last_desc_control: 0,
            last_desc_status: 0,
            cip_q0: 0,
            cip_q1: 0,
            req_count: 0,
            audio_quadlet_count: 0,
            audio: [0u32; MAX_AUDIO_QUADLETS],
        }
    }
}

/// SPSC trace ring: the refill path pushes a snapshot of every slot it is
/// about to overwrite, the verifier task drains.
struct TraceRing {
    entries: Box<[TraceEntry]>,
    write_index: AtomicU32,
    read_index: AtomicU32,
    dropped: AtomicU64,
}

unsafe impl Sync for TraceRing {}

impl TraceRing {
    fn new() -> TraceRing {
        TraceRing {
            entries: vec![TraceEntry::default(); TRACE_CAPACITY as usize].into_boxed_slice(),
            write_index: AtomicU32::new(0),
            read_index: AtomicU32::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, entry: TraceEntry) {
        let w = self.write_index.load(Ordering::Relaxed);
        let r = self.read_index.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= TRACE_CAPACITY {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let idx = (w & (TRACE_CAPACITY - 1)) as usize;
        unsafe {
            let slot = self.entries.as_ptr().add(idx) as *mut TraceEntry;
            *slot = entry;
        }
        self.write_index.store(w.wrapping_add(1), Ordering::Release);
    }

    fn pop(&self) -> Option<TraceEntry> {
        let r = self.read_index.load(Ordering::Relaxed);
        let w = self.write_index.load(Ordering::Acquire);
        if r == w {
            return None;
        }
        let entry = self.entries[(r & (TRACE_CAPACITY - 1)) as usize];
        self.read_index.store(r.wrapping_add(1), Ordering::Release);
        Some(entry)
    }

    fn reset(&self) {
        self.write_index.store(0, Ordering::Relaxed);
        self.read_index.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of pipeline/ring counters fed to each verifier run.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerifierInputs {
    pub frames_per_packet: u32,
    pub pcm_channels: u32,
    pub am824_slots: u32,
    pub zero_copy_enabled: bool,
    pub shared_tx_queue_valid: bool,
    pub shared_tx_fill_frames: u32,

    pub audio_inject_cursor_resets: u64,
    pub audio_inject_missed_packets: u64,
    pub underrun_silenced_packets: u64,
    pub critical_gap_events: u64,
    pub dbc_discontinuities: u64,
}

#[derive(Debug, Default)]
struct VerifierState {
    have_last_data_dbc: bool,
    last_data_dbc: u8,
    blocks_per_data: u8,
    silent_data_run: u32,
    inject_miss_consecutive_runs: u32,

    last_inject_cursor_resets: u64,
    last_inject_missed_packets: u64,
    last_underrun_silenced: u64,
    last_critical_gap: u64,
    last_dbc_discontinuities: u64,
    last_dropped_trace: u64,

    last_log_ns: [u64; LogKey::Count as usize],
}

#[derive(Clone, Copy)]
enum LogKey {
    InjectResets,
    InjectMiss,
    UnderrunSilenced,
    CriticalGap,
    DbcCounter,
    TraceDrop,
    Uncompleted,
    ReqCount,
    CipField,
    CmdPtr,
    DbcDisc,
    AllZero,
    InvalidLabel,
    SilenceRun,
    Count,
}

impl VerifierState {
    fn log_allowed(&mut self, key: LogKey, now_ns: u64) -> bool {
        let slot = &mut self.last_log_ns[key as usize];
        if now_ns.wrapping_sub(*slot) >= LOG_INTERVAL_NS {
            *slot = now_ns;
            true
        } else {
            false
        }
    }
}

/// Off-path transmit verifier. The hot path only pushes trace entries and
/// flips the kick flag; all analysis runs on its own task and feeds the
/// recovery controller through a reason mask.
pub struct TxVerifier {
    trace: TraceRing,
    inputs: Mutex<VerifierInputs>,
    state: Mutex<VerifierState>,
    queued: AtomicBool,
    shutting_down: AtomicBool,
    enabled: AtomicBool,
    notify: Notify,
    recovery: Arc<RecoveryController>,
}

impl TxVerifier {
    pub fn new(recovery: Arc<RecoveryController>) -> TxVerifier {
        TxVerifier {
            trace: TraceRing::new(),
            inputs: Mutex::new(VerifierInputs::default()),
            state: Mutex::new(VerifierState::default()),
            queued: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            notify: Notify::new(),
            recovery,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn dropped_trace(&self) -> u64 {
        self.trace.dropped.load(Ordering::Relaxed)
    }

    pub fn reset_for_start(&self, blocks_per_data: u8) {
        self.shutting_down.store(false, Ordering::Release);
        self.queued.store(false, Ordering::Release);
        self.trace.reset();
        let mut state = self.state.lock().expect("verifier state poisoned");
        *state = VerifierState {
            blocks_per_data,
            ..Default::default()
        };
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// De-duplicated kick from the watchdog: snapshot the inputs and wake
    /// the worker task.
    pub fn kick(&self, inputs: VerifierInputs) {
        if self.shutting_down.load(Ordering::Acquire) || !self.enabled.load(Ordering::Acquire) {
            return;
        }
        if self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.inputs.lock().expect("verifier inputs poisoned") = inputs;
        fence(Ordering::Release);
        self.notify.notify_one();
    }

    /// Worker task body; owned by the service's runtime.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            self.run_work();
        }
    }

    /// One analysis pass over the trace backlog. Public so tests and the
    /// shutdown path can run it synchronously.
    pub fn run_work(&self) {
        struct QueuedGuard<'a>(&'a AtomicBool);
        impl Drop for QueuedGuard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _guard = QueuedGuard(&self.queued);

        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if !self.enabled.load(Ordering::Acquire) {
            while self.trace.pop().is_some() {}
            return;
        }

        let inputs = *self.inputs.lock().expect("verifier inputs poisoned");
        let mut state = self.state.lock().expect("verifier state poisoned");
        let now = host_now_ns();
        let mut restart_reasons = 0u32;

        let delta_resets = inputs
            .audio_inject_cursor_resets
            .wrapping_sub(state.last_inject_cursor_resets);
        let delta_missed = inputs
            .audio_inject_missed_packets
            .wrapping_sub(state.last_inject_missed_packets);
        let delta_silenced = inputs
            .underrun_silenced_packets
            .wrapping_sub(state.last_underrun_silenced);
        let delta_gap = inputs
            .critical_gap_events
            .wrapping_sub(state.last_critical_gap);
        let delta_dbc = inputs
            .dbc_discontinuities
            .wrapping_sub(state.last_dbc_discontinuities);
        let dropped = self.trace.dropped.load(Ordering::Relaxed);
        let delta_dropped = dropped.wrapping_sub(state.last_dropped_trace);

        if delta_resets > 0 && state.log_allowed(LogKey::InjectResets, now) {
            warn!(
                "txverify: inject cursor resets +{} (total {})",
                delta_resets, inputs.audio_inject_cursor_resets
            );
        }
        if delta_missed > 0 && state.log_allowed(LogKey::InjectMiss, now) {
            warn!(
                "txverify: inject missed packets +{} (total {})",
                delta_missed, inputs.audio_inject_missed_packets
            );
        }
        if delta_silenced > 0 && state.log_allowed(LogKey::UnderrunSilenced, now) {
            warn!(
                "txverify: underrun-silenced packets +{} (total {})",
                delta_silenced, inputs.underrun_silenced_packets
            );
        }
        if delta_gap > 0 && state.log_allowed(LogKey::CriticalGap, now) {
            warn!(
                "txverify: critical DMA gap events +{} (total {})",
                delta_gap, inputs.critical_gap_events
            );
        }
        if delta_dbc > 0 && state.log_allowed(LogKey::DbcCounter, now) {
            warn!(
                "txverify: producer DBC discontinuities +{} (total {})",
                delta_dbc, inputs.dbc_discontinuities
            );
        }
        if delta_dropped > 0 && state.log_allowed(LogKey::TraceDrop, now) {
            warn!("txverify: trace ring dropped +{delta_dropped} (total {dropped})");
        }

        // Sustained injection misses should not outlive a couple of ticks.
        if delta_missed > 0 {
            state.inject_miss_consecutive_runs =
                state.inject_miss_consecutive_runs.saturating_add(1);
        } else {
            state.inject_miss_consecutive_runs = 0;
        }
        if delta_missed >= 8 || state.inject_miss_consecutive_runs >= 2 {
            restart_reasons |= recovery::REASON_INJECT_MISS;
        }
        if delta_dbc > 0 {
            restart_reasons |= recovery::REASON_DBC_DISCONTINUITY;
        }

        state.last_inject_cursor_resets = inputs.audio_inject_cursor_resets;
        state.last_inject_missed_packets = inputs.audio_inject_missed_packets;
        state.last_underrun_silenced = inputs.underrun_silenced_packets;
        state.last_critical_gap = inputs.critical_gap_events;
        state.last_dbc_discontinuities = inputs.dbc_discontinuities;
        state.last_dropped_trace = dropped;

        let mut processed = 0;
        while processed < MAX_ENTRIES_PER_RUN {
            let Some(e) = self.trace.pop() else { break };
            processed += 1;
            restart_reasons |=
                self.check_entry(&mut state, &inputs, &e, delta_missed, now);
        }

        if restart_reasons != 0 {
            self.recovery.request(restart_reasons);
        }
    }

    fn check_entry(
        &self,
        state: &mut VerifierState,
        inputs: &VerifierInputs,
        e: &TraceEntry,
        delta_missed: u64,
        now: u64,
    ) -> u32 {
        let mut reasons = 0u32;

        let expected_no_data_req = CIP_HEADER_BYTES as u16;
        let expected_slots = if inputs.am824_slots != 0 {
            inputs.am824_slots
        } else {
            inputs.pcm_channels
        };
        let expected_data_req =
            (CIP_HEADER_BYTES + inputs.frames_per_packet * expected_slots * 4) as u16;

        let cip = CipFields::parse(e.cip_q0, e.cip_q1);
        let is_no_data = cip.syt == SYT_NO_INFO || e.req_count == expected_no_data_req;
        let is_data = !is_no_data && e.req_count > expected_no_data_req;

        if e.last_desc_status == 0 {
            if state.log_allowed(LogKey::Uncompleted, now) {
                error!(
                    "txverify: overwriting uncompleted slot pkt={} hw={} req={} ctl={:#010x} cip=[{:#010x} {:#010x}]",
                    e.packet_index,
                    e.hw_packet_index,
                    e.req_count,
                    e.last_desc_control,
                    e.cip_q0,
                    e.cip_q1
                );
            }
            reasons |= recovery::REASON_UNCOMPLETED_OVERWRITE;
        }

        if is_no_data && e.req_count != expected_no_data_req {
            if state.log_allowed(LogKey::ReqCount, now) {
                error!(
                    "txverify: NO-DATA req_count {} expected {} pkt={}",
                    e.req_count, expected_no_data_req, e.packet_index
                );
            }
            reasons |= recovery::REASON_CIP_ANOMALY;
        }
        if is_data && e.req_count != expected_data_req {
            if state.log_allowed(LogKey::ReqCount, now) {
                error!(
                    "txverify: DATA req_count {} expected {} pkt={}",
                    e.req_count, expected_data_req, e.packet_index
                );
            }
            reasons |= recovery::REASON_CIP_ANOMALY;
        }

        let cip_ok = cip.eoh0 == 0
            && cip.eoh1 == 2
            && cip.fmt == FMT_AM824
            && cip.fdf == FDF_SFC_48K
            && cip.dbs as u32 == expected_slots
            && !(is_data && cip.syt == SYT_NO_INFO)
            && !(is_no_data && cip.syt != SYT_NO_INFO);
        if !cip_ok {
            if state.log_allowed(LogKey::CipField, now) {
                error!(
                    "txverify: CIP mismatch pkt={} eoh=({},{}) fmt={:#04x} fdf={:#04x} dbs={} syt={:#06x} data={}",
                    e.packet_index, cip.eoh0, cip.eoh1, cip.fmt, cip.fdf, cip.dbs, cip.syt, is_data
                );
            }
            reasons |= recovery::REASON_CIP_ANOMALY;
        }

        let dist = circular_distance(e.hw_packet_index, e.packet_index);
        if dist > layout::GUARD_BAND_PACKETS && state.log_allowed(LogKey::CmdPtr, now) {
            warn!(
                "txverify: cmdPtr index diverges from completion pkt={} hw={} dist={}",
                e.packet_index, e.hw_packet_index, dist
            );
        }

        if is_data {
            if state.have_last_data_dbc {
                let expected = state.last_data_dbc.wrapping_add(state.blocks_per_data);
                if cip.dbc != expected {
                    if state.log_allowed(LogKey::DbcDisc, now) {
                        error!(
                            "txverify: DBC discontinuity pkt={} got {:#04x} expected {:#04x}",
                            e.packet_index, cip.dbc, expected
                        );
                    }
                    reasons |= recovery::REASON_DBC_DISCONTINUITY;
                }
            }
            state.have_last_data_dbc = true;
            state.last_data_dbc = cip.dbc;
        }

        if is_data && e.audio_quadlet_count > 0 {
            let slots_per_frame = expected_slots.max(1);
            let pcm_slots = inputs.pcm_channels.min(slots_per_frame);
            let mut all_silence = true;
            let mut saw_all_zero = false;
            let mut invalid_label = false;
            let mut invalid_label_non_zero = false;

            for i in 0..e.audio_quadlet_count as u32 {
                let q = e.audio[i as usize];
                let slot = i % slots_per_frame;
                let is_pcm = slot < pcm_slots;
                if q == 0 {
                    saw_all_zero = true;
                }
                let expected_label = if is_pcm {
                    am824::AM824_LABEL_MBLA
                } else {
                    am824::AM824_LABEL_MIDI_BASE + ((slot - pcm_slots) & 0x3) as u8
                };
                if am824::label(q) != expected_label {
                    invalid_label = true;
                    if q != 0 {
                        invalid_label_non_zero = true;
                    }
                }
                if is_pcm && q != am824::SILENCE {
                    all_silence = false;
                }
            }

            if saw_all_zero && state.log_allowed(LogKey::AllZero, now) {
                error!(
                    "txverify: all-zero audio quadlet(s) pkt={} req={}",
                    e.packet_index, e.req_count
                );
            }
            if invalid_label {
                if state.log_allowed(LogKey::InvalidLabel, now) {
                    error!("txverify: invalid AM824 label pkt={}", e.packet_index);
                }
                if invalid_label_non_zero {
                    reasons |= recovery::REASON_INVALID_LABEL;
                }
            }

            if all_silence {
                state.silent_data_run += 1;
            } else {
                state.silent_data_run = 0;
            }
            if state.silent_data_run >= 8 {
                let should_have_audio = !inputs.zero_copy_enabled
                    && inputs.shared_tx_queue_valid
                    && inputs.shared_tx_fill_frames >= inputs.frames_per_packet
                    && delta_missed == 0;
                if should_have_audio && state.log_allowed(LogKey::SilenceRun, now) {
                    warn!(
                        "txverify: suspicious silence run len={} pkt={} queue_fill={}",
                        state.silent_data_run, e.packet_index, inputs.shared_tx_fill_frames
                    );
                }
            }
        }

        reasons
    }
}

impl CaptureHook for TxVerifier {
    fn capture_before_overwrite(
        &self,
        packet_index: u32,
        hw_packet_index: u32,
        _cmd_ptr: u32,
        last_desc: &Descriptor,
        payload: &[u8],
    ) {
        if self.shutting_down.load(Ordering::Acquire) || !self.enabled.load(Ordering::Acquire) {
            return;
        }

        let mut entry = TraceEntry {
            packet_index,
            hw_packet_index,
            last_desc_control: last_desc.control,
            last_desc_status: last_desc.status,
            req_count: last_desc.req_count(),
            cip_q0: am824::read_quadlet(&payload[0..4]),
            cip_q1: am824::read_quadlet(&payload[4..8]),
            ..Default::default()
        };

        let audio_bytes = (entry.req_count as u32).saturating_sub(CIP_HEADER_BYTES);
        let quadlets = (audio_bytes / 4).min(MAX_AUDIO_QUADLETS as u32);
        entry.audio_quadlet_count = quadlets as u16;
        for i in 0..quadlets as usize {
            entry.audio[i] = am824::read_quadlet(&payload[8 + i * 4..12 + i * 4]);
        }

        self.trace.push(entry);
    }
}

fn circular_distance(a: u32, b: u32) -> u32 {
    let n = layout::NUM_PACKETS;
    let d1 = (a + n - b) % n;
    let d2 = (b + n - a) % n;
    d1.min(d2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::CipBuilder;

    fn packet_bytes(dbs: u8, dbc: u8, syt: u16, is_no_data: bool, frames: u32) -> Vec<u8> {
        let builder = CipBuilder::new(1, dbs);
        let (q0, q1) = builder.build(dbc, syt, is_no_data);
        let size = if is_no_data {
            8
        } else {
            8 + (frames * dbs as u32 * 4) as usize
        };
        let mut buf = vec![0u8; size];
        CipBuilder::write(&mut buf, q0, q1);
        if !is_no_data {
            for i in 0..(frames * dbs as u32) as usize {
                am824::write_quadlet(&mut buf[8 + i * 4..12 + i * 4], am824::SILENCE);
            }
        }
        buf
    }

    fn completed_descriptor(req: u16) -> Descriptor {
        Descriptor {
            control: isofire_ohci::output_last_control(0, req),
            data_address: 0,
            branch: 0,
            status: (0x11 << 16) | 42,
        }
    }

    fn inputs() -> VerifierInputs {
        VerifierInputs {
            frames_per_packet: 8,
            pcm_channels: 2,
            am824_slots: 2,
            shared_tx_queue_valid: true,
            ..Default::default()
        }
    }

    fn verifier() -> (Arc<RecoveryController>, TxVerifier) {
        let recovery = Arc::new(RecoveryController::default());
        let v = TxVerifier::new(recovery.clone());
        v.reset_for_start(8);
        (recovery, v)
    }

    #[test]
    fn clean_stream_raises_no_reasons() {
        let (recovery, v) = verifier();
        let mut dbc = 0u8;
        for i in 0..20u32 {
            let is_no_data = i % 4 == 0;
            let buf = packet_bytes(2, dbc, if is_no_data { 0xFFFF } else { 0x1000 }, is_no_data, 8);
            let desc = completed_descriptor(buf.len() as u16);
            v.capture_before_overwrite(i % layout::NUM_PACKETS, i % layout::NUM_PACKETS, 0, &desc, &buf);
            if !is_no_data {
                dbc = dbc.wrapping_add(8);
            }
        }
        v.kick(inputs());
        v.run_work();
        assert_eq!(recovery.pending(), 0);
    }

    #[test]
    fn dbc_jump_requests_restart() {
        let (recovery, v) = verifier();
        let a = packet_bytes(2, 0x00, 0x1000, false, 8);
        let b = packet_bytes(2, 0x10, 0x1000, false, 8); // expected 0x08
        let desc = completed_descriptor(a.len() as u16);
        v.capture_before_overwrite(1, 1, 0, &desc, &a);
        v.capture_before_overwrite(2, 2, 0, &desc, &b);
        v.kick(inputs());
        v.run_work();
        assert!(recovery.pending() & recovery::REASON_DBC_DISCONTINUITY != 0);
    }

    #[test]
    fn uncompleted_overwrite_is_fatal_reason() {
        let (recovery, v) = verifier();
        let buf = packet_bytes(2, 0, 0x1000, false, 8);
        let mut desc = completed_descriptor(buf.len() as u16);
        desc.status = 0;
        v.capture_before_overwrite(0, 0, 0, &desc, &buf);
        v.kick(inputs());
        v.run_work();
        let pending = recovery.pending();
        assert!(pending & recovery::REASON_UNCOMPLETED_OVERWRITE != 0);
        assert!(pending & recovery::FATAL_MASK != 0);
    }

    #[test]
    fn invalid_label_flags_restart() {
        let (recovery, v) = verifier();
        let mut buf = packet_bytes(2, 0, 0x1000, false, 8);
        // Corrupt the first audio quadlet with a non-AM824 label.
        am824::write_quadlet(&mut buf[8..12], 0x1F00_0001);
        let desc = completed_descriptor(buf.len() as u16);
        v.capture_before_overwrite(0, 0, 0, &desc, &buf);
        v.kick(inputs());
        v.run_work();
        assert!(recovery.pending() & recovery::REASON_INVALID_LABEL != 0);
    }

    #[test]
    fn wrong_fdf_is_cip_anomaly() {
        let (recovery, v) = verifier();
        let builder = CipBuilder::new(1, 2);
        let (q0, q1) = builder.build(0, 0x1234, false);
        let mut buf = vec![0u8; 8 + 64];
        CipBuilder::write(&mut buf, q0, q1);
        for i in 0..16 {
            am824::write_quadlet(&mut buf[8 + i * 4..12 + i * 4], am824::SILENCE);
        }
        buf[5] = 0x00; // FDF byte of Q1: not 48 kHz any more
        let desc = completed_descriptor(buf.len() as u16);
        v.capture_before_overwrite(0, 0, 0, &desc, &buf);
        v.kick(inputs());
        v.run_work();
        assert!(recovery.pending() & recovery::REASON_CIP_ANOMALY != 0);
    }

    #[test]
    fn sustained_inject_misses_request_restart() {
        let (recovery, v) = verifier();
        let mut i = inputs();
        i.audio_inject_missed_packets = 24; // >= 8 in one tick
        v.kick(i);
        v.run_work();
        assert!(recovery.pending() & recovery::REASON_INJECT_MISS != 0);
    }

    #[test]
    fn kick_is_deduplicated() {
        let (_recovery, v) = verifier();
        v.kick(inputs());
        assert!(v.queued.load(Ordering::Acquire));
        // Second kick while queued is a no-op (inputs stay untouched).
        let mut other = inputs();
        other.frames_per_packet = 99;
        v.kick(other);
        assert_eq!(v.inputs.lock().unwrap().frames_per_packet, 8);
        v.run_work();
        assert!(!v.queued.load(Ordering::Acquire));
    }
}
