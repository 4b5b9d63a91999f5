use serde::Serialize;
use std::sync::atomic::Ordering;

use crate::rx::RxContext;
use crate::tx::TxContext;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TxCountersSnapshot {
    pub packets_assembled: u64,
    pub interrupts: u64,
    pub irq_watchdog_kicks: u64,
    pub refill_calls: u64,
    pub refills: u64,
    pub packets_refilled: u64,
    pub exit_dead: u64,
    pub exit_decode_fail: u64,
    pub exit_hw_oob: u64,
    pub min_dma_gap_packets: u32,
    pub critical_gap_events: u64,
    pub refill_latency_buckets: [u64; 4],

    pub resync_applied: u64,
    pub stale_frames_dropped: u64,
    pub legacy_pump_moved_frames: u64,
    pub exit_zero_refill: u64,
    pub underrun_silenced_packets: u64,
    pub inject_cursor_resets: u64,
    pub inject_missed_packets: u64,
    pub rb_low_events: u64,
    pub txq_low_events: u64,
    pub assembler_underruns: u64,
    pub dbc_discontinuities: u64,

    pub verifier_trace_dropped: u64,
    pub recovery_restarts: u64,
    pub recovery_suppressed: u64,
}

impl TxCountersSnapshot {
    pub fn collect(ctx: &TxContext) -> TxCountersSnapshot {
        let ring = ctx.ring().counters();
        let audio = ctx.audio().counters();
        TxCountersSnapshot {
            packets_assembled: ctx.packets_assembled(),
            interrupts: ctx.interrupt_count(),
            irq_watchdog_kicks: ctx.irq_watchdog_kicks(),
            refill_calls: ring.calls.load(Ordering::Relaxed),
            refills: ring.refills.load(Ordering::Relaxed),
            packets_refilled: ring.packets_refilled.load(Ordering::Relaxed),
            exit_dead: ring.exit_dead.load(Ordering::Relaxed),
            exit_decode_fail: ring.exit_decode_fail.load(Ordering::Relaxed),
            exit_hw_oob: ring.exit_hw_oob.load(Ordering::Relaxed),
            min_dma_gap_packets: ring.min_dma_gap_packets.load(Ordering::Relaxed),
            critical_gap_events: ring.critical_gap_events.load(Ordering::Relaxed),
            refill_latency_buckets: ctx.refill_latency_buckets(),
            resync_applied: audio.resync_applied.load(Ordering::Relaxed),
            stale_frames_dropped: audio.stale_frames_dropped.load(Ordering::Relaxed),
            legacy_pump_moved_frames: audio.legacy_pump_moved_frames.load(Ordering::Relaxed),
            exit_zero_refill: audio.exit_zero_refill.load(Ordering::Relaxed),
            underrun_silenced_packets: audio.underrun_silenced_packets.load(Ordering::Relaxed),
            inject_cursor_resets: audio.audio_inject_cursor_resets.load(Ordering::Relaxed),
            inject_missed_packets: audio.audio_inject_missed_packets.load(Ordering::Relaxed),
            rb_low_events: audio.rb_low_events.load(Ordering::Relaxed),
            txq_low_events: audio.txq_low_events.load(Ordering::Relaxed),
            assembler_underruns: ctx
                .audio()
                .assembler()
                .underrun_diag()
                .underrun_count
                .load(Ordering::Relaxed),
            dbc_discontinuities: ctx.audio().dbc_discontinuities(),
            verifier_trace_dropped: ctx.verifier().dropped_trace(),
            recovery_restarts: ctx.recovery().restart_count(),
            recovery_suppressed: ctx.recovery().suppressed_count(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RxCountersSnapshot {
    pub packets: u64,
    pub sample_packets: u64,
    pub empty_packets: u64,
    pub errors: u64,
    pub discontinuities: u64,
    pub poll_latency_buckets: [u64; 4],
}

impl RxCountersSnapshot {
    pub fn collect(ctx: &RxContext) -> RxCountersSnapshot {
        let stream = ctx.audio().stream();
        RxCountersSnapshot {
            packets: stream.packet_count(),
            sample_packets: stream.sample_packet_count(),
            empty_packets: stream.empty_packet_count(),
            errors: stream.error_count(),
            discontinuities: stream.discontinuity_count(),
            poll_latency_buckets: stream.latency_buckets(),
        }
    }
}

/// Whole-session counter snapshot, serialized to one JSON line on stop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CountersSnapshot {
    pub tx: Option<TxCountersSnapshot>,
    pub rx: Option<RxCountersSnapshot>,
}
