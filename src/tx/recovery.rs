use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

// Restart reason bits, shared with the verifier.
pub const REASON_INVALID_LABEL: u32 = 1 << 1;
pub const REASON_CIP_ANOMALY: u32 = 1 << 2;
pub const REASON_DBC_DISCONTINUITY: u32 = 1 << 3;
pub const REASON_UNCOMPLETED_OVERWRITE: u32 = 1 << 4;
pub const REASON_INJECT_MISS: u32 = 1 << 5;

pub const FATAL_MASK: u32 = REASON_INVALID_LABEL | REASON_CIP_ANOMALY | REASON_UNCOMPLETED_OVERWRITE;

const FATAL_COOLDOWN_NS: u64 = 50_000_000;
const NON_FATAL_COOLDOWN_NS: u64 = 200_000_000;

/// Arbitrates full Stop/Start restarts of the IT engine. Requests OR into a
/// reason mask; `try_begin` hands the accumulated mask to exactly one caller
/// at a time and cooldown-gates restart storms.
#[derive(Debug, Default)]
pub struct RecoveryController {
    request_bits: AtomicU32,
    last_restart_ns: AtomicU64,
    restart_count: AtomicU64,
    suppressed_count: AtomicU64,
    in_progress: AtomicBool,
}

impl RecoveryController {
    pub fn request(&self, reason_bits: u32) {
        if reason_bits != 0 {
            self.request_bits.fetch_or(reason_bits, Ordering::Release);
        }
    }

    pub fn restart_count(&self) -> u64 {
        self.restart_count.load(Ordering::Relaxed)
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed_count.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> u32 {
        self.request_bits.load(Ordering::Acquire)
    }

    /// Returns the consumed reason mask when a restart may begin now. The
    /// controller stays gated until `complete` is called.
    pub fn try_begin(&self, now_ns: u64) -> Option<u32> {
        let peek = self.request_bits.load(Ordering::Acquire);
        if peek == 0 {
            return None;
        }
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return None;
        }

        let last = self.last_restart_ns.load(Ordering::Relaxed);
        let cooldown = if peek & FATAL_MASK != 0 {
            FATAL_COOLDOWN_NS
        } else {
            NON_FATAL_COOLDOWN_NS
        };
        if last != 0 && now_ns >= last && now_ns - last < cooldown {
            self.suppressed_count.fetch_add(1, Ordering::Relaxed);
            self.in_progress.store(false, Ordering::Release);
            return None;
        }

        let reasons = self.request_bits.swap(0, Ordering::AcqRel);
        if reasons == 0 {
            self.in_progress.store(false, Ordering::Release);
            return None;
        }
        Some(reasons)
    }

    pub fn complete(&self, now_ns: u64, reasons: u32, success: bool) {
        if success {
            self.last_restart_ns.store(now_ns, Ordering::Relaxed);
            self.restart_count.fetch_add(1, Ordering::Relaxed);
        } else if reasons != 0 {
            // Retry on a later tick, still cooldown-gated.
            self.request_bits.fetch_or(reasons, Ordering::Release);
        }
        self.in_progress.store(false, Ordering::Release);
    }
}
