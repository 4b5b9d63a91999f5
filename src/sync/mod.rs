pub mod discipline;

pub use discipline::ExternalSyncDiscipline;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub const FDF_48K: u8 = 0x02;
pub const NO_INFO_SYT: u16 = 0xFFFF;
pub const ESTABLISH_VALID_UPDATES: u32 = 16;
/// Bridge samples older than this are treated as stale.
pub const EXTERNAL_SYNC_STALE_NANOS: u64 = 100_000_000;

/// Shared record through which the IR pipeline informs the IT SYT path of
/// the device's most recent timestamp. IR writes, IT reads; every publish
/// uses release ordering, every observation acquire.
#[derive(Debug, Default)]
pub struct ExternalSyncBridge {
    pub active: AtomicBool,
    pub clock_established: AtomicBool,
    pub update_seq: AtomicU32,
    /// `[SYT:16][FDF:8][DBS:8]`
    pub last_packed_rx: AtomicU32,
    pub last_update_host_ns: AtomicU64,
}

pub fn pack_rx_sample(syt: u16, fdf: u8, dbs: u8) -> u32 {
    ((syt as u32) << 16) | ((fdf as u32) << 8) | dbs as u32
}

pub fn unpack_syt(packed: u32) -> u16 {
    (packed >> 16) as u16
}

pub fn unpack_fdf(packed: u32) -> u8 {
    (packed >> 8) as u8
}

pub fn unpack_dbs(packed: u32) -> u8 {
    packed as u8
}

impl ExternalSyncBridge {
    pub fn reset(&self) {
        self.active.store(false, Ordering::Release);
        self.clock_established.store(false, Ordering::Release);
        self.update_seq.store(0, Ordering::Release);
        self.last_packed_rx.store(0, Ordering::Release);
        self.last_update_host_ns.store(0, Ordering::Release);
    }

    /// A usable RX SYT sample for the TX discipline: bridge active, clock
    /// established, and the last update fresh.
    pub fn fresh_rx_syt(&self, now_host_ns: u64) -> Option<u16> {
        if !self.active.load(Ordering::Acquire) || !self.clock_established.load(Ordering::Acquire) {
            return None;
        }
        let last = self.last_update_host_ns.load(Ordering::Acquire);
        if last == 0 || now_host_ns < last || now_host_ns - last > EXTERNAL_SYNC_STALE_NANOS {
            return None;
        }
        let packed = self.last_packed_rx.load(Ordering::Acquire);
        let syt = unpack_syt(packed);
        if syt == NO_INFO_SYT || unpack_fdf(packed) != FDF_48K {
            return None;
        }
        Some(syt)
    }
}

/// IR-side establishment tracker. Owned by the receive pipeline; the bridge
/// flag itself is flipped by the caller after the transition is logged.
#[derive(Debug, Default)]
pub struct ExternalSyncClockState {
    consecutive_valid: u32,
}

impl ExternalSyncClockState {
    /// Observe one RX CIP sample. Returns true exactly once when the
    /// establish threshold is crossed.
    pub fn observe_sample(
        &mut self,
        bridge: &ExternalSyncBridge,
        now_host_ns: u64,
        syt: u16,
        fdf: u8,
        dbs: u8,
    ) -> (bool, u32) {
        if fdf != FDF_48K {
            self.consecutive_valid = 0;
            return (false, 0);
        }
        if syt == NO_INFO_SYT {
            // NO-DATA packets do not reset establishment progress.
            return (false, 0);
        }

        bridge
            .last_packed_rx
            .store(pack_rx_sample(syt, fdf, dbs), Ordering::Release);
        bridge.last_update_host_ns.store(now_host_ns, Ordering::Release);
        let seq = bridge.update_seq.fetch_add(1, Ordering::AcqRel) + 1;

        if self.consecutive_valid < ESTABLISH_VALID_UPDATES {
            self.consecutive_valid += 1;
        }

        let transition = !bridge.clock_established.load(Ordering::Acquire)
            && self.consecutive_valid >= ESTABLISH_VALID_UPDATES;
        (transition, seq)
    }

    /// Clear establishment when the bridge went inactive or the last sample
    /// aged out. Returns true if `clock_established` was dropped.
    pub fn handle_stale(&mut self, bridge: &ExternalSyncBridge, now_host_ns: u64) -> bool {
        if !bridge.active.load(Ordering::Acquire) {
            self.consecutive_valid = 0;
            return bridge.clock_established.swap(false, Ordering::AcqRel);
        }

        let last = bridge.last_update_host_ns.load(Ordering::Acquire);
        if last == 0 {
            return false;
        }
        if now_host_ns.wrapping_sub(last) > EXTERNAL_SYNC_STALE_NANOS {
            self.consecutive_valid = 0;
            return bridge.clock_established.swap(false, Ordering::AcqRel);
        }
        false
    }

    pub fn reset(&mut self) {
        self.consecutive_valid = 0;
    }

    pub fn consecutive_valid(&self) -> u32 {
        self.consecutive_valid
    }
}
