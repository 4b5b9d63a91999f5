use serde::{Deserialize, Serialize};

/// Maximum AM824 slots per data block (wire DBS: PCM + MIDI + control slots).
pub const MAX_AM824_SLOTS: u32 = 32;
/// Maximum host-facing PCM channels; PCM slots are a subset of the DBS.
pub const MAX_PCM_CHANNELS: u32 = 16;

pub const TX_QUEUE_CAPACITY_FRAMES: u32 = 4096;
pub const RX_QUEUE_CAPACITY_FRAMES: u32 = 4096;
pub const AUDIO_RING_FRAMES: u32 = 4096;
pub const AUDIO_IO_PERIOD_FRAMES: u32 = 512;

/// Queue-to-ring transfer chunk used by pre-prime and the refill pump.
pub const TRANSFER_CHUNK_FRAMES: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMode {
    NonBlocking,
    Blocking,
}

impl StreamMode {
    pub fn from_raw(raw: u32) -> StreamMode {
        if raw == 1 {
            StreamMode::Blocking
        } else {
            StreamMode::NonBlocking
        }
    }
}

/// TX buffering policy knobs, selected at configure time and carried by
/// value through the transmit pipeline.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TxBufferProfile {
    pub name: &'static str,
    pub start_wait_target_frames: u32,
    /// 0 = unbounded pre-prime.
    pub startup_prime_limit_frames: u32,
    pub legacy_rb_target_frames: u32,
    pub legacy_rb_max_frames: u32,
    pub legacy_max_chunks_per_refill: u32,
    pub min_prime_data_packets: u32,
}

pub const TX_PROFILE_A: TxBufferProfile = TxBufferProfile {
    name: "A",
    start_wait_target_frames: 256,
    startup_prime_limit_frames: 512,
    legacy_rb_target_frames: 512,
    legacy_rb_max_frames: 768,
    legacy_max_chunks_per_refill: 6,
    min_prime_data_packets: 8,
};

pub const TX_PROFILE_B: TxBufferProfile = TxBufferProfile {
    name: "B",
    start_wait_target_frames: 512,
    startup_prime_limit_frames: 0,
    legacy_rb_target_frames: 1024,
    legacy_rb_max_frames: 1536,
    legacy_max_chunks_per_refill: 8,
    min_prime_data_packets: 8,
};

pub const TX_PROFILE_C: TxBufferProfile = TxBufferProfile {
    name: "C",
    start_wait_target_frames: 128,
    startup_prime_limit_frames: 256,
    legacy_rb_target_frames: 256,
    legacy_rb_max_frames: 384,
    legacy_max_chunks_per_refill: 4,
    min_prime_data_packets: 8,
};

impl TxBufferProfile {
    pub fn is_valid(&self) -> bool {
        self.start_wait_target_frames > 0
            && self.legacy_rb_target_frames > 0
            && self.legacy_rb_target_frames <= self.legacy_rb_max_frames
            && self.legacy_max_chunks_per_refill > 0
            && self.start_wait_target_frames <= TX_QUEUE_CAPACITY_FRAMES
    }
}

/// RX buffering policy.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RxBufferProfile {
    pub name: &'static str,
    pub startup_fill_target_frames: u32,
    pub startup_drain_threshold_frames: u32,
    pub safety_offset_frames: u32,
    pub input_latency_frames: u32,
}

pub const RX_PROFILE_A: RxBufferProfile = RxBufferProfile {
    name: "A",
    startup_fill_target_frames: 2048,
    startup_drain_threshold_frames: 256,
    safety_offset_frames: 64,
    input_latency_frames: 24,
};

pub const RX_PROFILE_B: RxBufferProfile = RxBufferProfile {
    name: "B",
    startup_fill_target_frames: 256,
    startup_drain_threshold_frames: 128,
    safety_offset_frames: 48,
    input_latency_frames: 32,
};

pub const RX_PROFILE_C: RxBufferProfile = RxBufferProfile {
    name: "C",
    startup_fill_target_frames: 128,
    startup_drain_threshold_frames: 64,
    safety_offset_frames: 32,
    input_latency_frames: 32,
};

/// Shared-memory region handed across the session boundary.
#[derive(Debug, Clone, Copy)]
pub struct QueueRegion {
    pub base: *mut u8,
    pub bytes: u64,
}

unsafe impl Send for QueueRegion {}
unsafe impl Sync for QueueRegion {}

/// Optional zero-copy audio buffer (disabled unless explicitly provided).
#[derive(Debug, Clone, Copy)]
pub struct ZeroCopyRegion {
    pub base: *mut u8,
    pub bytes: u64,
    pub frames: u32,
}

unsafe impl Send for ZeroCopyRegion {}
unsafe impl Sync for ZeroCopyRegion {}

/// Everything the core consumes at duplex start time.
#[derive(Debug, Clone)]
pub struct StartParams {
    pub guid: u64,
    pub ir_channel: u8,
    pub it_channel: u8,
    pub sid: u8,
    pub stream_mode: StreamMode,
    pub pcm_channels: u32,
    pub am824_slots: u32,
    pub tx_queue: Option<QueueRegion>,
    pub rx_queue: Option<QueueRegion>,
    pub zero_copy: Option<ZeroCopyRegion>,
    pub tx_profile: TxBufferProfile,
    pub rx_profile: RxBufferProfile,
    /// Agere/LSI wake-flush quirk, resolved by PCI attach and frozen here.
    pub agere_flush_quirk: bool,
}

impl StartParams {
    pub fn new(guid: u64) -> StartParams {
        StartParams {
            guid,
            ir_channel: 0,
            it_channel: 1,
            sid: 0,
            stream_mode: StreamMode::Blocking,
            pcm_channels: 2,
            am824_slots: 0,
            tx_queue: None,
            rx_queue: None,
            zero_copy: None,
            tx_profile: TX_PROFILE_A,
            rx_profile: RX_PROFILE_B,
            agere_flush_quirk: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_are_valid() {
        assert!(TX_PROFILE_A.is_valid());
        assert!(TX_PROFILE_B.is_valid());
        assert!(TX_PROFILE_C.is_valid());
    }

    #[test]
    fn stream_mode_raw_mapping() {
        assert_eq!(StreamMode::from_raw(1), StreamMode::Blocking);
        assert_eq!(StreamMode::from_raw(0), StreamMode::NonBlocking);
        assert_eq!(StreamMode::from_raw(7), StreamMode::NonBlocking);
    }

    #[test]
    fn zero_copy_defaults_off() {
        let params = StartParams::new(1);
        assert!(params.zero_copy.is_none());
        assert!(!params.agere_flush_quirk);
    }
}
