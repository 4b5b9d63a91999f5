use crate::encoding::cip::SYT_NO_INFO;
use crate::timing::{TICKS_PER_CYCLE, TRANSFER_DELAY_TICKS};
use tracing::warn;

/// Per-rate SYT timing constants. Only the 48 kHz row is populated; other
/// rates fall back to it until their tables are derived.
#[derive(Debug, Clone, Copy)]
pub struct SytRateParams {
    pub sample_rate: f64,
    pub ticks_per_sample: u32,
}

pub const SYT_RATE_48K: SytRateParams = SytRateParams {
    sample_rate: 48_000.0,
    ticks_per_sample: 512,
};

/// Wrap point of the offset accumulator: 16 cycles in the 24.576 MHz tick
/// domain, matching the 4-bit cycle field of SYT.
pub const SYT_OFFSET_WRAP: u32 = 16 * TICKS_PER_CYCLE;

/// Cycle-based SYT generation: the presentation timestamp is derived from
/// the packet's transmit cycle plus an accumulated per-sample tick offset
/// and the fixed DMA transfer delay.
#[derive(Debug, Clone)]
pub struct SytGenerator {
    ticks_per_sample: u32,
    syt_offset_ticks: u32,
    data_packet_count: u64,
    initialized: bool,
}

impl Default for SytGenerator {
    fn default() -> Self {
        SytGenerator {
            ticks_per_sample: SYT_RATE_48K.ticks_per_sample,
            syt_offset_ticks: 0,
            data_packet_count: 0,
            initialized: false,
        }
    }
}

impl SytGenerator {
    pub fn initialize(&mut self, sample_rate: f64) {
        if sample_rate == SYT_RATE_48K.sample_rate {
            self.ticks_per_sample = SYT_RATE_48K.ticks_per_sample;
        } else {
            warn!("syt: unsupported rate {sample_rate} Hz, using 48 kHz parameters");
            self.ticks_per_sample = SYT_RATE_48K.ticks_per_sample;
        }
        self.reset();
        self.initialized = true;
    }

    pub fn reset(&mut self) {
        self.syt_offset_ticks = 0;
        self.data_packet_count = 0;
    }

    pub fn is_valid(&self) -> bool {
        self.initialized
    }

    pub fn data_packet_count(&self) -> u64 {
        self.data_packet_count
    }

    pub fn offset_ticks(&self) -> u32 {
        self.syt_offset_ticks
    }

    /// SYT for a DATA packet transmitted at `transmit_cycle` (0..8000).
    /// Advances the offset accumulator by the packet's sample span.
    pub fn compute(&mut self, transmit_cycle: u32, samples_in_packet: u32) -> u16 {
        if !self.initialized || samples_in_packet == 0 {
            return SYT_NO_INFO;
        }

        let total = self.syt_offset_ticks + TRANSFER_DELAY_TICKS;
        let extra_cycles = total / TICKS_PER_CYCLE;
        let remaining = total % TICKS_PER_CYCLE;
        let presentation_cycle = transmit_cycle + extra_cycles;
        let syt = (((presentation_cycle & 0xF) << 12) | (remaining & 0xFFF)) as u16;

        self.syt_offset_ticks += samples_in_packet * self.ticks_per_sample;
        if self.syt_offset_ticks >= SYT_OFFSET_WRAP {
            self.syt_offset_ticks -= SYT_OFFSET_WRAP;
        }

        self.data_packet_count += 1;
        syt
    }

    /// Signed modular correction in the 16-cycle tick domain.
    pub fn nudge(&mut self, delta_ticks: i32) {
        if !self.initialized || delta_ticks == 0 {
            return;
        }
        let wrap = SYT_OFFSET_WRAP as i64;
        let mut adjusted = self.syt_offset_ticks as i64 + delta_ticks as i64;
        adjusted %= wrap;
        if adjusted < 0 {
            adjusted += wrap;
        }
        self.syt_offset_ticks = adjusted as u32;
    }
}
