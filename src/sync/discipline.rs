use crate::timing::TICKS_PER_CYCLE;

pub const TICK_DOMAIN: i32 = 16 * TICKS_PER_CYCLE as i32; // 49152
pub const TICKS_PER_SAMPLE: i32 = 512;
pub const SAMPLES_PER_DATA_PACKET: i32 = 8;
pub const PACKET_INTERVAL_TICKS: i32 = TICKS_PER_SAMPLE * SAMPLES_PER_DATA_PACKET; // 4096
pub const DEADBAND_TICKS: i32 = 32;
pub const STEP_TICKS: i32 = 1;
pub const BASELINE_WINDOW: u32 = 8;
/// ~5.3 ms at 48 kHz / 8-sample packets.
pub const CORRECTION_COOLDOWN_PACKETS: u32 = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct DisciplineResult {
    pub active: bool,
    pub locked: bool,
    pub phase_error_ticks: i32,
    pub correction_ticks: i32,
    pub stale_or_unlock_event: bool,
}

/// Phase discipline of the TX SYT generator against observed RX SYT at
/// 48 kHz. The raw phase is wrapped to half a packet interval so whole-packet
/// sampling skew between the IR and IT paths cannot masquerade as drift; the
/// first eight samples average into a baseline, then each sample outside the
/// deadband emits a single ±1 tick correction gated by a cooldown.
#[derive(Debug, Default)]
pub struct ExternalSyncDiscipline {
    active: bool,
    baseline_locked: bool,
    baseline_count: u32,
    baseline_accum: i64,
    baseline_phase_ticks: i32,
    last_phase_error_ticks: i32,
    correction_cooldown: u32,
    correction_count: u64,
    stale_or_unlock_count: u64,
}

impl ExternalSyncDiscipline {
    pub fn reset(&mut self) {
        *self = ExternalSyncDiscipline {
            correction_count: self.correction_count,
            stale_or_unlock_count: self.stale_or_unlock_count,
            ..Default::default()
        };
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn locked(&self) -> bool {
        self.baseline_locked
    }

    pub fn last_phase_error_ticks(&self) -> i32 {
        self.last_phase_error_ticks
    }

    pub fn correction_count(&self) -> u64 {
        self.correction_count
    }

    pub fn stale_or_unlock_count(&self) -> u64 {
        self.stale_or_unlock_count
    }

    pub fn update(&mut self, enabled: bool, tx_syt: u16, rx_syt: u16) -> DisciplineResult {
        let mut result = DisciplineResult::default();

        if !enabled {
            if self.active || self.baseline_locked || self.baseline_count != 0 {
                self.stale_or_unlock_count += 1;
                result.stale_or_unlock_event = true;
            }
            self.active = false;
            self.baseline_locked = false;
            self.baseline_count = 0;
            self.baseline_accum = 0;
            self.baseline_phase_ticks = 0;
            self.last_phase_error_ticks = 0;
            self.correction_cooldown = 0;
            return result;
        }

        self.active = true;
        let raw_phase =
            wrap_signed_interval(syt_to_tick_index(rx_syt) - syt_to_tick_index(tx_syt));

        if !self.baseline_locked {
            self.baseline_accum += raw_phase as i64;
            self.baseline_count += 1;
            if self.baseline_count >= BASELINE_WINDOW {
                self.baseline_phase_ticks =
                    (self.baseline_accum / self.baseline_count as i64) as i32;
                self.baseline_locked = true;
                self.baseline_count = 0;
                self.baseline_accum = 0;
            }
            self.last_phase_error_ticks = 0;
            result.active = true;
            result.locked = self.baseline_locked;
            return result;
        }

        let phase_error = wrap_signed_interval(raw_phase - self.baseline_phase_ticks);
        self.last_phase_error_ticks = phase_error;

        let mut correction = 0;
        if self.correction_cooldown > 0 {
            self.correction_cooldown -= 1;
        } else if phase_error.abs() > DEADBAND_TICKS {
            correction = if phase_error > 0 { STEP_TICKS } else { -STEP_TICKS };
            self.correction_cooldown = CORRECTION_COOLDOWN_PACKETS;
            self.correction_count += 1;
        }

        result.active = true;
        result.locked = true;
        result.phase_error_ticks = phase_error;
        result.correction_ticks = correction;
        result
    }
}

/// Monotonic tick index of a SYT in the 16-cycle domain `[0, 49152)`.
pub fn syt_to_tick_index(syt: u16) -> i32 {
    let cycle4 = ((syt >> 12) & 0xF) as i32;
    let ticks12 = (syt & 0xFFF) as i32;
    cycle4 * TICKS_PER_CYCLE as i32 + ticks12 % TICKS_PER_CYCLE as i32
}

pub fn wrap_signed_ticks(ticks: i32) -> i32 {
    let half = TICK_DOMAIN / 2;
    let mut wrapped = ticks % TICK_DOMAIN;
    if wrapped >= half {
        wrapped -= TICK_DOMAIN;
    } else if wrapped < -half {
        wrapped += TICK_DOMAIN;
    }
    wrapped
}

/// Wrap into `(-2048, 2048]` so ±whole-packet skew cancels out.
pub fn wrap_signed_interval(ticks: i32) -> i32 {
    let half = PACKET_INTERVAL_TICKS / 2;
    let mut wrapped = ticks % PACKET_INTERVAL_TICKS;
    if wrapped >= half {
        wrapped -= PACKET_INTERVAL_TICKS;
    } else if wrapped < -half {
        wrapped += PACKET_INTERVAL_TICKS;
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_tick(tick: i32) -> u16 {
        let cycle = (tick / TICKS_PER_CYCLE as i32) & 0xF;
        let rem = tick % TICKS_PER_CYCLE as i32;
        ((cycle << 12) | rem) as u16
    }

    fn prime_baseline(d: &mut ExternalSyncDiscipline, phase: i32) {
        for _ in 0..BASELINE_WINDOW {
            let r = d.update(true, encode_tick(0), encode_tick(phase));
            assert_eq!(r.correction_ticks, 0);
        }
        assert!(d.locked());
    }

    #[test]
    fn corrections_follow_phase_direction() {
        let mut d = ExternalSyncDiscipline::default();
        prime_baseline(&mut d, 400);

        let r = d.update(true, encode_tick(0), encode_tick(500));
        assert_eq!(r.phase_error_ticks, 100);
        assert_eq!(r.correction_ticks, 1);

        // Cooldown: same-direction phases produce no further corrections.
        for _ in 0..CORRECTION_COOLDOWN_PACKETS {
            let r = d.update(true, encode_tick(0), encode_tick(500));
            assert_eq!(r.correction_ticks, 0);
        }
        let r = d.update(true, encode_tick(0), encode_tick(500));
        assert_eq!(r.correction_ticks, 1);
    }

    #[test]
    fn negative_phase_corrects_down() {
        let mut d = ExternalSyncDiscipline::default();
        prime_baseline(&mut d, 400);
        let r = d.update(true, encode_tick(0), encode_tick(300));
        assert_eq!(r.phase_error_ticks, -100);
        assert_eq!(r.correction_ticks, -1);
    }

    #[test]
    fn deadband_suppresses_small_errors() {
        let mut d = ExternalSyncDiscipline::default();
        prime_baseline(&mut d, 400);
        let r = d.update(true, encode_tick(0), encode_tick(420));
        assert_eq!(r.phase_error_ticks, 20);
        assert_eq!(r.correction_ticks, 0);
    }

    #[test]
    fn whole_packet_skew_is_invisible() {
        let mut d = ExternalSyncDiscipline::default();
        prime_baseline(&mut d, 400);
        // One full packet interval of extra skew wraps to zero phase error.
        let r = d.update(
            true,
            encode_tick(0),
            encode_tick(400 + PACKET_INTERVAL_TICKS),
        );
        assert_eq!(r.phase_error_ticks, 0);
    }

    #[test]
    fn disable_resets_and_counts() {
        let mut d = ExternalSyncDiscipline::default();
        prime_baseline(&mut d, 400);
        let r = d.update(false, 0, 0);
        assert!(r.stale_or_unlock_event);
        assert!(!d.locked());
        assert_eq!(d.stale_or_unlock_count(), 1);
        // Baseline restarts from scratch.
        let r = d.update(true, encode_tick(0), encode_tick(100));
        assert!(!r.locked);
    }

    #[test]
    fn tick_index_conversion() {
        assert_eq!(syt_to_tick_index(0x0000), 0);
        assert_eq!(syt_to_tick_index(0x2E00), 2 * 3072 + (0xE00 % 3072));
        assert_eq!(syt_to_tick_index(0xF000), 15 * 3072);
        assert_eq!(wrap_signed_ticks(TICK_DOMAIN + 5), 5);
        assert_eq!(wrap_signed_interval(PACKET_INTERVAL_TICKS + 7), 7);
        assert_eq!(wrap_signed_interval(-PACKET_INTERVAL_TICKS - 7), -7);
    }
}
