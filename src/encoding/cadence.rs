use crate::config::StreamMode;

/// Frames per DATA packet at 48 kHz blocking (SYT interval).
pub const BLOCKING_FRAMES_PER_PACKET: u32 = 8;
/// Frames per cycle at 48 kHz non-blocking.
pub const NON_BLOCKING_FRAMES_PER_PACKET: u32 = 6;

/// 48 kHz packet cadence.
///
/// Blocking: NO-DATA on cycles where `index % 4 == 0`, 8 frames otherwise;
/// 6 DATA + 2 NO-DATA per 8 cycles gives exactly 48 frames per millisecond.
/// Non-blocking: DATA every cycle with 6 frames.
#[derive(Debug, Clone)]
pub struct Cadence {
    mode: StreamMode,
    cycle_index: u64,
}

impl Cadence {
    pub fn new(mode: StreamMode) -> Cadence {
        Cadence {
            mode,
            cycle_index: 0,
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: StreamMode) {
        self.mode = mode;
        self.cycle_index = 0;
    }

    pub fn next_is_data(&self) -> bool {
        match self.mode {
            StreamMode::Blocking => self.cycle_index % 4 != 0,
            StreamMode::NonBlocking => true,
        }
    }

    pub fn samples_this_cycle(&self) -> u32 {
        match self.mode {
            StreamMode::Blocking => {
                if self.next_is_data() {
                    BLOCKING_FRAMES_PER_PACKET
                } else {
                    0
                }
            }
            StreamMode::NonBlocking => NON_BLOCKING_FRAMES_PER_PACKET,
        }
    }

    /// Frame count of a DATA packet in the active mode.
    pub fn frames_per_data_packet(&self) -> u32 {
        match self.mode {
            StreamMode::Blocking => BLOCKING_FRAMES_PER_PACKET,
            StreamMode::NonBlocking => NON_BLOCKING_FRAMES_PER_PACKET,
        }
    }

    pub fn cycle_in_group(&self) -> u32 {
        (self.cycle_index % 8) as u32
    }

    pub fn total_cycles(&self) -> u64 {
        self.cycle_index
    }

    pub fn advance(&mut self) {
        self.cycle_index += 1;
    }

    pub fn reset(&mut self) {
        self.cycle_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_window_is_six_data_two_no_data() {
        let mut c = Cadence::new(StreamMode::Blocking);
        for _ in 0..16 {
            // Any alignment of the 8-cycle window.
            let mut data = 0;
            let mut no_data = 0;
            let mut frames = 0;
            for _ in 0..8 {
                if c.next_is_data() {
                    data += 1;
                } else {
                    no_data += 1;
                }
                frames += c.samples_this_cycle();
                c.advance();
            }
            assert_eq!(data, 6);
            assert_eq!(no_data, 2);
            assert_eq!(frames, 48);
        }
    }

    #[test]
    fn blocking_no_data_positions() {
        let mut c = Cadence::new(StreamMode::Blocking);
        let pattern: Vec<bool> = (0..8)
            .map(|_| {
                let d = c.next_is_data();
                c.advance();
                d
            })
            .collect();
        assert_eq!(
            pattern,
            [false, true, true, true, false, true, true, true]
        );
    }

    #[test]
    fn non_blocking_always_data() {
        let mut c = Cadence::new(StreamMode::NonBlocking);
        let mut frames = 0;
        for _ in 0..8 {
            assert!(c.next_is_data());
            frames += c.samples_this_cycle();
            c.advance();
        }
        assert_eq!(frames, 48);
    }

    #[test]
    fn reset_rewinds_to_cycle_zero() {
        let mut c = Cadence::new(StreamMode::Blocking);
        c.advance();
        c.advance();
        c.reset();
        assert_eq!(c.total_cycles(), 0);
        assert!(!c.next_is_data());
    }
}
