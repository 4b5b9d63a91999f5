use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{AUDIO_IO_PERIOD_FRAMES, QueueRegion, RX_PROFILE_B, RxBufferProfile};
use crate::encoding::PacketAssembler;
use crate::hw::HostAudioClock;
use crate::shm::SharedQueue;
use crate::timing::host_now_ns;

const MAX_PPM: f64 = 100.0;
const DEADBAND_FRAMES: i32 = 8;
const PPM_PER_FRAME: f64 = 0.45;
const IPPM_PER_FRAME_TICK: f64 = 0.0008;
const INTEGRAL_CLAMP: i64 = 200_000;
const METRICS_LOG_PERIOD_TICKS: u64 = 430;

#[derive(Debug, Default)]
pub struct ClockSyncState {
    pub target_fill_level: u32,
    pub fill_error_integral: i64,
    pub last_fill_error: i32,

    pub nominal_ticks_per_buffer: f64,
    pub current_ticks_per_buffer: f64,
    pub fractional_ticks: f64,

    pub adjustment_count: u64,
    pub max_correction_ppm: f64,
    pub saturation_count: u64,
    was_saturated: bool,
    drift_direction: i32,
    monotone_drift_ticks: u32,
}

impl ClockSyncState {
    fn reset_control(&mut self) {
        self.fill_error_integral = 0;
        self.last_fill_error = 0;
        self.fractional_ticks = 0.0;
        self.adjustment_count = 0;
        self.max_correction_ppm = 0.0;
        self.saturation_count = 0;
        self.was_saturated = false;
        self.drift_direction = 0;
        self.monotone_drift_ticks = 0;
    }
}

#[derive(Debug, Default)]
struct EncodingMetrics {
    packets_generated: u64,
    data_packets: u64,
    no_data_packets: u64,
}

fn round_with_fraction(fractional: &mut f64, current_ticks: f64) -> u64 {
    let exact = current_ticks + *fractional;
    let rounded = exact as u64;
    *fractional = exact - rounded as f64;
    rounded
}

/// Host-side audio clock engine. Once per IO-buffer period it advances the
/// zero timestamp the OS audio stack consumes, choosing the per-buffer host
/// tick count by priority: the bus cycle-time correlation when published, a
/// PI loop on the TX fill level in zero-copy mode, nominal otherwise.
pub struct ClockEngine {
    host_clock: Arc<dyn HostAudioClock>,
    tx_queue: SharedQueue,
    rx_queue: SharedQueue,
    zero_copy_frames: u32,
    period_frames: u32,
    sample_rate: f64,

    sync: ClockSyncState,
    host_ticks_per_buffer: u64,
    rx_profile: RxBufferProfile,
    rx_startup_drained: bool,
    local_assembler: PacketAssembler,
    encoding: EncodingMetrics,
    metrics_counter: u64,
}

impl ClockEngine {
    pub fn new(
        host_clock: Arc<dyn HostAudioClock>,
        tx_region: Option<QueueRegion>,
        rx_region: Option<QueueRegion>,
        zero_copy_frames: u32,
        sample_rate: f64,
    ) -> ClockEngine {
        let mut tx_queue = SharedQueue::default();
        if let Some(r) = tx_region {
            tx_queue.attach(r.base, r.bytes);
        }
        let mut rx_queue = SharedQueue::default();
        if let Some(r) = rx_region {
            rx_queue.attach(r.base, r.bytes);
        }
        ClockEngine {
            host_clock,
            tx_queue,
            rx_queue,
            zero_copy_frames,
            period_frames: AUDIO_IO_PERIOD_FRAMES,
            sample_rate,
            sync: ClockSyncState::default(),
            host_ticks_per_buffer: 0,
            rx_profile: RX_PROFILE_B,
            rx_startup_drained: false,
            local_assembler: PacketAssembler::new(2, 0),
            encoding: EncodingMetrics::default(),
            metrics_counter: 0,
        }
    }

    pub fn set_rx_profile(&mut self, profile: RxBufferProfile) {
        self.rx_profile = profile;
    }

    pub fn sync_state(&self) -> &ClockSyncState {
        &self.sync
    }

    pub fn host_ticks_per_buffer(&self) -> u64 {
        self.host_ticks_per_buffer
    }

    pub fn local_assembler(&mut self) -> &mut PacketAssembler {
        &mut self.local_assembler
    }

    fn zero_copy_enabled(&self) -> bool {
        self.zero_copy_frames > 0
    }

    pub fn prepare_for_start(&mut self) {
        self.local_assembler.reset();
        self.encoding = EncodingMetrics::default();
        self.metrics_counter = 0;
        self.rx_startup_drained = false;

        let nominal = self.period_frames as f64 * 1e9 / self.sample_rate;
        self.host_ticks_per_buffer = nominal as u64;
        self.sync.nominal_ticks_per_buffer = nominal;
        self.sync.current_ticks_per_buffer = nominal;
        self.sync.reset_control();

        if self.tx_queue.is_valid() {
            self.tx_queue.producer_set_zero_copy_phase(0);
            self.tx_queue.producer_request_consumer_resync();
        }

        self.sync.target_fill_level = if self.tx_queue.is_valid() {
            if self.zero_copy_enabled() {
                ((self.zero_copy_frames * 5) / 8).max(8)
            } else {
                64
            }
        } else {
            2048
        };

        debug!(
            "clock: start target_fill={} nominal_ticks={} zero_copy={}",
            self.sync.target_fill_level,
            self.host_ticks_per_buffer,
            self.zero_copy_enabled()
        );

        self.host_clock.update_zero_timestamp(0, 0);
    }

    pub fn prepare_for_stop(&mut self) {
        self.sync.reset_control();
        debug!("clock: stopped");
    }

    fn apply_cycle_time_clock(&mut self, q8: u32) -> u64 {
        let nanos_per_sample = q8 as f64 / 256.0;
        self.sync.current_ticks_per_buffer = nanos_per_sample * self.period_frames as f64;
        round_with_fraction(
            &mut self.sync.fractional_ticks,
            self.sync.current_ticks_per_buffer,
        )
    }

    fn apply_zero_copy_pll(&mut self) -> u64 {
        let fill = self.tx_queue.fill_level_frames() as i32;
        let fill_error = fill - self.sync.target_fill_level as i32;

        let mut control_error = fill_error;
        if control_error.abs() <= DEADBAND_FRAMES {
            control_error = 0;
        }

        // Anti-windup: freeze the integral while the output is pegged in
        // the direction of the error.
        let ppm_unclamped = PPM_PER_FRAME * control_error as f64
            + IPPM_PER_FRAME_TICK * self.sync.fill_error_integral as f64;
        let sat_high = ppm_unclamped > MAX_PPM && control_error > 0;
        let sat_low = ppm_unclamped < -MAX_PPM && control_error < 0;
        if !(sat_high || sat_low) {
            self.sync.fill_error_integral = (self.sync.fill_error_integral
                + control_error as i64)
                .clamp(-INTEGRAL_CLAMP, INTEGRAL_CLAMP);
        }

        let ppm = (PPM_PER_FRAME * control_error as f64
            + IPPM_PER_FRAME_TICK * self.sync.fill_error_integral as f64)
            .clamp(-MAX_PPM, MAX_PPM);

        let correction = self.sync.nominal_ticks_per_buffer * (ppm / 1e6);
        self.sync.current_ticks_per_buffer = self.sync.nominal_ticks_per_buffer + correction;
        self.sync.last_fill_error = fill_error;
        self.sync.adjustment_count += 1;
        if ppm.abs() > self.sync.max_correction_ppm {
            self.sync.max_correction_ppm = ppm.abs();
        }

        let saturated = ppm.abs() >= MAX_PPM - 0.1;
        if saturated && !self.sync.was_saturated {
            self.sync.saturation_count += 1;
            warn!(
                "clock: pll saturated corr={:.1}ppm fill={} target={} err={}",
                ppm, fill, self.sync.target_fill_level, fill_error
            );
        }
        self.sync.was_saturated = saturated;

        let dir = control_error.signum();
        if dir != 0 && dir == self.sync.drift_direction {
            self.sync.monotone_drift_ticks += 1;
            if self.sync.monotone_drift_ticks == 200 {
                warn!(
                    "clock: monotone drift ({}) for 200+ ticks fill={} target={}",
                    if dir > 0 { "fast" } else { "slow" },
                    fill,
                    self.sync.target_fill_level
                );
            }
        } else {
            self.sync.drift_direction = dir;
            self.sync.monotone_drift_ticks = if dir != 0 { 1 } else { 0 };
        }

        round_with_fraction(
            &mut self.sync.fractional_ticks,
            self.sync.current_ticks_per_buffer,
        )
    }

    fn apply_nominal(&mut self, with_legacy_tx_update: bool) -> u64 {
        if with_legacy_tx_update {
            let fill = self.tx_queue.fill_level_frames() as i32;
            self.sync.last_fill_error = fill - self.sync.target_fill_level as i32;
            self.sync.fill_error_integral = 0;
            self.sync.current_ticks_per_buffer = self.sync.nominal_ticks_per_buffer;
            self.sync.fractional_ticks = 0.0;
            self.sync.max_correction_ppm = 0.0;
            return self.sync.nominal_ticks_per_buffer as u64;
        }
        round_with_fraction(
            &mut self.sync.fractional_ticks,
            self.sync.current_ticks_per_buffer,
        )
    }

    fn compute_host_ticks(&mut self, q8: u32, rx_pll_ready: bool) -> u64 {
        if q8 > 0 {
            return self.apply_cycle_time_clock(q8);
        }
        if self.zero_copy_enabled() && self.tx_queue.is_valid() {
            return self.apply_zero_copy_pll();
        }
        if rx_pll_ready {
            return self.apply_nominal(false);
        }
        if self.tx_queue.is_valid() {
            return self.apply_nominal(true);
        }
        self.sync.current_ticks_per_buffer as u64
    }

    fn drain_local_encoding(&mut self) {
        while self.local_assembler.buffer_fill_level()
            >= self.local_assembler.frames_per_data_packet()
        {
            let pkt = self.local_assembler.assemble_next(0xFFFF, false);
            self.encoding.packets_generated += 1;
            if pkt.is_data {
                self.encoding.data_packets += 1;
            } else {
                self.encoding.no_data_packets += 1;
            }
        }
    }

    /// Startup latency bound: once the RX queue reaches its fill target,
    /// drop any backlog beyond the drain threshold before the first read.
    fn maybe_drain_rx_startup(&mut self) {
        if self.rx_startup_drained || !self.rx_queue.is_valid() {
            return;
        }
        let fill = self.rx_queue.fill_level_frames();
        let target = self.rx_profile.startup_fill_target_frames;
        if fill < target {
            return;
        }
        let excess = fill - target;
        if excess > self.rx_profile.startup_drain_threshold_frames {
            let dropped = self.rx_queue.consume_frames(excess);
            debug!("clock: rx startup drain dropped {dropped} frames (fill={fill})");
        }
        self.rx_startup_drained = true;
    }

    /// One timer tick: advance the zero timestamp and return the next
    /// wake deadline in host nanoseconds.
    pub fn tick(&mut self, now_ns: u64) -> u64 {
        let local_encoding = !self.tx_queue.is_valid();
        let rx_pll_ready = self.rx_queue.is_valid();
        self.maybe_drain_rx_startup();
        let q8 = if rx_pll_ready {
            self.rx_queue.corr_host_ns_per_sample_q8()
        } else {
            0
        };

        let (mut sample_time, mut host_time) = self.host_clock.current_zero_timestamp();
        let ticks = self.compute_host_ticks(q8, rx_pll_ready);
        self.host_ticks_per_buffer = ticks;

        if host_time != 0 {
            sample_time += self.period_frames as u64;
            host_time += ticks;
        } else {
            sample_time = 0;
            host_time = now_ns;
        }
        self.host_clock.update_zero_timestamp(sample_time, host_time);

        self.metrics_counter += 1;
        if self.metrics_counter % METRICS_LOG_PERIOD_TICKS == 0 {
            let corr_ppm = (self.sync.current_ticks_per_buffer
                - self.sync.nominal_ticks_per_buffer)
                / self.sync.nominal_ticks_per_buffer
                * 1e6;
            debug!(
                "clock: q8={} corr={:.1}ppm fill={} target={} err={} integral={} sat={} pkts={}",
                q8,
                corr_ppm,
                self.tx_queue.fill_level_frames(),
                self.sync.target_fill_level,
                self.sync.last_fill_error,
                self.sync.fill_error_integral,
                self.sync.saturation_count,
                self.encoding.packets_generated
            );
        }

        if local_encoding {
            self.drain_local_encoding();
        }

        host_time + ticks
    }

    /// Cooperative timer loop. Runs until `stop` is raised.
    pub async fn run(mut self, stop: Arc<AtomicBool>) {
        self.prepare_for_start();
        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let now = host_now_ns();
            let deadline = self.tick(now);
            let sleep_ns = deadline.saturating_sub(host_now_ns());
            tokio::time::sleep(Duration::from_nanos(sleep_ns)).await;
        }
        self.prepare_for_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::SharedRegion;
    use std::sync::Mutex;

    struct TestClock {
        zero: Mutex<(u64, u64)>,
    }

    impl TestClock {
        fn new() -> Arc<TestClock> {
            Arc::new(TestClock {
                zero: Mutex::new((0, 0)),
            })
        }
    }

    impl HostAudioClock for TestClock {
        fn current_zero_timestamp(&self) -> (u64, u64) {
            *self.zero.lock().unwrap()
        }

        fn update_zero_timestamp(&self, sample_time: u64, host_time_ns: u64) {
            *self.zero.lock().unwrap() = (sample_time, host_time_ns);
        }
    }

    fn queue_region(capacity: u32) -> (SharedRegion, SharedQueue, QueueRegion) {
        let bytes = SharedQueue::required_bytes(capacity, 2);
        let region = SharedRegion::new(bytes as usize).unwrap();
        assert!(SharedQueue::initialize_in_place(region.base(), bytes, capacity, 2));
        let mut q = SharedQueue::default();
        assert!(q.attach(region.base(), bytes));
        let qr = QueueRegion {
            base: region.base(),
            bytes,
        };
        (region, q, qr)
    }

    #[test]
    fn target_fill_selection() {
        let clock = TestClock::new();
        let (_r, _q, tx) = queue_region(4096);

        let mut zc = ClockEngine::new(clock.clone(), Some(tx), None, 1024, 48_000.0);
        zc.prepare_for_start();
        assert_eq!(zc.sync_state().target_fill_level, 1024 * 5 / 8);

        let mut legacy = ClockEngine::new(clock.clone(), Some(tx), None, 0, 48_000.0);
        legacy.prepare_for_start();
        assert_eq!(legacy.sync_state().target_fill_level, 64);

        let mut none = ClockEngine::new(clock, None, None, 0, 48_000.0);
        none.prepare_for_start();
        assert_eq!(none.sync_state().target_fill_level, 2048);
    }

    #[test]
    fn first_tick_anchors_then_advances() {
        let clock = TestClock::new();
        let (_r, _q, tx) = queue_region(4096);
        let mut engine = ClockEngine::new(clock.clone(), Some(tx), None, 0, 48_000.0);
        engine.prepare_for_start();

        let deadline = engine.tick(1_000_000);
        let (sample, host) = clock.current_zero_timestamp();
        assert_eq!(sample, 0);
        assert_eq!(host, 1_000_000);
        assert_eq!(deadline, 1_000_000 + engine.host_ticks_per_buffer());

        engine.tick(2_000_000);
        let (sample, host) = clock.current_zero_timestamp();
        assert_eq!(sample, 512);
        // 512 frames at 48 kHz is ~10.67 ms of host time.
        assert_eq!(host, 1_000_000 + engine.host_ticks_per_buffer());
        let nominal = (512f64 * 1e9 / 48_000.0) as u64;
        assert_eq!(engine.host_ticks_per_buffer(), nominal);
    }

    #[test]
    fn cycle_time_q8_takes_priority() {
        let clock = TestClock::new();
        let (_rt, _qt, tx) = queue_region(4096);
        let (_rr, rx_reader, rx) = queue_region(4096);

        // 48 kHz nominal is 20833.33 ns/sample; publish a slightly slow
        // device clock.
        let q8 = (20_900.0f64 * 256.0) as u32;
        rx_reader.set_corr_host_ns_per_sample_q8(q8);

        let mut engine = ClockEngine::new(clock, Some(tx), Some(rx), 0, 48_000.0);
        engine.prepare_for_start();
        engine.tick(1_000);
        let expected = (q8 as f64 / 256.0 * 512.0) as u64;
        let got = engine.host_ticks_per_buffer();
        assert!(got >= expected - 1 && got <= expected + 1);
    }

    #[test]
    fn pll_reacts_to_fill_error_within_limits() {
        let clock = TestClock::new();
        let (_r, producer, tx) = queue_region(4096);
        let mut engine = ClockEngine::new(clock, Some(tx), None, 1024, 48_000.0);
        engine.prepare_for_start();
        let nominal = engine.sync_state().nominal_ticks_per_buffer;
        let target = engine.sync_state().target_fill_level;

        // Fill far above target: the callback should slow down (more host
        // ticks per buffer), clamped at +100 ppm.
        producer.publish_frames(target + 2048);
        engine.tick(1_000);
        let ticks = engine.sync_state().current_ticks_per_buffer;
        assert!(ticks > nominal);
        assert!(ticks <= nominal * (1.0 + MAX_PPM / 1e6) + 1.0);
        assert_eq!(engine.sync_state().saturation_count, 1);

        // Within the deadband nothing moves.
        let consumer = producer; // same attachment acts as the reader here
        consumer.consumer_drop_queued_frames();
        consumer.publish_frames(target);
        let integral_before = engine.sync_state().fill_error_integral;
        engine.tick(2_000);
        assert_eq!(engine.sync_state().fill_error_integral, integral_before);
    }

    #[test]
    fn legacy_tx_path_resets_integral() {
        let clock = TestClock::new();
        let (_r, _producer, tx) = queue_region(4096);
        let mut engine = ClockEngine::new(clock, Some(tx), None, 0, 48_000.0);
        engine.prepare_for_start();
        engine.sync.fill_error_integral = 777;
        engine.tick(1_000);
        assert_eq!(engine.sync_state().fill_error_integral, 0);
        assert_eq!(
            engine.host_ticks_per_buffer(),
            engine.sync_state().nominal_ticks_per_buffer as u64
        );
    }

    #[test]
    fn rx_startup_drain_bounds_backlog() {
        let clock = TestClock::new();
        let (_r, rx_writer, rx) = queue_region(4096);
        let mut engine = ClockEngine::new(clock, None, Some(rx), 0, 48_000.0);
        engine.set_rx_profile(crate::config::RX_PROFILE_B);
        engine.prepare_for_start();

        // Below target: nothing dropped, drain still pending.
        rx_writer.publish_frames(100);
        engine.tick(1_000);
        assert_eq!(rx_writer.fill_level_frames(), 100);

        // Well past target + threshold: backlog trimmed to the target once.
        rx_writer.publish_frames(1000);
        engine.tick(2_000);
        assert_eq!(
            rx_writer.fill_level_frames(),
            crate::config::RX_PROFILE_B.startup_fill_target_frames
        );

        // Later growth is left alone.
        rx_writer.publish_frames(1000);
        engine.tick(3_000);
        assert_eq!(
            rx_writer.fill_level_frames(),
            crate::config::RX_PROFILE_B.startup_fill_target_frames + 1000
        );
    }

    #[test]
    fn local_encoding_drains_assembler() {
        let clock = TestClock::new();
        let mut engine = ClockEngine::new(clock, None, None, 0, 48_000.0);
        engine.prepare_for_start();
        let frames = vec![1i32; 2 * 64];
        engine.local_assembler().ring().write(&frames, 64);
        engine.tick(1_000);
        assert!(engine.local_assembler().buffer_fill_level() < 8);
    }
}
