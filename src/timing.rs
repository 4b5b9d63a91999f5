use nix::libc;

pub const TICKS_PER_CYCLE: u32 = 3072;
pub const CYCLES_PER_SECOND: u32 = 8000;
pub const NANOS_PER_CYCLE: u64 = 125_000;
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// 128-second wrap period of the FireWire cycle timer.
pub const FW_TIME_WRAP_SECONDS: u32 = 128;
pub const FW_TIME_WRAP_NANOS: i64 = FW_TIME_WRAP_SECONDS as i64 * NANOS_PER_SECOND as i64;

/// OHCI DMA pipeline latency per IEC 61883-6 (~479 us).
pub const TRANSFER_DELAY_TICKS: u32 = 0x2E00;

/// Monotonic host clock in nanoseconds.
pub fn host_now_ns() -> u64 {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ok = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) == 0 };
    if !ok {
        return 0;
    }
    now.tv_sec as u64 * NANOS_PER_SECOND + now.tv_nsec as u64
}

/// Absolute-deadline sleep on the monotonic clock.
pub fn host_sleep_until_ns(deadline_ns: u64) -> bool {
    let wake = libc::timespec {
        tv_sec: (deadline_ns / NANOS_PER_SECOND) as libc::time_t,
        tv_nsec: (deadline_ns % NANOS_PER_SECOND) as libc::c_long,
    };
    unsafe {
        libc::clock_nanosleep(
            libc::CLOCK_MONOTONIC,
            libc::TIMER_ABSTIME,
            &wake,
            std::ptr::null_mut(),
        ) == 0
    }
}

/// Convert a 32-bit cycle timer value to nanoseconds since the 128 s epoch.
pub fn fw_time_to_nanos(cycle_timer: u32) -> u64 {
    let sec = isofire_ohci::cycle_timer_seconds(cycle_timer) as u64;
    let cyc = isofire_ohci::cycle_timer_cycles(cycle_timer) as u64;
    let off = isofire_ohci::cycle_timer_offset(cycle_timer) as u64;
    sec * NANOS_PER_SECOND + cyc * NANOS_PER_CYCLE + (off * NANOS_PER_CYCLE) / TICKS_PER_CYCLE as u64
}

/// Signed delta between two cycle-timer readings, shortest path across the
/// 128 s wrap.
pub fn delta_fw_nanos(a: u32, b: u32) -> i64 {
    let na = fw_time_to_nanos(a) as i64;
    let nb = fw_time_to_nanos(b) as i64;
    let mut d = na - nb;
    let half = FW_TIME_WRAP_NANOS / 2;
    if d > half {
        d -= FW_TIME_WRAP_NANOS;
    }
    if d < -half {
        d += FW_TIME_WRAP_NANOS;
    }
    d
}
