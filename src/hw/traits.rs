use isofire_ohci::DmaRegion;
use std::io;
use std::sync::atomic::{Ordering, fence};

/// Register window of one OHCI controller. Offsets are the constants from
/// `isofire-ohci`; the PCI attach path that produces an implementation is
/// outside the core.
pub trait OhciRegisters: Send + Sync {
    fn read(&self, offset: u32) -> u32;
    fn write(&self, offset: u32, value: u32);

    fn read_cycle_timer(&self) -> u32 {
        self.read(isofire_ohci::ISOCHRONOUS_CYCLE_TIMER)
    }
}

/// DMA-coherent memory provider. Descriptor regions must come back 4 KiB
/// aligned with IOVAs the engines can fit in 32 bits; payload regions need
/// 16-byte alignment.
pub trait DmaMemory: Send {
    fn allocate_descriptor_region(&mut self, bytes: usize) -> io::Result<DmaRegion>;
    fn allocate_payload_region(&mut self, bytes: usize) -> io::Result<DmaRegion>;

    /// Commit CPU writes (packet bytes, descriptor words) before the device
    /// observes them.
    fn publish_barrier(&self) {
        fence(Ordering::Release);
    }

    /// Order device completions before the CPU reads descriptor status.
    fn fetch_barrier(&self) {
        fence(Ordering::Acquire);
    }
}

/// The host audio device's zero-timestamp pair, consumed and advanced by the
/// clock engine.
pub trait HostAudioClock: Send + Sync {
    /// `(sample_time, host_time_ns)`; host_time 0 means "not yet anchored".
    fn current_zero_timestamp(&self) -> (u64, u64);
    fn update_zero_timestamp(&self, sample_time: u64, host_time_ns: u64);
}
