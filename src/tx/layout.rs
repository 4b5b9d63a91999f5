use isofire_ohci::DESCRIPTOR_SIZE;

// OHCI prefetches descriptors in 32-byte chunks and must never cross a page
// boundary mid-fetch, so the tail of every 4 KiB page stays unused
// (Linux firewire-ohci padding strategy).
pub const OHCI_PAGE_SIZE: usize = 4096;
pub const OHCI_PREFETCH_SIZE: usize = 32;
pub const USABLE_PER_PAGE: usize = OHCI_PAGE_SIZE - OHCI_PREFETCH_SIZE; // 4064

/// Packets are programmed as OUTPUT_MORE_IMMEDIATE (2 blocks) + OUTPUT_LAST.
pub const BLOCKS_PER_PACKET: u32 = 3;
/// ~25 ms of ring at 8000 packets/s.
pub const NUM_PACKETS: u32 = 200;
pub const RING_BLOCKS: u32 = NUM_PACKETS * BLOCKS_PER_PACKET;

pub const DESCRIPTOR_STRIDE: u32 = DESCRIPTOR_SIZE as u32;
const DESCRIPTORS_PER_PAGE_RAW: u32 = (USABLE_PER_PAGE / DESCRIPTOR_SIZE) as u32; // 254
pub const DESCRIPTORS_PER_PAGE: u32 =
    (DESCRIPTORS_PER_PAGE_RAW / BLOCKS_PER_PACKET) * BLOCKS_PER_PACKET; // 252

pub const TOTAL_PAGES: u32 = RING_BLOCKS.div_ceil(DESCRIPTORS_PER_PAGE); // 3
pub const DESCRIPTOR_RING_BYTES: usize = TOTAL_PAGES as usize * OHCI_PAGE_SIZE; // 12288

/// Fixed payload stride per ring slot.
pub const MAX_PACKET_SIZE: u32 = 4096;
pub const PAYLOAD_BYTES: usize = (NUM_PACKETS * MAX_PACKET_SIZE) as usize;

/// Verifier tolerance between cmdPtr and completion progress.
pub const GUARD_BAND_PACKETS: u32 = 4;

/// Audio injection window (~2 ms) and the refill fill-ahead ceiling.
pub const AUDIO_WRITE_AHEAD: u32 = 16;
pub const MAX_WRITE_AHEAD: u32 = NUM_PACKETS - GUARD_BAND_PACKETS; // 196

const _: () = assert!(DESCRIPTORS_PER_PAGE >= BLOCKS_PER_PACKET);
const _: () = assert!(DESCRIPTORS_PER_PAGE % BLOCKS_PER_PACKET == 0);
const _: () = assert!(DESCRIPTORS_PER_PAGE as usize * DESCRIPTOR_SIZE <= USABLE_PER_PAGE);
const _: () = assert!(BLOCKS_PER_PACKET == 3);
