use byteorder::{ByteOrder, LittleEndian};
use nix::libc;
use std::io;

// Global interrupt registers
pub const INT_EVENT_SET: u32 = 0x080;
pub const INT_EVENT_CLEAR: u32 = 0x084;
pub const INT_MASK_SET: u32 = 0x088;
pub const INT_MASK_CLEAR: u32 = 0x08C;

// Isochronous transmit/receive interrupt banks
pub const ISO_XMIT_INT_EVENT_SET: u32 = 0x090;
pub const ISO_XMIT_INT_EVENT_CLEAR: u32 = 0x094;
pub const ISO_XMIT_INT_MASK_SET: u32 = 0x098;
pub const ISO_XMIT_INT_MASK_CLEAR: u32 = 0x09C;
pub const ISO_RECV_INT_EVENT_SET: u32 = 0x0A0;
pub const ISO_RECV_INT_EVENT_CLEAR: u32 = 0x0A4;
pub const ISO_RECV_INT_MASK_SET: u32 = 0x0A8;
pub const ISO_RECV_INT_MASK_CLEAR: u32 = 0x0AC;

pub const ISOCHRONOUS_CYCLE_TIMER: u32 = 0x0F0;

// IntEvent bits consumed by the isochronous engines
pub const INT_ISOCH_TX: u32 = 1 << 6;
pub const INT_ISOCH_RX: u32 = 1 << 7;
pub const INT_CYCLE_64_SECONDS: u32 = 1 << 24;
pub const INT_CYCLE_LOST: u32 = 1 << 25;

// Per-context register blocks
pub const IT_CONTEXT_BASE: u32 = 0x200;
pub const IT_CONTEXT_STRIDE: u32 = 16;
pub const IR_CONTEXT_BASE: u32 = 0x400;
pub const IR_CONTEXT_STRIDE: u32 = 32;

pub fn it_context_control_set(index: u8) -> u32 {
    IT_CONTEXT_BASE + IT_CONTEXT_STRIDE * index as u32
}

pub fn it_context_control_clear(index: u8) -> u32 {
    it_context_control_set(index) + 0x4
}

pub fn it_command_ptr(index: u8) -> u32 {
    it_context_control_set(index) + 0xC
}

pub fn ir_context_control_set(index: u8) -> u32 {
    IR_CONTEXT_BASE + IR_CONTEXT_STRIDE * index as u32
}

pub fn ir_context_control_clear(index: u8) -> u32 {
    ir_context_control_set(index) + 0x4
}

pub fn ir_command_ptr(index: u8) -> u32 {
    ir_context_control_set(index) + 0xC
}

pub fn ir_context_match(index: u8) -> u32 {
    ir_context_control_set(index) + 0x10
}

// ContextControl bits (common to IT and IR)
pub const CONTEXT_RUN: u32 = 1 << 15;
pub const CONTEXT_WAKE: u32 = 1 << 12;
pub const CONTEXT_DEAD: u32 = 1 << 11;
pub const CONTEXT_ACTIVE: u32 = 1 << 10;
pub const CONTEXT_EVENT_CODE_MASK: u32 = 0x1F;
pub const CONTEXT_WRITABLE_BITS: u32 = CONTEXT_RUN | CONTEXT_WAKE;

// IR ContextControlSet mode bits
pub const IR_CONTEXT_BUFFER_FILL: u32 = 1 << 31;
pub const IR_CONTEXT_ISOCH_HEADER: u32 = 1 << 30;
pub const IR_CONTEXT_CYCLE_MATCH_ENABLE: u32 = 1 << 29;
pub const IR_CONTEXT_MULTI_CHAN_MODE: u32 = 1 << 28;

pub fn context_event_code(control: u32) -> u8 {
    (control & CONTEXT_EVENT_CODE_MASK) as u8
}

/// IR ContextMatch word: tag bitmask in [31:28], sync in [11:8], channel in [5:0].
pub fn ir_match_word(tag_mask: u8, sync: u8, channel: u8) -> u32 {
    ((tag_mask as u32 & 0xF) << 28) | ((sync as u32 & 0xF) << 8) | (channel as u32 & 0x3F)
}

// CommandPtr encodes a 16-byte aligned descriptor address OR-ed with Z in the
// low nibble.
pub fn command_ptr(descriptor_iova: u32, z: u8) -> u32 {
    (descriptor_iova & !0xF) | (z as u32 & 0xF)
}

pub fn command_ptr_address(command_ptr: u32) -> u32 {
    command_ptr & !0xF
}

pub fn command_ptr_z(command_ptr: u32) -> u8 {
    (command_ptr & 0xF) as u8
}

// Cycle timer register: [31:25] seconds, [24:12] cycles, [11:0] ticks.
pub const CYCLE_TIMER_SECONDS_SHIFT: u32 = 25;
pub const CYCLE_TIMER_CYCLES_SHIFT: u32 = 12;
pub const CYCLE_TIMER_CYCLES_MASK: u32 = 0x1FFF;
pub const CYCLE_TIMER_OFFSET_MASK: u32 = 0xFFF;

pub fn cycle_timer_seconds(ct: u32) -> u32 {
    ct >> CYCLE_TIMER_SECONDS_SHIFT
}

pub fn cycle_timer_cycles(ct: u32) -> u32 {
    (ct >> CYCLE_TIMER_CYCLES_SHIFT) & CYCLE_TIMER_CYCLES_MASK
}

pub fn cycle_timer_offset(ct: u32) -> u32 {
    ct & CYCLE_TIMER_OFFSET_MASK
}

pub fn cycle_timer_word(seconds: u32, cycles: u32, offset: u32) -> u32 {
    ((seconds & 0x7F) << CYCLE_TIMER_SECONDS_SHIFT)
        | ((cycles & CYCLE_TIMER_CYCLES_MASK) << CYCLE_TIMER_CYCLES_SHIFT)
        | (offset & CYCLE_TIMER_OFFSET_MASK)
}

// Descriptor command encodings in the high control halfword
pub const DESC_CMD_OUTPUT_LAST: u32 = 0x1 << 28;
pub const DESC_CMD_INPUT_MORE: u32 = 0x2 << 28;
pub const DESC_STATUS_UPDATE: u32 = 1 << 27;
pub const DESC_BRANCH_ALWAYS: u32 = 0x3 << 18;
pub const DESC_KEY_IMMEDIATE: u32 = 0x0200 << 16;

pub const DESC_INT_NEVER: u8 = 0;
pub const DESC_INT_ALWAYS: u8 = 3;

pub const DESCRIPTOR_SIZE: usize = 16;
/// OUTPUT_MORE_IMMEDIATE spans the descriptor record plus one 16-byte
/// immediate-data block.
pub const IMMEDIATE_DESCRIPTOR_SIZE: usize = 32;

/// One 16-byte OHCI DMA descriptor, stored little-endian in the slab.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub control: u32,
    pub data_address: u32,
    pub branch: u32,
    pub status: u32,
}

impl Descriptor {
    pub fn read_from(bytes: &[u8]) -> Descriptor {
        Descriptor {
            control: LittleEndian::read_u32(&bytes[0..4]),
            data_address: LittleEndian::read_u32(&bytes[4..8]),
            branch: LittleEndian::read_u32(&bytes[8..12]),
            status: LittleEndian::read_u32(&bytes[12..16]),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u32(&mut bytes[0..4], self.control);
        LittleEndian::write_u32(&mut bytes[4..8], self.data_address);
        LittleEndian::write_u32(&mut bytes[8..12], self.branch);
        LittleEndian::write_u32(&mut bytes[12..16], self.status);
    }

    pub fn req_count(&self) -> u16 {
        (self.control & 0xFFFF) as u16
    }

    pub fn res_count(&self) -> u16 {
        (self.status & 0xFFFF) as u16
    }

    pub fn xfer_status(&self) -> u16 {
        (self.status >> 16) as u16
    }
}

/// OUTPUT_MORE_IMMEDIATE: descriptor record followed by four immediate-data
/// quadlets occupying the next 16-byte block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImmediateDescriptor {
    pub common: Descriptor,
    pub immediate: [u32; 4],
}

impl ImmediateDescriptor {
    pub fn read_from(bytes: &[u8]) -> ImmediateDescriptor {
        let mut immediate = [0u32; 4];
        for (k, word) in immediate.iter_mut().enumerate() {
            *word = LittleEndian::read_u32(&bytes[16 + k * 4..16 + k * 4 + 4]);
        }
        ImmediateDescriptor {
            common: Descriptor::read_from(bytes),
            immediate,
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        self.common.write_to(bytes);
        for (k, word) in self.immediate.iter().enumerate() {
            LittleEndian::write_u32(&mut bytes[16 + k * 4..16 + k * 4 + 4], *word);
        }
    }
}

pub fn output_more_immediate_control() -> u32 {
    DESC_KEY_IMMEDIATE | 8
}

pub fn output_last_control(int_bits: u8, req_count: u16) -> u32 {
    DESC_CMD_OUTPUT_LAST
        | DESC_STATUS_UPDATE
        | ((int_bits as u32 & 0x3) << 20)
        | DESC_BRANCH_ALWAYS
        | req_count as u32
}

pub fn input_more_control(int_bits: u8, req_count: u16) -> u32 {
    DESC_CMD_INPUT_MORE
        | DESC_STATUS_UPDATE
        | ((int_bits as u32 & 0x3) << 20)
        | DESC_BRANCH_ALWAYS
        | req_count as u32
}

/// Isochronous packet header Q0 as programmed into OUTPUT_MORE_IMMEDIATE:
/// speed in [18:16], tag in [15:14], channel in [13:8], tcode=0xA in [7:4].
pub fn isoch_header_q0(speed: u8, tag: u8, channel: u8, sy: u8) -> u32 {
    ((speed as u32 & 0x7) << 16)
        | ((tag as u32 & 0x3) << 14)
        | ((channel as u32 & 0x3F) << 8)
        | (0xAu32 << 4)
        | (sy as u32 & 0xF)
}

pub fn isoch_header_q1(data_length: u16) -> u32 {
    (data_length as u32) << 16
}

/// A device-visible memory region: host virtual base, bus address, length.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegion {
    pub virt: *mut u8,
    pub iova: u64,
    pub len: usize,
}

unsafe impl Send for DmaRegion {}

impl DmaRegion {
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.virt, self.len) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn bytes_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.virt, self.len) }
    }
}

struct Mapping {
    base: *mut u8,
    len: usize,
    iova: u64,
}

unsafe impl Send for Mapping {}

/// Process-local DMA provider: anonymous shared mappings with synthetic
/// 32-bit bus addresses. Stands in for the IOMMU path on hosts and in tests;
/// the translation table is what a real mapper would keep.
pub struct ProcessDmaMemory {
    mappings: Vec<Mapping>,
    next_iova: u64,
}

impl Default for ProcessDmaMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessDmaMemory {
    pub const PAGE_SIZE: usize = 4096;

    pub fn new() -> Self {
        Self {
            mappings: Vec::new(),
            // Synthetic bus address space starts above the traditional DMA
            // low region and stays within 32 bits.
            next_iova: 0x0010_0000,
        }
    }

    pub fn allocate(&mut self, len: usize) -> io::Result<DmaRegion> {
        let len = len.div_ceil(Self::PAGE_SIZE) * Self::PAGE_SIZE;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let iova = self.next_iova;
        if iova + len as u64 > u32::MAX as u64 {
            unsafe { libc::munmap(base, len) };
            return Err(io::Error::other("synthetic IOVA space exhausted"));
        }
        self.next_iova += len as u64;
        let base = base as *mut u8;
        self.mappings.push(Mapping { base, len, iova });
        Ok(DmaRegion {
            virt: base,
            iova,
            len,
        })
    }

    pub fn translate(&self, iova: u64, len: usize) -> Option<*mut u8> {
        for m in &self.mappings {
            if iova >= m.iova && iova + len as u64 <= m.iova + m.len as u64 {
                let off = (iova - m.iova) as usize;
                return Some(unsafe { m.base.add(off) });
            }
        }
        None
    }
}

impl Drop for ProcessDmaMemory {
    fn drop(&mut self) {
        for m in &self.mappings {
            unsafe {
                libc::munmap(m.base as *mut libc::c_void, m.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ptr_roundtrip() {
        let cp = command_ptr(0xDEAD_BEE0, 3);
        assert_eq!(command_ptr_address(cp), 0xDEAD_BEE0);
        assert_eq!(command_ptr_z(cp), 3);
    }

    #[test]
    fn descriptor_bytes_roundtrip() {
        let d = Descriptor {
            control: output_last_control(DESC_INT_ALWAYS, 72),
            data_address: 0x0040_0000,
            branch: command_ptr(0x0010_0030, 3),
            status: 0,
        };
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        d.write_to(&mut buf);
        assert_eq!(Descriptor::read_from(&buf), d);
        assert_eq!(d.req_count(), 72);
    }

    #[test]
    fn isoch_header_fields() {
        let q0 = isoch_header_q0(2, 1, 0x3D, 0);
        assert_eq!((q0 >> 16) & 0x7, 2);
        assert_eq!((q0 >> 14) & 0x3, 1);
        assert_eq!((q0 >> 8) & 0x3F, 0x3D);
        assert_eq!((q0 >> 4) & 0xF, 0xA);
        assert_eq!(isoch_header_q1(72), 72 << 16);
    }

    #[test]
    fn cycle_timer_fields_roundtrip() {
        let ct = cycle_timer_word(5, 7999, 3071);
        assert_eq!(cycle_timer_seconds(ct), 5);
        assert_eq!(cycle_timer_cycles(ct), 7999);
        assert_eq!(cycle_timer_offset(ct), 3071);
    }

    #[test]
    fn process_dma_memory_translates_its_own_regions() {
        let mut mem = ProcessDmaMemory::new();
        let a = mem.allocate(8192).unwrap();
        let b = mem.allocate(4096).unwrap();
        assert!(a.iova <= u32::MAX as u64 && b.iova <= u32::MAX as u64);
        assert_eq!(a.iova % 4096, 0);
        assert_eq!(mem.translate(a.iova, 8192), Some(a.virt));
        assert_eq!(
            mem.translate(b.iova + 16, 16),
            Some(unsafe { b.virt.add(16) })
        );
        assert_eq!(mem.translate(0xFFFF_0000, 4), None);
    }

    #[test]
    fn ir_match_word_fields() {
        let w = ir_match_word(0x2, 0, 9);
        assert_eq!(w >> 28, 0x2);
        assert_eq!(w & 0x3F, 9);
    }
}
