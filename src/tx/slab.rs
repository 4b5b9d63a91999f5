use isofire_ohci::{Descriptor, DmaRegion, ImmediateDescriptor};
use tracing::{debug, error};

use crate::error::IsochError;
use crate::hw::DmaMemory;
use crate::tx::layout;

/// Owns the dedicated IT descriptor and payload DMA regions and provides
/// page-gap safe descriptor addressing.
pub struct DescriptorSlab {
    desc: DmaRegion,
    payload: DmaRegion,
}

impl DescriptorSlab {
    pub fn allocate(dma: &mut dyn DmaMemory) -> Result<DescriptorSlab, IsochError> {
        let desc = dma
            .allocate_descriptor_region(layout::DESCRIPTOR_RING_BYTES)
            .map_err(|_| IsochError::NoResources)?;
        let payload = dma
            .allocate_payload_region(layout::PAYLOAD_BYTES)
            .map_err(|_| IsochError::NoResources)?;

        if desc.iova > u32::MAX as u64 || payload.iova > u32::MAX as u64 {
            error!(
                "it: slab IOVA out of 32-bit range desc={:#x} payload={:#x}",
                desc.iova, payload.iova
            );
            return Err(IsochError::NoResources);
        }
        if desc.iova & 0xF != 0 {
            error!("it: descriptor base not 16-byte aligned {:#x}", desc.iova);
            return Err(IsochError::NoResources);
        }
        // The page-gap math assumes the slab starts on a page boundary.
        if desc.iova & (layout::OHCI_PAGE_SIZE as u64 - 1) != 0 {
            error!("it: descriptor base not 4 KiB aligned {:#x}", desc.iova);
            return Err(IsochError::NoResources);
        }

        desc.bytes_mut().fill(0);

        debug!(
            "it: rings ready desc_iova={:#x} payload_iova={:#x} packets={} blocks={} pages={}",
            desc.iova,
            payload.iova,
            layout::NUM_PACKETS,
            layout::RING_BLOCKS,
            layout::TOTAL_PAGES
        );
        Ok(DescriptorSlab { desc, payload })
    }

    fn descriptor_offset(logical_index: u32) -> usize {
        let page = logical_index / layout::DESCRIPTORS_PER_PAGE;
        let in_page = (logical_index % layout::DESCRIPTORS_PER_PAGE) * layout::DESCRIPTOR_STRIDE;
        page as usize * layout::OHCI_PAGE_SIZE + in_page as usize
    }

    pub fn read_descriptor(&self, logical_index: u32) -> Descriptor {
        let off = Self::descriptor_offset(logical_index);
        Descriptor::read_from(&self.desc.bytes()[off..off + 16])
    }

    pub fn write_descriptor(&self, logical_index: u32, d: &Descriptor) {
        let off = Self::descriptor_offset(logical_index);
        d.write_to(&mut self.desc.bytes_mut()[off..off + 16]);
    }

    pub fn read_immediate(&self, logical_index: u32) -> ImmediateDescriptor {
        let off = Self::descriptor_offset(logical_index);
        ImmediateDescriptor::read_from(&self.desc.bytes()[off..off + 32])
    }

    pub fn write_immediate(&self, logical_index: u32, d: &ImmediateDescriptor) {
        let off = Self::descriptor_offset(logical_index);
        d.write_to(&mut self.desc.bytes_mut()[off..off + 32]);
    }

    pub fn descriptor_iova(&self, logical_index: u32) -> u32 {
        self.desc.iova as u32 + Self::descriptor_offset(logical_index) as u32
    }

    pub fn descriptor_base_iova(&self) -> u32 {
        self.desc.iova as u32
    }

    /// Inverse of `descriptor_iova`: rejects addresses below the slab, in
    /// the page padding, misaligned, or past the ring.
    pub fn decode_cmd_addr(&self, cmd_addr: u32) -> Option<u32> {
        let base = self.desc.iova as u32;
        if cmd_addr < base || cmd_addr & 0xF != 0 {
            return None;
        }
        let offset = cmd_addr - base;
        let page = offset / layout::OHCI_PAGE_SIZE as u32;
        let in_page = offset % layout::OHCI_PAGE_SIZE as u32;
        if page >= layout::TOTAL_PAGES {
            return None;
        }
        let usable = layout::DESCRIPTORS_PER_PAGE * layout::DESCRIPTOR_STRIDE;
        if in_page >= usable || in_page % layout::DESCRIPTOR_STRIDE != 0 {
            return None;
        }
        let logical = page * layout::DESCRIPTORS_PER_PAGE + in_page / layout::DESCRIPTOR_STRIDE;
        if logical >= layout::RING_BLOCKS {
            return None;
        }
        Some(logical)
    }

    pub fn payload_bytes(&self, packet_index: u32) -> &mut [u8] {
        let off = (packet_index * layout::MAX_PACKET_SIZE) as usize;
        &mut self.payload.bytes_mut()[off..off + layout::MAX_PACKET_SIZE as usize]
    }

    pub fn payload_iova(&self, packet_index: u32) -> u32 {
        self.payload.iova as u32 + packet_index * layout::MAX_PACKET_SIZE
    }

    pub fn debug_fill(&self, pattern: u8) {
        self.desc.bytes_mut().fill(pattern);
    }

    /// Layout self-check: no descriptor in the prefetch zone, every packet's
    /// three blocks on one page. Returns false if anything is off.
    pub fn validate_layout(&self) -> bool {
        let mut ok = true;
        for i in 0..layout::RING_BLOCKS {
            let iova = self.descriptor_iova(i);
            let page_off = iova as usize & (layout::OHCI_PAGE_SIZE - 1);
            if page_off >= layout::USABLE_PER_PAGE {
                error!("it: descriptor {i} iova={iova:#x} lands in prefetch zone");
                ok = false;
            }
        }
        for pkt in 0..layout::NUM_PACKETS {
            let base = pkt * layout::BLOCKS_PER_PACKET;
            let page0 = self.descriptor_iova(base) / layout::OHCI_PAGE_SIZE as u32;
            let page2 = self.descriptor_iova(base + 2) / layout::OHCI_PAGE_SIZE as u32;
            if page0 != page2 {
                error!("it: packet {pkt} spans pages {page0}..{page2}");
                ok = false;
            }
        }
        ok
    }
}
