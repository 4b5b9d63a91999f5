use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use isofire_ohci::{self as ohci, Descriptor, ImmediateDescriptor};
use tracing::debug;

use crate::encoding::AssembledPacket;
use crate::hw::{DmaMemory, OhciRegisters};
use crate::tx::layout;
use crate::tx::slab::DescriptorSlab;

/// Supplies the cadence-correct silent packet for the next transmit cycle.
pub trait PacketProvider {
    fn next_silent_packet(&mut self, transmit_cycle: u32) -> AssembledPacket;
}

/// Writes real audio into slots just ahead of the hardware cursor.
pub trait AudioInjector {
    fn inject_near_hw(&mut self, hw_packet_index: u32, slab: &DescriptorSlab);
}

/// Observes each slot just before the refill loop overwrites it.
pub trait CaptureHook {
    fn capture_before_overwrite(
        &self,
        packet_index: u32,
        hw_packet_index: u32,
        cmd_ptr: u32,
        last_desc: &Descriptor,
        payload: &[u8],
    );
}

#[derive(Debug, Default)]
pub struct RingCounters {
    pub calls: AtomicU64,
    pub exit_dead: AtomicU64,
    pub exit_decode_fail: AtomicU64,
    pub exit_hw_oob: AtomicU64,
    pub refills: AtomicU64,
    pub packets_refilled: AtomicU64,
    pub fatal_packet_size: AtomicU64,
    pub last_dma_gap_packets: AtomicU32,
    pub min_dma_gap_packets: AtomicU32,
    pub critical_gap_events: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PrimeStats {
    pub packets_assembled: u64,
    pub data_packets: u64,
    pub no_data_packets: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RefillOutcome {
    pub ok: bool,
    pub dead: bool,
    pub decode_failed: bool,
    pub hw_oob: bool,
    pub hw_packet_index: u32,
    pub cmd_ptr: u32,
    pub hw_timestamp: u16,
    pub packets_filled: u64,
    pub data_packets: u64,
    pub no_data_packets: u64,
}

/// Low-level OHCI IT ring engine: owns the descriptor slab, keeps it filled
/// with provider packets, decodes the hardware cursor from CommandPtr, and
/// re-arms the context when it idles. No audio semantics live here.
pub struct TxDmaRing {
    channel: u8,
    slab: Option<DescriptorSlab>,

    software_fill_index: u32,
    last_hw_packet_index: u32,
    ring_packets_ahead: u32,

    next_transmit_cycle: u32,
    cycle_tracking_valid: bool,
    last_hw_timestamp: u16,

    counters: RingCounters,
}

impl TxDmaRing {
    pub fn new() -> TxDmaRing {
        TxDmaRing {
            channel: 0,
            slab: None,
            software_fill_index: 0,
            last_hw_packet_index: 0,
            ring_packets_ahead: 0,
            next_transmit_cycle: 0,
            cycle_tracking_valid: false,
            last_hw_timestamp: 0,
            counters: RingCounters::default(),
        }
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    pub fn has_rings(&self) -> bool {
        self.slab.is_some()
    }

    pub fn slab(&self) -> &DescriptorSlab {
        self.slab.as_ref().expect("rings not set up")
    }

    pub fn counters(&self) -> &RingCounters {
        &self.counters
    }

    pub fn last_hw_timestamp(&self) -> u16 {
        self.last_hw_timestamp
    }

    pub fn next_transmit_cycle(&self) -> u32 {
        self.next_transmit_cycle
    }

    pub fn setup_rings(&mut self, dma: &mut dyn DmaMemory) -> crate::error::Result<()> {
        if self.slab.is_none() {
            self.slab = Some(DescriptorSlab::allocate(dma)?);
        }
        Ok(())
    }

    pub fn reset_for_start(&mut self) {
        self.software_fill_index = 0;
        self.last_hw_packet_index = 0;
        self.ring_packets_ahead = 0;
        self.next_transmit_cycle = 0;
        self.cycle_tracking_valid = false;
        self.last_hw_timestamp = 0;
        self.counters
            .last_dma_gap_packets
            .store(layout::NUM_PACKETS, Ordering::Relaxed);
        self.counters
            .min_dma_gap_packets
            .store(layout::NUM_PACKETS, Ordering::Relaxed);
    }

    /// Anchor cycle tracking a little ahead of the bus clock.
    pub fn seed_cycle_tracking(&mut self, regs: &dyn OhciRegisters) {
        let ct = regs.read_cycle_timer();
        let current = ohci::cycle_timer_cycles(ct);
        self.next_transmit_cycle = (current + 4) % 8000;
        self.cycle_tracking_valid = true;
        self.last_hw_timestamp = 0;
        debug!(
            "it: cycle tracking seeded current={} next_tx={}",
            current, self.next_transmit_cycle
        );
    }

    fn write_packet_payload(slab: &DescriptorSlab, packet_index: u32, pkt: &AssembledPacket) {
        let payload = slab.payload_bytes(packet_index);
        payload[..pkt.size as usize].copy_from_slice(&pkt.data[..pkt.size as usize]);
    }

    /// Fill every slot with a provider packet and close the branch ring.
    pub fn prime(&mut self, dma: &dyn DmaMemory, provider: &mut dyn PacketProvider) -> PrimeStats {
        let slab = self.slab.as_ref().expect("rings not set up");
        let mut stats = PrimeStats::default();

        slab.validate_layout();

        for pkt_idx in 0..layout::NUM_PACKETS {
            let pkt = provider.next_silent_packet(self.next_transmit_cycle);
            self.next_transmit_cycle = (self.next_transmit_cycle + 1) % 8000;

            if pkt.size > layout::MAX_PACKET_SIZE {
                self.counters.fatal_packet_size.fetch_add(1, Ordering::Relaxed);
                return stats;
            }

            let desc_base = pkt_idx * layout::BLOCKS_PER_PACKET;
            let next_base = ((pkt_idx + 1) % layout::NUM_PACKETS) * layout::BLOCKS_PER_PACKET;
            let branch = ohci::command_ptr(
                slab.descriptor_iova(next_base),
                layout::BLOCKS_PER_PACKET as u8,
            );

            Self::write_packet_payload(slab, pkt_idx, &pkt);

            let imm = ImmediateDescriptor {
                common: Descriptor {
                    control: ohci::output_more_immediate_control(),
                    data_address: 0,
                    branch,
                    status: 0,
                },
                immediate: [
                    ohci::isoch_header_q0(2, 1, self.channel, 0),
                    ohci::isoch_header_q1(pkt.size as u16),
                    0,
                    0,
                ],
            };
            slab.write_immediate(desc_base, &imm);

            let int_bits = if pkt_idx % 8 == 7 {
                ohci::DESC_INT_ALWAYS
            } else {
                ohci::DESC_INT_NEVER
            };
            let last = Descriptor {
                control: ohci::output_last_control(int_bits, pkt.size as u16),
                data_address: slab.payload_iova(pkt_idx),
                branch,
                status: 0,
            };
            slab.write_descriptor(desc_base + 2, &last);

            stats.packets_assembled += 1;
            if pkt.is_data {
                stats.data_packets += 1;
            } else {
                stats.no_data_packets += 1;
            }
        }

        self.software_fill_index = 0;
        self.ring_packets_ahead = layout::NUM_PACKETS;
        self.last_hw_packet_index = 0;

        fence(Ordering::Release);
        dma.publish_barrier();

        stats
    }

    /// One refill pass: decode the hardware cursor, account consumption,
    /// resync the transmit cycle from the completion timestamp, top the ring
    /// back up, then hand the hot window to the injector.
    pub fn refill<P>(
        &mut self,
        regs: &dyn OhciRegisters,
        dma: &dyn DmaMemory,
        context_index: u8,
        pipeline: &mut P,
        capture: Option<&dyn CaptureHook>,
    ) -> RefillOutcome
    where
        P: PacketProvider + AudioInjector,
    {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        let mut out = RefillOutcome::default();

        let ctrl = regs.read(ohci::it_context_control_set(context_index));
        if ctrl & ohci::CONTEXT_DEAD != 0 {
            self.counters.exit_dead.fetch_add(1, Ordering::Relaxed);
            out.dead = true;
            return out;
        }

        let cmd_ptr = regs.read(ohci::it_command_ptr(context_index));
        let cmd_addr = ohci::command_ptr_address(cmd_ptr);
        out.cmd_ptr = cmd_ptr;

        let slab = self.slab.as_ref().expect("rings not set up");
        let Some(hw_logical) = slab.decode_cmd_addr(cmd_addr) else {
            self.counters.exit_decode_fail.fetch_add(1, Ordering::Relaxed);
            out.decode_failed = true;
            return out;
        };
        let hw_packet_index = hw_logical / layout::BLOCKS_PER_PACKET;
        if hw_packet_index >= layout::NUM_PACKETS {
            self.counters.exit_hw_oob.fetch_add(1, Ordering::Relaxed);
            out.hw_oob = true;
            return out;
        }
        out.hw_packet_index = hw_packet_index;

        let consumed = (hw_packet_index + layout::NUM_PACKETS - self.last_hw_packet_index)
            % layout::NUM_PACKETS;
        self.last_hw_packet_index = hw_packet_index;
        self.ring_packets_ahead = self.ring_packets_ahead.wrapping_sub(consumed);
        if self.ring_packets_ahead > layout::NUM_PACKETS {
            self.ring_packets_ahead = 0;
        }

        let gap = self.ring_packets_ahead;
        self.counters.last_dma_gap_packets.store(gap, Ordering::Relaxed);
        let mut prev_min = self.counters.min_dma_gap_packets.load(Ordering::Relaxed);
        while gap < prev_min {
            match self.counters.min_dma_gap_packets.compare_exchange_weak(
                prev_min,
                gap,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => prev_min = v,
            }
        }
        if gap < layout::NUM_PACKETS / 5 {
            self.counters.critical_gap_events.fetch_add(1, Ordering::Relaxed);
        }

        // Cycle resync: the last completed OUTPUT_LAST carries the hardware
        // cycle timestamp of its transmission.
        if consumed > 0 && self.cycle_tracking_valid {
            dma.fetch_barrier();
            let last_processed =
                (hw_packet_index + layout::NUM_PACKETS - 1) % layout::NUM_PACKETS;
            let ol = slab.read_descriptor(last_processed * layout::BLOCKS_PER_PACKET + 2);
            if ol.status != 0 {
                let hw_timestamp = (ol.status & 0xFFFF) as u16;
                let hw_cycle = (hw_timestamp as u32) & 0x1FFF;
                self.last_hw_timestamp = hw_timestamp;
                out.hw_timestamp = hw_timestamp;

                let ahead = (self.software_fill_index + layout::NUM_PACKETS - last_processed)
                    % layout::NUM_PACKETS;
                self.next_transmit_cycle = (hw_cycle + ahead) % 8000;
            }
        }

        let to_fill = layout::MAX_WRITE_AHEAD.saturating_sub(self.ring_packets_ahead);
        if to_fill > 0 {
            self.counters.refills.fetch_add(1, Ordering::Relaxed);

            for i in 0..to_fill {
                let pkt_idx = (self.software_fill_index + i) % layout::NUM_PACKETS;
                let desc_base = pkt_idx * layout::BLOCKS_PER_PACKET;

                if let Some(hook) = capture {
                    let existing = slab.read_descriptor(desc_base + 2);
                    let payload = slab.payload_bytes(pkt_idx);
                    hook.capture_before_overwrite(
                        pkt_idx,
                        hw_packet_index,
                        cmd_ptr,
                        &existing,
                        payload,
                    );
                }

                let pkt = pipeline.next_silent_packet(self.next_transmit_cycle);
                self.next_transmit_cycle = (self.next_transmit_cycle + 1) % 8000;

                if pkt.size > layout::MAX_PACKET_SIZE {
                    self.counters.fatal_packet_size.fetch_add(1, Ordering::Relaxed);
                    return out;
                }

                Self::write_packet_payload(slab, pkt_idx, &pkt);

                let mut last = slab.read_descriptor(desc_base + 2);
                last.control = (last.control & 0xFFFF_0000) | pkt.size;
                last.data_address = slab.payload_iova(pkt_idx);
                last.status = 0;
                slab.write_descriptor(desc_base + 2, &last);

                let mut imm = slab.read_immediate(desc_base);
                imm.immediate[1] = ohci::isoch_header_q1(pkt.size as u16);
                slab.write_immediate(desc_base, &imm);

                out.packets_filled += 1;
                if pkt.is_data {
                    out.data_packets += 1;
                } else {
                    out.no_data_packets += 1;
                }
            }

            self.software_fill_index =
                (self.software_fill_index + to_fill) % layout::NUM_PACKETS;
            self.ring_packets_ahead += to_fill;

            fence(Ordering::Release);
            dma.publish_barrier();

            self.counters
                .packets_refilled
                .fetch_add(to_fill as u64, Ordering::Relaxed);
        }

        pipeline.inject_near_hw(hw_packet_index, slab);

        out.ok = true;
        out
    }

    pub fn wake_if_idle(&self, regs: &dyn OhciRegisters, context_index: u8) {
        let ctrl = regs.read(ohci::it_context_control_set(context_index));
        let run = ctrl & ohci::CONTEXT_RUN != 0;
        let dead = ctrl & ohci::CONTEXT_DEAD != 0;
        let active = ctrl & ohci::CONTEXT_ACTIVE != 0;
        if run && !dead && !active {
            regs.write(ohci::it_context_control_set(context_index), ohci::CONTEXT_WAKE);
        }
    }
}

impl Default for TxDmaRing {
    fn default() -> Self {
        Self::new()
    }
}
