use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use isofire_ohci::{self as ohci, Descriptor, DmaRegion, ProcessDmaMemory};

use crate::hw::traits::{DmaMemory, OhciRegisters};
use crate::timing::TICKS_PER_CYCLE;

/// `ProcessDmaMemory` shared between the engines (allocation) and the sim
/// controller (IOVA translation while walking descriptor programs).
#[derive(Clone)]
pub struct SharedDmaMemory(pub Arc<Mutex<ProcessDmaMemory>>);

impl SharedDmaMemory {
    pub fn new() -> SharedDmaMemory {
        SharedDmaMemory(Arc::new(Mutex::new(ProcessDmaMemory::new())))
    }

    fn translate(&self, iova: u64, len: usize) -> Option<*mut u8> {
        self.0.lock().expect("dma memory poisoned").translate(iova, len)
    }
}

impl Default for SharedDmaMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaMemory for SharedDmaMemory {
    fn allocate_descriptor_region(&mut self, bytes: usize) -> io::Result<DmaRegion> {
        self.0.lock().expect("dma memory poisoned").allocate(bytes)
    }

    fn allocate_payload_region(&mut self, bytes: usize) -> io::Result<DmaRegion> {
        self.0.lock().expect("dma memory poisoned").allocate(bytes)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SimContext {
    control: u32,
    command_ptr: u32,
    match_word: u32,
}

struct SimState {
    registers: HashMap<u32, u32>,
    it: [SimContext; 4],
    ir: [SimContext; 4],
    cycle_count: u64,
    wake_writes: u64,
    it_packets_consumed: u64,
}

/// Deterministic in-process OHCI controller. Register writes follow the
/// set/clear semantics of the real part; `consume_it_packets` and
/// `deliver_ir_packet` advance the DMA engines by walking the descriptor
/// programs through the shared translation table, stamping completion
/// status exactly where hardware would.
pub struct SimOhci {
    state: Mutex<SimState>,
    memory: SharedDmaMemory,
}

impl SimOhci {
    pub fn new(memory: SharedDmaMemory) -> SimOhci {
        SimOhci {
            state: Mutex::new(SimState {
                registers: HashMap::new(),
                it: [SimContext::default(); 4],
                ir: [SimContext::default(); 4],
                cycle_count: 0,
                wake_writes: 0,
                it_packets_consumed: 0,
            }),
            memory,
        }
    }

    pub fn wake_writes(&self) -> u64 {
        self.state.lock().expect("sim state poisoned").wake_writes
    }

    pub fn it_packets_consumed(&self) -> u64 {
        self.state.lock().expect("sim state poisoned").it_packets_consumed
    }

    pub fn current_cycle(&self) -> u32 {
        (self.state.lock().expect("sim state poisoned").cycle_count % 8000) as u32
    }

    pub fn advance_cycles(&self, cycles: u32) {
        self.state.lock().expect("sim state poisoned").cycle_count += cycles as u64;
    }

    pub fn mark_it_dead(&self, index: usize) {
        let mut st = self.state.lock().expect("sim state poisoned");
        st.it[index].control |= ohci::CONTEXT_DEAD;
        st.it[index].control &= !ohci::CONTEXT_ACTIVE;
    }

    fn read_descriptor(&self, iova: u32) -> Option<Descriptor> {
        let ptr = self.memory.translate(iova as u64, ohci::DESCRIPTOR_SIZE)?;
        let bytes = unsafe { std::slice::from_raw_parts(ptr, ohci::DESCRIPTOR_SIZE) };
        Some(Descriptor::read_from(bytes))
    }

    fn write_descriptor(&self, iova: u32, desc: &Descriptor) -> bool {
        match self.memory.translate(iova as u64, ohci::DESCRIPTOR_SIZE) {
            Some(ptr) => {
                let bytes =
                    unsafe { std::slice::from_raw_parts_mut(ptr, ohci::DESCRIPTOR_SIZE) };
                desc.write_to(bytes);
                true
            }
            None => false,
        }
    }

    /// IT completion timestamp stored in the OUTPUT_LAST status word:
    /// 3 seconds bits + 13 cycle bits, with a nonzero transfer status above.
    fn it_status_word(cycle_count: u64) -> u32 {
        let seconds = ((cycle_count / 8000) & 0x7) as u32;
        let cycle = (cycle_count % 8000) as u32;
        let timestamp = (seconds << 13) | cycle;
        (0x0011 << 16) | timestamp
    }

    /// Consume `packets` from the IT context: each consumed packet stamps
    /// its OUTPUT_LAST status and follows the branch. A zero branch parks
    /// the context (Active clears), like hardware hitting Z=0.
    pub fn consume_it_packets(&self, index: usize, packets: u32) {
        let mut st = self.state.lock().expect("sim state poisoned");
        if st.it[index].control & ohci::CONTEXT_RUN == 0
            || st.it[index].control & ohci::CONTEXT_DEAD != 0
        {
            return;
        }

        for _ in 0..packets {
            if st.it[index].control & ohci::CONTEXT_ACTIVE == 0 {
                break;
            }
            let cmd = st.it[index].command_ptr;
            let addr = ohci::command_ptr_address(cmd);
            let z = ohci::command_ptr_z(cmd);
            if z == 0 {
                st.it[index].control &= !ohci::CONTEXT_ACTIVE;
                break;
            }

            // Packet = OUTPUT_MORE_IMMEDIATE (2 blocks) + OUTPUT_LAST.
            let last_iova = addr + 2 * ohci::DESCRIPTOR_SIZE as u32;
            let Some(mut last) = self.read_descriptor(last_iova) else {
                st.it[index].control |= ohci::CONTEXT_DEAD;
                break;
            };

            st.cycle_count += 1;
            last.status = Self::it_status_word(st.cycle_count);
            self.write_descriptor(last_iova, &last);

            st.it_packets_consumed += 1;
            st.it[index].command_ptr = last.branch;
            if ohci::command_ptr_z(last.branch) == 0 {
                st.it[index].control &= !ohci::CONTEXT_ACTIVE;
            }
        }
    }

    /// Deliver one received packet into the IR context's current buffer.
    /// The payload must already carry the 8-byte receive prefix.
    pub fn deliver_ir_packet(&self, index: usize, packet: &[u8]) -> bool {
        let mut st = self.state.lock().expect("sim state poisoned");
        if st.ir[index].control & ohci::CONTEXT_RUN == 0 {
            return false;
        }
        let cmd = st.ir[index].command_ptr;
        let addr = ohci::command_ptr_address(cmd);
        if ohci::command_ptr_z(cmd) == 0 {
            st.ir[index].control &= !ohci::CONTEXT_ACTIVE;
            return false;
        }
        let Some(mut desc) = self.read_descriptor(addr) else {
            return false;
        };
        let req = desc.req_count() as usize;
        if desc.status != 0 || packet.len() > req {
            // Slot not yet recycled by software, or oversized packet.
            return false;
        }
        let Some(buf) = self.memory.translate(desc.data_address as u64, req) else {
            return false;
        };
        unsafe {
            std::ptr::copy_nonoverlapping(packet.as_ptr(), buf, packet.len());
        }
        st.cycle_count += 1;
        desc.status = (0x0011 << 16) | (req - packet.len()) as u32;
        self.write_descriptor(addr, &desc);
        st.ir[index].command_ptr = desc.branch;
        true
    }

    fn apply_set(context: &mut SimContext, value: u32) {
        context.control |= value;
        if value & ohci::CONTEXT_WAKE != 0 {
            // Wake re-arms a parked engine; the bit itself does not stick.
            context.control &= !ohci::CONTEXT_WAKE;
            if context.control & ohci::CONTEXT_RUN != 0
                && context.control & ohci::CONTEXT_DEAD == 0
            {
                context.control |= ohci::CONTEXT_ACTIVE;
            }
        }
        if value & ohci::CONTEXT_RUN != 0 && context.control & ohci::CONTEXT_DEAD == 0 {
            context.control |= ohci::CONTEXT_ACTIVE;
        }
    }

    fn apply_clear(context: &mut SimContext, value: u32) {
        context.control &= !value;
        if value & ohci::CONTEXT_RUN != 0 {
            // Clearing Run parks the engine and clears a Dead fault.
            context.control &= !(ohci::CONTEXT_ACTIVE | ohci::CONTEXT_DEAD);
        }
    }
}

impl OhciRegisters for SimOhci {
    fn read(&self, offset: u32) -> u32 {
        let st = self.state.lock().expect("sim state poisoned");
        if offset == ohci::ISOCHRONOUS_CYCLE_TIMER {
            let seconds = (st.cycle_count / 8000) as u32 & 0x7F;
            let cycles = (st.cycle_count % 8000) as u32;
            return ohci::cycle_timer_word(seconds, cycles, TICKS_PER_CYCLE / 2);
        }
        for i in 0..4u8 {
            if offset == ohci::it_context_control_set(i)
                || offset == ohci::it_context_control_clear(i)
            {
                return st.it[i as usize].control;
            }
            if offset == ohci::it_command_ptr(i) {
                return st.it[i as usize].command_ptr;
            }
            if offset == ohci::ir_context_control_set(i)
                || offset == ohci::ir_context_control_clear(i)
            {
                return st.ir[i as usize].control;
            }
            if offset == ohci::ir_command_ptr(i) {
                return st.ir[i as usize].command_ptr;
            }
            if offset == ohci::ir_context_match(i) {
                return st.ir[i as usize].match_word;
            }
        }
        st.registers.get(&offset).copied().unwrap_or(0)
    }

    fn write(&self, offset: u32, value: u32) {
        let mut st = self.state.lock().expect("sim state poisoned");
        for i in 0..4u8 {
            let idx = i as usize;
            if offset == ohci::it_context_control_set(i) {
                if value & ohci::CONTEXT_WAKE != 0 {
                    st.wake_writes += 1;
                }
                Self::apply_set(&mut st.it[idx], value);
                return;
            }
            if offset == ohci::it_context_control_clear(i) {
                Self::apply_clear(&mut st.it[idx], value);
                return;
            }
            if offset == ohci::it_command_ptr(i) {
                st.it[idx].command_ptr = value;
                return;
            }
            if offset == ohci::ir_context_control_set(i) {
                if value & ohci::CONTEXT_WAKE != 0 {
                    st.wake_writes += 1;
                }
                Self::apply_set(&mut st.ir[idx], value);
                return;
            }
            if offset == ohci::ir_context_control_clear(i) {
                Self::apply_clear(&mut st.ir[idx], value);
                return;
            }
            if offset == ohci::ir_command_ptr(i) {
                st.ir[idx].command_ptr = value;
                return;
            }
            if offset == ohci::ir_context_match(i) {
                st.ir[idx].match_word = value;
                return;
            }
        }
        st.registers.insert(offset, value);
    }
}
