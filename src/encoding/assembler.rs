use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::config::{AUDIO_RING_FRAMES, MAX_AM824_SLOTS, StreamMode};
use crate::encoding::am824;
use crate::encoding::cadence::{BLOCKING_FRAMES_PER_PACKET, Cadence};
use crate::encoding::cip::{CIP_HEADER_BYTES, CipBuilder};
use crate::encoding::dbc::DbcGenerator;
use crate::encoding::ring::AudioRing;

pub const MAX_FRAMES_PER_PACKET: u32 = BLOCKING_FRAMES_PER_PACKET;
pub const MAX_PACKET_BYTES: usize =
    CIP_HEADER_BYTES as usize + (MAX_FRAMES_PER_PACKET * MAX_AM824_SLOTS * 4) as usize;

/// Snapshot of the most recent short read, stores are RT-safe, read from the
/// non-RT poll path for logging.
#[derive(Debug, Default)]
pub struct UnderrunDiag {
    pub underrun_count: AtomicU64,
    pub last_fill_level: AtomicU32,
    pub last_requested_frames: AtomicU32,
    pub last_available_frames: AtomicU32,
    pub last_cycle_number: AtomicU64,
    pub last_dbc: AtomicU8,
}

impl UnderrunDiag {
    pub fn record(&self, fill: u32, requested: u32, available: u32, cycle: u64, dbc: u8) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
        self.last_fill_level.store(fill, Ordering::Relaxed);
        self.last_requested_frames.store(requested, Ordering::Relaxed);
        self.last_available_frames.store(available, Ordering::Relaxed);
        self.last_cycle_number.store(cycle, Ordering::Relaxed);
        self.last_dbc.store(dbc, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.underrun_count.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssembledPacket {
    pub data: [u8; MAX_PACKET_BYTES],
    pub size: u32,
    pub is_data: bool,
    pub dbc: u8,
    pub cycle_number: u64,
}

impl Default for AssembledPacket {
    fn default() -> Self {
        AssembledPacket {
            data: [0u8; MAX_PACKET_BYTES],
            size: 0,
            is_data: false,
            dbc: 0,
            cycle_number: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ZeroCopySource {
    base: *const i32,
    capacity_frames: u32,
    read_pos: u32,
}

unsafe impl Send for ZeroCopySource {}

/// Assembles complete isochronous packets: cadence decides DATA/NO-DATA,
/// the DBC generator stamps continuity, the CIP builder frames the header,
/// audio comes from the SPSC ring or the zero-copy window.
pub struct PacketAssembler {
    pcm_channels: u32,
    am824_slots: u32,
    cadence: Cadence,
    dbc_gen: DbcGenerator,
    cip: CipBuilder,
    ring: AudioRing,
    zero_copy: Option<ZeroCopySource>,
    underrun_diag: UnderrunDiag,
    dbg_data_packets: AtomicU64,
    dbg_underrun_packets: AtomicU64,
}

impl PacketAssembler {
    pub fn new(pcm_channels: u32, sid: u8) -> PacketAssembler {
        PacketAssembler {
            pcm_channels,
            am824_slots: pcm_channels,
            cadence: Cadence::new(StreamMode::Blocking),
            dbc_gen: DbcGenerator::default(),
            cip: CipBuilder::new(sid, pcm_channels as u8),
            ring: AudioRing::new(AUDIO_RING_FRAMES, pcm_channels),
            zero_copy: None,
            underrun_diag: UnderrunDiag::default(),
            dbg_data_packets: AtomicU64::new(0),
            dbg_underrun_packets: AtomicU64::new(0),
        }
    }

    pub fn pcm_channels(&self) -> u32 {
        self.pcm_channels
    }

    pub fn am824_slots(&self) -> u32 {
        self.am824_slots
    }

    pub fn stream_mode(&self) -> StreamMode {
        self.cadence.mode()
    }

    pub fn set_stream_mode(&mut self, mode: StreamMode) {
        self.cadence.set_mode(mode);
    }

    pub fn frames_per_data_packet(&self) -> u32 {
        self.cadence.frames_per_data_packet()
    }

    pub fn data_packet_size(&self) -> u32 {
        CIP_HEADER_BYTES + self.frames_per_data_packet() * self.am824_slots * 4
    }

    pub fn ring(&self) -> &AudioRing {
        &self.ring
    }

    pub fn buffer_fill_level(&self) -> u32 {
        self.ring.fill_level()
    }

    pub fn underrun_count(&self) -> u64 {
        self.ring.underrun_count()
    }

    pub fn underrun_diag(&self) -> &UnderrunDiag {
        &self.underrun_diag
    }

    pub fn next_is_data(&self) -> bool {
        self.cadence.next_is_data()
    }

    pub fn current_cycle(&self) -> u64 {
        self.cadence.total_cycles()
    }

    /// Full reconfiguration: channel geometry, SID, ring and cursors.
    pub fn reconfigure(&mut self, pcm_channels: u32, am824_slots: u32, sid: u8) {
        self.pcm_channels = pcm_channels;
        self.am824_slots = am824_slots;
        self.cip = CipBuilder::new(sid, am824_slots as u8);
        self.ring = AudioRing::new(AUDIO_RING_FRAMES, pcm_channels);
        self.cadence.reset();
        self.dbc_gen.reset(0);
        self.zero_copy = None;
        self.dbg_data_packets.store(0, Ordering::Relaxed);
        self.dbg_underrun_packets.store(0, Ordering::Relaxed);
        self.underrun_diag.reset();
    }

    pub fn reset(&mut self) {
        self.reset_with_dbc(0);
    }

    pub fn reset_with_dbc(&mut self, initial_dbc: u8) {
        self.cadence.reset();
        self.dbc_gen.reset(initial_dbc);
        self.ring.reset();
        if let Some(zc) = self.zero_copy.as_mut() {
            zc.read_pos = 0;
        }
    }

    pub fn set_zero_copy_source(&mut self, base: *const i32, capacity_frames: u32) {
        if base.is_null() || capacity_frames == 0 {
            self.zero_copy = None;
        } else {
            self.zero_copy = Some(ZeroCopySource {
                base,
                capacity_frames,
                read_pos: 0,
            });
        }
    }

    pub fn zero_copy_enabled(&self) -> bool {
        self.zero_copy.is_some()
    }

    pub fn zero_copy_read_position(&self) -> u32 {
        self.zero_copy.map(|z| z.read_pos).unwrap_or(0)
    }

    pub fn set_zero_copy_read_position(&mut self, frame_pos: u32) {
        if let Some(zc) = self.zero_copy.as_mut() {
            zc.read_pos = frame_pos % zc.capacity_frames;
        }
    }

    pub fn record_underrun(&self, fill: u32, requested: u32, available: u32, cycle: u64, dbc: u8) {
        self.underrun_diag.record(fill, requested, available, cycle, dbc);
    }

    pub fn snapshot_debug(&self) -> (u64, u64) {
        (
            self.dbg_data_packets.swap(0, Ordering::Relaxed),
            self.dbg_underrun_packets.swap(0, Ordering::Relaxed),
        )
    }

    /// Assemble the packet for the current cycle and advance the cadence.
    /// With `silent` the payload is valid AM824 silence and no audio source
    /// is consumed; real audio is injected near the hardware cursor later.
    pub fn assemble_next(&mut self, syt: u16, silent: bool) -> AssembledPacket {
        let mut packet = AssembledPacket {
            cycle_number: self.cadence.total_cycles(),
            is_data: self.cadence.next_is_data(),
            ..Default::default()
        };
        let frames = self.frames_per_data_packet();
        packet.dbc = self.dbc_gen.dbc(packet.is_data, frames as u8);

        if packet.is_data {
            if silent {
                self.fill_data_silent(&mut packet, syt);
            } else {
                self.fill_data(&mut packet, syt, frames);
            }
        } else {
            packet.size = CIP_HEADER_BYTES;
            let (q0, q1) = self.cip.build_no_data(packet.dbc);
            CipBuilder::write(&mut packet.data, q0, q1);
        }

        self.cadence.advance();
        packet
    }

    fn fill_data_silent(&mut self, packet: &mut AssembledPacket, syt: u16) {
        let frames = self.frames_per_data_packet();
        packet.size = self.data_packet_size();
        let (q0, q1) = self.cip.build(packet.dbc, syt, false);
        CipBuilder::write(&mut packet.data, q0, q1);

        // Silence must still be valid AM824: MBLA on PCM slots, conformant
        // labels on the placeholder slots. Devices treat raw zeros as noise.
        let slots = self.am824_slots;
        for f in 0..frames {
            for s in 0..slots {
                let quadlet = if s < self.pcm_channels {
                    am824::SILENCE
                } else {
                    am824::encode_midi_placeholder(s - self.pcm_channels)
                };
                let off = (CIP_HEADER_BYTES + (f * slots + s) * 4) as usize;
                am824::write_quadlet(&mut packet.data[off..off + 4], quadlet);
            }
        }
    }

    fn fill_data(&mut self, packet: &mut AssembledPacket, syt: u16, frames: u32) {
        packet.size = self.data_packet_size();
        let (q0, q1) = self.cip.build(packet.dbc, syt, false);
        CipBuilder::write(&mut packet.data, q0, q1);

        let ch = self.pcm_channels as usize;
        let mut samples = [0i32; (MAX_FRAMES_PER_PACKET * MAX_AM824_SLOTS) as usize];

        let frames_read = if let Some(zc) = self.zero_copy.as_mut() {
            for f in 0..frames as usize {
                let frame_idx = (zc.read_pos + f as u32) % zc.capacity_frames;
                let src = unsafe { zc.base.add(frame_idx as usize * ch) };
                unsafe {
                    std::ptr::copy_nonoverlapping(src, samples[f * ch..].as_mut_ptr(), ch);
                }
            }
            zc.read_pos = (zc.read_pos + frames) % zc.capacity_frames;
            frames
        } else {
            self.ring.read(&mut samples[..frames as usize * ch], frames)
        };

        self.dbg_data_packets.fetch_add(1, Ordering::Relaxed);
        if frames_read < frames {
            self.dbg_underrun_packets.fetch_add(1, Ordering::Relaxed);
            self.underrun_diag.record(
                self.ring.fill_level(),
                frames,
                frames_read,
                packet.cycle_number,
                packet.dbc,
            );
        }

        encode_pcm_frames(
            &samples,
            frames,
            self.pcm_channels,
            self.am824_slots,
            &mut packet.data[CIP_HEADER_BYTES as usize..],
        );
    }
}

/// Encode interleaved PCM frames into AM824 wire quadlets, filling slots
/// beyond the PCM channel count with MIDI placeholder labels.
pub fn encode_pcm_frames(
    pcm_interleaved: &[i32],
    frames: u32,
    pcm_channels: u32,
    am824_slots: u32,
    out: &mut [u8],
) {
    let midi_slots = am824_slots.saturating_sub(pcm_channels);
    for f in 0..frames {
        for ch in 0..pcm_channels {
            let q = am824::encode(pcm_interleaved[(f * pcm_channels + ch) as usize]);
            let off = ((f * am824_slots + ch) * 4) as usize;
            am824::write_quadlet(&mut out[off..off + 4], q);
        }
        for s in 0..midi_slots {
            let q = am824::encode_midi_placeholder(s);
            let off = ((f * am824_slots + pcm_channels + s) * 4) as usize;
            am824::write_quadlet(&mut out[off..off + 4], q);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::cip::{CipFields, SYT_NO_INFO};

    #[test]
    fn blocking_prime_counts() {
        let mut asm = PacketAssembler::new(2, 0x3D);
        asm.set_stream_mode(StreamMode::Blocking);

        let mut data = 0u32;
        let mut no_data = 0u32;
        let mut frames = 0u32;
        for _ in 0..200 {
            let pkt = asm.assemble_next(0x1000, true);
            if pkt.is_data {
                data += 1;
                frames += asm.frames_per_data_packet();
                assert_eq!(pkt.size, 8 + 8 * 2 * 4);
            } else {
                no_data += 1;
                assert_eq!(pkt.size, 8);
            }
        }
        assert_eq!(data, 150);
        assert_eq!(no_data, 50);
        assert_eq!(frames, 1200);
    }

    #[test]
    fn no_data_packet_has_no_info_syt() {
        let mut asm = PacketAssembler::new(2, 0);
        let pkt = asm.assemble_next(0x1234, true);
        assert!(!pkt.is_data);
        let cip = CipFields::parse_bytes(&pkt.data);
        assert_eq!(cip.syt, SYT_NO_INFO);
        assert_eq!(cip.dbs, 2);
    }

    #[test]
    fn silent_data_payload_is_valid_am824() {
        let mut asm = PacketAssembler::new(2, 0);
        asm.reconfigure(2, 4, 7);
        asm.assemble_next(0, true); // cycle 0 is NO-DATA
        let pkt = asm.assemble_next(0x0400, true);
        assert!(pkt.is_data);
        assert_eq!(pkt.size, 8 + 8 * 4 * 4);
        for f in 0..8u32 {
            for s in 0..4u32 {
                let off = (8 + (f * 4 + s) * 4) as usize;
                let q = am824::read_quadlet(&pkt.data[off..off + 4]);
                if s < 2 {
                    assert_eq!(q, am824::SILENCE);
                } else {
                    assert_eq!(am824::label(q), 0x80 + (s - 2) as u8);
                }
            }
        }
    }

    #[test]
    fn data_packet_consumes_ring_audio() {
        let mut asm = PacketAssembler::new(2, 0);
        let input: Vec<i32> = (0..16).collect();
        asm.ring().write(&input, 8);

        asm.assemble_next(0, false); // NO-DATA
        let pkt = asm.assemble_next(0x0100, false);
        assert!(pkt.is_data);
        for i in 0..16usize {
            let q = am824::read_quadlet(&pkt.data[8 + i * 4..12 + i * 4]);
            assert_eq!(am824::decode(q), Some(i as i32));
        }
    }

    #[test]
    fn short_ring_read_records_underrun_and_zero_fills() {
        let mut asm = PacketAssembler::new(2, 0);
        asm.ring().write(&[5, 6], 1);
        asm.assemble_next(0, false);
        let pkt = asm.assemble_next(0x0100, false);
        assert!(pkt.is_data);
        assert_eq!(
            asm.underrun_diag().underrun_count.load(Ordering::Relaxed),
            1
        );
        let first = am824::read_quadlet(&pkt.data[8..12]);
        assert_eq!(am824::decode(first), Some(5));
        let third = am824::read_quadlet(&pkt.data[16..20]);
        assert_eq!(am824::decode(third), Some(0));
    }

    #[test]
    fn zero_copy_window_wraps() {
        let mut asm = PacketAssembler::new(1, 0);
        let source: Vec<i32> = (0..16).collect();
        asm.set_zero_copy_source(source.as_ptr(), 16);
        asm.set_zero_copy_read_position(12);

        asm.assemble_next(0, false);
        let pkt = asm.assemble_next(0x0100, false);
        assert!(pkt.is_data);
        let expect = [12, 13, 14, 15, 0, 1, 2, 3];
        for (i, want) in expect.iter().enumerate() {
            let q = am824::read_quadlet(&pkt.data[8 + i * 4..12 + i * 4]);
            assert_eq!(am824::decode(q), Some(*want));
        }
        assert_eq!(asm.zero_copy_read_position(), 4);
    }

    #[test]
    fn non_blocking_every_cycle_is_data() {
        let mut asm = PacketAssembler::new(2, 0);
        asm.set_stream_mode(StreamMode::NonBlocking);
        for _ in 0..8 {
            let pkt = asm.assemble_next(0x0100, true);
            assert!(pkt.is_data);
            assert_eq!(pkt.size, 8 + 6 * 2 * 4);
        }
    }
}
