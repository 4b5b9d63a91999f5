use isofire::config::{StreamMode, TX_PROFILE_A};
use isofire::encoding::am824;
use isofire::encoding::cip::{CIP_HEADER_BYTES, CipFields, FDF_SFC_48K, FMT_AM824, SYT_NO_INFO};
use isofire::hw::{SharedDmaMemory, SimOhci};
use isofire::shm::{SharedQueue, SharedRegion};
use isofire::tx::ring::PacketProvider;
use isofire::tx::{TxAudioPipeline, TxDmaRing, layout};

fn primed_ring() -> (SharedDmaMemory, TxDmaRing, TxAudioPipeline, SharedRegion) {
    let bytes = SharedQueue::required_bytes(4096, 2);
    let region = SharedRegion::new(bytes as usize).unwrap();
    assert!(SharedQueue::initialize_in_place(region.base(), bytes, 4096, 2));

    let mut pipeline = TxAudioPipeline::new(TX_PROFILE_A);
    pipeline.set_shared_tx_queue(region.base(), bytes);
    pipeline
        .configure(0x3D, StreamMode::Blocking, 0, 4)
        .unwrap();
    pipeline.reset_for_start();
    pipeline.set_cycle_tracking_valid(true);

    let mut mem = SharedDmaMemory::new();
    let sim = SimOhci::new(mem.clone());
    let mut ring = TxDmaRing::new();
    ring.set_channel(1);
    ring.setup_rings(&mut mem).unwrap();
    ring.reset_for_start();
    ring.seed_cycle_tracking(&sim);
    let stats = ring.prime(&mem, &mut pipeline);
    assert_eq!(stats.packets_assembled, 200);
    (mem, ring, pipeline, region)
}

/// Walk the whole primed slab and hold every wire-level invariant: CIP
/// conformance, the blocking cadence sample rate, DBC continuity across
/// NO-DATA packets, and AM824 labels per slot.
#[test]
fn primed_slab_holds_wire_invariants() {
    let (_mem, ring, pipeline, _region) = primed_ring();
    let slab = ring.slab();

    let frames = pipeline.frames_per_data_packet();
    let pcm = pipeline.pcm_channels();
    let slots = pipeline.am824_slots();
    let data_bytes = CIP_HEADER_BYTES + frames * slots * 4;

    let mut data_packets = 0u32;
    let mut no_data_packets = 0u32;
    let mut total_frames = 0u32;
    let mut last_data_dbc: Option<u8> = None;

    for pkt in 0..layout::NUM_PACKETS {
        let last = slab.read_descriptor(pkt * layout::BLOCKS_PER_PACKET + 2);
        let imm = slab.read_immediate(pkt * layout::BLOCKS_PER_PACKET);
        let req = last.req_count() as u32;
        let payload = slab.payload_bytes(pkt);
        let cip = CipFields::parse_bytes(payload);

        // Isoch header length mirrors the descriptor request count.
        assert_eq!(imm.immediate[1] >> 16, req);
        assert_eq!((imm.immediate[0] >> 8) & 0x3F, 1); // channel
        assert_eq!((imm.immediate[0] >> 4) & 0xF, 0xA); // STREAM_DATA tcode

        assert_eq!(cip.eoh0, 0);
        assert_eq!(cip.eoh1, 2);
        assert_eq!(cip.fmt, FMT_AM824);
        assert_eq!(cip.fdf, FDF_SFC_48K);
        assert_eq!(cip.dbs as u32, slots);
        assert_eq!(cip.sid, 0x3D);

        let is_data = req > CIP_HEADER_BYTES;
        if is_data {
            data_packets += 1;
            total_frames += frames;
            assert_eq!(req, data_bytes);
            assert_ne!(cip.syt, SYT_NO_INFO);

            if let Some(prev) = last_data_dbc {
                assert_eq!(cip.dbc, prev.wrapping_add(frames as u8));
            }
            last_data_dbc = Some(cip.dbc);

            for f in 0..frames {
                for s in 0..slots {
                    let off = (CIP_HEADER_BYTES + (f * slots + s) * 4) as usize;
                    let q = am824::read_quadlet(&payload[off..off + 4]);
                    if s < pcm {
                        assert_eq!(am824::label(q), am824::AM824_LABEL_MBLA);
                    } else {
                        assert_eq!(am824::label(q), 0x80 + (s - pcm) as u8);
                    }
                }
            }
        } else {
            no_data_packets += 1;
            assert_eq!(req, CIP_HEADER_BYTES);
            assert_eq!(cip.syt, SYT_NO_INFO);
        }
    }

    // Blocking 48 kHz over 200 cycles: 150 DATA / 50 NO-DATA, 1200 frames,
    // i.e. exactly 48 frames per 8-cycle window.
    assert_eq!(data_packets, 150);
    assert_eq!(no_data_packets, 50);
    assert_eq!(total_frames, 1200);
}

/// Every 8-cycle window of freshly assembled packets carries exactly 48
/// samples, no matter where the window starts.
#[test]
fn any_eight_cycle_window_carries_48_samples() {
    let (_mem, _ring, mut pipeline, _region) = primed_ring();

    let mut frame_counts = Vec::new();
    for cycle in 0..64u32 {
        let pkt = pipeline.next_silent_packet(cycle);
        frame_counts.push(if pkt.is_data {
            pipeline.frames_per_data_packet()
        } else {
            0
        });
    }
    for start in 0..(frame_counts.len() - 8) {
        let window: u32 = frame_counts[start..start + 8].iter().sum();
        assert_eq!(window, 48, "window starting at {start}");
    }
}
