pub mod am824;
pub mod assembler;
pub mod cadence;
pub mod cip;
pub mod dbc;
pub mod ring;
pub mod syt;

pub use am824::{AM824_LABEL_MBLA, AM824_LABEL_MIDI_BASE};
pub use assembler::{AssembledPacket, PacketAssembler, UnderrunDiag};
pub use cadence::Cadence;
pub use cip::{CIP_HEADER_BYTES, CipBuilder, CipFields, CipHeader, SYT_NO_INFO};
pub use dbc::DbcGenerator;
pub use ring::AudioRing;
pub use syt::SytGenerator;
