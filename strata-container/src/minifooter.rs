// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The fixed-size trailer at the end of every container.
//!
//! The trailer is 48 bytes: a 28-byte index block (three u64 index offsets
//! plus the u32 version word), the endianness byte, three reserved bytes,
//! the file size, and the trailing magic. Given only the trailer a reader
//! can locate the three indexes and from them stream only the process
//! groups it needs.

use bitflags::bitflags;
use strata_core::{ErrorKind, StrataError};

use crate::wire::{ByteReader, ByteWriter, Endian};

/// Trailing magic bytes identifying a container.
pub const MAGIC: [u8; 8] = *b"STRATA01";

/// Total trailer size in bytes.
pub const MINIFOOTER_LEN: usize = 48;

/// Current container format version (low 24 bits of the version word).
pub const FORMAT_VERSION: u32 = 1;

bitflags! {
    /// Flags byte in the high 8 bits of the version word.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FooterFlags: u8 {
        /// The last step was written by fewer ranks than entered close.
        const PARTIAL_STEP = 1 << 0;
    }
}

/// Parsed trailer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Minifooter {
    pub pg_index_offset: u64,
    pub vars_index_offset: u64,
    pub attrs_index_offset: u64,
    pub version: u32,
    pub flags: FooterFlags,
    pub endian: Endian,
    pub file_size: u64,
}

impl Minifooter {
    pub fn new(
        pg_index_offset: u64,
        vars_index_offset: u64,
        attrs_index_offset: u64,
        flags: FooterFlags,
        file_size: u64,
    ) -> Minifooter {
        Minifooter {
            pg_index_offset,
            vars_index_offset,
            attrs_index_offset,
            version: FORMAT_VERSION,
            flags,
            endian: Endian::native(),
            file_size,
        }
    }

    pub fn encode(&self) -> [u8; MINIFOOTER_LEN] {
        let mut w = ByteWriter::new();
        w.u64(self.pg_index_offset);
        w.u64(self.vars_index_offset);
        w.u64(self.attrs_index_offset);
        w.u32(self.version | ((self.flags.bits() as u32) << 24));
        w.u8(self.endian.byte());
        w.bytes(&[0; 3]);
        w.u64(self.file_size);
        w.bytes(&MAGIC);
        let buf = w.into_vec();
        debug_assert_eq!(buf.len(), MINIFOOTER_LEN);
        buf.try_into().expect("fixed trailer size")
    }

    /// Decode the trailer from the last [`MINIFOOTER_LEN`] bytes of a file.
    pub fn decode(tail: &[u8]) -> Result<Minifooter, StrataError> {
        if tail.len() != MINIFOOTER_LEN {
            return Err(StrataError::record(
                ErrorKind::InvalidData,
                format!("trailer must be {MINIFOOTER_LEN} bytes, got {}", tail.len()),
            ));
        }
        if tail[MINIFOOTER_LEN - 8..] != MAGIC {
            return Err(StrataError::record(
                ErrorKind::InvalidData,
                "trailing magic missing, not a strata container",
            ));
        }
        // The endianness byte sits at a fixed position and must be read
        // before any multi-byte field.
        let endian = Endian::from_byte(tail[28])?;
        let mut r = ByteReader::new(tail, endian);
        let pg_index_offset = r.u64()?;
        let vars_index_offset = r.u64()?;
        let attrs_index_offset = r.u64()?;
        let word = r.u32()?;
        let version = word & 0x00ff_ffff;
        let flags = FooterFlags::from_bits_truncate((word >> 24) as u8);
        if version != FORMAT_VERSION {
            return Err(StrataError::record(
                ErrorKind::InvalidData,
                format!("unsupported container version {version}"),
            ));
        }
        r.skip(4)?; // endianness + reserved
        let file_size = r.u64()?;
        Ok(Minifooter {
            pg_index_offset,
            vars_index_offset,
            attrs_index_offset,
            version,
            flags,
            endian,
            file_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let footer = Minifooter::new(100, 200, 300, FooterFlags::empty(), 348);
        let bytes = footer.encode();
        assert_eq!(Minifooter::decode(&bytes).unwrap(), footer);
    }

    #[test]
    fn partial_step_flag_survives() {
        let footer = Minifooter::new(1, 2, 3, FooterFlags::PARTIAL_STEP, 51);
        let decoded = Minifooter::decode(&footer.encode()).unwrap();
        assert!(decoded.flags.contains(FooterFlags::PARTIAL_STEP));
        assert_eq!(decoded.version, FORMAT_VERSION);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Minifooter::new(0, 0, 0, FooterFlags::empty(), 48).encode();
        bytes[MINIFOOTER_LEN - 1] ^= 0xff;
        let err = Minifooter::decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Minifooter::decode(&[0u8; 12]).is_err());
    }
}
