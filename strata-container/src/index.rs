// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The three footer indexes: process groups, variables, attributes.
//!
//! The process-group index is a flat sorted list. The variable and
//! attribute indexes merge contributions with identical
//! `(group, name, path, type)` into a single entry whose characteristic
//! sets grow by one per process group the variable appeared in, so a
//! reader can enumerate every block of a variable without walking the
//! groups.

use ahash::AHashMap;
use strata_core::{DataType, ErrorKind, StrataError};

use crate::record::{Characteristic, VarWrite, charkind};
use crate::wire::{ByteReader, ByteWriter, Endian};

/// One entry of the process-group index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PgIndexEntry {
    pub process_id: u32,
    pub time_index: u32,
    pub offset: u64,
    pub length: u64,
}

/// The characteristics one process group contributed for one variable or
/// attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct CharSet {
    pub time_index: u32,
    pub process_id: u32,
    /// Absolute file offset of the containing process group.
    pub pg_offset: u64,
    pub chars: Vec<Characteristic>,
}

/// Merged index entry for one variable (or attribute).
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub group: String,
    pub name: String,
    pub path: String,
    pub dtype: DataType,
    pub sets: Vec<CharSet>,
}

impl IndexEntry {
    fn merge_key(&self) -> (String, String, String, u8) {
        (
            self.group.clone(),
            self.name.clone(),
            self.path.clone(),
            self.dtype.code(),
        )
    }
}

/// In-memory form of the variable or attribute index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedIndex {
    entries: Vec<IndexEntry>,
    by_key: AHashMap<(String, String, String, u8), usize>,
}

impl MergedIndex {
    pub fn new() -> MergedIndex {
        MergedIndex::default()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn find(&self, group: &str, name: &str, path: &str, dtype: DataType) -> Option<&IndexEntry> {
        let key = (
            group.to_string(),
            name.to_string(),
            path.to_string(),
            dtype.code(),
        );
        self.by_key.get(&key).map(|&i| &self.entries[i])
    }

    /// Find by name alone; first match in insertion order.
    pub fn find_named(&self, name: &str) -> Option<&IndexEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name || format!("{}/{}", e.path, e.name) == name)
    }

    /// Merge one contribution. Entries with the same
    /// `(group, name, path, type)` collapse; their characteristic sets
    /// accumulate in arrival order.
    pub fn merge(&mut self, entry: IndexEntry) {
        match self.by_key.get(&entry.merge_key()) {
            Some(&i) => self.entries[i].sets.extend(entry.sets),
            None => {
                self.by_key.insert(entry.merge_key(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn merge_all(&mut self, other: MergedIndex) {
        for entry in other.entries {
            self.merge(entry);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.u32(self.entries.len() as u32);
        for entry in &self.entries {
            let len_patch = w.placeholder_u64();
            let start = w.len() - 8;
            w.str16(&entry.group);
            w.str16(&entry.name);
            w.str16(&entry.path);
            w.u8(entry.dtype.code());
            w.u32(entry.sets.len() as u32);
            for set in &entry.sets {
                w.u32(set.time_index);
                w.u32(set.process_id);
                w.u64(set.pg_offset);
                w.u8(set.chars.len() as u8);
                for c in &set.chars {
                    w.u8(c.kind);
                    w.u32(c.payload.len() as u32);
                    w.bytes(&c.payload);
                }
            }
            let len = (w.len() - start) as u64;
            w.patch_u64(len_patch, len);
        }
        w.into_vec()
    }

    pub fn decode(data: &[u8], endian: Endian) -> Result<MergedIndex, StrataError> {
        let mut r = ByteReader::new(data, endian);
        let count = r.u32()? as usize;
        let mut index = MergedIndex::new();
        for _ in 0..count {
            let start = r.pos();
            let entry_len = r.u64()?;
            let group = r.str16()?;
            let name = r.str16()?;
            let path = r.str16()?;
            let dtype = DataType::from_code(r.u8()?).ok_or_else(|| {
                StrataError::record(ErrorKind::InvalidData, "unknown type code in index")
            })?;
            let sets_count = r.u32()? as usize;
            let mut sets = Vec::with_capacity(sets_count);
            for _ in 0..sets_count {
                let time_index = r.u32()?;
                let process_id = r.u32()?;
                let pg_offset = r.u64()?;
                let nchars = r.u8()? as usize;
                let mut chars = Vec::with_capacity(nchars);
                for _ in 0..nchars {
                    let kind = r.u8()?;
                    let len = r.u32()? as usize;
                    chars.push(Characteristic {
                        kind,
                        payload: r.bytes(len)?.to_vec(),
                    });
                }
                sets.push(CharSet {
                    time_index,
                    process_id,
                    pg_offset,
                    chars,
                });
            }
            // Entry length lets readers skip entries with unknown trailing
            // fields.
            r.seek(start + entry_len as usize)?;
            index.merge(IndexEntry {
                group,
                name,
                path,
                dtype,
                sets,
            });
        }
        Ok(index)
    }
}

/// Build the index contribution of one variable write in one process group.
pub fn index_set_for(
    var: &VarWrite<'_>,
    time_index: u32,
    process_id: u32,
    pg_offset: u64,
    payload_offset: u64,
) -> CharSet {
    CharSet {
        time_index,
        process_id,
        pg_offset,
        chars: crate::record::characteristics_of(var, payload_offset),
    }
}

/// Build the index contribution of one attribute in one process group.
/// Var-referenced attributes carry the value resolved at close (when the
/// referenced scalar had one) plus the reference itself.
pub fn attr_index_set(
    attr: &crate::record::AttrWrite<'_>,
    resolved: Option<&[u8]>,
    time_index: u32,
    process_id: u32,
    pg_offset: u64,
) -> CharSet {
    let mut chars = Vec::new();
    match &attr.value {
        crate::record::AttrPayload::Inline(bytes) => chars.push(Characteristic {
            kind: charkind::VALUE,
            payload: bytes.to_vec(),
        }),
        crate::record::AttrPayload::VarRef(id) => {
            let mut w = ByteWriter::new();
            w.u16(*id);
            chars.push(Characteristic {
                kind: charkind::REF_VAR,
                payload: w.into_vec(),
            });
            if let Some(bytes) = resolved {
                chars.push(Characteristic {
                    kind: charkind::VALUE,
                    payload: bytes.to_vec(),
                });
            }
        }
    }
    CharSet {
        time_index,
        process_id,
        pg_offset,
        chars,
    }
}

/// Encode the process-group index, sorting by `(time_index, process_id)`.
pub fn encode_pg_index(entries: &mut Vec<PgIndexEntry>) -> Vec<u8> {
    entries.sort_by_key(|e| (e.time_index, e.process_id));
    let mut w = ByteWriter::new();
    w.u32(entries.len() as u32);
    for e in entries.iter() {
        w.u32(e.process_id);
        w.u32(e.time_index);
        w.u64(e.offset);
        w.u64(e.length);
    }
    w.into_vec()
}

pub fn decode_pg_index(data: &[u8], endian: Endian) -> Result<Vec<PgIndexEntry>, StrataError> {
    let mut r = ByteReader::new(data, endian);
    let count = r.u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let process_id = r.u32()?;
        let time_index = r.u32()?;
        let offset = r.u64()?;
        let length = r.u64()?;
        entries.push(PgIndexEntry {
            process_id,
            time_index,
            offset,
            length,
        });
    }
    Ok(entries)
}

/// Convenience lookups over a [`CharSet`].
impl CharSet {
    pub fn char(&self, kind: u8) -> Option<&Characteristic> {
        self.chars.iter().find(|c| c.kind == kind)
    }

    /// Payload offset within the process group, from the offset
    /// characteristic.
    pub fn payload_offset(&self, endian: Endian) -> Option<u64> {
        let c = self.char(charkind::OFFSET)?;
        ByteReader::new(&c.payload, endian).u64().ok()
    }

    pub fn axes(&self, endian: Endian) -> Option<Vec<strata_core::ResolvedAxis>> {
        let c = self.char(charkind::DIMS)?;
        let mut r = ByteReader::new(&c.payload, endian);
        let ndims = r.u8().ok()? as usize;
        let mut axes = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            let _rank = r.u8().ok()?;
            let local = r.u64().ok()?;
            let global = r.u64().ok()?;
            let offset = r.u64().ok()?;
            let local_src = crate::record::src_from_code(r.u16().ok()?);
            let global_src = crate::record::src_from_code(r.u16().ok()?);
            let offset_src = crate::record::src_from_code(r.u16().ok()?);
            axes.push(strata_core::ResolvedAxis {
                local,
                global,
                offset,
                local_src,
                global_src,
                offset_src,
            });
        }
        Some(axes)
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.char(charkind::VALUE).map(|c| c.payload.as_slice())
    }

    pub fn stat_bitmap(&self) -> Option<u8> {
        self.char(charkind::STAT_BITMAP)?.payload.first().copied()
    }

    /// Per-component f64 statistic payload (min/max/sum/sum_sq kinds).
    pub fn stat_f64s(&self, kind: u8, endian: Endian) -> Option<Vec<f64>> {
        let c = self.char(kind)?;
        let mut r = ByteReader::new(&c.payload, endian);
        let mut out = Vec::with_capacity(c.payload.len() / 8);
        while r.remaining() >= 8 {
            out.push(r.f64().ok()?);
        }
        Some(out)
    }

    pub fn element_count(&self, endian: Endian) -> Option<u64> {
        let c = self.char(charkind::COUNT)?;
        ByteReader::new(&c.payload, endian).u64().ok()
    }

    /// Per-component histograms recorded for this block.
    pub fn histograms(&self, endian: Endian) -> Option<Vec<strata_core::Histogram>> {
        let c = self.char(charkind::HIST)?;
        let mut r = ByteReader::new(&c.payload, endian);
        let components = r.u8().ok()? as usize;
        let mut out = Vec::with_capacity(components);
        for _ in 0..components {
            let nbreaks = r.u32().ok()? as usize;
            let mut breaks = Vec::with_capacity(nbreaks);
            for _ in 0..nbreaks {
                breaks.push(r.f64().ok()?);
            }
            let mut frequencies = Vec::with_capacity(nbreaks + 1);
            for _ in 0..=nbreaks {
                frequencies.push(r.u64().ok()?);
            }
            out.push(strata_core::Histogram::from_parts(breaks, frequencies));
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Dim, ResolvedAxis, VarId};

    fn entry(group: &str, name: &str, time_index: u32, process_id: u32) -> IndexEntry {
        IndexEntry {
            group: group.into(),
            name: name.into(),
            path: String::new(),
            dtype: DataType::Double,
            sets: vec![CharSet {
                time_index,
                process_id,
                pg_offset: 64 * time_index as u64,
                chars: vec![Characteristic {
                    kind: charkind::OFFSET,
                    payload: vec![0; 8],
                }],
            }],
        }
    }

    #[test]
    fn merge_collapses_identical_identity() {
        let mut index = MergedIndex::new();
        index.merge(entry("mesh", "x", 0, 0));
        index.merge(entry("mesh", "x", 1, 0));
        index.merge(entry("mesh", "y", 0, 0));
        assert_eq!(index.entries().len(), 2);
        assert_eq!(index.entries()[0].sets.len(), 2);
    }

    #[test]
    fn index_round_trips() {
        let mut index = MergedIndex::new();
        index.merge(entry("mesh", "x", 0, 0));
        index.merge(entry("mesh", "x", 1, 1));
        let bytes = index.encode();
        let decoded = MergedIndex::decode(&bytes, Endian::native()).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn pg_index_sorted_by_time_then_rank() {
        let mut entries = vec![
            PgIndexEntry {
                process_id: 1,
                time_index: 1,
                offset: 300,
                length: 10,
            },
            PgIndexEntry {
                process_id: 0,
                time_index: 1,
                offset: 200,
                length: 10,
            },
            PgIndexEntry {
                process_id: 0,
                time_index: 0,
                offset: 0,
                length: 10,
            },
        ];
        let bytes = encode_pg_index(&mut entries);
        let decoded = decode_pg_index(&bytes, Endian::native()).unwrap();
        let order: Vec<_> = decoded.iter().map(|e| (e.time_index, e.process_id)).collect();
        assert_eq!(order, [(0, 0), (1, 0), (1, 1)]);
    }

    #[test]
    fn charset_accessors_parse_back() {
        let axes = [ResolvedAxis {
            local: 5,
            global: 10,
            offset: 5,
            local_src: Dim::Var(VarId(1)),
            global_src: Dim::Literal(0),
            offset_src: Dim::Literal(0),
        }];
        let data = [1.0f64; 5];
        let var = VarWrite {
            id: 2,
            name: "u",
            path: "",
            dtype: DataType::Double,
            is_dim: false,
            transform: None,
            axes: &axes,
            payload: strata_core::bytes_of(&data),
            stats: None,
        };
        let set = index_set_for(&var, 3, 1, 4096, 128);
        assert_eq!(set.payload_offset(Endian::native()), Some(128));
        let parsed = set.axes(Endian::native()).unwrap();
        assert_eq!(parsed[0].local, 5);
        assert_eq!(parsed[0].local_src, Dim::Var(VarId(1)));
        assert_eq!(set.value(), None);
    }
}
