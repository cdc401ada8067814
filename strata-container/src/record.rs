// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-group, variable, and attribute record codecs.
//!
//! A process group is one process's contribution to one step:
//! a header, one record + aligned payload per written variable, then one
//! record per written attribute. Every record is length-prefixed so readers
//! can skip forward past anything they do not understand, and every payload
//! is aligned to 8 bytes.
//!
//! Dimension provenance is recorded next to each resolved extent as a u16:
//! `0` means the neighbouring u64 is a literal, values below `0x8000` name
//! the scalar variable that provided it, `0x8000 | id` names an attribute,
//! and `0xffff` is the time axis.

use strata_core::{
    AttrId, DataType, Dim, ResolvedAxis, StatFlags, StatsSet, StrataError, VarId,
};
use strata_core::ErrorKind;

use crate::wire::{ByteReader, ByteWriter, Endian};

/// Characteristic kind tags. Part of the container contract.
pub mod charkind {
    pub const OFFSET: u8 = 0;
    pub const DIMS: u8 = 1;
    pub const VALUE: u8 = 2;
    pub const MIN: u8 = 3;
    pub const MAX: u8 = 4;
    pub const SUM: u8 = 5;
    pub const SUM_SQ: u8 = 6;
    pub const HIST: u8 = 7;
    pub const STAT_BITMAP: u8 = 8;
    pub const TRANSFORM: u8 = 9;
    pub const COUNT: u8 = 10;
    pub const REF_VAR: u8 = 11;
}

/// Encode dimension provenance.
pub fn src_code(dim: Dim) -> u16 {
    match dim {
        Dim::Literal(_) => 0,
        Dim::Var(id) => id.0,
        Dim::Attr(id) => 0x8000 | id.0,
        Dim::Time => 0xffff,
    }
}

/// Decode dimension provenance; literals come back as `Dim::Literal(0)`
/// (the resolved extent lives in the neighbouring u64).
pub fn src_from_code(code: u16) -> Dim {
    match code {
        0 => Dim::Literal(0),
        0xffff => Dim::Time,
        code if code >= 0x8000 => Dim::Attr(AttrId(code & 0x7fff)),
        code => Dim::Var(VarId(code)),
    }
}

/// One tagged `(kind, payload)` fragment attached to a variable or
/// attribute record.
#[derive(Clone, Debug, PartialEq)]
pub struct Characteristic {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Characteristic {
    fn write(&self, w: &mut ByteWriter) {
        w.u8(self.kind);
        w.u32(self.payload.len() as u32);
        w.bytes(&self.payload);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Characteristic, StrataError> {
        let kind = r.u8()?;
        let len = r.u32()? as usize;
        Ok(Characteristic {
            kind,
            payload: r.bytes(len)?.to_vec(),
        })
    }
}

/// Description of one variable write handed to the codec by the write
/// pipeline.
#[derive(Clone, Debug)]
pub struct VarWrite<'a> {
    pub id: u16,
    pub name: &'a str,
    pub path: &'a str,
    pub dtype: DataType,
    pub is_dim: bool,
    pub transform: Option<&'a str>,
    pub axes: &'a [ResolvedAxis],
    pub payload: &'a [u8],
    pub stats: Option<&'a StatsSet>,
}

/// Attribute payload: inline bytes or a reference to a variable.
#[derive(Clone, Debug)]
pub enum AttrPayload<'a> {
    Inline(&'a [u8]),
    VarRef(u16),
}

/// Description of one attribute handed to the codec at close.
#[derive(Clone, Debug)]
pub struct AttrWrite<'a> {
    pub id: u16,
    pub name: &'a str,
    pub path: &'a str,
    pub dtype: DataType,
    pub value: AttrPayload<'a>,
}

/// Process-group header fields.
#[derive(Clone, Debug, PartialEq)]
pub struct PgHeader {
    pub group: String,
    pub process_id: u32,
    pub time_index_name: String,
    pub time_index: u32,
    pub host_fortran: bool,
}

fn encode_axes(w: &mut ByteWriter, axes: &[ResolvedAxis]) {
    w.u8(axes.len() as u8);
    for (rank, axis) in axes.iter().enumerate() {
        w.u8(rank as u8);
        w.u64(axis.local);
        w.u64(axis.global);
        w.u64(axis.offset);
        w.u16(src_code(axis.local_src));
        w.u16(src_code(axis.global_src));
        w.u16(src_code(axis.offset_src));
    }
}

fn decode_axes(r: &mut ByteReader<'_>) -> Result<Vec<ResolvedAxis>, StrataError> {
    let ndims = r.u8()? as usize;
    let mut axes = Vec::with_capacity(ndims);
    for _ in 0..ndims {
        let _rank = r.u8()?;
        let local = r.u64()?;
        let global = r.u64()?;
        let offset = r.u64()?;
        let local_src = src_from_code(r.u16()?);
        let global_src = src_from_code(r.u16()?);
        let offset_src = src_from_code(r.u16()?);
        axes.push(ResolvedAxis {
            local,
            global,
            offset,
            local_src,
            global_src,
            offset_src,
        });
    }
    Ok(axes)
}

fn f64s_payload(values: impl Iterator<Item = f64>) -> Vec<u8> {
    let mut w = ByteWriter::new();
    for v in values {
        w.f64(v);
    }
    w.into_vec()
}

/// Build the characteristic list for one variable record. The same list
/// goes into the in-PG record and, prefixed with the PG coordinates, into
/// the variable index entry.
pub fn characteristics_of(var: &VarWrite<'_>, payload_offset: u64) -> Vec<Characteristic> {
    let mut chars = Vec::new();
    let mut w = ByteWriter::new();
    w.u64(payload_offset);
    chars.push(Characteristic {
        kind: charkind::OFFSET,
        payload: w.into_vec(),
    });

    let mut w = ByteWriter::new();
    encode_axes(&mut w, var.axes);
    chars.push(Characteristic {
        kind: charkind::DIMS,
        payload: w.into_vec(),
    });

    // Scalars and strings carry their value inline so readers can resolve
    // dimension references and attributes without touching the payload
    // region.
    if var.axes.is_empty() {
        chars.push(Characteristic {
            kind: charkind::VALUE,
            payload: var.payload.to_vec(),
        });
    }

    if let Some(transform) = var.transform {
        chars.push(Characteristic {
            kind: charkind::TRANSFORM,
            payload: transform.as_bytes().to_vec(),
        });
    }

    if let Some(stats) = var.stats {
        let flags = stats.flags();
        chars.push(Characteristic {
            kind: charkind::STAT_BITMAP,
            payload: vec![flags.bits()],
        });
        let comps = 0..stats.components();
        if flags.contains(StatFlags::MIN) {
            chars.push(Characteristic {
                kind: charkind::MIN,
                payload: f64s_payload(comps.clone().map(|c| stats.slot(c).min)),
            });
        }
        if flags.contains(StatFlags::MAX) {
            chars.push(Characteristic {
                kind: charkind::MAX,
                payload: f64s_payload(comps.clone().map(|c| stats.slot(c).max)),
            });
        }
        if flags.contains(StatFlags::SUM) {
            chars.push(Characteristic {
                kind: charkind::SUM,
                payload: f64s_payload(comps.clone().map(|c| stats.slot(c).sum)),
            });
        }
        if flags.contains(StatFlags::SUM_SQ) {
            chars.push(Characteristic {
                kind: charkind::SUM_SQ,
                payload: f64s_payload(comps.clone().map(|c| stats.slot(c).sum_sq)),
            });
        }
        if flags.contains(StatFlags::COUNT) {
            let mut w = ByteWriter::new();
            w.u64(stats.slot(0).count);
            chars.push(Characteristic {
                kind: charkind::COUNT,
                payload: w.into_vec(),
            });
        }
        if flags.contains(StatFlags::HIST) && stats.slot(0).hist.is_some() {
            let mut w = ByteWriter::new();
            w.u8(stats.components() as u8);
            for c in comps {
                let hist = stats.slot(c).hist.as_ref().expect("all components share breaks");
                w.u32(hist.breaks().len() as u32);
                for b in hist.breaks() {
                    w.f64(*b);
                }
                for f in hist.frequencies() {
                    w.u64(*f);
                }
            }
            chars.push(Characteristic {
                kind: charkind::HIST,
                payload: w.into_vec(),
            });
        }
    }
    chars
}

/// Encode one full process group. Returns the bytes plus, per variable (in
/// input order), the payload offset within the group.
pub fn encode_pg(
    header: &PgHeader,
    vars: &[VarWrite<'_>],
    attrs: &[AttrWrite<'_>],
) -> (Vec<u8>, Vec<u64>) {
    let mut w = ByteWriter::new();
    let pg_len = w.placeholder_u64();
    w.str16(&header.group);
    w.u8(header.host_fortran as u8);
    w.u32(header.process_id);
    w.str16(&header.time_index_name);
    w.u32(header.time_index);
    w.u32(vars.len() as u32);
    w.u32(attrs.len() as u32);
    w.align8();

    let mut payload_offsets = Vec::with_capacity(vars.len());
    for (ordinal, var) in vars.iter().enumerate() {
        let record_start = w.len();
        let var_len = w.placeholder_u64();
        w.u32(var.id as u32);
        w.u32(ordinal as u32);
        w.str16(var.name);
        w.str16(var.path);
        w.u8(var.dtype.code());
        w.u8(var.is_dim as u8);
        encode_axes(&mut w, var.axes);
        w.u64(var.payload.len() as u64);

        // The payload offset is known before the characteristics because
        // the characteristic list has a deterministic size; encode it
        // twice (dry run) to find where the payload will land.
        let payload_offset = {
            let chars = characteristics_of(var, 0);
            let mut chars_len = 1usize; // count byte
            for c in &chars {
                chars_len += 1 + 4 + c.payload.len();
            }
            ((w.len() + chars_len) as u64).next_multiple_of(8)
        };
        payload_offsets.push(payload_offset);

        let chars = characteristics_of(var, payload_offset);
        w.u8(chars.len() as u8);
        for c in &chars {
            c.write(&mut w);
        }
        w.align8();
        debug_assert_eq!(w.len() as u64, payload_offset);
        w.bytes(var.payload);
        w.align8();
        let record_len = (w.len() - record_start) as u64;
        w.patch_u64(var_len, record_len);
    }

    for attr in attrs {
        let record_start = w.len();
        let attr_len = w.placeholder_u64();
        w.u32(attr.id as u32);
        w.str16(attr.name);
        w.str16(attr.path);
        w.u8(attr.dtype.code());
        match &attr.value {
            AttrPayload::Inline(bytes) => {
                w.u8(0);
                w.u32(bytes.len() as u32);
                w.bytes(bytes);
            }
            AttrPayload::VarRef(id) => {
                w.u8(1);
                w.u16(*id);
            }
        }
        w.align8();
        let record_len = (w.len() - record_start) as u64;
        w.patch_u64(attr_len, record_len);
    }

    let total = w.len() as u64;
    w.patch_u64(pg_len, total);
    (w.into_vec(), payload_offsets)
}

/// A variable record parsed back out of a process group.
#[derive(Clone, Debug)]
pub struct VarRecord {
    pub id: u16,
    pub ordinal: u32,
    pub name: String,
    pub path: String,
    pub dtype: DataType,
    pub is_dim: bool,
    pub axes: Vec<ResolvedAxis>,
    pub chars: Vec<Characteristic>,
    /// Payload offset within the process group.
    pub payload_offset: u64,
    pub payload_len: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttrRecValue {
    Inline(Vec<u8>),
    VarRef(u16),
}

#[derive(Clone, Debug)]
pub struct AttrRecord {
    pub id: u16,
    pub name: String,
    pub path: String,
    pub dtype: DataType,
    pub value: AttrRecValue,
}

/// A fully parsed process group.
#[derive(Clone, Debug)]
pub struct PgParsed {
    pub header: PgHeader,
    pub vars: Vec<VarRecord>,
    pub attrs: Vec<AttrRecord>,
    pub length: u64,
}

fn bad(msg: &str) -> StrataError {
    StrataError::record(ErrorKind::InvalidData, msg.to_string())
}

/// Parse one process group starting at offset 0 of `data`.
pub fn parse_pg(data: &[u8], endian: Endian) -> Result<PgParsed, StrataError> {
    let mut r = ByteReader::new(data, endian);
    let length = r.u64()?;
    if length > data.len() as u64 {
        return Err(bad("process group length exceeds available bytes"));
    }
    let group = r.str16()?;
    let host_fortran = r.u8()? != 0;
    let process_id = r.u32()?;
    let time_index_name = r.str16()?;
    let time_index = r.u32()?;
    let nvars = r.u32()? as usize;
    let nattrs = r.u32()? as usize;
    r.align8()?;

    let mut vars = Vec::with_capacity(nvars);
    for _ in 0..nvars {
        let record_start = r.pos();
        let var_len = r.u64()?;
        let id = r.u32()? as u16;
        let ordinal = r.u32()?;
        let name = r.str16()?;
        let path = r.str16()?;
        let dtype = DataType::from_code(r.u8()?)
            .ok_or_else(|| bad("unknown variable type code"))?;
        let is_dim = r.u8()? != 0;
        let axes = decode_axes(&mut r)?;
        let payload_len = r.u64()?;
        let nchars = r.u8()? as usize;
        let mut chars = Vec::with_capacity(nchars);
        for _ in 0..nchars {
            chars.push(Characteristic::read(&mut r)?);
        }
        r.align8()?;
        let payload_offset = r.pos() as u64;
        vars.push(VarRecord {
            id,
            ordinal,
            name,
            path,
            dtype,
            is_dim,
            axes,
            chars,
            payload_offset,
            payload_len,
        });
        // Skip over the payload via the record length so unknown trailing
        // fields in future versions are tolerated.
        r.seek(record_start + var_len as usize)?;
    }

    let mut attrs = Vec::with_capacity(nattrs);
    for _ in 0..nattrs {
        let record_start = r.pos();
        let attr_len = r.u64()?;
        let id = r.u32()? as u16;
        let name = r.str16()?;
        let path = r.str16()?;
        let dtype = DataType::from_code(r.u8()?)
            .ok_or_else(|| bad("unknown attribute type code"))?;
        let value = match r.u8()? {
            0 => {
                let len = r.u32()? as usize;
                AttrRecValue::Inline(r.bytes(len)?.to_vec())
            }
            1 => AttrRecValue::VarRef(r.u16()?),
            _ => return Err(bad("unknown attribute value form")),
        };
        attrs.push(AttrRecord {
            id,
            name,
            path,
            dtype,
            value,
        });
        r.seek(record_start + attr_len as usize)?;
    }

    Ok(PgParsed {
        header: PgHeader {
            group,
            process_id,
            time_index_name,
            time_index,
            host_fortran,
        },
        vars,
        attrs,
        length,
    })
}

/// Upper bound on the metadata bytes one variable record adds to a process
/// group, used for arena reservations at `group_size` time.
pub fn var_record_overhead(
    name: &str,
    path: &str,
    ndims: usize,
    components: usize,
    hist_breaks: usize,
    transform_len: usize,
) -> u64 {
    let chars = 8 /* offset */ + 2 + ndims * 32 /* dims */ + 1 /* bitmap */
        + components * 8 * 4 /* min/max/sum/sum_sq */ + 8 /* count */
        + if hist_breaks > 0 {
            1 + components * (4 + hist_breaks * 8 + (hist_breaks + 1) * 8)
        } else {
            0
        }
        + transform_len;
    (64 + name.len() + path.len() + ndims * 32 + chars + 12 * 5 /* char headers */ + 32) as u64
}

/// Upper bound on the process-group header size.
pub fn pg_header_overhead(group: &str, time_index_name: &str) -> u64 {
    (64 + group.len() + time_index_name.len()) as u64
}

/// Upper bound on one attribute record.
pub fn attr_record_overhead(name: &str, path: &str, value_len: usize) -> u64 {
    (64 + name.len() + path.len() + value_len) as u64
}
