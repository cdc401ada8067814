// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Read side of the container: trailer, indexes, metadata queries, and
//! bounded-box / per-block data reads.
//!
//! The reader works from the footer indexes alone; process groups are only
//! parsed on demand (or by tests verifying index coverage). Bounded-box
//! reads assemble the request from every intersecting block via a strided
//! n-dimensional copy.

use std::path::Path;

use strata_core::{DataType, ErrorKind, StatFlags, StrataError};

use crate::index::{CharSet, IndexEntry, MergedIndex, PgIndexEntry, decode_pg_index};
use crate::minifooter::{MINIFOOTER_LEN, Minifooter};
use crate::record::{PgParsed, charkind, parse_pg};
use crate::wire::Endian;

/// Per-component statistics recovered from the index, merged across every
/// process group the variable appeared in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatSummary {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub sum_sq: f64,
    pub count: u64,
}

/// Metadata answer for one variable.
#[derive(Clone, Debug)]
pub struct VarInfo {
    pub group: String,
    pub name: String,
    pub path: String,
    pub dtype: DataType,
    pub ndims: usize,
    /// Global extents from the first block; local extents when the
    /// variable has no global decomposition.
    pub dims: Vec<u64>,
    pub steps: Vec<u32>,
    pub blocks: usize,
    pub stat_flags: Option<StatFlags>,
    pub stats: Option<Vec<StatSummary>>,
}

/// An open container.
pub struct ContainerReader {
    data: Vec<u8>,
    footer: Minifooter,
    endian: Endian,
    pg_index: Vec<PgIndexEntry>,
    vars: MergedIndex,
    attrs: MergedIndex,
}

fn invalid(msg: impl Into<String>) -> StrataError {
    StrataError::record(ErrorKind::InvalidData, msg)
}

impl ContainerReader {
    pub fn open(path: impl AsRef<Path>) -> Result<ContainerReader, StrataError> {
        let data = std::fs::read(path.as_ref()).map_err(|err| {
            StrataError::record(
                ErrorKind::InvalidFilePointer,
                format!("cannot open container {}: {err}", path.as_ref().display()),
            )
        })?;
        ContainerReader::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<ContainerReader, StrataError> {
        if data.len() < MINIFOOTER_LEN {
            return Err(invalid("file shorter than the container trailer"));
        }
        let footer = Minifooter::decode(&data[data.len() - MINIFOOTER_LEN..])?;
        let endian = footer.endian;
        let check = |offset: u64| -> Result<usize, StrataError> {
            usize::try_from(offset)
                .ok()
                .filter(|&o| o <= data.len())
                .ok_or_else(|| invalid("index offset beyond end of file"))
        };
        let vars_at = check(footer.vars_index_offset)?;
        let attrs_at = check(footer.attrs_index_offset)?;
        let pgs_at = check(footer.pg_index_offset)?;
        // file_size is only written when known at close; zero is fine, a
        // disagreement means the container was truncated or appended to
        // without its trailer being rewritten.
        if footer.file_size != 0 && footer.file_size != data.len() as u64 {
            tracing::warn!(
                recorded = footer.file_size,
                actual = data.len(),
                "container size disagrees with its trailer"
            );
        }
        let vars = MergedIndex::decode(&data[vars_at..], endian)?;
        let attrs = MergedIndex::decode(&data[attrs_at..], endian)?;
        let pg_index = decode_pg_index(&data[pgs_at..], endian)?;
        tracing::debug!(
            groups = pg_index.len(),
            vars = vars.entries().len(),
            attrs = attrs.entries().len(),
            "container opened"
        );
        Ok(ContainerReader {
            data,
            footer,
            endian,
            pg_index,
            vars,
            attrs,
        })
    }

    pub fn footer(&self) -> &Minifooter {
        &self.footer
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn pg_index(&self) -> &[PgIndexEntry] {
        &self.pg_index
    }

    /// Distinct group names in first-appearance order.
    pub fn group_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for entry in self.vars.entries().iter().chain(self.attrs.entries()) {
            if !names.contains(&entry.group.as_str()) {
                names.push(&entry.group);
            }
        }
        names
    }

    pub fn var_names(&self) -> Vec<&str> {
        self.vars.entries().iter().map(|e| e.name.as_str()).collect()
    }

    pub fn attr_names(&self) -> Vec<&str> {
        self.attrs.entries().iter().map(|e| e.name.as_str()).collect()
    }

    pub fn var_entry(&self, name: &str) -> Result<&IndexEntry, StrataError> {
        self.vars.find_named(name).ok_or_else(|| {
            StrataError::record(ErrorKind::InvalidVarname, format!("no variable `{name}`"))
        })
    }

    /// Variable lookup by position in the index, mirroring lookup by name.
    pub fn var_entry_by_id(&self, id: usize) -> Result<&IndexEntry, StrataError> {
        self.vars.entries().get(id).ok_or_else(|| {
            StrataError::record(ErrorKind::InvalidVarid, format!("no variable index {id}"))
        })
    }

    /// Steps the variable appears in, ascending and deduplicated.
    pub fn steps(&self, name: &str) -> Result<Vec<u32>, StrataError> {
        let entry = self.var_entry(name)?;
        let mut steps: Vec<u32> = entry.sets.iter().map(|s| s.time_index).collect();
        steps.sort_unstable();
        steps.dedup();
        Ok(steps)
    }

    pub fn var_info(&self, name: &str) -> Result<VarInfo, StrataError> {
        let entry = self.var_entry(name)?;
        let first = entry
            .sets
            .first()
            .ok_or_else(|| invalid(format!("variable `{name}` has no blocks")))?;
        let axes = first.axes(self.endian).unwrap_or_default();
        let dims = axes
            .iter()
            .map(|a| if a.global > 0 { a.global } else { a.local })
            .collect();
        let steps = self.steps(name)?;

        let stat_flags = first
            .stat_bitmap()
            .map(StatFlags::from_bits_truncate);
        let stats = stat_flags.and_then(|flags| self.merged_stats(entry, flags));

        Ok(VarInfo {
            group: entry.group.clone(),
            name: entry.name.clone(),
            path: entry.path.clone(),
            dtype: entry.dtype,
            ndims: axes.len(),
            dims,
            steps,
            blocks: entry.sets.len(),
            stat_flags,
            stats,
        })
    }

    fn merged_stats(&self, entry: &IndexEntry, flags: StatFlags) -> Option<Vec<StatSummary>> {
        if !flags.intersects(StatFlags::MIN | StatFlags::MAX | StatFlags::SUM) {
            return None;
        }
        let components = entry
            .sets
            .first()?
            .stat_f64s(charkind::MIN, self.endian)?
            .len();
        let mut merged = vec![
            StatSummary {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                sum: 0.0,
                sum_sq: 0.0,
                count: 0,
            };
            components
        ];
        for set in &entry.sets {
            let mins = set.stat_f64s(charkind::MIN, self.endian)?;
            let maxs = set.stat_f64s(charkind::MAX, self.endian)?;
            let sums = set.stat_f64s(charkind::SUM, self.endian)?;
            let sq = set.stat_f64s(charkind::SUM_SQ, self.endian);
            let count = set.element_count(self.endian).unwrap_or(0);
            for (c, slot) in merged.iter_mut().enumerate() {
                slot.min = slot.min.min(*mins.get(c)?);
                slot.max = slot.max.max(*maxs.get(c)?);
                slot.sum += *sums.get(c)?;
                if let Some(sq) = &sq {
                    slot.sum_sq += *sq.get(c)?;
                }
                slot.count += count;
            }
        }
        Some(merged)
    }

    /// Attribute value: inline bytes, or the value the referenced variable
    /// had when the group was closed.
    pub fn attr_value(&self, name: &str) -> Result<(DataType, Vec<u8>), StrataError> {
        let entry = self.attrs.find_named(name).ok_or_else(|| {
            StrataError::record(ErrorKind::InvalidVarname, format!("no attribute `{name}`"))
        })?;
        let set = entry
            .sets
            .first()
            .ok_or_else(|| invalid(format!("attribute `{name}` has no record")))?;
        match set.value() {
            Some(bytes) => Ok((entry.dtype, bytes.to_vec())),
            None => Err(invalid(format!(
                "attribute `{name}` references a variable that was never written"
            ))),
        }
    }

    /// Parse the process group behind an index entry, for consumers that
    /// need the full records (and for index-coverage verification).
    pub fn parse_pg_at(&self, entry: &PgIndexEntry) -> Result<PgParsed, StrataError> {
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        let slice = self
            .data
            .get(start..end)
            .ok_or_else(|| invalid("process group outside file bounds"))?;
        parse_pg(slice, self.endian)
    }

    fn block_payload<'a>(&'a self, set: &'a CharSet, elem_size: u64) -> Result<&'a [u8], StrataError> {
        if let Some(value) = set.value() {
            // Scalars and strings are served from the inline value.
            return Ok(value);
        }
        let axes = set.axes(self.endian).unwrap_or_default();
        let elements: u64 = axes.iter().map(|a| a.local.max(1)).product::<u64>().max(1);
        let len = elements * elem_size;
        let offset = set
            .payload_offset(self.endian)
            .ok_or_else(|| invalid("block has no offset characteristic"))?;
        let start = (set.pg_offset + offset) as usize;
        let end = start + len as usize;
        self.data
            .get(start..end)
            .ok_or_else(|| invalid("block payload outside file bounds"))
    }

    /// Read one block of a variable verbatim: the `block`-th process group
    /// contribution at `step`.
    pub fn read_block(&self, name: &str, step: u32, block: usize) -> Result<Vec<u8>, StrataError> {
        let entry = self.var_entry(name)?;
        let elem_size = entry.dtype.fixed_size().unwrap_or(1) as u64;
        let set = entry
            .sets
            .iter()
            .filter(|s| s.time_index == step)
            .nth(block)
            .ok_or_else(|| {
                StrataError::record(
                    ErrorKind::OutOfBound,
                    format!("variable `{name}` has no block {block} at step {step}"),
                )
            })?;
        Ok(self.block_payload(set, elem_size)?.to_vec())
    }

    /// Bounded-box read: assemble `count` elements starting at `start`
    /// (global coordinates) for `step`, gathering from every intersecting
    /// block.
    pub fn read_box(
        &self,
        name: &str,
        start: &[u64],
        count: &[u64],
        step: u32,
    ) -> Result<Vec<u8>, StrataError> {
        let entry = self.var_entry(name)?;
        let elem_size = entry.dtype.fixed_size().ok_or_else(|| {
            StrataError::record(
                ErrorKind::InvalidData,
                "bounded-box reads are not defined for string variables",
            )
        })? as u64;

        let sets: Vec<&CharSet> = entry
            .sets
            .iter()
            .filter(|s| s.time_index == step)
            .collect();
        if sets.is_empty() {
            return Err(StrataError::record(
                ErrorKind::OutOfBound,
                format!("variable `{name}` has no data at step {step}"),
            ));
        }

        let first_axes = sets[0].axes(self.endian).unwrap_or_default();
        if first_axes.is_empty() {
            // Scalar: the box is the value.
            return Ok(self.block_payload(sets[0], elem_size)?.to_vec());
        }
        let ndims = first_axes.len();
        if start.len() != ndims || count.len() != ndims {
            return Err(StrataError::record(
                ErrorKind::InvalidDimension,
                format!("selection rank {} does not match variable rank {ndims}", start.len()),
            ));
        }
        let global: Vec<u64> = first_axes
            .iter()
            .map(|a| if a.global > 0 { a.global } else { a.local })
            .collect();
        for d in 0..ndims {
            if start[d] + count[d] > global[d] {
                return Err(StrataError::record(
                    ErrorKind::OutOfBound,
                    format!(
                        "selection [{}, {}) exceeds extent {} on axis {d}",
                        start[d],
                        start[d] + count[d],
                        global[d]
                    ),
                ));
            }
        }

        let total: u64 = count.iter().product();
        let mut out = vec![0u8; (total * elem_size) as usize];

        for set in sets {
            let axes = set.axes(self.endian).unwrap_or_default();
            let payload = self.block_payload(set, elem_size)?;
            copy_intersection(
                &axes.iter().map(|a| a.local).collect::<Vec<_>>(),
                &axes.iter().map(|a| a.offset).collect::<Vec<_>>(),
                payload,
                start,
                count,
                &mut out,
                elem_size as usize,
            );
        }
        Ok(out)
    }
}

/// Copy the intersection of one block (`local` extents at `offset`) into
/// the selection (`sel_start`, `sel_count`), both row-major.
fn copy_intersection(
    local: &[u64],
    offset: &[u64],
    payload: &[u8],
    sel_start: &[u64],
    sel_count: &[u64],
    out: &mut [u8],
    elem_size: usize,
) {
    let ndims = local.len();
    // Intersection bounds per axis, in global coordinates.
    let mut lo = vec![0u64; ndims];
    let mut hi = vec![0u64; ndims];
    for d in 0..ndims {
        lo[d] = offset[d].max(sel_start[d]);
        hi[d] = (offset[d] + local[d]).min(sel_start[d] + sel_count[d]);
        if lo[d] >= hi[d] {
            return; // no overlap
        }
    }

    // Row-major strides, in elements.
    let stride = |dims: &[u64]| -> Vec<u64> {
        let mut s = vec![1u64; ndims];
        for d in (0..ndims.saturating_sub(1)).rev() {
            s[d] = s[d + 1] * dims[d + 1];
        }
        s
    };
    let src_stride = stride(local);
    let dst_stride = stride(sel_count);

    // Walk every run of the innermost axis.
    let run = (hi[ndims - 1] - lo[ndims - 1]) as usize;
    let mut coord = lo.clone();
    loop {
        let mut src_idx = 0u64;
        let mut dst_idx = 0u64;
        for d in 0..ndims {
            src_idx += (coord[d] - offset[d]) * src_stride[d];
            dst_idx += (coord[d] - sel_start[d]) * dst_stride[d];
        }
        let src = src_idx as usize * elem_size;
        let dst = dst_idx as usize * elem_size;
        let bytes = run * elem_size;
        if src + bytes <= payload.len() && dst + bytes <= out.len() {
            out[dst..dst + bytes].copy_from_slice(&payload[src..src + bytes]);
        }

        // Advance the odometer over every axis but the innermost.
        let mut d = ndims.wrapping_sub(2);
        loop {
            if d == usize::MAX {
                return;
            }
            coord[d] += 1;
            if coord[d] < hi[d] {
                break;
            }
            coord[d] = lo[d];
            d = d.wrapping_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_1d_intersection() {
        // Block [5..10) of a global [0..10), selection [3..8).
        let payload: Vec<u8> = (5u8..10).collect();
        let mut out = vec![0u8; 5];
        copy_intersection(&[5], &[5], &payload, &[3], &[5], &mut out, 1);
        assert_eq!(out, [0, 0, 5, 6, 7]);
    }

    #[test]
    fn copies_2d_intersection() {
        // 2x3 block at offset (1, 0) of a 3x3 global; select the full 3x3.
        let payload: Vec<u8> = vec![10, 11, 12, 20, 21, 22];
        let mut out = vec![0u8; 9];
        copy_intersection(&[2, 3], &[1, 0], &payload, &[0, 0], &[3, 3], &mut out, 1);
        assert_eq!(out, [0, 0, 0, 10, 11, 12, 20, 21, 22]);
    }

    #[test]
    fn disjoint_blocks_copy_nothing() {
        let payload = vec![1u8; 4];
        let mut out = vec![0u8; 4];
        copy_intersection(&[4], &[8], &payload, &[0], &[4], &mut out, 1);
        assert_eq!(out, [0; 4]);
    }
}
