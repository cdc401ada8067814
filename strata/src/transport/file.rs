// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! File transport: the rank-0 collective rendezvous.
//!
//! Every rank assembles its process group locally; at close the transport
//! runs a two-phase collective. Phase one gathers each rank's group length
//! at rank 0, which computes prefix offsets and scatters each rank its
//! absolute file position. Phase two writes the group bytes, either by
//! every rank (collective aggregation) or through every k-th rank
//! (aggregator writers). Rank 0 finally merges the per-rank index
//! contributions with whatever the file already held and appends the three
//! indexes and the trailer. Groups land in the file sorted by
//! `(time_index, process_id)`.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_container::{
    ByteReader, ByteWriter, Endian, FooterFlags, IndexEntry, MINIFOOTER_LEN, MergedIndex,
    Minifooter, PgIndexEntry, attr_index_set, decode_pg_index, encode_pg_index, index_set_for,
};
use strata_core::{ErrorKind, StrataError};

use crate::comm::{Comm, TAG_USER};
use crate::config::Params;
use crate::transport::{OpenMode, StepPayload, Transport};

const TAG_PG_FORWARD: u8 = TAG_USER;

/// Who writes process-group bytes into the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregation {
    /// Every rank writes its own group at its scattered offset.
    Collective,
    /// Every k-th rank collects its sub-group's bytes and writes them.
    Aggregator(usize),
}

/// What to do when a rank signals failure into the collective.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Abort,
    /// Write the surviving groups and set the partial-step flag.
    Partial,
}

/// See the module docs.
pub struct FileTransport {
    base_path: PathBuf,
    aggregation: Aggregation,
    on_failure: FailurePolicy,
}

// Existing container state loaded by rank 0 before appending.
struct Existing {
    /// End of the process-group region (== vars index offset).
    data_end: u64,
    vars: MergedIndex,
    attrs: MergedIndex,
    pg_entries: Vec<PgIndexEntry>,
    flags: FooterFlags,
}

impl FileTransport {
    pub fn new(params: &Params, base_path: &str) -> Result<FileTransport, StrataError> {
        params.warn_unknown("file", &["aggregation", "on_failure"]);
        let aggregation = match params.get("aggregation") {
            None | Some("collective") => Aggregation::Collective,
            Some(text) => {
                let inner = text
                    .strip_prefix("aggregator(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| {
                        StrataError::record(
                            ErrorKind::InvalidData,
                            format!("bad aggregation `{text}`"),
                        )
                    })?;
                let k: usize = inner.parse().map_err(|_| {
                    StrataError::record(
                        ErrorKind::InvalidData,
                        format!("bad aggregator count `{inner}`"),
                    )
                })?;
                if k == 0 {
                    return Err(StrataError::record(
                        ErrorKind::InvalidData,
                        "aggregator count must be positive",
                    ));
                }
                Aggregation::Aggregator(k)
            }
        };
        let on_failure = match params.get("on_failure") {
            None | Some("abort") => FailurePolicy::Abort,
            Some("partial") => FailurePolicy::Partial,
            Some(other) => {
                return Err(StrataError::record(
                    ErrorKind::InvalidData,
                    format!("bad failure policy `{other}`"),
                ));
            }
        };
        Ok(FileTransport {
            base_path: PathBuf::from(base_path),
            aggregation,
            on_failure,
        })
    }

    fn target(&self, file: &str) -> PathBuf {
        self.base_path.join(file)
    }
}

fn read_existing(path: &Path) -> Result<Option<Existing>, StrataError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(StrataError::record(
                ErrorKind::InvalidFilePointer,
                format!("cannot read {}: {err}", path.display()),
            ));
        }
    };
    if data.len() < MINIFOOTER_LEN {
        return Ok(None);
    }
    let footer = Minifooter::decode(&data[data.len() - MINIFOOTER_LEN..])?;
    let endian = footer.endian;
    let vars_at = footer.vars_index_offset as usize;
    let attrs_at = footer.attrs_index_offset as usize;
    let pgs_at = footer.pg_index_offset as usize;
    if vars_at > data.len() || attrs_at > data.len() || pgs_at > data.len() {
        return Err(StrataError::record(
            ErrorKind::InvalidData,
            "existing container has index offsets beyond end of file",
        ));
    }
    Ok(Some(Existing {
        data_end: footer.vars_index_offset,
        vars: MergedIndex::decode(&data[vars_at..], endian)?,
        attrs: MergedIndex::decode(&data[attrs_at..], endian)?,
        pg_entries: decode_pg_index(&data[pgs_at..], endian)?,
        flags: footer.flags,
    }))
}

fn write_all_at(file: &mut File, offset: u64, bytes: &[u8]) -> Result<(), StrataError> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    Ok(())
}

/// Per-rank index contribution shipped to rank 0 in phase three.
fn encode_contribution(step: &StepPayload<'_>, rank: u32, offset: u64, pg_len: u64) -> Vec<u8> {
    let mut vars = MergedIndex::new();
    for var in step.vars {
        vars.merge(IndexEntry {
            group: step.group.to_string(),
            name: var.rec.name.to_string(),
            path: var.rec.path.to_string(),
            dtype: var.rec.dtype,
            sets: vec![index_set_for(
                &var.rec,
                step.time_index,
                rank,
                offset,
                var.payload_offset,
            )],
        });
    }
    let mut attrs = MergedIndex::new();
    for attr in step.attrs {
        attrs.merge(IndexEntry {
            group: step.group.to_string(),
            name: attr.rec.name.to_string(),
            path: attr.rec.path.to_string(),
            dtype: attr.rec.dtype,
            sets: vec![attr_index_set(
                &attr.rec,
                attr.resolved.as_deref(),
                step.time_index,
                rank,
                offset,
            )],
        });
    }

    let vars_bytes = vars.encode();
    let attrs_bytes = attrs.encode();
    let mut w = ByteWriter::new();
    w.u32(rank);
    w.u32(step.time_index);
    w.u64(offset);
    w.u64(pg_len);
    w.u64(vars_bytes.len() as u64);
    w.bytes(&vars_bytes);
    w.u64(attrs_bytes.len() as u64);
    w.bytes(&attrs_bytes);
    w.into_vec()
}

struct Contribution {
    entry: PgIndexEntry,
    vars: MergedIndex,
    attrs: MergedIndex,
}

fn decode_contribution(bytes: &[u8]) -> Result<Option<Contribution>, StrataError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let endian = Endian::native();
    let mut r = ByteReader::new(bytes, endian);
    let process_id = r.u32()?;
    let time_index = r.u32()?;
    let offset = r.u64()?;
    let length = r.u64()?;
    let vars_len = r.u64()? as usize;
    let vars = MergedIndex::decode(r.bytes(vars_len)?, endian)?;
    let attrs_len = r.u64()? as usize;
    let attrs = MergedIndex::decode(r.bytes(attrs_len)?, endian)?;
    Ok(Some(Contribution {
        entry: PgIndexEntry {
            process_id,
            time_index,
            offset,
            length,
        },
        vars,
        attrs,
    }))
}

// Phase-one plan broadcast from rank 0: abort, write, or the untouched
// zero-write append.
const PLAN_WRITE: u64 = 0;
const PLAN_ABORT: u64 = 1;
const PLAN_UNTOUCHED: u64 = 2;

impl Transport for FileTransport {
    fn name(&self) -> &'static str {
        "file"
    }

    fn is_collective(&self) -> bool {
        true
    }

    fn begin_step(
        &mut self,
        file: &str,
        mode: OpenMode,
        comm: &Arc<dyn Comm>,
    ) -> Result<Option<u32>, StrataError> {
        match mode {
            OpenMode::Write => Ok(Some(0)),
            OpenMode::Read => Ok(None),
            OpenMode::Append => {
                let next = if comm.rank() == 0 {
                    let next = match read_existing(&self.target(file))? {
                        Some(existing) => existing
                            .pg_entries
                            .iter()
                            .map(|e| e.time_index + 1)
                            .max()
                            .unwrap_or(0),
                        None => 0,
                    };
                    comm.broadcast_u64(0, Some(next as u64))?
                } else {
                    comm.broadcast_u64(0, None)?
                };
                Ok(Some(next as u32))
            }
        }
    }

    fn close_step(&mut self, step: &StepPayload<'_>) -> Result<(), StrataError> {
        let comm = step.comm;
        let rank = comm.rank();
        let size = comm.size();
        let path = self.target(step.file);

        // Phase 1: report status and length, receive the plan and offset.
        let pg_len = step.pg.map(|pg| pg.len() as u64).unwrap_or(0);
        let mut report = ByteWriter::new();
        report.u8(step.failed as u8);
        report.u64(pg_len);
        let gathered = comm.gather(0, report.as_slice())?;

        let mut root = None;
        let plan;
        let my_offset;
        if let Some(reports) = gathered {
            let mut statuses = Vec::with_capacity(size);
            for bytes in &reports {
                let mut r = ByteReader::new(bytes, Endian::native());
                let failed = r.u8()? != 0;
                let len = r.u64()?;
                statuses.push((failed, len));
            }
            let any_failed = statuses.iter().any(|(failed, _)| *failed);
            let any_data = statuses.iter().any(|(failed, len)| !*failed && *len > 0);

            let existing = if step.mode == OpenMode::Append {
                read_existing(&path)?
            } else {
                None
            };

            plan = if any_failed && self.on_failure == FailurePolicy::Abort {
                PLAN_ABORT
            } else if !any_data && existing.is_some() {
                PLAN_UNTOUCHED
            } else {
                PLAN_WRITE
            };
            comm.broadcast_u64(0, Some(plan))?;

            if plan == PLAN_ABORT {
                my_offset = u64::MAX;
            } else {
                let base = existing.as_ref().map(|e| e.data_end).unwrap_or(0);
                let mut offsets = vec![u64::MAX; size];
                let mut cursor = base;
                for (r, (failed, len)) in statuses.iter().enumerate() {
                    if !*failed && *len > 0 {
                        offsets[r] = cursor;
                        cursor += len;
                    }
                }
                my_offset = comm.scatter_u64(0, Some(&offsets))?;
                root = Some((statuses, existing, cursor));
            }
        } else {
            plan = comm.broadcast_u64(0, None)?;
            my_offset = if plan == PLAN_ABORT {
                u64::MAX
            } else {
                comm.scatter_u64(0, None)?
            };
        }

        if plan == PLAN_ABORT {
            return Err(StrataError::record(
                ErrorKind::TransportFailure,
                "a rank failed to produce its process group, step aborted",
            ));
        }

        if plan == PLAN_UNTOUCHED {
            comm.barrier()?;
            return Ok(());
        }

        // Phase 2: write process-group bytes.
        if rank == 0 {
            let mut open = OpenOptions::new();
            open.write(true).create(true);
            if step.mode == OpenMode::Write {
                open.truncate(true);
            }
            open.open(&path).map_err(|err| {
                StrataError::record(
                    ErrorKind::InvalidFilePointer,
                    format!("cannot open {}: {err}", path.display()),
                )
            })?;
        }
        comm.barrier()?;

        match self.aggregation {
            Aggregation::Collective => {
                if let (Some(pg), true) = (step.pg, my_offset != u64::MAX) {
                    let mut file = OpenOptions::new().write(true).open(&path)?;
                    write_all_at(&mut file, my_offset, pg)?;
                }
            }
            Aggregation::Aggregator(k) => {
                let aggregator = rank - rank % k;
                if rank == aggregator {
                    let mut file = OpenOptions::new().write(true).open(&path)?;
                    if let (Some(pg), true) = (step.pg, my_offset != u64::MAX) {
                        write_all_at(&mut file, my_offset, pg)?;
                    }
                    for member in rank + 1..(rank + k).min(size) {
                        let packet = comm.recv(member, TAG_PG_FORWARD)?;
                        let mut r = ByteReader::new(&packet, Endian::native());
                        let offset = r.u64()?;
                        let len = r.u64()? as usize;
                        if offset != u64::MAX && len > 0 {
                            let bytes = r.bytes(len)?;
                            write_all_at(&mut file, offset, bytes)?;
                        }
                    }
                } else {
                    let mut w = ByteWriter::new();
                    w.u64(my_offset);
                    let pg = if my_offset != u64::MAX { step.pg } else { None };
                    let pg = pg.unwrap_or(&[]);
                    w.u64(pg.len() as u64);
                    w.bytes(pg);
                    comm.send(aggregator, TAG_PG_FORWARD, w.as_slice())?;
                }
            }
        }
        comm.barrier()?;

        // Phase 3: merge index contributions at rank 0.
        let contribution = if step.pg.is_some() && !step.failed && my_offset != u64::MAX {
            encode_contribution(step, rank as u32, my_offset, pg_len)
        } else {
            Vec::new()
        };
        let gathered = comm.gather(0, &contribution)?;

        if let (Some(contribs), Some((statuses, existing, data_end))) = (gathered, root) {
            let (mut vars, mut attrs, mut pg_entries, old_flags) = match existing {
                Some(existing) => (
                    existing.vars,
                    existing.attrs,
                    existing.pg_entries,
                    existing.flags,
                ),
                None => (
                    MergedIndex::new(),
                    MergedIndex::new(),
                    Vec::new(),
                    FooterFlags::empty(),
                ),
            };
            for bytes in &contribs {
                if let Some(contrib) = decode_contribution(bytes)? {
                    pg_entries.push(contrib.entry);
                    vars.merge_all(contrib.vars);
                    attrs.merge_all(contrib.attrs);
                }
            }
            let mut flags = old_flags;
            if statuses.iter().any(|(failed, _)| *failed) {
                flags |= FooterFlags::PARTIAL_STEP;
            }

            let vars_bytes = vars.encode();
            let attrs_bytes = attrs.encode();
            let pg_bytes = encode_pg_index(&mut pg_entries);

            let vars_at = data_end;
            let attrs_at = vars_at + vars_bytes.len() as u64;
            let pgs_at = attrs_at + attrs_bytes.len() as u64;
            let footer_at = pgs_at + pg_bytes.len() as u64;
            let file_size = footer_at + MINIFOOTER_LEN as u64;
            let footer = Minifooter::new(pgs_at, vars_at, attrs_at, flags, file_size);

            let mut file = OpenOptions::new().write(true).open(&path)?;
            write_all_at(&mut file, vars_at, &vars_bytes)?;
            write_all_at(&mut file, attrs_at, &attrs_bytes)?;
            write_all_at(&mut file, pgs_at, &pg_bytes)?;
            write_all_at(&mut file, footer_at, &footer.encode())?;
            file.set_len(file_size)?;
            file.sync_all()?;
            tracing::info!(
                path = %path.display(),
                groups = pg_entries.len(),
                bytes = file_size,
                "container step committed"
            );
        }
        comm.barrier()?;
        Ok(())
    }
}
