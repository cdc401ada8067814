// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-open write pipeline: `open → group_size → write* → close`.
//!
//! A [`FileHandle`] is a single-producer session over one group and one
//! target. Array payloads are borrowed for the life of the handle (the
//! `'data` lifetime) and only serialized into the arena at close; scalars
//! and strings are copied immediately because callers routinely rebind
//! them. Close assembles the process group, hands it to every transport
//! bound to the group, and only then lets the arena reuse the space.

use std::sync::Arc;

use strata_container::{
    AttrPayload, AttrWrite, ContainerReader, PgHeader, VarWrite, attr_record_overhead, encode_pg,
    pg_header_overhead, var_record_overhead,
};
use strata_core::{
    AllocateWhen, AttrValue, Axes, BufferArena, Element, ErrorKind, Group, Payload, Reserve,
    SpillBuffer, StatFlags, StatsSet, StrataError, WrittenLog, WrittenVar, bytes_of, resolve_dims,
};

use crate::comm::Comm;
use crate::transport::{OpenMode, StepAttr, StepPayload, StepVar, Transport};

/// Session state machine. A handle is born `Opened`; `Fresh` is the
/// pre-open world that has no handle to speak of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Opened,
    Sized,
    Writing,
    Closed,
}

enum ReservedSpace {
    Arena { offset: u64, size: u64 },
    Spill { buffer: SpillBuffer, size: u64 },
}

/// An open session. See the module docs.
pub struct FileHandle<'a> {
    group: &'a mut Group,
    transports: &'a mut Vec<Box<dyn Transport>>,
    arena: &'a mut BufferArena,
    comm: Arc<dyn Comm>,
    file: String,
    mode: OpenMode,
    state: SessionState,
    time_index: u32,
    reservation: Option<ReservedSpace>,
    /// Deferred buffer-overflow failure from `group_size`; surfaces at
    /// close so the collective can still run.
    overflow: Option<StrataError>,
    log: WrittenLog<'a>,
    reader: Option<ContainerReader>,
}

impl<'a> FileHandle<'a> {
    pub(crate) fn open(
        group: &'a mut Group,
        transports: &'a mut Vec<Box<dyn Transport>>,
        arena: &'a mut BufferArena,
        comm: Arc<dyn Comm>,
        file: &str,
        mode: OpenMode,
    ) -> Result<FileHandle<'a>, StrataError> {
        arena.reached(AllocateWhen::BeforeOpen)?;

        let mut time_index = match mode {
            OpenMode::Write => 0,
            OpenMode::Append | OpenMode::Read => group.time_index(),
        };
        for transport in transports.iter_mut() {
            if let Some(step) = transport.begin_step(file, mode, &comm)? {
                time_index = time_index.max(step);
            }
        }
        group.set_time_index(time_index.saturating_add(1));

        let reader = if mode == OpenMode::Read {
            Some(ContainerReader::open(file)?)
        } else {
            None
        };

        arena.reached(AllocateWhen::AfterOpen)?;
        tracing::debug!(group = group.name(), file, ?mode, time_index, "session opened");
        Ok(FileHandle {
            group,
            transports,
            arena,
            comm,
            file: file.to_string(),
            mode,
            state: SessionState::Opened,
            time_index,
            reservation: None,
            overflow: None,
            log: WrittenLog::new(),
            reader,
        })
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn time_index(&self) -> u32 {
        self.time_index
    }

    /// The reader behind a read-mode handle.
    pub fn reader(&self) -> Option<&ContainerReader> {
        self.reader.as_ref()
    }

    /// Declare this step's payload size and reserve buffer space for it.
    /// Returns the step's total bytes: summed across the communicator when
    /// any bound transport is collective, local otherwise.
    pub fn group_size(&mut self, declared_bytes: u64) -> Result<u64, StrataError> {
        if self.mode == OpenMode::Read {
            return Err(StrataError::record(
                ErrorKind::InvalidFileMode,
                "group_size is meaningless on a read-mode handle",
            ));
        }
        if self.state != SessionState::Opened {
            return Err(StrataError::record(
                ErrorKind::InvalidFileMode,
                "group_size must be the first call after open",
            ));
        }

        let overhead = metadata_overhead(self.group);
        let local = declared_bytes + overhead;
        match self.arena.reserve(local) {
            Ok(Reserve::Arena(offset)) => {
                self.reservation = Some(ReservedSpace::Arena {
                    offset,
                    size: local,
                });
            }
            Ok(Reserve::Spill(buffer)) => {
                self.reservation = Some(ReservedSpace::Spill {
                    buffer,
                    size: local,
                });
            }
            Err(err) if err.kind() == ErrorKind::BufferOverflow => {
                // The step is doomed, but the failure must travel through
                // close so collective peers are not left hanging.
                self.overflow = Some(err);
            }
            Err(err) => return Err(err),
        }

        let total = if self.transports.iter().any(|t| t.is_collective()) {
            self.comm.allreduce_sum_u64(local)?
        } else {
            local
        };
        self.state = SessionState::Sized;
        Ok(total)
    }

    fn lookup(&self, name: &str) -> Result<strata_core::VarId, StrataError> {
        self.group.find_var_id("", name).ok_or_else(|| {
            StrataError::record(
                ErrorKind::InvalidVarname,
                format!("no variable `{name}` in group `{}`", self.group.name()),
            )
        })
    }

    /// Write a typed payload: a single element for scalar variables, the
    /// full local block for arrays. Array memory is borrowed until close.
    pub fn write<T: Element>(&mut self, name: &str, data: &'a [T]) -> Result<(), StrataError> {
        let id = self.lookup(name)?;
        let (dtype, is_scalar, is_dim, dims, breaks) = {
            let var = self.group.var_by_id(id).expect("id from lookup");
            (
                var.dtype,
                var.is_scalar(),
                var.is_dim,
                var.dims.clone(),
                var.hist_breaks.clone(),
            )
        };

        if self.mode == OpenMode::Read {
            // Read-open handles may only set dimension scalars (and the
            // communicator descriptor) to steer chunked reads.
            let allowed = is_dim || Some(name) == self.group.comm_descriptor();
            if !allowed {
                return Err(StrataError::record(
                    ErrorKind::InvalidFileMode,
                    format!("cannot write `{name}` on a read-mode handle"),
                ));
            }
            if data.len() != 1 {
                return Err(StrataError::record(
                    ErrorKind::InvalidData,
                    format!("dimension scalar `{name}` expects exactly one value"),
                ));
            }
            return self
                .group
                .set_scalar_value(id, bytes_of(data).to_vec());
        }

        if !matches!(self.state, SessionState::Sized | SessionState::Writing) {
            return Err(StrataError::record(
                ErrorKind::InvalidFileMode,
                "write requires group_size first",
            ));
        }
        if T::DTYPE != dtype {
            return Err(StrataError::record(
                ErrorKind::InvalidData,
                format!("variable `{name}` is {dtype:?}, payload is {:?}", T::DTYPE),
            ));
        }

        let (axes, payload) = if is_scalar {
            if data.len() != 1 {
                return Err(StrataError::record(
                    ErrorKind::InvalidData,
                    format!("scalar `{name}` written with {} values", data.len()),
                ));
            }
            let bytes = bytes_of(data).to_vec();
            self.group.set_scalar_value(id, bytes.clone())?;
            (Axes::new(), Payload::Owned(bytes))
        } else {
            let (axes, elements) = resolve_dims(&dims, self.group, self.time_index)?;
            if data.len() as u64 != elements {
                return Err(StrataError::record(
                    ErrorKind::InvalidData,
                    format!(
                        "variable `{name}` resolves to {elements} elements, payload has {}",
                        data.len()
                    ),
                ));
            }
            (axes, Payload::Borrowed(bytes_of(data)))
        };

        let stats = if self.group.stats_enabled() && dtype.is_numeric() {
            let mut flags = StatFlags::basic();
            if breaks.is_some() {
                flags |= StatFlags::HIST;
            }
            let mut stats = StatsSet::new(flags, dtype.stat_components(), breaks.as_deref());
            for value in data {
                value.observe(&mut stats);
            }
            Some(stats)
        } else {
            None
        };

        self.log.record(WrittenVar {
            id,
            axes,
            payload,
            stats,
            write_offset: 0,
        });
        self.state = SessionState::Writing;
        Ok(())
    }

    /// Write a scalar by value. Scalars are copied into the session, so no
    /// borrow outlives this call.
    pub fn write_scalar<T: Element>(&mut self, name: &str, value: T) -> Result<(), StrataError> {
        let id = self.lookup(name)?;
        let (dtype, is_scalar, is_dim) = {
            let var = self.group.var_by_id(id).expect("id from lookup");
            (var.dtype, var.is_scalar(), var.is_dim)
        };
        let data = [value];
        let bytes = bytes_of(&data).to_vec();

        if self.mode == OpenMode::Read {
            let allowed = is_dim || Some(name) == self.group.comm_descriptor();
            if !allowed {
                return Err(StrataError::record(
                    ErrorKind::InvalidFileMode,
                    format!("cannot write `{name}` on a read-mode handle"),
                ));
            }
            return self.group.set_scalar_value(id, bytes);
        }
        if !matches!(self.state, SessionState::Sized | SessionState::Writing) {
            return Err(StrataError::record(
                ErrorKind::InvalidFileMode,
                "write requires group_size first",
            ));
        }
        if T::DTYPE != dtype {
            return Err(StrataError::record(
                ErrorKind::InvalidData,
                format!("variable `{name}` is {dtype:?}, payload is {:?}", T::DTYPE),
            ));
        }
        if !is_scalar {
            return Err(StrataError::record(
                ErrorKind::InvalidData,
                format!("variable `{name}` is an array, write a slice"),
            ));
        }
        self.group.set_scalar_value(id, bytes.clone())?;

        let stats = if self.group.stats_enabled() && dtype.is_numeric() {
            let mut stats = StatsSet::new(StatFlags::basic(), dtype.stat_components(), None);
            value.observe(&mut stats);
            Some(stats)
        } else {
            None
        };
        self.log.record(WrittenVar {
            id,
            axes: Axes::new(),
            payload: Payload::Owned(bytes),
            stats,
            write_offset: 0,
        });
        self.state = SessionState::Writing;
        Ok(())
    }

    /// Write a string variable. Strings always copy (length + NUL) because
    /// the caller's buffer lifetime is not contracted past this call.
    pub fn write_str(&mut self, name: &str, value: &str) -> Result<(), StrataError> {
        let id = self.lookup(name)?;
        let var = self.group.var_by_id(id).expect("id from lookup");
        if var.dtype != strata_core::DataType::Str {
            return Err(StrataError::record(
                ErrorKind::InvalidData,
                format!("variable `{name}` is {:?}, payload is a string", var.dtype),
            ));
        }
        if !var.is_scalar() {
            return Err(StrataError::record(
                ErrorKind::InvalidData,
                "string variables are scalar",
            ));
        }
        if self.mode == OpenMode::Read {
            return Err(StrataError::record(
                ErrorKind::InvalidFileMode,
                format!("cannot write `{name}` on a read-mode handle"),
            ));
        }
        if !matches!(self.state, SessionState::Sized | SessionState::Writing) {
            return Err(StrataError::record(
                ErrorKind::InvalidFileMode,
                "write requires group_size first",
            ));
        }
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.group.set_scalar_value(id, bytes.clone())?;
        self.log.record(WrittenVar {
            id,
            axes: Axes::new(),
            payload: Payload::Owned(bytes),
            stats: None,
            write_offset: 0,
        });
        self.state = SessionState::Writing;
        Ok(())
    }

    /// Read a variable's data (read mode only): the full extent at its
    /// first recorded step, copied into `buf`.
    pub fn read(&self, name: &str, buf: &mut [u8]) -> Result<usize, StrataError> {
        let reader = self.reader.as_ref().ok_or_else(|| {
            StrataError::record(
                ErrorKind::InvalidFileMode,
                "read requires a read-mode handle",
            )
        })?;
        let info = reader.var_info(name)?;
        let step = *info.steps.first().ok_or_else(|| {
            StrataError::record(ErrorKind::OutOfBound, format!("`{name}` has no steps"))
        })?;
        let start = vec![0u64; info.ndims];
        let bytes = reader.read_box(name, &start, &info.dims, step)?;
        if bytes.len() > buf.len() {
            return Err(StrataError::record(
                ErrorKind::OutOfBound,
                format!("buffer of {} bytes, variable needs {}", buf.len(), bytes.len()),
            ));
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Close the session: serialize the written log into a process group,
    /// hand it to every bound transport, then release the buffer space.
    pub fn close(mut self) -> Result<(), StrataError> {
        if self.mode == OpenMode::Read {
            self.state = SessionState::Closed;
            return Ok(());
        }
        self.arena.reached(AllocateWhen::EndOfStep)?;

        let failed = self.overflow.is_some();
        let group = &*self.group;

        // Snapshot the written log into codec views.
        let mut vars: Vec<StepVar<'_>> = Vec::with_capacity(self.log.len());
        if !failed {
            for written in self.log.iter() {
                let var = group.var_by_id(written.id).expect("logged id");
                vars.push(StepVar {
                    rec: VarWrite {
                        id: written.id.0,
                        name: &var.name,
                        path: &var.path,
                        dtype: var.dtype,
                        is_dim: var.is_dim,
                        transform: var.transform.as_deref(),
                        axes: &written.axes[..],
                        payload: written.payload.bytes(),
                        stats: written.stats.as_ref(),
                    },
                    payload_offset: 0,
                });
            }
        }
        let attrs: Vec<StepAttr<'_>> = group
            .attrs()
            .map(|attr| {
                let (rec_value, resolved) = match &attr.value {
                    AttrValue::Literal(bytes) => (AttrPayload::Inline(bytes), None),
                    AttrValue::VarRef(id) => (
                        AttrPayload::VarRef(id.0),
                        group.var_by_id(*id).and_then(|v| v.value()).map(<[u8]>::to_vec),
                    ),
                };
                StepAttr {
                    rec: AttrWrite {
                        id: attr.id.0,
                        name: &attr.name,
                        path: &attr.path,
                        dtype: attr.dtype,
                        value: rec_value,
                    },
                    resolved,
                }
            })
            .collect();

        // Assemble the process group and place it in reserved space.
        let mut spilled: Option<Vec<u8>> = None;
        let mut sealed = None;
        let mut assembly_error = self.overflow.take();
        if !failed && !vars.is_empty() {
            let header = PgHeader {
                group: group.name().to_string(),
                process_id: self.comm.rank() as u32,
                time_index_name: group.time_index_name().unwrap_or("").to_string(),
                time_index: self.time_index,
                host_fortran: false,
            };
            let recs: Vec<VarWrite<'_>> = vars.iter().map(|v| v.rec.clone()).collect();
            let attr_recs: Vec<AttrWrite<'_>> = attrs.iter().map(|a| a.rec.clone()).collect();
            let (pg, offsets) = encode_pg(&header, &recs, &attr_recs);
            for (var, offset) in vars.iter_mut().zip(&offsets) {
                var.payload_offset = *offset;
            }

            let need = pg.len() as u64;
            match self.reservation.take() {
                Some(ReservedSpace::Arena { offset, size }) if need <= size => {
                    self.arena.write_at(offset, &pg)?;
                    sealed = Some(self.arena.seal(need)?);
                }
                Some(ReservedSpace::Arena { size, .. }) => {
                    let _ = self.arena.seal(0).map(|id| self.arena.release(id));
                    assembly_error = Some(StrataError::record(
                        ErrorKind::BufferOverflow,
                        format!("process group needs {need} bytes, {size} were declared"),
                    ));
                }
                Some(ReservedSpace::Spill { mut buffer, size }) => {
                    if need <= size {
                        buffer.write_at(0, &pg)?;
                        spilled = Some(buffer.into_bytes(need)?);
                    } else {
                        assembly_error = Some(StrataError::record(
                            ErrorKind::BufferOverflow,
                            format!("process group needs {need} bytes, {size} were declared"),
                        ));
                    }
                }
                None => match self.arena.reserve(need)? {
                    Reserve::Arena(offset) => {
                        self.arena.write_at(offset, &pg)?;
                        sealed = Some(self.arena.seal(need)?);
                    }
                    Reserve::Spill(mut buffer) => {
                        buffer.write_at(0, &pg)?;
                        spilled = Some(buffer.into_bytes(need)?);
                    }
                },
            }
        }

        let step_failed = failed || assembly_error.is_some();
        let pg_slice: Option<&[u8]> = if step_failed {
            None
        } else if let Some(id) = sealed {
            self.arena.snapshot(id)
        } else {
            spilled.as_deref()
        };

        let step = StepPayload {
            file: &self.file,
            group: group.name(),
            time_index_name: group.time_index_name().unwrap_or(""),
            time_index: self.time_index,
            mode: self.mode,
            comm: &self.comm,
            pg: pg_slice,
            vars: &vars,
            attrs: &attrs,
            failed: step_failed,
        };

        let mut transport_error = None;
        for transport in self.transports.iter_mut() {
            if let Err(err) = transport.close_step(&step) {
                tracing::error!(transport = transport.name(), %err, "close_step failed");
                transport_error.get_or_insert(err);
            }
        }
        drop(step);

        if let Some(id) = sealed {
            self.arena.release(id);
        } else if let Some(ReservedSpace::Arena { .. }) = self.reservation.take() {
            // Reserved but nothing written: free the space.
            if let Ok(id) = self.arena.seal(0) {
                self.arena.release(id);
            }
        }

        self.state = SessionState::Closed;
        match assembly_error {
            // Re-record so the registry reflects the error the caller gets,
            // not whichever transport failed afterwards.
            Some(err) => Err(StrataError::record(err.kind(), err.message().to_string())),
            None => match transport_error {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }
}

/// Upper bound on the metadata a process group for `group` can need,
/// added to the declared payload size at `group_size`.
fn metadata_overhead(group: &Group) -> u64 {
    let mut total = pg_header_overhead(group.name(), group.time_index_name().unwrap_or(""));
    for var in group.vars() {
        total += var_record_overhead(
            &var.name,
            &var.path,
            var.dims.len(),
            var.dtype.stat_components(),
            var.hist_breaks.as_ref().map_or(0, Vec::len),
            var.transform.as_deref().map_or(0, str::len),
        );
        if var.is_scalar() {
            // Scalars repeat their value as an inline characteristic.
            total += 64;
        }
    }
    for attr in group.attrs() {
        let value_len = match &attr.value {
            AttrValue::Literal(bytes) => bytes.len(),
            AttrValue::VarRef(_) => 8,
        };
        total += attr_record_overhead(&attr.name, &attr.path, value_len);
    }
    total
}
