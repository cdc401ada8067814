// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! strata lets bulk-parallel scientific applications emit and reload
//! self-describing array datasets through one API while swapping the
//! delivery mechanism: a collective container file, a staged network
//! publisher, or the null sink.
//!
//! The entry point is the [`Strata`] process context: declare a group of
//! typed, possibly decomposed variables, bind it to one or more methods,
//! then per output step open a handle, announce the payload size, write
//! each variable, and close. A matching [`ContainerReader`] reopens a
//! written container for metadata queries and bounded reads.
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata::{DataType, Dim, OpenMode, SoloComm, Strata};
//!
//! # fn main() -> Result<(), strata::StrataError> {
//! let mut io = Strata::init_noxml();
//! let mesh = io.declare_group("mesh", None, true)?;
//! io.define_var(mesh, "npoints", "", DataType::Integer, &[], &[], &[], None)?;
//! io.define_var(
//!     mesh,
//!     "points",
//!     "",
//!     DataType::Double,
//!     &[Dim::Literal(44)],
//!     &[],
//!     &[],
//!     None,
//! )?;
//! io.select_method(mesh, "file", "", "")?;
//!
//! let points = [0.0f64; 44];
//! let mut fd = io.open("mesh", "mesh.sc", OpenMode::Write, Arc::new(SoloComm))?;
//! fd.group_size(4 + 44 * 8)?;
//! fd.write_scalar("npoints", 44i32)?;
//! fd.write("points", &points)?;
//! fd.close()?;
//! io.finalize(0)?;
//! # Ok(())
//! # }
//! ```

pub use strata_container::{
    ContainerReader, Endian, FooterFlags, MINIFOOTER_LEN, Minifooter, StatSummary, VarInfo,
};
pub use strata_core::{
    AllocateWhen, AttrId, AttrValue, Complex32, Complex64, DataType, Dim, DimSpec, Element,
    ErrorKind, GroupId, Histogram, OverflowPolicy, StatFlags, StrataError, VarId, bytes_of,
    clear_last_error, last_error, last_error_message,
};

pub use crate::comm::{Comm, SoloComm, ThreadComm};
pub use crate::pool::{CancelToken, PoolConfig, WorkerPool};
pub use crate::session::FileHandle;
pub use crate::transport::OpenMode;
pub use crate::transport::staging::{FileInfoMsg, Subscriber, SubscriberConn, VarMsg};

use std::path::PathBuf;
use std::sync::Arc;

use strata_core::{BufferArena, Group};

pub mod comm;
pub mod config;
pub mod pool;
pub mod session;
pub mod transport;

/// Process-wide library context with an explicit init/finalize lifecycle.
///
/// The context owns the metadata graph, the buffer arena, and the
/// transports bound to each group. It is not thread-safe: declare, define,
/// and select calls must be serialized by the caller, and a handle from
/// [`Strata::open`] is a single-producer object.
pub struct Strata {
    groups: Vec<Group>,
    transports: Vec<Vec<Box<dyn transport::Transport>>>,
    arena: BufferArena,
    init_comm: Arc<dyn Comm>,
    config_path: Option<PathBuf>,
}

impl Strata {
    /// Initialize with a declarative configuration file and the process
    /// communicator. The configuration loader is an external collaborator:
    /// this records the path and verifies it exists, the loader populates
    /// the metadata graph through the same declare/define/select calls.
    pub fn init(
        config_path: impl Into<PathBuf>,
        comm: Arc<dyn Comm>,
    ) -> Result<Strata, StrataError> {
        let config_path = config_path.into();
        if !config_path.exists() {
            return Err(StrataError::record(
                ErrorKind::InvalidFilePointer,
                format!("configuration file {} does not exist", config_path.display()),
            ));
        }
        tracing::info!(config = %config_path.display(), "strata initialized");
        Ok(Strata {
            groups: Vec::new(),
            transports: Vec::new(),
            arena: BufferArena::new(),
            init_comm: comm,
            config_path: Some(config_path),
        })
    }

    /// Initialize without a configuration file; groups are declared
    /// programmatically.
    pub fn init_noxml() -> Strata {
        Strata {
            groups: Vec::new(),
            transports: Vec::new(),
            arena: BufferArena::new(),
            init_comm: Arc::new(SoloComm),
            config_path: None,
        }
    }

    /// Like [`Strata::init_noxml`] but with a real communicator, so
    /// transports created by `select_method` know their rank.
    pub fn init_noxml_with_comm(comm: Arc<dyn Comm>) -> Strata {
        Strata {
            groups: Vec::new(),
            transports: Vec::new(),
            arena: BufferArena::new(),
            init_comm: comm,
            config_path: None,
        }
    }

    pub fn config_path(&self) -> Option<&std::path::Path> {
        self.config_path.as_deref()
    }

    /// Configure the process-wide buffer arena: size in megabytes and the
    /// allocation point.
    pub fn allocate_buffer(&mut self, mb: usize, when: AllocateWhen) -> Result<(), StrataError> {
        self.arena.configure(mb, when)
    }

    /// Choose what happens when a step does not fit the arena.
    pub fn set_overflow_policy(&mut self, policy: OverflowPolicy) {
        self.arena.set_policy(policy);
    }

    /// Declare a group. `time_index_name` names the scalar variable used
    /// as the step counter, if any; `stats` controls whether statistics
    /// are collected for the group's variables.
    pub fn declare_group(
        &mut self,
        name: &str,
        time_index_name: Option<&str>,
        stats: bool,
    ) -> Result<GroupId, StrataError> {
        if self.groups.iter().any(|g| g.name() == name) {
            return Err(StrataError::record(
                ErrorKind::DuplicateName,
                format!("group `{name}` already declared"),
            ));
        }
        self.groups.push(Group::new(name, time_index_name, stats));
        self.transports.push(Vec::new());
        Ok(GroupId(self.groups.len() - 1))
    }

    fn group_mut(&mut self, id: GroupId) -> Result<&mut Group, StrataError> {
        self.groups.get_mut(id.0).ok_or_else(|| {
            StrataError::record(ErrorKind::InvalidGroup, format!("no group id {}", id.0))
        })
    }

    pub fn group(&self, id: GroupId) -> Result<&Group, StrataError> {
        self.groups.get(id.0).ok_or_else(|| {
            StrataError::record(ErrorKind::InvalidGroup, format!("no group id {}", id.0))
        })
    }

    /// Define a variable. `local`, `global`, and `offsets` are parallel
    /// per-axis expression lists; `global` and `offsets` may be empty for
    /// purely local arrays, otherwise they must match `local` in length.
    /// An empty `local` declares a scalar.
    #[allow(clippy::too_many_arguments)]
    pub fn define_var(
        &mut self,
        group: GroupId,
        name: &str,
        path: &str,
        dtype: DataType,
        local: &[Dim],
        global: &[Dim],
        offsets: &[Dim],
        transform: Option<&str>,
    ) -> Result<VarId, StrataError> {
        if (!global.is_empty() && global.len() != local.len())
            || (!offsets.is_empty() && offsets.len() != local.len())
        {
            return Err(StrataError::record(
                ErrorKind::InvalidDimension,
                format!("variable `{name}`: global/offset lists must match the local rank"),
            ));
        }
        let dims: Vec<DimSpec> = local
            .iter()
            .enumerate()
            .map(|(axis, &l)| {
                DimSpec::global(
                    l,
                    global.get(axis).copied().unwrap_or(Dim::Literal(0)),
                    offsets.get(axis).copied().unwrap_or(Dim::Literal(0)),
                )
            })
            .collect();
        self.group_mut(group)?
            .define_var(name, path, dtype, dims, transform)
    }

    /// Configure histogram breakpoints for a variable.
    pub fn enable_histogram(
        &mut self,
        group: GroupId,
        var: VarId,
        breaks: Vec<f64>,
    ) -> Result<(), StrataError> {
        self.group_mut(group)?.enable_histogram(var, breaks)
    }

    /// Name the scalar a read-mode session may write to describe its
    /// communicator layout.
    pub fn set_comm_descriptor(&mut self, group: GroupId, name: &str) -> Result<(), StrataError> {
        self.group_mut(group)?.set_comm_descriptor(name);
        Ok(())
    }

    pub fn define_attribute(
        &mut self,
        group: GroupId,
        name: &str,
        path: &str,
        dtype: DataType,
        value: AttrValue,
    ) -> Result<AttrId, StrataError> {
        self.group_mut(group)?
            .define_attribute(name, path, dtype, value)
    }

    /// Bind a delivery method to a group. The transport is created
    /// immediately; the staging transport blocks here until its
    /// subscribers have registered.
    pub fn select_method(
        &mut self,
        group: GroupId,
        method: &str,
        parameters: &str,
        base_path: &str,
    ) -> Result<(), StrataError> {
        self.group(group)?;
        let comm = Arc::clone(&self.init_comm);
        let created = transport::create(method, parameters, base_path, &comm)?;
        self.group_mut(group)?
            .select_method(method, parameters, base_path);
        self.transports[group.0].push(created);
        Ok(())
    }

    /// Open a session on `group_name` targeting `file`.
    ///
    /// A group with no bound method gets the file transport with default
    /// parameters. Array payloads written through the returned handle are
    /// borrowed until `close`.
    pub fn open<'s>(
        &'s mut self,
        group_name: &str,
        file: &str,
        mode: OpenMode,
        comm: Arc<dyn Comm>,
    ) -> Result<FileHandle<'s>, StrataError> {
        let index = self
            .groups
            .iter()
            .position(|g| g.name() == group_name)
            .ok_or_else(|| {
                StrataError::record(
                    ErrorKind::InvalidGroup,
                    format!("no group `{group_name}` declared"),
                )
            })?;
        if self.transports[index].is_empty() {
            tracing::debug!(group = group_name, "no method bound, defaulting to file");
            self.transports[index].push(transport::create(
                "file",
                "",
                "",
                &Arc::clone(&self.init_comm),
            )?);
        }
        FileHandle::open(
            &mut self.groups[index],
            &mut self.transports[index],
            &mut self.arena,
            comm,
            file,
            mode,
        )
    }

    /// Tear down every transport. Groups die with the context.
    pub fn finalize(mut self, rank: usize) -> Result<(), StrataError> {
        let mut first_error = None;
        for transports in &mut self.transports {
            for transport in transports.iter_mut() {
                if let Err(err) = transport.finalize() {
                    tracing::error!(transport = transport.name(), %err, "finalize failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        tracing::info!(rank, "strata finalized");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_define_and_duplicate_errors() {
        let mut io = Strata::init_noxml();
        let g = io.declare_group("mesh", Some("step"), true).unwrap();
        let np = io
            .define_var(g, "npoints", "", DataType::Integer, &[], &[], &[], None)
            .unwrap();
        io.define_var(
            g,
            "points",
            "",
            DataType::Double,
            &[Dim::Var(np)],
            &[],
            &[],
            None,
        )
        .unwrap();
        let err = io.declare_group("mesh", None, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateName);
        assert_eq!(last_error(), ErrorKind::DuplicateName);
    }

    #[test]
    fn mismatched_global_rank_is_rejected() {
        let mut io = Strata::init_noxml();
        let g = io.declare_group("g", None, false).unwrap();
        let err = io
            .define_var(
                g,
                "a",
                "",
                DataType::Double,
                &[Dim::Literal(4)],
                &[Dim::Literal(8), Dim::Literal(8)],
                &[],
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDimension);
    }

    #[test]
    fn open_unknown_group_is_invalid_group() {
        let mut io = Strata::init_noxml();
        let err = io
            .open("ghost", "out.sc", OpenMode::Write, Arc::new(SoloComm))
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidGroup);
    }

    #[test]
    fn init_requires_existing_config() {
        let err = Strata::init("/no/such/config.xml", Arc::new(SoloComm) as Arc<dyn Comm>)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFilePointer);
    }

    #[test]
    fn init_records_the_config_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("layout.xml");
        std::fs::write(&config, "<declarations/>").unwrap();
        let io = Strata::init(&config, Arc::new(SoloComm) as Arc<dyn Comm>).unwrap();
        assert_eq!(io.config_path(), Some(config.as_path()));
    }

    #[test]
    fn select_method_rejects_unknown_names() {
        let mut io = Strata::init_noxml();
        let g = io.declare_group("g", None, false).unwrap();
        let err = io.select_method(g, "carrier-pigeon", "", "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn method_bindings_are_recorded_on_the_group() {
        let mut io = Strata::init_noxml();
        let g = io.declare_group("g", None, false).unwrap();
        io.select_method(g, "null", "", "").unwrap();
        io.select_method(g, "file", "on_failure=partial", "/scratch").unwrap();
        let methods = io.group(g).unwrap().methods().to_vec();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].method, "null");
        assert_eq!(methods[1].parameters, "on_failure=partial");
        assert_eq!(methods[1].base_path, "/scratch");
    }
}
