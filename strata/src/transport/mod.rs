// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport layer: where a completed process group goes at close.
//!
//! A group may be bound to any number of transports; a write on the group
//! fans out to every binding. Transports see each step as a
//! [`StepPayload`]: the assembled process-group bytes plus the per-variable
//! views the network transports need. The file transport is collective;
//! the staging transport publishes to subscribers; the null sink discards.

use std::sync::Arc;

use strata_container::{AttrWrite, VarWrite};
use strata_core::{ErrorKind, StrataError};

use crate::comm::Comm;
use crate::config::Params;

pub mod file;
pub mod staging;

/// Open mode of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Truncate any prior content of the target.
    Write,
    /// Preserve prior process groups and add new ones.
    Append,
    /// Metadata inspection only.
    Read,
}

impl OpenMode {
    /// Parse the single-letter mode string of the flat API.
    pub fn parse(mode: &str) -> Result<OpenMode, StrataError> {
        match mode {
            "w" => Ok(OpenMode::Write),
            "a" => Ok(OpenMode::Append),
            "r" => Ok(OpenMode::Read),
            other => Err(StrataError::record(
                ErrorKind::InvalidFileMode,
                format!("unknown open mode `{other}`"),
            )),
        }
    }
}

/// One variable of a completed step: the codec-level record view plus the
/// payload offset it was assigned inside the process group.
pub struct StepVar<'a> {
    pub rec: VarWrite<'a>,
    pub payload_offset: u64,
}

/// One attribute of a completed step; `resolved` carries the referenced
/// variable's value at close for var-ref attributes.
pub struct StepAttr<'a> {
    pub rec: AttrWrite<'a>,
    pub resolved: Option<Vec<u8>>,
}

/// Everything a transport sees when a session closes.
pub struct StepPayload<'a> {
    pub file: &'a str,
    pub group: &'a str,
    pub time_index_name: &'a str,
    pub time_index: u32,
    pub mode: OpenMode,
    pub comm: &'a Arc<dyn Comm>,
    /// Assembled process group; `None` when nothing was written or the
    /// rank failed to produce one.
    pub pg: Option<&'a [u8]>,
    pub vars: &'a [StepVar<'a>],
    pub attrs: &'a [StepAttr<'a>],
    /// This rank failed before assembly (e.g. buffer overflow with the
    /// abort policy); collective transports must still be driven so the
    /// other ranks' rendezvous completes.
    pub failed: bool,
}

/// A delivery mechanism for completed process groups.
pub trait Transport: Send {
    fn name(&self) -> &'static str;

    /// Whether close runs a communicator-wide rendezvous.
    fn is_collective(&self) -> bool {
        false
    }

    /// Called at open. A transport that tracks steps itself (or can read
    /// them from existing output) returns the step number to use.
    fn begin_step(
        &mut self,
        _file: &str,
        _mode: OpenMode,
        _comm: &Arc<dyn Comm>,
    ) -> Result<Option<u32>, StrataError> {
        Ok(None)
    }

    /// Deliver one completed step.
    fn close_step(&mut self, step: &StepPayload<'_>) -> Result<(), StrataError>;

    fn finalize(&mut self) -> Result<(), StrataError> {
        Ok(())
    }
}

/// The null sink: everything is accepted and discarded.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn name(&self) -> &'static str {
        "null"
    }

    fn close_step(&mut self, _step: &StepPayload<'_>) -> Result<(), StrataError> {
        Ok(())
    }
}

/// Instantiate a transport by method name and parameter string.
pub fn create(
    method: &str,
    parameters: &str,
    base_path: &str,
    comm: &Arc<dyn Comm>,
) -> Result<Box<dyn Transport>, StrataError> {
    let params = Params::parse(parameters);
    match method.to_ascii_lowercase().as_str() {
        "null" => Ok(Box::new(NullTransport)),
        "file" => Ok(Box::new(file::FileTransport::new(&params, base_path)?)),
        "staging" => Ok(Box::new(staging::StagingTransport::init(
            &params,
            comm.rank(),
        )?)),
        other => Err(StrataError::record(
            ErrorKind::InvalidData,
            format!("unknown method `{other}`"),
        )),
    }
}
