// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Core model of the strata parallel I/O library: scalar types, dimension
//! expressions, the group/variable/attribute metadata graph, the per-write
//! statistics engine, the process-wide buffer arena, and the error
//! registry. The container codec and the transports build on this crate.

pub use crate::buffer::{AllocateWhen, BufferArena, OverflowPolicy, Reserve, SegmentId, SpillBuffer};
pub use crate::dims::{Axes, Dim, DimScope, DimSpec, ResolvedAxis, resolve_dims};
pub use crate::error::{
    ErrorKind, StrataError, clear_last_error, last_error, last_error_message,
};
pub use crate::graph::{
    AttrId, AttrValue, Attribute, Group, GroupId, MethodBinding, Payload, VarId, Variable,
    WrittenLog, WrittenVar,
};
pub use crate::stats::{Histogram, StatFlags, StatSlot, StatsSet};
pub use crate::types::{Complex32, Complex64, DataType, Element, bytes_of};

pub mod buffer;
pub mod dims;
pub mod error;
pub mod graph;
pub mod stats;
pub mod types;
