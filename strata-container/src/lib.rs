// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bit-exact container codec for the strata parallel I/O library.
//!
//! A container is `[process groups][vars index][attrs index][pg index]
//! [minifooter]`. This crate owns the record layouts, the footer indexes,
//! the fixed trailer, and the [`ContainerReader`] that reopens a container
//! for metadata queries and bounded reads. Writers assemble process groups
//! with [`record::encode_pg`] and indexes with [`index::MergedIndex`]; the
//! transports in the `strata` crate decide where the bytes go.

pub use crate::index::{
    CharSet, IndexEntry, MergedIndex, PgIndexEntry, attr_index_set, decode_pg_index,
    encode_pg_index, index_set_for,
};
pub use crate::minifooter::{FORMAT_VERSION, FooterFlags, MAGIC, MINIFOOTER_LEN, Minifooter};
pub use crate::record::{
    AttrPayload, AttrRecValue, AttrRecord, AttrWrite, Characteristic, PgHeader, PgParsed,
    VarRecord, VarWrite, attr_record_overhead, charkind, encode_pg, parse_pg, pg_header_overhead,
    var_record_overhead,
};
pub use crate::reader::{ContainerReader, StatSummary, VarInfo};
pub use crate::wire::{ByteReader, ByteWriter, Endian};

pub mod index;
pub mod minifooter;
pub mod record;
pub mod reader;
pub mod wire;
