// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffer-overflow policies: abort fails the step at close and leaves no
//! file behind; spill delivers the oversized step through a disk-backed
//! assembly buffer.

use std::sync::Arc;

use strata::{
    AllocateWhen, ContainerReader, DataType, Dim, ErrorKind, OpenMode, OverflowPolicy, SoloComm,
    Strata,
};

const ELEMS: usize = 512 * 1024; // 4 MB of f64

fn declare(io: &mut Strata) {
    let g = io.declare_group("big", None, false).unwrap();
    io.define_var(
        g,
        "blob",
        "",
        DataType::Double,
        &[Dim::Literal(ELEMS as u64)],
        &[],
        &[],
        None,
    )
    .unwrap();
    io.select_method(g, "file", "", "").unwrap();
}

#[test]
fn abort_policy_fails_close_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("too-big.sc");

    let blob = vec![0.5f64; ELEMS];
    let mut io = Strata::init_noxml();
    io.allocate_buffer(1, AllocateWhen::Now).unwrap();
    io.set_overflow_policy(OverflowPolicy::Abort);
    declare(&mut io);

    let mut fd = io
        .open("big", target.to_str().unwrap(), OpenMode::Write, Arc::new(SoloComm))
        .unwrap();
    fd.group_size((ELEMS * 8) as u64).unwrap();
    fd.write("blob", &blob).unwrap();
    let err = fd.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BufferOverflow);
    assert_eq!(strata::last_error(), ErrorKind::BufferOverflow);

    // The file is absent (or at most zero-length).
    let len = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
    assert_eq!(len, 0, "aborted step must not leave a container behind");
    io.finalize(0).unwrap();
}

#[test]
fn spill_policy_still_delivers_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("spilled.sc");

    let blob = vec![0.25f64; ELEMS];
    let mut io = Strata::init_noxml();
    io.allocate_buffer(1, AllocateWhen::Now).unwrap();
    io.set_overflow_policy(OverflowPolicy::SpillToDisk);
    declare(&mut io);

    let mut fd = io
        .open("big", target.to_str().unwrap(), OpenMode::Write, Arc::new(SoloComm))
        .unwrap();
    fd.group_size((ELEMS * 8) as u64).unwrap();
    fd.write("blob", &blob).unwrap();
    fd.close().unwrap();

    let reader = ContainerReader::open(&target).unwrap();
    let back = reader.read_box("blob", &[0], &[ELEMS as u64], 0).unwrap();
    assert_eq!(back.len(), ELEMS * 8);
    assert_eq!(&back[..8], &0.25f64.to_ne_bytes());
    io.finalize(0).unwrap();
}
