// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Read-mode sessions: metadata inspection works, plain writes are
//! rejected without touching the container, and dimension scalars stay
//! writable for steering chunked reads.

use std::sync::Arc;

use strata::{DataType, Dim, ErrorKind, OpenMode, SoloComm, Strata};

fn write_container(io: &mut Strata, path: &str) {
    let g = io.declare_group("fields", None, false).unwrap();
    io.define_var(g, "plain", "", DataType::Integer, &[], &[], &[], None)
        .unwrap();
    let n = io
        .define_var(g, "n", "", DataType::Integer, &[], &[], &[], None)
        .unwrap();
    io.define_var(g, "u", "", DataType::Double, &[Dim::Var(n)], &[], &[], None)
        .unwrap();
    io.define_var(g, "ranks", "", DataType::Integer, &[], &[], &[], None)
        .unwrap();
    io.set_comm_descriptor(g, "ranks").unwrap();
    io.select_method(g, "file", "", "").unwrap();

    let u = [4.5f64; 8];
    let mut fd = io.open("fields", path, OpenMode::Write, Arc::new(SoloComm)).unwrap();
    fd.group_size(4 + 4 + 8 * 8).unwrap();
    fd.write_scalar("plain", 17i32).unwrap();
    fd.write_scalar("n", 8i32).unwrap();
    fd.write("u", &u).unwrap();
    fd.close().unwrap();
}

#[test]
fn write_rejected_and_container_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("fields.sc");
    let path = target.to_str().unwrap();

    let mut io = Strata::init_noxml();
    write_container(&mut io, path);
    let before = std::fs::read(&target).unwrap();

    let mut fd = io.open("fields", path, OpenMode::Read, Arc::new(SoloComm)).unwrap();
    assert_eq!(fd.mode(), OpenMode::Read);

    // A non-dimension scalar must not be writable in read mode.
    let err = fd.write_scalar("plain", 3i32).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFileMode);
    assert_eq!(strata::last_error(), ErrorKind::InvalidFileMode);

    // A scalar tagged as a dimension stays writable for chunk steering,
    // as is the communicator descriptor.
    fd.write_scalar("n", 4i32).unwrap();
    fd.write_scalar("ranks", 2i32).unwrap();

    // Metadata queries work on the same handle.
    let reader = fd.reader().unwrap();
    assert_eq!(reader.var_names().len(), 3);
    let info = reader.var_info("u").unwrap();
    assert_eq!(info.dims, [8]);

    fd.close().unwrap();
    io.finalize(0).unwrap();

    let after = std::fs::read(&target).unwrap();
    assert_eq!(before, after, "read-mode session must leave the container untouched");
}

#[test]
fn group_size_is_rejected_in_read_mode() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("fields2.sc");
    let path = target.to_str().unwrap();

    let mut io = Strata::init_noxml();
    write_container(&mut io, path);

    let mut fd = io.open("fields", path, OpenMode::Read, Arc::new(SoloComm)).unwrap();
    let err = fd.group_size(64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFileMode);
    fd.close().unwrap();
    io.finalize(0).unwrap();
}
