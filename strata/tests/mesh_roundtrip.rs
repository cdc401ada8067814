// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-rank unstructured-mesh round trip: eleven variables in one step,
//! then metadata and data verified through the reader.

use std::sync::Arc;

use strata::{
    ContainerReader, DataType, Dim, MINIFOOTER_LEN, OpenMode, SoloComm, Strata,
};

const NPOINTS: usize = 44;
const NUM_CELLS: usize = 60;
const NSPACE: usize = 2;

// Eleven base values, each repeated for the four rows of the mesh.
const U_BASE: [f64; 11] = [
    0.0, 5.87528e-3, 9.50859e-3, 9.51351e-3, 5.88816e-3, 1.59255e-5, 5.86238e-3, 9.50365e-3,
    9.51841e-3, 5.90102e-3, 3.18509e-5,
];

fn mesh_data() -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<i32>, Vec<f32>, Vec<f32>, Vec<f32>) {
    let u: Vec<f64> = U_BASE.iter().flat_map(|&v| [v; 4]).collect();
    let v: Vec<f64> = (0..NPOINTS).map(|i| -2.0 * (i / 4) as f64).collect();
    let t: Vec<f64> = (0..NPOINTS)
        .map(|i| if i % 4 == 1 || i % 4 == 2 { 2.0 } else { 0.0 })
        .collect();

    // Two triangles per quad, three bands of ten quads, one-based.
    let mut cells = Vec::with_capacity(NUM_CELLS * 3);
    for band in 0..3i32 {
        let base = 1 + band * 11;
        for i in 0..10 {
            let a = base + i;
            cells.extend_from_slice(&[a, a + 1, a + 11]);
            cells.extend_from_slice(&[a + 12, a + 11, a + 1]);
        }
    }
    // The application owns the one-based-to-zero-based adjustment.
    for c in &mut cells {
        *c -= 1;
    }

    let mut points = Vec::with_capacity(NPOINTS * 2);
    let mut points_x = Vec::with_capacity(NPOINTS);
    let mut points_y = Vec::with_capacity(NPOINTS);
    for col in 0..11 {
        for row in 0..4 {
            points.push(col as f32);
            points.push(row as f32);
            points_x.push(col as f32);
            points_y.push(row as f32);
        }
    }
    (u, v, t, cells, points, points_x, points_y)
}

fn declared_bytes() -> u64 {
    (4 + 4 + 4
        + 8 * NPOINTS * 3
        + 4 * NUM_CELLS * 3
        + 4 * NPOINTS * NSPACE
        + 4 * NPOINTS
        + 4 * NPOINTS) as u64
}

#[test]
fn unstructured_mesh_single_rank() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("unstructured.sc");
    let path = target.to_str().unwrap();

    let (u, v, t, cells, points, points_x, points_y) = mesh_data();

    let mut io = Strata::init_noxml();
    let mesh = io.declare_group("mesh", None, false).unwrap();
    let np = io
        .define_var(mesh, "npoints", "", DataType::Integer, &[], &[], &[], None)
        .unwrap();
    let nc = io
        .define_var(mesh, "num_cells", "", DataType::Integer, &[], &[], &[], None)
        .unwrap();
    io.define_var(mesh, "Nspace", "", DataType::Integer, &[], &[], &[], None)
        .unwrap();
    for name in ["U", "V", "T"] {
        io.define_var(mesh, name, "", DataType::Double, &[Dim::Var(np)], &[], &[], None)
            .unwrap();
    }
    io.define_var(
        mesh,
        "cells",
        "",
        DataType::Integer,
        &[Dim::Var(nc), Dim::Literal(3)],
        &[],
        &[],
        None,
    )
    .unwrap();
    io.define_var(
        mesh,
        "points",
        "",
        DataType::Real,
        &[Dim::Var(np), Dim::Literal(2)],
        &[],
        &[],
        None,
    )
    .unwrap();
    for name in ["points_X", "points_Y"] {
        io.define_var(mesh, name, "", DataType::Real, &[Dim::Var(np)], &[], &[], None)
            .unwrap();
    }
    io.select_method(mesh, "file", "", "").unwrap();

    let mut fd = io
        .open("mesh", path, OpenMode::Write, Arc::new(SoloComm))
        .unwrap();
    let total = fd.group_size(declared_bytes()).unwrap();
    assert!(total >= declared_bytes());

    fd.write_scalar("npoints", NPOINTS as i32).unwrap();
    fd.write_scalar("num_cells", NUM_CELLS as i32).unwrap();
    fd.write_scalar("Nspace", NSPACE as i32).unwrap();
    fd.write("U", &u).unwrap();
    fd.write("V", &v).unwrap();
    fd.write("T", &t).unwrap();
    fd.write("cells", &cells).unwrap();
    fd.write("points", &points).unwrap();
    fd.write("points_X", &points_x).unwrap();
    fd.write("points_Y", &points_y).unwrap();
    fd.close().unwrap();
    io.finalize(0).unwrap();

    // Trailing magic and size bound.
    let bytes = std::fs::read(&target).unwrap();
    assert_eq!(&bytes[bytes.len() - 8..], b"STRATA01");
    assert!(
        (bytes.len() as u64) <= 2 * declared_bytes(),
        "file of {} bytes exceeds twice the declared {} bytes",
        bytes.len(),
        declared_bytes()
    );
    assert!(bytes.len() >= MINIFOOTER_LEN);

    let reader = ContainerReader::open(&target).unwrap();
    assert_eq!(reader.pg_index().len(), 1, "one rank, one step, one group");
    assert_eq!(reader.group_names(), ["mesh"]);
    assert_eq!(reader.var_names().len(), 11);

    // Scalar values round-trip through the inline characteristics.
    let npoints = reader.read_block("npoints", 0, 0).unwrap();
    assert_eq!(npoints, (NPOINTS as i32).to_ne_bytes());

    // U[3] is still zero.
    let u3 = reader.read_box("U", &[3], &[1], 0).unwrap();
    assert_eq!(f64::from_ne_bytes(u3.try_into().unwrap()), 0.0);

    // cells[0] after the one-based adjustment.
    let first_cell = reader.read_box("cells", &[0, 0], &[1, 3], 0).unwrap();
    let cell: Vec<i32> = first_cell
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(cell, [0, 1, 11]);

    // Full-array round trips.
    let u_back = reader.read_box("U", &[0], &[NPOINTS as u64], 0).unwrap();
    assert_eq!(u_back, strata_core_bytes(&u));
    let points_back = reader
        .read_box("points", &[0, 0], &[NPOINTS as u64, 2], 0)
        .unwrap();
    assert_eq!(points_back, strata_core_bytes(&points));

    // By-position lookup mirrors by-name lookup.
    let first = reader.var_entry_by_id(0).unwrap();
    assert_eq!(first.name, "npoints");
    assert!(reader.var_entry_by_id(11).is_err());

    // Index coverage: every variable record in the process group is
    // reachable from the variable index.
    let pg = reader.parse_pg_at(&reader.pg_index()[0]).unwrap();
    assert_eq!(pg.vars.len(), 11);
    for record in &pg.vars {
        let entry = reader.var_entry(&record.name).unwrap();
        assert!(
            entry
                .sets
                .iter()
                .any(|set| set.time_index == 0 && set.process_id == 0),
            "variable `{}` missing from the index",
            record.name
        );
    }
}

fn strata_core_bytes<T: strata::Element>(slice: &[T]) -> Vec<u8> {
    strata::bytes_of(slice).to_vec()
}

#[test]
fn attributes_and_strings_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("attrs.sc");
    let path = target.to_str().unwrap();

    let mut io = Strata::init_noxml();
    let g = io.declare_group("mesh", None, false).unwrap();
    let np = io
        .define_var(g, "npoints", "", DataType::Integer, &[], &[], &[], None)
        .unwrap();
    io.define_var(g, "title", "", DataType::Str, &[], &[], &[], None)
        .unwrap();
    io.define_attribute(
        g,
        "schema",
        "",
        DataType::Str,
        strata::AttrValue::Literal(b"unstructured/v1\0".to_vec()),
    )
    .unwrap();
    io.define_attribute(
        g,
        "point_count",
        "",
        DataType::Integer,
        strata::AttrValue::VarRef(np),
    )
    .unwrap();
    io.select_method(g, "file", "", "").unwrap();

    let mut fd = io.open("mesh", path, OpenMode::Write, Arc::new(SoloComm)).unwrap();
    fd.group_size(64).unwrap();
    fd.write_scalar("npoints", 44i32).unwrap();
    fd.write_str("title", "twod mesh").unwrap();
    fd.close().unwrap();
    io.finalize(0).unwrap();

    let reader = ContainerReader::open(&target).unwrap();
    assert_eq!(reader.attr_names(), ["schema", "point_count"]);

    let (dtype, value) = reader.attr_value("schema").unwrap();
    assert_eq!(dtype, DataType::Str);
    assert_eq!(value, b"unstructured/v1\0");

    // The var-ref attribute resolves to the value npoints had at close.
    let (dtype, value) = reader.attr_value("point_count").unwrap();
    assert_eq!(dtype, DataType::Integer);
    assert_eq!(value, 44i32.to_ne_bytes());

    // Strings are stored with their terminating NUL.
    let title = reader.read_block("title", 0, 0).unwrap();
    assert_eq!(title, b"twod mesh\0");
}

#[test]
fn read_mode_serves_the_flat_read_call() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("flat.sc");
    let path = target.to_str().unwrap();

    let x = [7.5f64; 6];
    let mut io = Strata::init_noxml();
    let g = io.declare_group("g", None, false).unwrap();
    io.define_var(g, "x", "", DataType::Double, &[Dim::Literal(6)], &[], &[], None)
        .unwrap();
    let mut fd = io.open("g", path, OpenMode::Write, Arc::new(SoloComm)).unwrap();
    fd.group_size(48).unwrap();
    fd.write("x", &x).unwrap();
    fd.close().unwrap();

    let fd = io.open("g", path, OpenMode::Read, Arc::new(SoloComm)).unwrap();
    let mut buf = vec![0u8; 48];
    let n = fd.read("x", &mut buf).unwrap();
    assert_eq!(n, 48);
    assert_eq!(buf, strata_core_bytes(&x));
    fd.close().unwrap();
    io.finalize(0).unwrap();
}
