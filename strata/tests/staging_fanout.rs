// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Staging fan-out: one sender, two subscribers, parallel submission of
//! three variables. Each subscriber receives every variable exactly once
//! with a consistent `(timestep, nchunks)`, in any order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strata::{DataType, Dim, OpenMode, SoloComm, Strata, Subscriber};

const PORT: u16 = 47613;

fn subscribe(endpoint_id: u32) -> thread::JoinHandle<Vec<strata::FileInfoMsg>> {
    thread::spawn(move || {
        // The publisher binds its endpoint during select_method; retry
        // until it is up.
        let sub = loop {
            match Subscriber::register(("127.0.0.1", PORT), endpoint_id) {
                Ok(sub) => break sub,
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        };
        let mut conn = sub.accept().unwrap();
        (0..3).map(|_| conn.recv().unwrap()).collect()
    })
}

#[test]
fn two_subscribers_three_variables_parallel() {
    let subscribers = [subscribe(1), subscribe(2)];

    let x = [1.0f64; 4];
    let y = [2.0f64; 4];
    let z = [3.0f64; 4];

    let mut io = Strata::init_noxml();
    let g = io.declare_group("stage", None, false).unwrap();
    for name in ["x", "y", "z"] {
        io.define_var(g, name, "", DataType::Double, &[Dim::Literal(4)], &[], &[], None)
            .unwrap();
    }
    // Blocks until both subscribers have registered.
    io.select_method(
        g,
        "staging",
        &format!("cm_host=127.0.0.1;cm_port={PORT};max_client=2;num_parallel=2"),
        "",
    )
    .unwrap();

    let mut fd = io
        .open("stage", "staged.sc", OpenMode::Write, Arc::new(SoloComm))
        .unwrap();
    fd.group_size(3 * 4 * 8).unwrap();
    fd.write("x", &x).unwrap();
    fd.write("y", &y).unwrap();
    fd.write("z", &z).unwrap();
    fd.close().unwrap();
    io.finalize(0).unwrap();

    for handle in subscribers {
        let messages = handle.join().unwrap();
        assert_eq!(messages.len(), 3);
        // One variable per message, a full step's worth of chunks, and a
        // single consistent timestep.
        let timesteps: BTreeSet<u32> = messages.iter().map(|m| m.timestep).collect();
        assert_eq!(timesteps.len(), 1);
        let mut names = BTreeSet::new();
        for message in &messages {
            assert_eq!(message.fname, "staged.sc");
            assert_eq!(message.nchunks, 3);
            assert_eq!(message.comm_size, 1);
            assert_eq!(message.vars.len(), 1);
            let var = &message.vars[0];
            assert!(
                names.insert(var.name.clone()),
                "variable `{}` delivered twice to one subscriber",
                var.name
            );
            assert_eq!(var.ldims, [4]);
            assert_eq!(var.payload.len(), 32);
        }
        assert_eq!(
            names,
            BTreeSet::from(["x".to_string(), "y".to_string(), "z".to_string()])
        );
    }
}
