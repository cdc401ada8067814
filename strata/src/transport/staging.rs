// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Staging transport: publish each completed step to remote subscribers
//! instead of writing a file.
//!
//! At init the transport listens on its endpoint and waits for exactly
//! `max_client` subscribers to register their `(host, port, endpoint_id)`
//! contact record. It then dials every subscriber back and holds one
//! framed TCP connection per subscriber; each submitted message fans out
//! to all of them. Per step, the whole written-var log goes out as a
//! single message (sequential mode) or as one message per variable
//! submitted concurrently through the worker pool (`num_parallel > 1`),
//! with `nchunks` telling subscribers how many messages make up a full
//! step. Ordering within a step is unspecified; subscribers reassemble by
//! `(timestep, varid)`.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_utils::sync::WaitGroup;
use strata_container::{ByteReader, ByteWriter, Endian};
use strata_core::{DataType, ErrorKind, StrataError};

use crate::config::Params;
use crate::pool::{PoolConfig, WorkerPool};
use crate::transport::{StepPayload, StepVar, Transport};

const RECOGNISED: &[&str] = &[
    "cm_host",
    "cm_port",
    "cm_list",
    "reverse_dim",
    "max_client",
    "num_parallel",
    "linger",
];

/// One registered subscriber contact record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientInfo {
    pub host: String,
    pub port: u16,
    pub endpoint_id: u32,
}

/// See the module docs.
pub struct StagingTransport {
    reverse_dim: bool,
    num_parallel: usize,
    timestep: u32,
    pool: Option<WorkerPool>,
    conns: Vec<Arc<Mutex<TcpStream>>>,
    step_failed: Arc<AtomicBool>,
}

fn endpoint_for_rank(params: &Params, rank: usize) -> Result<(String, u16), StrataError> {
    if let Some(list) = params.get("cm_list") {
        let entries: Vec<&str> = list.split(',').map(str::trim).filter(|e| !e.is_empty()).collect();
        if entries.is_empty() {
            return Err(StrataError::record(
                ErrorKind::InvalidData,
                "cm_list has no entries",
            ));
        }
        // Ranks take endpoints round-robin across the list.
        let mine = entries[rank % entries.len()];
        let (host, port) = match mine.split_once(':') {
            Some(("", port)) => ("localhost", port),
            Some((host, port)) => (host, port),
            None => (mine, "59999"),
        };
        let port = port.parse::<u16>().map_err(|_| {
            StrataError::record(
                ErrorKind::InvalidData,
                format!("bad port in cm_list entry `{mine}`"),
            )
        })?;
        return Ok((host.to_string(), port));
    }
    let host = params.get("cm_host").unwrap_or("localhost").to_string();
    let port = params.get_parsed::<u16>("cm_port")?.unwrap_or(59999);
    Ok((host, port))
}

fn write_frame(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
    stream.read_exact(&mut body)?;
    Ok(body)
}

impl StagingTransport {
    /// Bind the local endpoint, wait for every subscriber, and bridge back
    /// to each of them. Blocks until `max_client` registrations arrive.
    pub fn init(params: &Params, rank: usize) -> Result<StagingTransport, StrataError> {
        params.warn_unknown("staging", RECOGNISED);
        let (host, port) = endpoint_for_rank(params, rank)?;
        let reverse_dim = params.flag("reverse_dim");
        let max_client = params.get_parsed::<usize>("max_client")?.unwrap_or(1);
        let num_parallel = params.get_parsed::<usize>("num_parallel")?.unwrap_or(1);
        let linger = params.get_parsed::<u64>("linger")?.unwrap_or(10);

        let listener = TcpListener::bind((host.as_str(), port)).map_err(|err| {
            StrataError::record(
                ErrorKind::TransportFailure,
                format!("staging cannot listen on {host}:{port}: {err}"),
            )
        })?;
        tracing::info!(%host, port, max_client, "staging transport listening");

        let mut clients = Vec::with_capacity(max_client);
        while clients.len() < max_client {
            let (mut stream, peer) = listener.accept().map_err(|err| {
                StrataError::record(
                    ErrorKind::TransportFailure,
                    format!("staging accept failed: {err}"),
                )
            })?;
            let body = read_frame(&mut stream)?;
            let mut r = ByteReader::new(&body, Endian::native());
            let client = ClientInfo {
                host: r.str16()?,
                port: r.u16()?,
                endpoint_id: r.u32()?,
            };
            tracing::debug!(?client, %peer, n = clients.len() + 1, "subscriber registered");
            clients.push(client);
        }

        // Bridge back: one persistent connection per subscriber; every
        // submission is written to all of them.
        let mut conns = Vec::with_capacity(clients.len());
        for client in &clients {
            let mut stream =
                TcpStream::connect((client.host.as_str(), client.port)).map_err(|err| {
                    StrataError::record(
                        ErrorKind::TransportFailure,
                        format!("no connection to {}:{}: {err}", client.host, client.port),
                    )
                })?;
            let mut hello = ByteWriter::new();
            hello.u32(client.endpoint_id);
            write_frame(&mut stream, hello.as_slice())?;
            conns.push(Arc::new(Mutex::new(stream)));
        }

        let pool = (num_parallel > 1).then(|| {
            WorkerPool::new(PoolConfig {
                min_workers: num_parallel,
                max_workers: num_parallel,
                linger: Duration::from_secs(linger),
                queue_capacity: 256,
            })
        });

        Ok(StagingTransport {
            reverse_dim,
            num_parallel,
            timestep: 0,
            pool,
            conns,
            step_failed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn fan_out(conns: &[Arc<Mutex<TcpStream>>], message: &[u8]) -> std::io::Result<()> {
        for conn in conns {
            let mut stream = conn.lock().unwrap();
            write_frame(&mut stream, message)?;
        }
        Ok(())
    }
}

fn encode_var(w: &mut ByteWriter, var: &StepVar<'_>, reverse_dim: bool) {
    let rec = &var.rec;
    w.u16(rec.id);
    if rec.path.is_empty() {
        w.str16(rec.name);
    } else {
        w.str16(&format!("{}/{}", rec.path, rec.name));
    }
    w.u8(rec.dtype.code());
    w.u8(rec.axes.len() as u8);
    // Row-major by default; column-major when the subscribers expect the
    // reversed axis mapping.
    let order: Vec<usize> = if reverse_dim {
        (0..rec.axes.len()).rev().collect()
    } else {
        (0..rec.axes.len()).collect()
    };
    for d in order {
        let axis = &rec.axes[d];
        w.u64(axis.global);
        w.u64(axis.local);
        w.u64(axis.offset);
    }
    w.u64(rec.payload.len() as u64);
    w.bytes(rec.payload);
}

fn encode_fileinfo(
    step: &StepPayload<'_>,
    vars: &[&StepVar<'_>],
    timestep: u32,
    nchunks: u32,
    reverse_dim: bool,
) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.str16(step.file);
    w.u32(timestep);
    w.u32(step.comm.rank() as u32);
    w.u32(step.comm.size() as u32);
    w.u32(nchunks);
    w.u32(vars.len() as u32);
    for var in vars {
        encode_var(&mut w, var, reverse_dim);
    }
    w.into_vec()
}

impl Transport for StagingTransport {
    fn name(&self) -> &'static str {
        "staging"
    }

    fn begin_step(
        &mut self,
        _file: &str,
        _mode: crate::transport::OpenMode,
        _comm: &Arc<dyn crate::comm::Comm>,
    ) -> Result<Option<u32>, StrataError> {
        // The step counter is transport-global and increments at each open.
        let step = self.timestep;
        self.timestep += 1;
        Ok(Some(step))
    }

    fn close_step(&mut self, step: &StepPayload<'_>) -> Result<(), StrataError> {
        if step.failed {
            return Err(StrataError::record(
                ErrorKind::TransportFailure,
                "staging step skipped: the process group was never assembled",
            ));
        }
        if step.vars.is_empty() {
            return Ok(());
        }

        if self.num_parallel > 1 {
            let pool = self.pool.as_ref().expect("pool exists when parallel");
            // Subscribers count chunks to know when a full step arrived,
            // so nchunks is the communicator-wide variable total.
            let nchunks = step.comm.allreduce_sum_u64(step.vars.len() as u64)? as u32;
            self.step_failed.store(false, Ordering::Relaxed);
            let wg = WaitGroup::new();
            for var in step.vars {
                let message = encode_fileinfo(
                    step,
                    &[var],
                    step.time_index,
                    nchunks,
                    self.reverse_dim,
                );
                let conns = self.conns.clone();
                let failed = Arc::clone(&self.step_failed);
                let wg = wg.clone();
                let queued = pool.queue(move |cancel| {
                    let _wg = wg;
                    if cancel.is_cancelled() {
                        return;
                    }
                    if let Err(err) = StagingTransport::fan_out(&conns, &message) {
                        tracing::error!(?err, "staging submission failed");
                        failed.store(true, Ordering::Relaxed);
                    }
                });
                if !queued {
                    self.step_failed.store(true, Ordering::Relaxed);
                }
            }
            wg.wait();
            pool.wait();
            if self.step_failed.load(Ordering::Relaxed) {
                return Err(StrataError::record(
                    ErrorKind::TransportFailure,
                    "one or more staged submissions failed",
                ));
            }
        } else {
            let vars: Vec<&StepVar<'_>> = step.vars.iter().collect();
            let message = encode_fileinfo(
                step,
                &vars,
                step.time_index,
                step.comm.size() as u32,
                self.reverse_dim,
            );
            StagingTransport::fan_out(&self.conns, &message).map_err(|err| {
                StrataError::record(
                    ErrorKind::TransportFailure,
                    format!("staging submission failed: {err}"),
                )
            })?;
        }
        tracing::debug!(
            timestep = step.time_index,
            vars = step.vars.len(),
            subscribers = self.conns.len(),
            "step staged"
        );
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), StrataError> {
        if let Some(pool) = self.pool.take() {
            pool.wait();
            pool.destroy();
        }
        self.conns.clear();
        Ok(())
    }
}

/// One variable of a received staging message.
#[derive(Clone, Debug, PartialEq)]
pub struct VarMsg {
    pub id: u16,
    pub name: String,
    pub dtype: DataType,
    pub gdims: Vec<u64>,
    pub ldims: Vec<u64>,
    pub offsets: Vec<u64>,
    pub payload: Vec<u8>,
}

/// A received staging message.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfoMsg {
    pub fname: String,
    pub timestep: u32,
    pub comm_rank: u32,
    pub comm_size: u32,
    pub nchunks: u32,
    pub vars: Vec<VarMsg>,
}

impl FileInfoMsg {
    pub fn decode(body: &[u8]) -> Result<FileInfoMsg, StrataError> {
        let mut r = ByteReader::new(body, Endian::native());
        let fname = r.str16()?;
        let timestep = r.u32()?;
        let comm_rank = r.u32()?;
        let comm_size = r.u32()?;
        let nchunks = r.u32()?;
        let nvars = r.u32()? as usize;
        let mut vars = Vec::with_capacity(nvars);
        for _ in 0..nvars {
            let id = r.u16()?;
            let name = r.str16()?;
            let dtype = DataType::from_code(r.u8()?).ok_or_else(|| {
                StrataError::record(ErrorKind::InvalidData, "unknown type in staged message")
            })?;
            let ndims = r.u8()? as usize;
            let mut gdims = Vec::with_capacity(ndims);
            let mut ldims = Vec::with_capacity(ndims);
            let mut offsets = Vec::with_capacity(ndims);
            for _ in 0..ndims {
                gdims.push(r.u64()?);
                ldims.push(r.u64()?);
                offsets.push(r.u64()?);
            }
            let payload_len = r.u64()? as usize;
            let payload = r.bytes(payload_len)?.to_vec();
            vars.push(VarMsg {
                id,
                name,
                dtype,
                gdims,
                ldims,
                offsets,
                payload,
            });
        }
        Ok(FileInfoMsg {
            fname,
            timestep,
            comm_rank,
            comm_size,
            nchunks,
            vars,
        })
    }
}

/// Subscriber-side counterpart used by receivers (and the fan-out tests):
/// register with a publisher, then accept its bridge connection and
/// iterate messages.
pub struct Subscriber {
    listener: TcpListener,
    endpoint_id: u32,
}

impl Subscriber {
    /// Bind an ephemeral local listener and register `(host, port,
    /// endpoint_id)` with the publisher at `publisher`.
    pub fn register(publisher: (&str, u16), endpoint_id: u32) -> Result<Subscriber, StrataError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .map_err(|err| StrataError::record(ErrorKind::TransportFailure, err.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|err| StrataError::record(ErrorKind::TransportFailure, err.to_string()))?
            .port();
        let mut stream = TcpStream::connect(publisher).map_err(|err| {
            StrataError::record(
                ErrorKind::TransportFailure,
                format!("cannot reach publisher {}:{}: {err}", publisher.0, publisher.1),
            )
        })?;
        let mut w = ByteWriter::new();
        w.str16("127.0.0.1");
        w.u16(port);
        w.u32(endpoint_id);
        write_frame(&mut stream, w.as_slice())?;
        Ok(Subscriber {
            listener,
            endpoint_id,
        })
    }

    /// Accept the publisher's bridge connection.
    pub fn accept(self) -> Result<SubscriberConn, StrataError> {
        let (mut stream, _peer) = self
            .listener
            .accept()
            .map_err(|err| StrataError::record(ErrorKind::TransportFailure, err.to_string()))?;
        let hello = read_frame(&mut stream)?;
        let mut r = ByteReader::new(&hello, Endian::native());
        let endpoint_id = r.u32()?;
        if endpoint_id != self.endpoint_id {
            return Err(StrataError::record(
                ErrorKind::TransportFailure,
                "bridge hello carries the wrong endpoint id",
            ));
        }
        Ok(SubscriberConn {
            stream,
            endpoint_id,
        })
    }
}

/// An accepted bridge connection delivering staged messages.
pub struct SubscriberConn {
    stream: TcpStream,
    pub endpoint_id: u32,
}

impl SubscriberConn {
    pub fn recv(&mut self) -> Result<FileInfoMsg, StrataError> {
        let body = read_frame(&mut self.stream)?;
        FileInfoMsg::decode(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Dim, ResolvedAxis};

    #[test]
    fn endpoint_selection_round_robins_cm_list() {
        let params = Params::parse("cm_list=node0:7000,node1:7001,:7002");
        assert_eq!(endpoint_for_rank(&params, 0).unwrap(), ("node0".into(), 7000));
        assert_eq!(endpoint_for_rank(&params, 1).unwrap(), ("node1".into(), 7001));
        assert_eq!(
            endpoint_for_rank(&params, 2).unwrap(),
            ("localhost".into(), 7002)
        );
        assert_eq!(endpoint_for_rank(&params, 3).unwrap(), ("node0".into(), 7000));
    }

    #[test]
    fn endpoint_falls_back_to_host_and_port() {
        let params = Params::parse("cm_host=node9;cm_port=6000");
        assert_eq!(endpoint_for_rank(&params, 5).unwrap(), ("node9".into(), 6000));
    }

    fn axis(local: u64, global: u64, offset: u64) -> ResolvedAxis {
        ResolvedAxis {
            local,
            global,
            offset,
            local_src: Dim::Literal(0),
            global_src: Dim::Literal(0),
            offset_src: Dim::Literal(0),
        }
    }

    #[test]
    fn varinfo_encodes_and_reverses_dimensions() {
        let axes = [axis(2, 8, 0), axis(3, 9, 6)];
        let data = [0u8; 6];
        let var = StepVar {
            rec: strata_container::VarWrite {
                id: 4,
                name: "cells",
                path: "",
                dtype: DataType::Integer,
                is_dim: false,
                transform: None,
                axes: &axes,
                payload: &data,
                stats: None,
            },
            payload_offset: 0,
        };

        let mut w = ByteWriter::new();
        encode_var(&mut w, &var, false);
        let fwd = w.into_vec();
        let mut w = ByteWriter::new();
        encode_var(&mut w, &var, true);
        let rev = w.into_vec();

        // Skip the common prefix (id + name + type + ndims), then compare
        // the first axis triple.
        let prefix = 2 + 2 + 5 + 1 + 1;
        let first_fwd = &fwd[prefix..prefix + 24];
        let first_rev = &rev[prefix..prefix + 24];
        let mut r = ByteReader::new(first_fwd, Endian::native());
        assert_eq!(r.u64().unwrap(), 8, "row-major leads with axis 0");
        let mut r = ByteReader::new(first_rev, Endian::native());
        assert_eq!(r.u64().unwrap(), 9, "column-major leads with the last axis");
    }

    #[test]
    fn fileinfo_message_round_trips() {
        let axes = [axis(5, 10, 5)];
        let data: [f64; 5] = [1.0, 2.0, 3.0, 4.0, 5.0];
        let payload = strata_core::bytes_of(&data);
        let var = StepVar {
            rec: strata_container::VarWrite {
                id: 2,
                name: "u",
                path: "/fields",
                dtype: DataType::Double,
                is_dim: false,
                transform: None,
                axes: &axes,
                payload,
                stats: None,
            },
            payload_offset: 0,
        };
        let comm: Arc<dyn crate::comm::Comm> = Arc::new(crate::comm::SoloComm);
        let step = StepPayload {
            file: "out.sc",
            group: "fields",
            time_index_name: "step",
            time_index: 3,
            mode: crate::transport::OpenMode::Write,
            comm: &comm,
            pg: None,
            vars: &[],
            attrs: &[],
            failed: false,
        };
        let message = encode_fileinfo(&step, &[&var], 3, 7, false);
        let decoded = FileInfoMsg::decode(&message).unwrap();
        assert_eq!(decoded.fname, "out.sc");
        assert_eq!(decoded.timestep, 3);
        assert_eq!(decoded.nchunks, 7);
        assert_eq!(decoded.vars.len(), 1);
        let v = &decoded.vars[0];
        assert_eq!(v.name, "/fields/u");
        assert_eq!(v.gdims, [10]);
        assert_eq!(v.ldims, [5]);
        assert_eq!(v.offsets, [5]);
        assert_eq!(v.payload, payload);
    }
}
