// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Communicator abstraction for the collective transports.
//!
//! Callers are MPI-style processes cooperating through a communicator. The
//! file transport's rendezvous is written against [`Comm`] only, so the
//! same code serves a real multi-process launcher, a single process
//! ([`SoloComm`]), and the in-process [`ThreadComm`] used by tests and
//! single-node tools. Every collective is a strict barrier: a rank that
//! never arrives fails the step with `err_collective_timeout`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use strata_core::{ErrorKind, StrataError};

/// Collective operations used by the transports. All ranks must call each
/// operation in the same order.
pub trait Comm: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Gather `bytes` at `root`. The root receives one buffer per rank (in
    /// rank order, its own included); other ranks receive `None`.
    fn gather(&self, root: usize, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>, StrataError>;

    /// Scatter one u64 per rank from `root`; `values` is `Some` on the
    /// root only and must hold one entry per rank.
    fn scatter_u64(&self, root: usize, values: Option<&[u64]>) -> Result<u64, StrataError>;

    /// Broadcast one u64 from `root`; `value` is `Some` on the root only.
    fn broadcast_u64(&self, root: usize, value: Option<u64>) -> Result<u64, StrataError>;

    fn allreduce_sum_u64(&self, value: u64) -> Result<u64, StrataError>;

    /// Point-to-point send, used by aggregating writers.
    fn send(&self, to: usize, tag: u8, bytes: &[u8]) -> Result<(), StrataError>;

    fn recv(&self, from: usize, tag: u8) -> Result<Vec<u8>, StrataError>;

    fn barrier(&self) -> Result<(), StrataError>;
}

/// The one-rank communicator: every collective is the identity.
#[derive(Debug, Default)]
pub struct SoloComm;

impl Comm for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn gather(&self, _root: usize, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>, StrataError> {
        Ok(Some(vec![bytes.to_vec()]))
    }

    fn scatter_u64(&self, _root: usize, values: Option<&[u64]>) -> Result<u64, StrataError> {
        values
            .and_then(|v| v.first().copied())
            .ok_or_else(|| StrataError::record(ErrorKind::InvalidData, "scatter without values"))
    }

    fn broadcast_u64(&self, _root: usize, value: Option<u64>) -> Result<u64, StrataError> {
        value.ok_or_else(|| StrataError::record(ErrorKind::InvalidData, "broadcast without value"))
    }

    fn allreduce_sum_u64(&self, value: u64) -> Result<u64, StrataError> {
        Ok(value)
    }

    fn send(&self, _to: usize, _tag: u8, _bytes: &[u8]) -> Result<(), StrataError> {
        Err(StrataError::record(
            ErrorKind::TransportFailure,
            "point-to-point send on a one-rank communicator",
        ))
    }

    fn recv(&self, _from: usize, _tag: u8) -> Result<Vec<u8>, StrataError> {
        Err(StrataError::record(
            ErrorKind::TransportFailure,
            "point-to-point recv on a one-rank communicator",
        ))
    }

    fn barrier(&self) -> Result<(), StrataError> {
        Ok(())
    }
}

struct Packet {
    from: usize,
    tag: u8,
    bytes: Vec<u8>,
}

// Message tags for the built-in collectives; user point-to-point traffic
// uses tags >= TAG_USER.
const TAG_GATHER: u8 = 0;
const TAG_SCATTER: u8 = 1;
const TAG_BCAST: u8 = 2;
/// First tag available to transports for their own traffic.
pub const TAG_USER: u8 = 16;

/// In-process communicator: one handle per rank, exchanged over channels.
///
/// Each handle is held by exactly one thread; collectives time out after
/// the configured window, turning a missing rank into
/// `err_collective_timeout` rather than a hang.
pub struct ThreadComm {
    rank: usize,
    size: usize,
    timeout: Duration,
    senders: Vec<Sender<Packet>>,
    receiver: Mutex<Receiver<Packet>>,
    // Packets that arrived ahead of the matching recv.
    pending: Mutex<Vec<Packet>>,
}

impl ThreadComm {
    /// Create `size` connected rank handles.
    pub fn split(size: usize, timeout: Duration) -> Vec<Arc<ThreadComm>> {
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| {
                Arc::new(ThreadComm {
                    rank,
                    size,
                    timeout,
                    senders: senders.clone(),
                    receiver: Mutex::new(receiver),
                    pending: Mutex::new(Vec::new()),
                })
            })
            .collect()
    }

    fn post(&self, to: usize, tag: u8, bytes: Vec<u8>) -> Result<(), StrataError> {
        self.senders[to]
            .send(Packet {
                from: self.rank,
                tag,
                bytes,
            })
            .map_err(|_| {
                StrataError::record(ErrorKind::TransportFailure, format!("rank {to} is gone"))
            })
    }

    fn take(&self, from: usize, tag: u8) -> Result<Vec<u8>, StrataError> {
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(pos) = pending.iter().position(|p| p.from == from && p.tag == tag) {
                return Ok(pending.remove(pos).bytes);
            }
        }
        let receiver = self.receiver.lock().unwrap();
        loop {
            let packet = receiver.recv_timeout(self.timeout).map_err(|_| {
                StrataError::record(
                    ErrorKind::CollectiveTimeout,
                    format!(
                        "rank {} waited {:?} for rank {from} (tag {tag})",
                        self.rank, self.timeout
                    ),
                )
            })?;
            if packet.from == from && packet.tag == tag {
                return Ok(packet.bytes);
            }
            self.pending.lock().unwrap().push(packet);
        }
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn gather(&self, root: usize, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>, StrataError> {
        if self.rank == root {
            let mut all = vec![Vec::new(); self.size];
            all[root] = bytes.to_vec();
            for from in (0..self.size).filter(|&r| r != root) {
                all[from] = self.take(from, TAG_GATHER)?;
            }
            Ok(Some(all))
        } else {
            self.post(root, TAG_GATHER, bytes.to_vec())?;
            Ok(None)
        }
    }

    fn scatter_u64(&self, root: usize, values: Option<&[u64]>) -> Result<u64, StrataError> {
        if self.rank == root {
            let values = values.ok_or_else(|| {
                StrataError::record(ErrorKind::InvalidData, "scatter root without values")
            })?;
            debug_assert_eq!(values.len(), self.size);
            for to in (0..self.size).filter(|&r| r != root) {
                self.post(to, TAG_SCATTER, values[to].to_ne_bytes().to_vec())?;
            }
            Ok(values[root])
        } else {
            let bytes = self.take(root, TAG_SCATTER)?;
            Ok(u64::from_ne_bytes(bytes.try_into().map_err(|_| {
                StrataError::record(ErrorKind::InvalidData, "short scatter packet")
            })?))
        }
    }

    fn broadcast_u64(&self, root: usize, value: Option<u64>) -> Result<u64, StrataError> {
        if self.rank == root {
            let value = value.ok_or_else(|| {
                StrataError::record(ErrorKind::InvalidData, "broadcast root without value")
            })?;
            for to in (0..self.size).filter(|&r| r != root) {
                self.post(to, TAG_BCAST, value.to_ne_bytes().to_vec())?;
            }
            Ok(value)
        } else {
            let bytes = self.take(root, TAG_BCAST)?;
            Ok(u64::from_ne_bytes(bytes.try_into().map_err(|_| {
                StrataError::record(ErrorKind::InvalidData, "short broadcast packet")
            })?))
        }
    }

    fn allreduce_sum_u64(&self, value: u64) -> Result<u64, StrataError> {
        let gathered = self.gather(0, &value.to_ne_bytes())?;
        let total = match gathered {
            Some(all) => {
                let mut total = 0u64;
                for bytes in all {
                    total += u64::from_ne_bytes(bytes.try_into().map_err(|_| {
                        StrataError::record(ErrorKind::InvalidData, "short reduce packet")
                    })?);
                }
                Some(total)
            }
            None => None,
        };
        self.broadcast_u64(0, total)
    }

    fn send(&self, to: usize, tag: u8, bytes: &[u8]) -> Result<(), StrataError> {
        debug_assert!(tag >= TAG_USER);
        self.post(to, tag, bytes.to_vec())
    }

    fn recv(&self, from: usize, tag: u8) -> Result<Vec<u8>, StrataError> {
        debug_assert!(tag >= TAG_USER);
        self.take(from, tag)
    }

    fn barrier(&self) -> Result<(), StrataError> {
        self.gather(0, &[])?;
        self.broadcast_u64(0, if self.rank == 0 { Some(0) } else { None })?;
        Ok(())
    }
}
