// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide byte arena for process-group assembly.
//!
//! One arena serves the whole process. A session reserves space for its
//! declared payload plus metadata overhead, assembles the process group into
//! the reservation with positioned writes, seals it, and hands the bytes to
//! the transport; the reservation frontier moves back only after the
//! transport signals release. Overflow behaviour is a policy chosen at
//! configuration time: fail the step, assemble the oversized group in a
//! temporary file, or discard the oldest retained group.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{ErrorKind, StrataError};

/// When the arena's backing storage is actually allocated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllocateWhen {
    #[default]
    Now,
    BeforeOpen,
    AfterOpen,
    EndOfStep,
}

/// What happens when a reservation does not fit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    #[default]
    Abort,
    SpillToDisk,
    DropOldest,
}

/// Identifier of a sealed, not-yet-released process-group segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentId(u64);

#[derive(Debug)]
struct Segment {
    id: SegmentId,
    start: usize,
    len: usize,
}

/// Result of a reservation: either an offset into the arena or a spill
/// buffer when the payload exceeded capacity under [`OverflowPolicy::SpillToDisk`].
pub enum Reserve {
    Arena(u64),
    Spill(SpillBuffer),
}

/// Process-wide byte arena. See the module docs for the lifecycle.
#[derive(Debug)]
pub struct BufferArena {
    capacity: usize,
    when: AllocateWhen,
    policy: OverflowPolicy,
    storage: Vec<u8>,
    allocated: bool,
    frontier: usize,
    open: Option<Segment>,
    retained: VecDeque<Segment>,
    next_segment: u64,
}

impl Default for BufferArena {
    fn default() -> Self {
        BufferArena::new()
    }
}

impl BufferArena {
    /// An unconfigured arena: 16 MB, eager allocation deferred until
    /// [`BufferArena::configure`] or first use.
    pub fn new() -> BufferArena {
        BufferArena {
            capacity: 16 << 20,
            when: AllocateWhen::BeforeOpen,
            policy: OverflowPolicy::Abort,
            storage: Vec::new(),
            allocated: false,
            frontier: 0,
            open: None,
            retained: VecDeque::new(),
            next_segment: 0,
        }
    }

    /// Set capacity (in megabytes) and the allocation point. Mirrors the
    /// public `allocate_buffer` operation.
    pub fn configure(&mut self, mb: usize, when: AllocateWhen) -> Result<(), StrataError> {
        if mb == 0 {
            return Err(StrataError::record(
                ErrorKind::InvalidData,
                "buffer size must be at least 1 MB",
            ));
        }
        self.capacity = mb << 20;
        self.when = when;
        if self.allocated {
            // Re-configuration after allocation resizes in place.
            self.storage.resize(self.capacity, 0);
        } else if when == AllocateWhen::Now {
            self.allocate()?;
        }
        Ok(())
    }

    pub fn set_policy(&mut self, policy: OverflowPolicy) {
        self.policy = policy;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Called by the write pipeline at each lifecycle point; allocates the
    /// backing storage when the configured point is reached.
    pub fn reached(&mut self, point: AllocateWhen) -> Result<(), StrataError> {
        if !self.allocated && point >= self.when {
            self.allocate()?;
        }
        Ok(())
    }

    fn allocate(&mut self) -> Result<(), StrataError> {
        let mut storage = Vec::new();
        if storage.try_reserve_exact(self.capacity).is_err() {
            return Err(StrataError::record(
                ErrorKind::NoMemory,
                format!("cannot allocate {} byte arena", self.capacity),
            ));
        }
        storage.resize(self.capacity, 0);
        self.storage = storage;
        self.allocated = true;
        tracing::debug!(capacity = self.capacity, "arena allocated");
        Ok(())
    }

    /// Reserve `bytes` for the next process group. At most one reservation
    /// may be open at a time.
    pub fn reserve(&mut self, bytes: u64) -> Result<Reserve, StrataError> {
        if self.open.is_some() {
            return Err(StrataError::record(
                ErrorKind::InvalidFileMode,
                "a process group is already under construction",
            ));
        }
        if !self.allocated {
            self.allocate()?;
        }
        let bytes = usize::try_from(bytes).map_err(|_| {
            StrataError::record(ErrorKind::BufferOverflow, "reservation exceeds address space")
        })?;

        if self.frontier + bytes > self.capacity {
            match self.policy {
                OverflowPolicy::Abort => {
                    return Err(StrataError::record(
                        ErrorKind::BufferOverflow,
                        format!(
                            "reservation of {bytes} bytes exceeds arena capacity {} (frontier {})",
                            self.capacity, self.frontier
                        ),
                    ));
                }
                OverflowPolicy::SpillToDisk => {
                    tracing::warn!(bytes, "arena full, spilling process group to disk");
                    return Ok(Reserve::Spill(SpillBuffer::new(bytes)?));
                }
                OverflowPolicy::DropOldest => {
                    while self.frontier + bytes > self.capacity {
                        if !self.drop_oldest() {
                            return Err(StrataError::record(
                                ErrorKind::BufferOverflow,
                                format!("{bytes} bytes larger than the whole arena"),
                            ));
                        }
                    }
                }
            }
        }

        let start = self.frontier;
        self.frontier += bytes;
        let id = SegmentId(self.next_segment);
        self.next_segment += 1;
        self.open = Some(Segment {
            id,
            start,
            len: bytes,
        });
        Ok(Reserve::Arena(start as u64))
    }

    /// Copy `data` into the open reservation at `offset` (arena-absolute).
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StrataError> {
        let seg = self.open.as_ref().ok_or_else(|| {
            StrataError::record(ErrorKind::InvalidFilePointer, "no open reservation")
        })?;
        let offset = offset as usize;
        if offset < seg.start || offset + data.len() > seg.start + seg.len {
            return Err(StrataError::record(
                ErrorKind::OutOfBound,
                "write outside the open reservation",
            ));
        }
        self.storage[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Seal the open reservation, trimming it to `used` bytes. The bytes
    /// stay valid until [`BufferArena::release`].
    pub fn seal(&mut self, used: u64) -> Result<SegmentId, StrataError> {
        let mut seg = self.open.take().ok_or_else(|| {
            StrataError::record(ErrorKind::InvalidFilePointer, "no open reservation to seal")
        })?;
        let used = used as usize;
        debug_assert!(used <= seg.len);
        self.frontier = seg.start + used;
        seg.len = used;
        let id = seg.id;
        self.retained.push_back(seg);
        Ok(id)
    }

    /// View the bytes of a sealed segment.
    pub fn snapshot(&self, id: SegmentId) -> Option<&[u8]> {
        self.retained
            .iter()
            .find(|seg| seg.id == id)
            .map(|seg| &self.storage[seg.start..seg.start + seg.len])
    }

    /// Transport signal that a segment's bytes are no longer needed. The
    /// frontier retreats once the tail of the arena is free.
    pub fn release(&mut self, id: SegmentId) {
        if let Some(pos) = self.retained.iter().position(|seg| seg.id == id) {
            self.retained.remove(pos);
        }
        self.reset_frontier();
    }

    fn reset_frontier(&mut self) {
        if self.open.is_none() {
            self.frontier = self
                .retained
                .iter()
                .map(|seg| seg.start + seg.len)
                .max()
                .unwrap_or(0);
        }
    }

    fn drop_oldest(&mut self) -> bool {
        match self.retained.pop_front() {
            Some(seg) => {
                tracing::warn!(segment = seg.id.0, len = seg.len, "dropping oldest process group");
                self.reset_frontier();
                true
            }
            None => false,
        }
    }
}

/// Assembly buffer for a process group that did not fit in the arena.
/// Backed by an unlinked temporary file; the contents are materialized once
/// at transport hand-off.
pub struct SpillBuffer {
    file: std::fs::File,
    len: usize,
}

impl SpillBuffer {
    fn new(len: usize) -> Result<SpillBuffer, StrataError> {
        let file = tempfile::tempfile().map_err(|err| {
            StrataError::record(ErrorKind::NoMemory, format!("cannot create spill file: {err}"))
        })?;
        file.set_len(len as u64)?;
        Ok(SpillBuffer { file, len })
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StrataError> {
        if offset as usize + data.len() > self.len {
            return Err(StrataError::record(
                ErrorKind::OutOfBound,
                "write outside the spill reservation",
            ));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Read the assembled bytes back for delivery.
    pub fn into_bytes(mut self, used: u64) -> Result<Vec<u8>, StrataError> {
        let mut out = vec![0u8; used as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_mb(mb: usize, policy: OverflowPolicy) -> BufferArena {
        let mut arena = BufferArena::new();
        arena.configure(mb, AllocateWhen::Now).unwrap();
        arena.set_policy(policy);
        arena
    }

    #[test]
    fn reserve_write_seal_release_cycle() {
        let mut arena = arena_mb(1, OverflowPolicy::Abort);
        let Reserve::Arena(offset) = arena.reserve(128).unwrap() else {
            panic!("expected arena reservation");
        };
        arena.write_at(offset, b"header").unwrap();
        arena.write_at(offset + 6, b"payload").unwrap();
        let id = arena.seal(13).unwrap();
        assert_eq!(arena.snapshot(id).unwrap(), b"headerpayload");
        arena.release(id);
        // Frontier is back at zero: a full-capacity reservation fits again.
        assert!(matches!(
            arena.reserve(1 << 20).unwrap(),
            Reserve::Arena(0)
        ));
    }

    #[test]
    fn abort_policy_reports_overflow() {
        let mut arena = arena_mb(1, OverflowPolicy::Abort);
        let err = match arena.reserve((4 << 20) as u64) {
            Err(err) => err,
            Ok(_) => panic!("4 MB must not fit a 1 MB arena"),
        };
        assert_eq!(err.kind(), ErrorKind::BufferOverflow);
    }

    #[test]
    fn spill_policy_diverts_to_disk() {
        let mut arena = arena_mb(1, OverflowPolicy::SpillToDisk);
        let Reserve::Spill(mut spill) = arena.reserve((2 << 20) as u64).unwrap() else {
            panic!("expected spill");
        };
        spill.write_at(0, b"spilled").unwrap();
        assert_eq!(spill.into_bytes(7).unwrap(), b"spilled");
    }

    #[test]
    fn drop_oldest_reclaims_retained_groups() {
        let mut arena = arena_mb(1, OverflowPolicy::DropOldest);
        let Reserve::Arena(off) = arena.reserve(600 << 10).unwrap() else {
            panic!()
        };
        arena.write_at(off, b"pg0").unwrap();
        arena.seal(600 << 10).unwrap();
        // Second group exceeds the remaining space; the oldest is dropped.
        let Reserve::Arena(off) = arena.reserve(600 << 10).unwrap() else {
            panic!("drop-oldest should have made room");
        };
        assert_eq!(off, 0);
    }

    #[test]
    fn only_one_group_under_construction() {
        let mut arena = arena_mb(1, OverflowPolicy::Abort);
        arena.reserve(16).unwrap();
        assert!(arena.reserve(16).is_err());
    }

    #[test]
    fn lazy_allocation_waits_for_the_configured_point() {
        let mut arena = BufferArena::new();
        arena.configure(1, AllocateWhen::AfterOpen).unwrap();
        assert!(!arena.allocated);
        arena.reached(AllocateWhen::BeforeOpen).unwrap();
        assert!(!arena.allocated);
        arena.reached(AllocateWhen::AfterOpen).unwrap();
        assert!(arena.allocated);
    }
}
