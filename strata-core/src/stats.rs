// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-variable statistics engine.
//!
//! Each variable with statistics enabled carries one [`StatsSet`]: a bitmap
//! of which statistics are collected plus one [`StatSlot`] per declared
//! component (one for real types, three for complex: magnitude, real,
//! imaginary). The write path folds every element of every payload into the
//! slots; the container codec snapshots them into characteristics at close.

use bitflags::bitflags;

bitflags! {
    /// Which statistics are collected for a variable.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StatFlags: u8 {
        const MIN    = 1 << 0;
        const MAX    = 1 << 1;
        const SUM    = 1 << 2;
        const SUM_SQ = 1 << 3;
        const HIST   = 1 << 4;
        const COUNT  = 1 << 5;
    }
}

impl StatFlags {
    /// Everything except the histogram, which needs configured breakpoints.
    pub fn basic() -> StatFlags {
        StatFlags::MIN | StatFlags::MAX | StatFlags::SUM | StatFlags::SUM_SQ | StatFlags::COUNT
    }
}

/// Histogram over caller-configured breakpoints.
///
/// `frequencies` has `breaks.len() + 1` bins: values below `breaks[0]`,
/// between consecutive breaks, and at or above the last break. The slot owns
/// both arrays; they drop with it.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    breaks: Vec<f64>,
    frequencies: Vec<u64>,
}

impl Histogram {
    /// `breaks` must be sorted ascending; empty breaks mean one bin.
    pub fn new(breaks: Vec<f64>) -> Histogram {
        let bins = breaks.len() + 1;
        Histogram {
            breaks,
            frequencies: vec![0; bins],
        }
    }

    pub fn from_parts(breaks: Vec<f64>, frequencies: Vec<u64>) -> Histogram {
        debug_assert_eq!(frequencies.len(), breaks.len() + 1);
        Histogram { breaks, frequencies }
    }

    pub fn breaks(&self) -> &[f64] {
        &self.breaks
    }

    pub fn frequencies(&self) -> &[u64] {
        &self.frequencies
    }

    fn fold(&mut self, value: f64) {
        let bin = self.breaks.partition_point(|b| value >= *b);
        self.frequencies[bin] += 1;
    }
}

/// Running statistics for one component of one variable.
#[derive(Clone, Debug, PartialEq)]
pub struct StatSlot {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub sum_sq: f64,
    pub count: u64,
    pub hist: Option<Histogram>,
}

impl StatSlot {
    fn new(breaks: Option<&[f64]>) -> StatSlot {
        StatSlot {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            sum_sq: 0.0,
            count: 0,
            hist: breaks.map(|b| Histogram::new(b.to_vec())),
        }
    }
}

/// The statistic slots of one variable for the current process group.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsSet {
    flags: StatFlags,
    slots: Vec<StatSlot>,
}

impl StatsSet {
    /// Allocate `components` slots collecting the statistics in `flags`.
    /// Histogram breakpoints apply to every component.
    pub fn new(flags: StatFlags, components: usize, breaks: Option<&[f64]>) -> StatsSet {
        let breaks = if flags.contains(StatFlags::HIST) {
            breaks
        } else {
            None
        };
        StatsSet {
            flags,
            slots: (0..components).map(|_| StatSlot::new(breaks)).collect(),
        }
    }

    pub fn flags(&self) -> StatFlags {
        self.flags
    }

    pub fn components(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, component: usize) -> &StatSlot {
        &self.slots[component]
    }

    /// Fold one observation into the slot for `component`.
    #[inline]
    pub fn fold(&mut self, component: usize, value: f64) {
        let flags = self.flags;
        let slot = &mut self.slots[component];
        if flags.contains(StatFlags::MIN) && value < slot.min {
            slot.min = value;
        }
        if flags.contains(StatFlags::MAX) && value > slot.max {
            slot.max = value;
        }
        if flags.contains(StatFlags::SUM) {
            slot.sum += value;
        }
        if flags.contains(StatFlags::SUM_SQ) {
            slot.sum_sq += value * value;
        }
        if flags.contains(StatFlags::COUNT) {
            slot.count += 1;
        }
        if let Some(hist) = &mut slot.hist {
            hist.fold(value);
        }
    }
}
