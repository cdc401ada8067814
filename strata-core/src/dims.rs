// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dimension expressions and their evaluator.
//!
//! A dimension is a tiny embedded language: a literal extent, a reference to
//! a scalar variable or an attribute whose current value provides the
//! extent, or the `time` token that resolves to the current step at write
//! time. One evaluator serves every call site.

use smallvec::SmallVec;

use crate::error::{ErrorKind, StrataError};
use crate::graph::{AttrId, VarId};

/// Resolved axes of one write. Ranks up to four stay inline.
pub type Axes = SmallVec<[ResolvedAxis; 4]>;

/// One dimension expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dim {
    Literal(u64),
    Var(VarId),
    Attr(AttrId),
    Time,
}

impl Dim {
    /// Parse the string form used by external configuration loaders:
    /// a decimal literal, the `time` token, or the name of a scalar
    /// variable or attribute in `scope`. Variables shadow attributes.
    pub fn parse(text: &str, scope: &impl DimScope) -> Result<Dim, StrataError> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("time") {
            return Ok(Dim::Time);
        }
        if text.chars().all(|c| c.is_ascii_digit()) && !text.is_empty() {
            let value = text.parse::<u64>().map_err(|_| {
                StrataError::record(
                    ErrorKind::InvalidDimension,
                    format!("dimension literal `{text}` out of range"),
                )
            })?;
            return Ok(Dim::Literal(value));
        }
        if let Some(id) = scope.var_by_name(text) {
            return Ok(Dim::Var(id));
        }
        if let Some(id) = scope.attr_by_name(text) {
            return Ok(Dim::Attr(id));
        }
        Err(StrataError::record(
            ErrorKind::InvalidDimension,
            format!("dimension `{text}` names no scalar variable or attribute"),
        ))
    }

    /// Evaluate against the current scalar values in `scope`.
    pub fn resolve(&self, scope: &impl DimScope, time_index: u32) -> Result<u64, StrataError> {
        match *self {
            Dim::Literal(value) => Ok(value),
            Dim::Time => Ok(time_index as u64),
            Dim::Var(id) => scope.scalar_value(id).ok_or_else(|| {
                StrataError::record(
                    ErrorKind::InvalidDimension,
                    format!("dimension variable {} has no value yet", id.0),
                )
            }),
            Dim::Attr(id) => scope.attr_value(id).ok_or_else(|| {
                StrataError::record(
                    ErrorKind::InvalidDimension,
                    format!("dimension attribute {} has no integer value", id.0),
                )
            }),
        }
    }
}

/// Local/global/offset triple for one axis of a variable.
///
/// A scalar variable has an empty dimension list. `global` and `offset`
/// default to zero literals for purely local arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DimSpec {
    pub local: Dim,
    pub global: Dim,
    pub offset: Dim,
}

impl DimSpec {
    pub fn local(local: Dim) -> DimSpec {
        DimSpec {
            local,
            global: Dim::Literal(0),
            offset: Dim::Literal(0),
        }
    }

    pub fn global(local: Dim, global: Dim, offset: Dim) -> DimSpec {
        DimSpec {
            local,
            global,
            offset,
        }
    }
}

/// The name and value lookups a dimension expression evaluates against.
/// Implemented by the metadata graph's `Group`.
pub trait DimScope {
    fn var_by_name(&self, name: &str) -> Option<VarId>;
    fn attr_by_name(&self, name: &str) -> Option<AttrId>;
    /// Current value of a scalar variable, widened to u64.
    fn scalar_value(&self, id: VarId) -> Option<u64>;
    /// Integer value of an attribute (literal or through its var ref).
    fn attr_value(&self, id: AttrId) -> Option<u64>;
}

/// A dimension value resolved at write time, with the provenance needed by
/// the container codec to record where the extent came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedAxis {
    pub local: u64,
    pub global: u64,
    pub offset: u64,
    pub local_src: Dim,
    pub global_src: Dim,
    pub offset_src: Dim,
}

/// Resolve a full dimension list. Returns the axes plus the element count
/// (product of local extents; 1 for scalars).
pub fn resolve_dims(
    dims: &[DimSpec],
    scope: &impl DimScope,
    time_index: u32,
) -> Result<(Axes, u64), StrataError> {
    let mut axes = Axes::new();
    let mut elements = 1u64;
    for spec in dims {
        let local = spec.local.resolve(scope, time_index)?;
        let global = spec.global.resolve(scope, time_index)?;
        let offset = spec.offset.resolve(scope, time_index)?;
        // The time axis contributes no elements to a single step's payload.
        if spec.local != Dim::Time {
            elements = elements.saturating_mul(local);
        }
        axes.push(ResolvedAxis {
            local,
            global,
            offset,
            local_src: spec.local,
            global_src: spec.global,
            offset_src: spec.offset,
        });
    }
    Ok((axes, elements))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeScope;

    impl DimScope for FakeScope {
        fn var_by_name(&self, name: &str) -> Option<VarId> {
            (name == "npoints").then_some(VarId(1))
        }
        fn attr_by_name(&self, name: &str) -> Option<AttrId> {
            (name == "nspace").then_some(AttrId(1))
        }
        fn scalar_value(&self, id: VarId) -> Option<u64> {
            (id == VarId(1)).then_some(44)
        }
        fn attr_value(&self, id: AttrId) -> Option<u64> {
            (id == AttrId(1)).then_some(2)
        }
    }

    #[test]
    fn parses_literal_token_and_names() {
        assert_eq!(Dim::parse("10", &FakeScope).unwrap(), Dim::Literal(10));
        assert_eq!(Dim::parse("time", &FakeScope).unwrap(), Dim::Time);
        assert_eq!(Dim::parse("npoints", &FakeScope).unwrap(), Dim::Var(VarId(1)));
        assert_eq!(Dim::parse("nspace", &FakeScope).unwrap(), Dim::Attr(AttrId(1)));
        assert!(Dim::parse("ghost", &FakeScope).is_err());
    }

    #[test]
    fn resolves_through_scope() {
        assert_eq!(Dim::Var(VarId(1)).resolve(&FakeScope, 0).unwrap(), 44);
        assert_eq!(Dim::Attr(AttrId(1)).resolve(&FakeScope, 0).unwrap(), 2);
        assert_eq!(Dim::Time.resolve(&FakeScope, 7).unwrap(), 7);
    }

    #[test]
    fn unresolved_reference_is_invalid_dimension() {
        let err = Dim::Var(VarId(9)).resolve(&FakeScope, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDimension);
    }

    #[test]
    fn resolve_dims_multiplies_local_extents() {
        let dims = [
            DimSpec::local(Dim::Var(VarId(1))),
            DimSpec::local(Dim::Attr(AttrId(1))),
        ];
        let (axes, elements) = resolve_dims(&dims, &FakeScope, 0).unwrap();
        assert_eq!(axes.len(), 2);
        assert_eq!(axes[0].local, 44);
        assert_eq!(elements, 88);
    }

    #[test]
    fn time_axis_contributes_no_payload_elements() {
        let dims = [
            DimSpec::local(Dim::Time),
            DimSpec::local(Dim::Literal(10)),
        ];
        let (_, elements) = resolve_dims(&dims, &FakeScope, 3).unwrap();
        assert_eq!(elements, 10);
    }
}
