// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The metadata graph: groups, variables, attributes, and method bindings.
//!
//! Groups own their variables and attributes in append-only arrays with
//! hash indexes by name; iteration order is declaration order, and ids are
//! assigned in declaration order starting at 1 (0 is reserved by the
//! container codec to mean "literal"). The graph is not thread-safe;
//! callers serialize declare/define/select operations.

use ahash::AHashMap;

use crate::dims::{Axes, Dim, DimScope, DimSpec};
use crate::error::{ErrorKind, StrataError};
use crate::stats::StatsSet;
use crate::types::DataType;

/// Index of a group within the process context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub usize);

/// Variable id, unique within its group, assigned in declaration order
/// starting at 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u16);

/// Attribute id, unique within its group, assigned in declaration order
/// starting at 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttrId(pub u16);

/// An attribute either carries a literal value of its type or references a
/// variable whose current scalar value provides it.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Literal(Vec<u8>),
    VarRef(VarId),
}

/// Named typed constant inside a group. Immutable after declare.
#[derive(Clone, Debug)]
pub struct Attribute {
    pub id: AttrId,
    pub name: String,
    pub path: String,
    pub dtype: DataType,
    pub value: AttrValue,
}

/// A transport binding attached to a group. A write on the group fans out
/// to every binding.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodBinding {
    pub method: String,
    pub parameters: String,
    pub base_path: String,
}

/// Named typed array (possibly scalar) inside a group.
#[derive(Clone, Debug)]
pub struct Variable {
    pub id: VarId,
    pub name: String,
    pub path: String,
    pub dtype: DataType,
    pub dims: Vec<DimSpec>,
    pub transform: Option<String>,
    /// Referenced by some other variable's dimension expression.
    pub is_dim: bool,
    pub hist_breaks: Option<Vec<f64>>,
    /// Owned copy of the most recently written scalar value.
    value: Option<Vec<u8>>,
}

impl Variable {
    /// A variable is scalar iff its dimension list is empty.
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Current scalar value widened to u64, for dimension resolution.
    /// Negative or fractional values do not resolve.
    pub fn value_as_u64(&self) -> Option<u64> {
        scalar_as_u64(self.dtype, self.value.as_deref()?)
    }
}

fn scalar_as_u64(dtype: DataType, bytes: &[u8]) -> Option<u64> {
    fn arr<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
        bytes.get(..N)?.try_into().ok()
    }
    match dtype {
        DataType::Byte => i64::from(i8::from_ne_bytes(arr(bytes)?)).try_into().ok(),
        DataType::Short => i64::from(i16::from_ne_bytes(arr(bytes)?)).try_into().ok(),
        DataType::Integer => i64::from(i32::from_ne_bytes(arr(bytes)?)).try_into().ok(),
        DataType::Long => i64::from_ne_bytes(arr(bytes)?).try_into().ok(),
        DataType::UnsignedByte => Some(u8::from_ne_bytes(arr(bytes)?) as u64),
        DataType::UnsignedShort => Some(u16::from_ne_bytes(arr(bytes)?) as u64),
        DataType::UnsignedInteger => Some(u32::from_ne_bytes(arr(bytes)?) as u64),
        DataType::UnsignedLong => Some(u64::from_ne_bytes(arr(bytes)?)),
        _ => None,
    }
}

/// Named container of variables, attributes, and method bindings.
#[derive(Debug)]
pub struct Group {
    name: String,
    time_index_name: Option<String>,
    stats_enabled: bool,
    all_unique_var_names: bool,
    comm_descriptor: Option<String>,
    vars: Vec<Variable>,
    var_index: AHashMap<String, VarId>,
    attrs: Vec<Attribute>,
    attr_index: AHashMap<String, AttrId>,
    methods: Vec<MethodBinding>,
    time_index: u32,
}

impl Group {
    pub fn new(name: &str, time_index_name: Option<&str>, stats_enabled: bool) -> Group {
        Group {
            name: name.to_string(),
            time_index_name: time_index_name.map(str::to_string),
            stats_enabled,
            all_unique_var_names: true,
            comm_descriptor: None,
            vars: Vec::new(),
            var_index: AHashMap::new(),
            attrs: Vec::new(),
            attr_index: AHashMap::new(),
            methods: Vec::new(),
            time_index: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn time_index_name(&self) -> Option<&str> {
        self.time_index_name.as_deref()
    }

    pub fn stats_enabled(&self) -> bool {
        self.stats_enabled
    }

    pub fn all_unique_var_names(&self) -> bool {
        self.all_unique_var_names
    }

    /// Switch to `(path, name)` identification. Only valid before the first
    /// definition, since the name index is keyed by the policy.
    pub fn set_unique_names(&mut self, unique: bool) -> Result<(), StrataError> {
        if !self.vars.is_empty() || !self.attrs.is_empty() {
            return Err(StrataError::record(
                ErrorKind::InvalidGroup,
                "naming policy must be set before definitions",
            ));
        }
        self.all_unique_var_names = unique;
        Ok(())
    }

    /// Scalar that read-mode sessions may write to describe their
    /// communicator layout.
    pub fn set_comm_descriptor(&mut self, name: &str) {
        self.comm_descriptor = Some(name.to_string());
    }

    pub fn comm_descriptor(&self) -> Option<&str> {
        self.comm_descriptor.as_deref()
    }

    pub fn time_index(&self) -> u32 {
        self.time_index
    }

    pub fn set_time_index(&mut self, time_index: u32) {
        self.time_index = time_index;
    }

    fn key(&self, path: &str, name: &str) -> String {
        if self.all_unique_var_names || path.is_empty() {
            name.to_string()
        } else {
            format!("{path}/{name}")
        }
    }

    /// Define a variable. Fails with `err_duplicate_name` when the name (or
    /// `(path, name)` under the non-unique policy) is already taken, and
    /// with `err_invalid_dimension` when more than one axis is the time
    /// token.
    pub fn define_var(
        &mut self,
        name: &str,
        path: &str,
        dtype: DataType,
        dims: Vec<DimSpec>,
        transform: Option<&str>,
    ) -> Result<VarId, StrataError> {
        if name.is_empty() {
            return Err(StrataError::record(
                ErrorKind::InvalidVarname,
                "variable name must not be empty",
            ));
        }
        let key = self.key(path, name);
        if self.var_index.contains_key(&key) {
            return Err(StrataError::record(
                ErrorKind::DuplicateName,
                format!("variable `{key}` already defined in group `{}`", self.name),
            ));
        }
        let time_axes = dims
            .iter()
            .filter(|spec| {
                spec.local == Dim::Time || spec.global == Dim::Time || spec.offset == Dim::Time
            })
            .count();
        if time_axes > 1 {
            return Err(StrataError::record(
                ErrorKind::InvalidDimension,
                format!("variable `{name}` declares more than one time axis"),
            ));
        }
        let id = u16::try_from(self.vars.len() + 1).map_err(|_| {
            StrataError::record(ErrorKind::NoMemory, "too many variables in group")
        })?;
        let id = VarId(id);

        // Tag every referenced scalar so read-mode sessions may still
        // write it.
        let referenced: Vec<VarId> = dims
            .iter()
            .flat_map(|spec| [spec.local, spec.global, spec.offset])
            .filter_map(|dim| match dim {
                Dim::Var(id) => Some(id),
                _ => None,
            })
            .collect();
        for var_ref in referenced {
            if let Some(var) = self.var_by_id_mut(var_ref) {
                var.is_dim = true;
            } else {
                return Err(StrataError::record(
                    ErrorKind::InvalidDimension,
                    format!("variable `{name}` references undefined variable id {}", var_ref.0),
                ));
            }
        }

        self.vars.push(Variable {
            id,
            name: name.to_string(),
            path: path.to_string(),
            dtype,
            dims,
            transform: transform.map(str::to_string),
            is_dim: false,
            hist_breaks: None,
            value: None,
        });
        self.var_index.insert(key, id);
        Ok(id)
    }

    /// Configure histogram breakpoints for a variable; enables the
    /// histogram statistic when the group collects statistics.
    pub fn enable_histogram(&mut self, id: VarId, breaks: Vec<f64>) -> Result<(), StrataError> {
        let var = self.var_by_id_mut(id).ok_or_else(|| {
            StrataError::record(ErrorKind::InvalidVarid, format!("no variable id {}", id.0))
        })?;
        var.hist_breaks = Some(breaks);
        Ok(())
    }

    pub fn define_attribute(
        &mut self,
        name: &str,
        path: &str,
        dtype: DataType,
        value: AttrValue,
    ) -> Result<AttrId, StrataError> {
        let key = self.key(path, name);
        if self.attr_index.contains_key(&key) {
            return Err(StrataError::record(
                ErrorKind::DuplicateName,
                format!("attribute `{key}` already defined in group `{}`", self.name),
            ));
        }
        if let AttrValue::VarRef(var_ref) = value {
            if self.var_by_id(var_ref).is_none() {
                return Err(StrataError::record(
                    ErrorKind::InvalidVarid,
                    format!("attribute `{name}` references undefined variable id {}", var_ref.0),
                ));
            }
        }
        let id = u16::try_from(self.attrs.len() + 1).map_err(|_| {
            StrataError::record(ErrorKind::NoMemory, "too many attributes in group")
        })?;
        let id = AttrId(id);
        self.attrs.push(Attribute {
            id,
            name: name.to_string(),
            path: path.to_string(),
            dtype,
            value,
        });
        self.attr_index.insert(key, id);
        Ok(id)
    }

    pub fn select_method(&mut self, method: &str, parameters: &str, base_path: &str) {
        self.methods.push(MethodBinding {
            method: method.to_string(),
            parameters: parameters.to_string(),
            base_path: base_path.to_string(),
        });
    }

    pub fn methods(&self) -> &[MethodBinding] {
        &self.methods
    }

    pub fn vars(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }

    pub fn attrs(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter()
    }

    /// Look up a variable respecting the group's naming policy.
    pub fn find_var(&self, path: &str, name: &str) -> Option<&Variable> {
        let id = *self.var_index.get(&self.key(path, name))?;
        self.var_by_id(id)
    }

    pub fn find_var_id(&self, path: &str, name: &str) -> Option<VarId> {
        self.var_index.get(&self.key(path, name)).copied()
    }

    pub fn var_by_id(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id.0.checked_sub(1)? as usize)
    }

    pub fn var_by_id_mut(&mut self, id: VarId) -> Option<&mut Variable> {
        self.vars.get_mut(id.0.checked_sub(1)? as usize)
    }

    pub fn attr_by_id(&self, id: AttrId) -> Option<&Attribute> {
        self.attrs.get(id.0.checked_sub(1)? as usize)
    }

    pub fn find_attr(&self, path: &str, name: &str) -> Option<&Attribute> {
        let id = *self.attr_index.get(&self.key(path, name))?;
        self.attr_by_id(id)
    }

    /// Record the owned copy of a scalar write so later dimension
    /// references resolve to it.
    pub fn set_scalar_value(&mut self, id: VarId, bytes: Vec<u8>) -> Result<(), StrataError> {
        let var = self.var_by_id_mut(id).ok_or_else(|| {
            StrataError::record(ErrorKind::InvalidVarid, format!("no variable id {}", id.0))
        })?;
        var.value = Some(bytes);
        Ok(())
    }
}

impl DimScope for Group {
    fn var_by_name(&self, name: &str) -> Option<VarId> {
        self.find_var_id("", name)
    }

    fn attr_by_name(&self, name: &str) -> Option<AttrId> {
        self.attr_index.get(name).copied()
    }

    fn scalar_value(&self, id: VarId) -> Option<u64> {
        self.var_by_id(id)?.value_as_u64()
    }

    fn attr_value(&self, id: AttrId) -> Option<u64> {
        let attr = self.attr_by_id(id)?;
        match &attr.value {
            AttrValue::Literal(bytes) => scalar_as_u64(attr.dtype, bytes),
            AttrValue::VarRef(var_ref) => self.scalar_value(*var_ref),
        }
    }
}

/// Payload of one written variable: scalars and strings are owned copies,
/// arrays borrow the caller's memory for the life of the session.
#[derive(Debug)]
pub enum Payload<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a [u8]),
}

impl Payload<'_> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Owned(bytes) => bytes,
            Payload::Borrowed(bytes) => bytes,
        }
    }
}

/// Snapshot of one variable write: the state the container codec needs
/// after the application buffer is no longer guaranteed live. For array
/// variables only the borrow descriptor is retained, under the caller's
/// contract that the memory stays valid until close returns.
#[derive(Debug)]
pub struct WrittenVar<'a> {
    pub id: VarId,
    pub axes: Axes,
    pub payload: Payload<'a>,
    pub stats: Option<StatsSet>,
    /// Payload offset inside the process group, assigned at serialization.
    pub write_offset: u64,
}

/// Per-open-file append-only log of writes, used at close to build the
/// process group. Writing a variable twice in one step replaces the earlier
/// entry in place.
#[derive(Debug, Default)]
pub struct WrittenLog<'a> {
    entries: Vec<WrittenVar<'a>>,
    by_var: AHashMap<VarId, usize>,
}

impl<'a> WrittenLog<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, written: WrittenVar<'a>) {
        match self.by_var.get(&written.id) {
            Some(&pos) => self.entries[pos] = written,
            None => {
                self.by_var.insert(written.id, self.entries.len());
                self.entries.push(written);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &WrittenVar<'a>> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WrittenVar<'a>> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_var.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dims::resolve_dims;

    fn mesh_group() -> Group {
        let mut group = Group::new("mesh", Some("step"), true);
        group
            .define_var("npoints", "", DataType::Integer, vec![], None)
            .unwrap();
        group
            .define_var(
                "points",
                "",
                DataType::Double,
                vec![DimSpec::local(Dim::Var(VarId(1)))],
                None,
            )
            .unwrap();
        group
    }

    #[test]
    fn ids_follow_declaration_order() {
        let group = mesh_group();
        assert_eq!(group.find_var_id("", "npoints"), Some(VarId(1)));
        assert_eq!(group.find_var_id("", "points"), Some(VarId(2)));
        let names: Vec<_> = group.vars().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["npoints", "points"]);
    }

    #[test]
    fn duplicate_name_rejected_under_unique_policy() {
        let mut group = mesh_group();
        let err = group
            .define_var("npoints", "other", DataType::Integer, vec![], None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateName);
    }

    #[test]
    fn path_scoped_names_allowed_when_not_unique() {
        let mut group = Group::new("fields", None, false);
        group.set_unique_names(false).unwrap();
        group
            .define_var("T", "/cell", DataType::Double, vec![], None)
            .unwrap();
        group
            .define_var("T", "/node", DataType::Double, vec![], None)
            .unwrap();
        assert!(group.find_var("/cell", "T").is_some());
        assert!(group.find_var("/node", "T").is_some());
    }

    #[test]
    fn referenced_scalar_is_tagged_as_dimension() {
        let group = mesh_group();
        assert!(group.find_var("", "npoints").unwrap().is_dim);
        assert!(!group.find_var("", "points").unwrap().is_dim);
    }

    #[test]
    fn two_time_axes_rejected() {
        let mut group = Group::new("g", None, false);
        let err = group
            .define_var(
                "x",
                "",
                DataType::Double,
                vec![DimSpec::local(Dim::Time), DimSpec::local(Dim::Time)],
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDimension);
    }

    #[test]
    fn dimension_resolution_reads_written_scalar() {
        let mut group = mesh_group();
        group
            .set_scalar_value(VarId(1), 44i32.to_ne_bytes().to_vec())
            .unwrap();
        let dims = group.find_var("", "points").unwrap().dims.clone();
        let (axes, elements) = resolve_dims(&dims, &group, 0).unwrap();
        assert_eq!(axes[0].local, 44);
        assert_eq!(elements, 44);
    }

    #[test]
    fn attribute_value_resolves_literal_and_var_ref() {
        let mut group = mesh_group();
        group
            .define_attribute(
                "nspace",
                "",
                DataType::Integer,
                AttrValue::Literal(2i32.to_ne_bytes().to_vec()),
            )
            .unwrap();
        group
            .define_attribute("np", "", DataType::Integer, AttrValue::VarRef(VarId(1)))
            .unwrap();
        group
            .set_scalar_value(VarId(1), 44i32.to_ne_bytes().to_vec())
            .unwrap();
        assert_eq!(group.attr_value(AttrId(1)), Some(2));
        assert_eq!(group.attr_value(AttrId(2)), Some(44));
    }

    #[test]
    fn later_write_replaces_earlier_in_log() {
        let mut log = WrittenLog::new();
        log.record(WrittenVar {
            id: VarId(1),
            axes: Axes::new(),
            payload: Payload::Owned(vec![1]),
            stats: None,
            write_offset: 0,
        });
        log.record(WrittenVar {
            id: VarId(1),
            axes: Axes::new(),
            payload: Payload::Owned(vec![2]),
            stats: None,
            write_offset: 0,
        });
        assert_eq!(log.len(), 1);
        assert_eq!(log.iter().next().unwrap().payload.bytes(), &[2]);
    }
}
