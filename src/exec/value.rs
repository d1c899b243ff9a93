// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Tagged scalar values and materialized rows.
//!
//! `Value` is the unit of data flowing through blocks and accumulators.
//! Equality and hashing are structural: floats compare by bit pattern so that
//! any value, including NaN, is a well-defined group key.

use std::borrow::Borrow;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::Arc;

/// An owned tagged scalar. `Nothing` doubles as the "no prior value" token fed
/// to an accumulator for the first contribution to a group.
#[derive(Clone, Debug)]
pub enum Value {
    Nothing,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Str(Arc<str>),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn tag_name(&self) -> &'static str {
        match self {
            Value::Nothing => "Nothing",
            Value::Bool(_) => "Bool",
            Value::Int64(_) => "Int64",
            Value::Float64(_) => "Float64",
            Value::Str(_) => "Str",
        }
    }

    /// Logical bytes held by this value, counted against memory budgets.
    pub fn estimated_size(&self) -> usize {
        let payload = match self {
            Value::Str(s) => s.len(),
            _ => 0,
        };
        mem::size_of::<Value>() + payload
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nothing, Value::Nothing) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            Value::Nothing => {}
            Value::Bool(b) => b.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
        }
    }
}

/// A deep-owned ordered tuple of values: group keys and accumulator-state
/// tuples are both rows. Safe to store across batches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Row(Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// A row of `len` `Nothing` slots, the uninitialized accumulator state.
    pub fn filled(len: usize) -> Self {
        Self(vec![Value::Nothing; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn get(&self, idx: usize) -> Result<&Value, String> {
        self.0
            .get(idx)
            .ok_or_else(|| format!("row index {} out of bounds (len={})", idx, self.0.len()))
    }

    pub fn set(&mut self, idx: usize, value: Value) -> Result<(), String> {
        let len = self.0.len();
        let slot = self
            .0
            .get_mut(idx)
            .ok_or_else(|| format!("row index {} out of bounds (len={})", idx, len))?;
        *slot = value;
        Ok(())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub fn estimated_size(&self) -> usize {
        self.0.iter().map(Value::estimated_size).sum()
    }
}

impl Borrow<[Value]> for Row {
    fn borrow(&self) -> &[Value] {
        &self.0
    }
}

impl From<&[Value]> for Row {
    fn from(values: &[Value]) -> Self {
        Self(values.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn float_keys_compare_by_bits() {
        assert_eq!(Value::Float64(f64::NAN), Value::Float64(f64::NAN));
        assert_ne!(Value::Float64(0.0), Value::Float64(-0.0));
        assert_eq!(
            hash_of(&Value::Float64(1.5)),
            hash_of(&Value::Float64(1.5))
        );
    }

    #[test]
    fn tags_do_not_cross_compare() {
        assert_ne!(Value::Int64(1), Value::Float64(1.0));
        assert_ne!(Value::Bool(false), Value::Nothing);
    }

    #[test]
    fn row_hashes_like_value_slice() {
        use std::hash::BuildHasher;
        let row = Row::new(vec![Value::Int64(7), Value::str("a")]);
        let hasher = std::collections::hash_map::RandomState::new();
        let slice: &[Value] = row.values();
        assert_eq!(hasher.hash_one(&row), hasher.hash_one(slice));
    }

    #[test]
    fn estimated_size_counts_string_payload() {
        let short = Value::str("a");
        let long = Value::str("abcdefghij");
        assert!(long.estimated_size() > short.estimated_size());
    }
}
