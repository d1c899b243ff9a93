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
//! Compiled aggregate kernels.
//!
//! Each aggregate ships in three forms driven by the hash-agg operator:
//! a block-level accumulator (whole column plus selection bitmap), a row-level
//! accumulator (one scalar), and an associative merge used when partial
//! aggregates are recovered from spill. All three accept `Value::Nothing` as
//! the uninitialized prior state of a freshly inserted group, and the block
//! and row forms are required to produce identical results over the same
//! selected rows.

use crate::exec::block::ValueBlock;
use crate::exec::value::Value;

/// Declared aggregate expression, resolved to an `AggKernel` at prepare time.
#[derive(Clone, Debug)]
pub struct AggFunction {
    pub name: String,
}

impl AggFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggKernel {
    Count,
    Sum,
    Min,
    Max,
}

/// Resolve declared aggregate functions into kernels; order is preserved.
pub fn build_kernels(functions: &[AggFunction]) -> Result<Vec<AggKernel>, String> {
    functions.iter().map(|f| AggKernel::compile(&f.name)).collect()
}

impl AggKernel {
    pub fn compile(name: &str) -> Result<Self, String> {
        match name {
            "count" => Ok(AggKernel::Count),
            "sum" => Ok(AggKernel::Sum),
            "min" => Ok(AggKernel::Min),
            "max" => Ok(AggKernel::Max),
            other => Err(format!("unknown aggregate function '{}'", other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggKernel::Count => "count",
            AggKernel::Sum => "sum",
            AggKernel::Min => "min",
            AggKernel::Max => "max",
        }
    }

    /// Block-level accumulator: folds every selected row of `data` into
    /// `prev` and returns the new state.
    pub fn update_block(
        &self,
        prev: &Value,
        data: &dyn ValueBlock,
        selection: &[bool],
    ) -> Result<Value, String> {
        let values = data.extract();
        if values.len() != selection.len() {
            return Err(format!(
                "accumulator input length mismatch: data has {} rows, selection has {}",
                values.len(),
                selection.len()
            ));
        }
        let mut state = prev.clone();
        for (value, selected) in values.iter().zip(selection.iter()) {
            if *selected {
                state = self.update_row(&state, value)?;
            }
        }
        Ok(state)
    }

    /// Row-level accumulator: folds one scalar into `prev`. `Nothing` inputs
    /// contribute nothing, matching SQL null semantics.
    pub fn update_row(&self, prev: &Value, value: &Value) -> Result<Value, String> {
        if value.is_nothing() {
            return Ok(prev.clone());
        }
        match self {
            AggKernel::Count => numeric_add(prev, &Value::Int64(1)),
            AggKernel::Sum => numeric_add(prev, value),
            AggKernel::Min => pick_extreme(prev, value, std::cmp::Ordering::Less),
            AggKernel::Max => pick_extreme(prev, value, std::cmp::Ordering::Greater),
        }
    }

    /// Associative merge of two partial states for the same key. Commutes, so
    /// the order spill events split a group across records does not matter.
    pub fn merge(&self, prev: &Value, partial: &Value) -> Result<Value, String> {
        if partial.is_nothing() {
            return Ok(prev.clone());
        }
        match self {
            AggKernel::Count | AggKernel::Sum => numeric_add(prev, partial),
            AggKernel::Min => pick_extreme(prev, partial, std::cmp::Ordering::Less),
            AggKernel::Max => pick_extreme(prev, partial, std::cmp::Ordering::Greater),
        }
    }

    pub fn block_text(&self) -> String {
        format!("block_{}(data, selection)", self.name())
    }

    pub fn row_text(&self) -> String {
        format!("{}(value)", self.name())
    }

    pub fn merge_text(&self) -> String {
        format!("merge_{}(partial)", self.name())
    }
}

fn numeric_add(prev: &Value, value: &Value) -> Result<Value, String> {
    match (prev, value) {
        (Value::Nothing, v) => Ok(v.clone()),
        (Value::Int64(a), Value::Int64(b)) => a
            .checked_add(*b)
            .map(Value::Int64)
            .ok_or_else(|| format!("integer overflow adding {} and {}", a, b)),
        (Value::Int64(a), Value::Float64(b)) => Ok(Value::Float64(*a as f64 + b)),
        (Value::Float64(a), Value::Int64(b)) => Ok(Value::Float64(a + *b as f64)),
        (Value::Float64(a), Value::Float64(b)) => Ok(Value::Float64(a + b)),
        (a, b) => Err(format!(
            "cannot add {} and {} in aggregate",
            a.tag_name(),
            b.tag_name()
        )),
    }
}

fn compare_values(a: &Value, b: &Value) -> Result<std::cmp::Ordering, String> {
    match (a, b) {
        (Value::Int64(x), Value::Int64(y)) => Ok(x.cmp(y)),
        (Value::Float64(x), Value::Float64(y)) => x
            .partial_cmp(y)
            .ok_or_else(|| "cannot order NaN in min/max aggregate".to_string()),
        (Value::Int64(x), Value::Float64(y)) => (*x as f64)
            .partial_cmp(y)
            .ok_or_else(|| "cannot order NaN in min/max aggregate".to_string()),
        (Value::Float64(x), Value::Int64(y)) => x
            .partial_cmp(&(*y as f64))
            .ok_or_else(|| "cannot order NaN in min/max aggregate".to_string()),
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (a, b) => Err(format!(
            "cannot compare {} and {} in min/max aggregate",
            a.tag_name(),
            b.tag_name()
        )),
    }
}

fn pick_extreme(
    prev: &Value,
    value: &Value,
    keep_if: std::cmp::Ordering,
) -> Result<Value, String> {
    if prev.is_nothing() {
        return Ok(value.clone());
    }
    if compare_values(value, prev)? == keep_if {
        Ok(value.clone())
    } else {
        Ok(prev.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::block::MaterializedBlock;

    fn ints(values: &[i64]) -> MaterializedBlock {
        MaterializedBlock::new(values.iter().map(|v| Value::Int64(*v)).collect())
    }

    #[test]
    fn sum_block_respects_selection() {
        let kernel = AggKernel::compile("sum").expect("kernel");
        let data = ints(&[10, 20, 5]);
        let state = kernel
            .update_block(&Value::Nothing, &data, &[true, false, true])
            .expect("update");
        assert_eq!(state, Value::Int64(15));
    }

    #[test]
    fn block_and_row_forms_agree() {
        let kernel = AggKernel::compile("sum").expect("kernel");
        let data = ints(&[1, 2, 3, 4]);
        let selection = [true, true, false, true];

        let block_state = kernel
            .update_block(&Value::Nothing, &data, &selection)
            .expect("block");

        let mut row_state = Value::Nothing;
        for (value, selected) in data.extract().iter().zip(selection.iter()) {
            if *selected {
                row_state = kernel.update_row(&row_state, value).expect("row");
            }
        }
        assert_eq!(block_state, row_state);
    }

    #[test]
    fn count_skips_nothing_inputs() {
        let kernel = AggKernel::compile("count").expect("kernel");
        let mut state = Value::Nothing;
        for value in [Value::Int64(1), Value::Nothing, Value::Int64(3)] {
            state = kernel.update_row(&state, &value).expect("row");
        }
        assert_eq!(state, Value::Int64(2));
    }

    #[test]
    fn min_max_track_extremes_from_nothing() {
        let min = AggKernel::compile("min").expect("kernel");
        let max = AggKernel::compile("max").expect("kernel");
        let mut lo = Value::Nothing;
        let mut hi = Value::Nothing;
        for v in [7i64, 3, 9, 3] {
            lo = min.update_row(&lo, &Value::Int64(v)).expect("min");
            hi = max.update_row(&hi, &Value::Int64(v)).expect("max");
        }
        assert_eq!(lo, Value::Int64(3));
        assert_eq!(hi, Value::Int64(9));
    }

    #[test]
    fn merge_is_commutative_over_partials() {
        let kernel = AggKernel::compile("sum").expect("kernel");
        let a = Value::Int64(30);
        let b = Value::Int64(12);
        let ab = kernel.merge(&a, &b).expect("merge");
        let ba = kernel.merge(&b, &a).expect("merge");
        assert_eq!(ab, ba);
        assert_eq!(kernel.merge(&Value::Nothing, &a).expect("merge"), a);
        assert_eq!(kernel.merge(&a, &Value::Nothing).expect("merge"), a);
    }

    #[test]
    fn sum_overflow_is_an_error() {
        let kernel = AggKernel::compile("sum").expect("kernel");
        let err = kernel
            .update_row(&Value::Int64(i64::MAX), &Value::Int64(1))
            .expect_err("expected overflow");
        assert!(err.contains("overflow"), "err={}", err);
    }

    #[test]
    fn unknown_function_is_rejected() {
        let err = AggKernel::compile("median").expect_err("expected unknown");
        assert!(err.contains("unknown aggregate"), "err={}", err);
    }
}
