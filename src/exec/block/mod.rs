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
//! Columnar batch abstraction consumed by block operators.
//!
//! Responsibilities:
//! - Defines the `ValueBlock` contract (count, extract, tokenize, clone) and
//!   its three kinds: materialized vector, constant-repeated, single-value view.
//! - Defines `BlockChunk`, one batch of equal-length columns addressed by slot
//!   id, with duplicate-slot and length invariants enforced at construction.
//! - Provides the selection-bitmap helpers used by the aggregation operator.

use std::borrow::Cow;

use hashbrown::HashMap;

use crate::common::ids::SlotId;
use crate::exec::value::Value;

/// Dictionary view of a block: `tokens` holds each distinct value in
/// first-occurrence order and `idxs[row]` indexes into it.
#[derive(Debug)]
pub struct TokenizedBlock {
    pub tokens: Vec<Value>,
    pub idxs: Vec<usize>,
}

/// One column of a batch. Implementations differ in storage, never in the
/// observable sequence of tagged values.
pub trait ValueBlock {
    /// Number of rows in the block.
    fn count(&self) -> usize;

    /// Deblock to a scalar sequence. Borrowed where storage allows.
    fn extract(&self) -> Cow<'_, [Value]>;

    /// Build a distinct-value dictionary plus per-row indices. Dictionary
    /// order is first occurrence, deterministic and unsorted.
    fn tokenize(&self) -> TokenizedBlock;

    fn clone_block(&self) -> Box<dyn ValueBlock>;
}

/// Fully materialized vector of values.
#[derive(Clone, Debug)]
pub struct MaterializedBlock {
    values: Vec<Value>,
}

impl MaterializedBlock {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
}

impl ValueBlock for MaterializedBlock {
    fn count(&self) -> usize {
        self.values.len()
    }

    fn extract(&self) -> Cow<'_, [Value]> {
        Cow::Borrowed(&self.values)
    }

    fn tokenize(&self) -> TokenizedBlock {
        let mut seen: HashMap<&Value, usize> = HashMap::with_capacity(self.values.len());
        let mut tokens = Vec::new();
        let mut idxs = Vec::with_capacity(self.values.len());
        for value in &self.values {
            let next = tokens.len();
            let idx = *seen.entry(value).or_insert_with(|| {
                tokens.push(value.clone());
                next
            });
            idxs.push(idx);
        }
        TokenizedBlock { tokens, idxs }
    }

    fn clone_block(&self) -> Box<dyn ValueBlock> {
        Box::new(self.clone())
    }
}

/// A single value repeated `len` times without materializing it.
#[derive(Clone, Debug)]
pub struct MonoBlock {
    value: Value,
    len: usize,
}

impl MonoBlock {
    pub fn new(value: Value, len: usize) -> Self {
        Self { value, len }
    }

    /// All-true selection bitmap of the given length.
    pub fn all_true(len: usize) -> Self {
        Self::new(Value::Bool(true), len)
    }
}

impl ValueBlock for MonoBlock {
    fn count(&self) -> usize {
        self.len
    }

    fn extract(&self) -> Cow<'_, [Value]> {
        Cow::Owned(vec![self.value.clone(); self.len])
    }

    fn tokenize(&self) -> TokenizedBlock {
        TokenizedBlock {
            tokens: vec![self.value.clone()],
            idxs: vec![0; self.len],
        }
    }

    fn clone_block(&self) -> Box<dyn ValueBlock> {
        Box::new(self.clone())
    }
}

/// View of exactly one value, for feeding an externally-owned scalar to code
/// that expects a block without copying it into a vector.
#[derive(Clone, Debug)]
pub struct SingletonBlock {
    value: Value,
}

impl SingletonBlock {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl ValueBlock for SingletonBlock {
    fn count(&self) -> usize {
        1
    }

    fn extract(&self) -> Cow<'_, [Value]> {
        Cow::Borrowed(std::slice::from_ref(&self.value))
    }

    fn tokenize(&self) -> TokenizedBlock {
        TokenizedBlock {
            tokens: vec![self.value.clone()],
            idxs: vec![0],
        }
    }

    fn clone_block(&self) -> Box<dyn ValueBlock> {
        Box::new(self.clone())
    }
}

/// One batch: equal-length columns addressed by unique slot ids.
pub struct BlockChunk {
    columns: Vec<(SlotId, Box<dyn ValueBlock>)>,
    slot_to_index: HashMap<SlotId, usize>,
    num_rows: usize,
}

impl BlockChunk {
    pub fn try_new(columns: Vec<(SlotId, Box<dyn ValueBlock>)>) -> Result<Self, String> {
        let num_rows = columns.first().map(|(_, block)| block.count()).unwrap_or(0);
        let mut slot_to_index = HashMap::with_capacity(columns.len());
        for (idx, (slot, block)) in columns.iter().enumerate() {
            if block.count() != num_rows {
                return Err(format!(
                    "block length mismatch in chunk: slot {} has {} rows, expected {}",
                    slot,
                    block.count(),
                    num_rows
                ));
            }
            if slot_to_index.insert(*slot, idx).is_some() {
                // A duplicate slot id would make column resolution ambiguous.
                return Err(format!("duplicate slot id {} in chunk", slot));
            }
        }
        Ok(Self {
            columns,
            slot_to_index,
            num_rows,
        })
    }

    pub fn len(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, slot: SlotId) -> Result<&dyn ValueBlock, String> {
        let idx = self.slot_to_index.get(&slot).copied().ok_or_else(|| {
            format!(
                "slot id {} not found in chunk (slots={:?})",
                slot,
                self.slot_to_index.keys().collect::<Vec<_>>()
            )
        })?;
        Ok(self.columns[idx].1.as_ref())
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.columns.iter().map(|(slot, _)| *slot)
    }
}

impl Clone for BlockChunk {
    fn clone(&self) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|(slot, block)| (*slot, block.clone_block()))
                .collect(),
            slot_to_index: self.slot_to_index.clone(),
            num_rows: self.num_rows,
        }
    }
}

impl std::fmt::Debug for BlockChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockChunk")
            .field("num_rows", &self.num_rows)
            .field("slots", &self.columns.iter().map(|(s, _)| *s).collect::<Vec<_>>())
            .finish()
    }
}

/// Deblock a boolean selection column, rejecting any non-boolean tag.
pub fn extract_bitmap(block: &dyn ValueBlock) -> Result<Vec<bool>, String> {
    let values = block.extract();
    let mut bits = Vec::with_capacity(values.len());
    for (row, value) in values.iter().enumerate() {
        let bit = value.as_bool().ok_or_else(|| {
            format!(
                "selection bitmap holds {} at row {}, expected Bool",
                value.tag_name(),
                row
            )
        })?;
        bits.push(bit);
    }
    Ok(bits)
}

pub fn all_false(bits: &[bool]) -> bool {
    !bits.iter().any(|b| *b)
}

/// Membership mask: true where the row belongs to `partition`.
pub fn partition_mask(partition_ids: &[usize], partition: usize) -> Vec<bool> {
    partition_ids.iter().map(|id| *id == partition).collect()
}

pub fn bit_and(lhs: &[bool], rhs: &[bool]) -> Result<Vec<bool>, String> {
    if lhs.len() != rhs.len() {
        return Err(format!(
            "bitmap length mismatch: {} vs {}",
            lhs.len(),
            rhs.len()
        ));
    }
    Ok(lhs.iter().zip(rhs.iter()).map(|(a, b)| *a && *b).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_block(values: &[i64]) -> MaterializedBlock {
        MaterializedBlock::new(values.iter().map(|v| Value::Int64(*v)).collect())
    }

    #[test]
    fn tokenize_keeps_first_occurrence_order() {
        let block = int_block(&[3, 1, 3, 2, 1]);
        let tokenized = block.tokenize();
        assert_eq!(
            tokenized.tokens,
            vec![Value::Int64(3), Value::Int64(1), Value::Int64(2)]
        );
        assert_eq!(tokenized.idxs, vec![0, 1, 0, 2, 1]);
    }

    #[test]
    fn mono_block_tokenizes_to_single_token() {
        let block = MonoBlock::new(Value::str("k"), 4);
        let tokenized = block.tokenize();
        assert_eq!(tokenized.tokens.len(), 1);
        assert_eq!(tokenized.idxs, vec![0, 0, 0, 0]);
        assert_eq!(block.extract().len(), 4);
    }

    #[test]
    fn singleton_block_is_a_one_row_view() {
        let block = SingletonBlock::new(Value::Int64(9));
        assert_eq!(block.count(), 1);
        assert_eq!(block.extract().as_ref(), &[Value::Int64(9)]);
    }

    #[test]
    fn chunk_rejects_duplicate_slots() {
        let err = BlockChunk::try_new(vec![
            (SlotId::new(1), Box::new(int_block(&[1])) as Box<dyn ValueBlock>),
            (SlotId::new(1), Box::new(int_block(&[2]))),
        ])
        .expect_err("expected duplicate slot error");
        assert!(err.contains("duplicate slot id"), "err={}", err);
    }

    #[test]
    fn chunk_rejects_length_mismatch() {
        let err = BlockChunk::try_new(vec![
            (SlotId::new(1), Box::new(int_block(&[1, 2])) as Box<dyn ValueBlock>),
            (SlotId::new(2), Box::new(int_block(&[3]))),
        ])
        .expect_err("expected length error");
        assert!(err.contains("length mismatch"), "err={}", err);
    }

    #[test]
    fn bitmap_helpers() {
        let bits = extract_bitmap(&MonoBlock::all_true(3)).expect("bitmap");
        assert_eq!(bits, vec![true, true, true]);
        assert!(all_false(&[false, false]));
        assert!(!all_false(&[false, true]));

        let mask = partition_mask(&[0, 1, 0, 2], 0);
        assert_eq!(mask, vec![true, false, true, false]);
        let combined = bit_and(&mask, &[true, true, false, true]).expect("and");
        assert_eq!(combined, vec![true, false, false, false]);

        let err = bit_and(&[true], &[true, false]).expect_err("length");
        assert!(err.contains("length mismatch"), "err={}", err);
    }

    #[test]
    fn non_bool_bitmap_is_rejected() {
        let err = extract_bitmap(&int_block(&[1])).expect_err("expected tag error");
        assert!(err.contains("expected Bool"), "err={}", err);
    }
}
