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
//! Per-batch compound-key tokenization for the vectorized accumulation path.

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use crate::exec::block::{TokenizedBlock, ValueBlock};
use crate::exec::value::Row;

/// Result of tokenizing one batch's group-by columns: one materialized key
/// per partition (first-seen order) and the partition id of every row.
#[derive(Debug)]
pub(crate) struct TokenizedKeys {
    pub keys: Vec<Row>,
    pub idxs: Vec<usize>,
}

/// Tokenize the group-by blocks of one batch into compound partition keys.
///
/// Deduplication is keyed on the tuple of per-column token indices, never on
/// the dereferenced values, so each row costs a few integer comparisons.
/// Returns `None` once the number of distinct partitions exceeds
/// `partition_limit`: near-unique keys would make partition-at-a-time
/// processing slower than plain element-wise accumulation, so the caller
/// falls back.
pub(crate) fn try_tokenize(
    gb_blocks: &[&dyn ValueBlock],
    num_rows: usize,
    partition_limit: usize,
) -> Result<Option<TokenizedKeys>, String> {
    if gb_blocks.is_empty() {
        return Err("tokenize requires at least one group-by block".to_string());
    }

    let mut token_infos: Vec<TokenizedBlock> = Vec::with_capacity(gb_blocks.len());
    for block in gb_blocks {
        let info = block.tokenize();
        if info.idxs.len() != num_rows {
            return Err(format!(
                "tokenized block length mismatch: got {} rows, expected {}",
                info.idxs.len(),
                num_rows
            ));
        }
        token_infos.push(info);
    }

    let num_cols = token_infos.len();
    let mut partitions: HashMap<Vec<usize>, usize> = HashMap::new();
    let mut keys: Vec<Row> = Vec::new();
    let mut idxs = vec![0usize; num_rows];

    for row in 0..num_rows {
        let mut compound = Vec::with_capacity(num_cols);
        for info in &token_infos {
            compound.push(info.idxs[row]);
        }

        let partition = match partitions.entry(compound) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let id = keys.len();
                if id + 1 > partition_limit {
                    // Too many partitions for this batch to be worth the
                    // tokenized path.
                    return Ok(None);
                }
                let mut key = Vec::with_capacity(num_cols);
                for (col, info) in token_infos.iter().enumerate() {
                    let token_idx = entry.key()[col];
                    let token = info.tokens.get(token_idx).ok_or_else(|| {
                        format!(
                            "token index {} out of bounds for group-by column {} ({} tokens)",
                            token_idx,
                            col,
                            info.tokens.len()
                        )
                    })?;
                    key.push(token.clone());
                }
                keys.push(Row::new(key));
                *entry.insert(id)
            }
        };
        idxs[row] = partition;
    }

    Ok(Some(TokenizedKeys { keys, idxs }))
}
