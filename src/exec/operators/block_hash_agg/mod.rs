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
//! Vectorized GROUP BY hash aggregation over block chunks.
//!
//! Responsibilities:
//! - `open()` is an aggregation barrier: it consumes the child to exhaustion,
//!   folding every batch into an in-memory group table and spilling the table
//!   whenever it outgrows its memory budget.
//! - Each batch is accumulated partition-at-a-time when tokenizing its
//!   group-by columns stays under the partition limit, and row-at-a-time
//!   otherwise; both strategies honor the batch's selection bitmap.
//! - `get_next()` drains results in blocks: straight from the resident table
//!   when nothing spilled, or through the key-merging spill scan otherwise.
//!
//! Output chunks carry the group-key columns under the group-by slots, one
//! column per aggregate under its output slot, and an all-true selection
//! bitmap under the bitmap slot.

mod group_table;
mod spill;
mod tokenize;

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use hashbrown::HashSet;

use crate::common::config;
use crate::common::ids::SlotId;
use crate::exec::block::{
    all_false, bit_and, extract_bitmap, partition_mask, BlockChunk, MaterializedBlock, MonoBlock,
    ValueBlock,
};
use crate::exec::expr::{build_kernels, AggFunction, AggKernel};
use crate::exec::stage::{PlanStage, StageStats};
use crate::exec::value::{Row, Value};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::metrics::SpillMetrics;
use crate::runtime::yield_policy::{NeverYield, YieldPolicy};

use group_table::GroupTable;
use spill::{MergeReader, SpillPipeline};
use tokenize::{try_tokenize, TokenizedKeys};

const STAGE_NAME: &str = "BLOCK_HASH_AGG";

/// Counters for one stage, folded into `StageStats` on request.
#[derive(Clone, Debug, Default)]
pub(crate) struct HashAggStats {
    pub opens: u64,
    pub rows_produced: u64,
    pub spills: u64,
    pub spilled_records: u64,
    pub spilled_bytes: u64,
}

/// Blocking GROUP BY hash aggregation stage with external spill.
pub struct BlockHashAggStage {
    child: Box<dyn PlanStage>,
    group_slots: Vec<SlotId>,
    bitmap_slot: SlotId,
    agg_data_slots: Vec<SlotId>,
    agg_out_slots: Vec<SlotId>,
    functions: Vec<AggFunction>,
    kernels: Vec<AggKernel>,
    allow_disk_use: bool,
    force_increased_spilling: bool,
    partition_limit: usize,
    block_out_rows: usize,
    memory_budget: usize,
    spill_dir: PathBuf,
    yield_policy: Arc<dyn YieldPolicy>,
    metrics: Arc<SpillMetrics>,
    tracker: Arc<MemTracker>,

    opened: bool,
    done: bool,
    spilled: bool,
    resident: Vec<(Row, Row)>,
    resident_pos: usize,
    spill: SpillPipeline,
    merge: MergeReader,
    stats: HashAggStats,
}

impl BlockHashAggStage {
    /// Validate the slot layout and compile the aggregate kernels.
    ///
    /// `agg_data_slots`, `functions`, and `agg_out_slots` run in parallel: the
    /// i-th aggregate reads its input column from `agg_data_slots[i]` and
    /// publishes its result under `agg_out_slots[i]`. Data slots may alias
    /// group-by slots (aggregating a key column is legal); output slots, the
    /// group-by slots, and the bitmap slot must be pairwise distinct or the
    /// output chunk would be ambiguous.
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        child: Box<dyn PlanStage>,
        group_slots: Vec<SlotId>,
        bitmap_slot: SlotId,
        agg_data_slots: Vec<SlotId>,
        functions: Vec<AggFunction>,
        agg_out_slots: Vec<SlotId>,
        allow_disk_use: bool,
        force_increased_spilling: bool,
    ) -> Result<Self, String> {
        if group_slots.is_empty() {
            return Err("hash aggregation requires at least one group-by slot".to_string());
        }
        if agg_data_slots.len() != functions.len() || functions.len() != agg_out_slots.len() {
            return Err(format!(
                "aggregate declaration mismatch: {} data slots, {} functions, {} output slots",
                agg_data_slots.len(),
                functions.len(),
                agg_out_slots.len()
            ));
        }
        if force_increased_spilling && !allow_disk_use {
            return Err(
                "forced spilling requires disk use to be allowed for this stage".to_string(),
            );
        }

        let mut seen: HashSet<SlotId> = HashSet::new();
        for slot in std::iter::once(bitmap_slot)
            .chain(group_slots.iter().copied())
            .chain(agg_out_slots.iter().copied())
        {
            if !seen.insert(slot) {
                return Err(format!("duplicate output slot id {} in hash aggregation", slot));
            }
        }

        let kernels = build_kernels(&functions)?;
        let memory_budget = config::agg_memory_budget_bytes();
        let spill_dir = config::spill_local_dir();
        Ok(Self {
            child,
            group_slots,
            bitmap_slot,
            agg_data_slots,
            agg_out_slots,
            functions,
            kernels,
            allow_disk_use,
            force_increased_spilling,
            partition_limit: config::agg_tokenized_partition_limit(),
            block_out_rows: config::agg_block_out_rows(),
            memory_budget,
            spill_dir: spill_dir.clone(),
            yield_policy: Arc::new(NeverYield),
            metrics: Arc::new(SpillMetrics::new()),
            tracker: MemTracker::new_root(STAGE_NAME),
            opened: false,
            done: false,
            spilled: false,
            resident: Vec::new(),
            resident_pos: 0,
            spill: SpillPipeline::new(
                memory_budget,
                force_increased_spilling,
                allow_disk_use,
                spill_dir,
            ),
            merge: MergeReader::new(),
            stats: HashAggStats::default(),
        })
    }

    pub fn with_yield_policy(mut self, policy: Arc<dyn YieldPolicy>) -> Self {
        self.yield_policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SpillMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_partition_limit(mut self, limit: usize) -> Self {
        self.partition_limit = limit;
        self
    }

    pub fn with_block_out_rows(mut self, rows: usize) -> Self {
        self.block_out_rows = rows.max(1);
        self
    }

    pub fn with_spill_dir(mut self, dir: PathBuf) -> Self {
        self.spill_dir = dir;
        self
    }

    pub fn memory_peak_bytes(&self) -> i64 {
        self.tracker.peak()
    }

    fn reset_exec_state(&mut self) {
        self.opened = false;
        self.done = false;
        self.spilled = false;
        self.resident.clear();
        self.resident_pos = 0;
        self.spill = SpillPipeline::new(
            self.memory_budget,
            self.force_increased_spilling,
            self.allow_disk_use,
            self.spill_dir.clone(),
        );
        self.merge.clear();
    }

    fn fold_chunk(&self, table: &mut GroupTable, chunk: &BlockChunk) -> Result<(), String> {
        let bits = extract_bitmap(chunk.column(self.bitmap_slot)?)?;
        if all_false(&bits) {
            // Nothing selected; the batch must not create any entries.
            return Ok(());
        }

        let mut gb_blocks: Vec<&dyn ValueBlock> = Vec::with_capacity(self.group_slots.len());
        for slot in &self.group_slots {
            gb_blocks.push(chunk.column(*slot)?);
        }
        let mut data_blocks: Vec<&dyn ValueBlock> = Vec::with_capacity(self.agg_data_slots.len());
        for slot in &self.agg_data_slots {
            data_blocks.push(chunk.column(*slot)?);
        }

        match try_tokenize(&gb_blocks, chunk.len(), self.partition_limit)? {
            Some(tokenized) => self.accumulate_tokenized(table, &tokenized, &data_blocks, &bits),
            None => self.accumulate_element_wise(table, &gb_blocks, &data_blocks, &bits),
        }
    }

    /// Partition-at-a-time accumulation: one table probe and one block-level
    /// kernel run per partition, regardless of how many rows it covers.
    fn accumulate_tokenized(
        &self,
        table: &mut GroupTable,
        tokenized: &TokenizedKeys,
        data_blocks: &[&dyn ValueBlock],
        bits: &[bool],
    ) -> Result<(), String> {
        let tracker = table.tracker_handle();
        let single_partition = tokenized.keys.len() == 1;
        for (partition, key) in tokenized.keys.iter().enumerate() {
            let selection = if single_partition {
                // The whole batch shares one key; the bitmap is the selection.
                bits.to_vec()
            } else {
                bit_and(&partition_mask(&tokenized.idxs, partition), bits)?
            };
            if all_false(&selection) {
                continue;
            }

            let state = table.find_or_insert(key.values());
            let before = state.estimated_size();
            for (idx, kernel) in self.kernels.iter().enumerate() {
                let prev = state.get(idx)?.clone();
                let next = kernel.update_block(&prev, data_blocks[idx], &selection)?;
                state.set(idx, next)?;
            }
            let after = state.estimated_size();
            if after >= before {
                tracker.consume((after - before) as i64);
            } else {
                tracker.release((before - after) as i64);
            }
        }
        Ok(())
    }

    /// Row-at-a-time fallback used when a batch has too many distinct keys for
    /// tokenization to pay off.
    fn accumulate_element_wise(
        &self,
        table: &mut GroupTable,
        gb_blocks: &[&dyn ValueBlock],
        data_blocks: &[&dyn ValueBlock],
        bits: &[bool],
    ) -> Result<(), String> {
        let tracker = table.tracker_handle();
        let gbs: Vec<Cow<'_, [Value]>> = gb_blocks.iter().map(|b| b.extract()).collect();
        let datas: Vec<Cow<'_, [Value]>> = data_blocks.iter().map(|b| b.extract()).collect();
        for col in gbs.iter().chain(datas.iter()) {
            if col.len() != bits.len() {
                return Err(format!(
                    "column length mismatch in batch: {} rows vs {} bitmap bits",
                    col.len(),
                    bits.len()
                ));
            }
        }

        let mut key_buf: Vec<Value> = Vec::with_capacity(gbs.len());
        for row in 0..bits.len() {
            if !bits[row] {
                continue;
            }
            key_buf.clear();
            for col in &gbs {
                key_buf.push(col[row].clone());
            }

            let state = table.find_or_insert(&key_buf);
            let before = state.estimated_size();
            for (idx, kernel) in self.kernels.iter().enumerate() {
                let prev = state.get(idx)?.clone();
                let next = kernel.update_row(&prev, &datas[idx][row])?;
                state.set(idx, next)?;
            }
            let after = state.estimated_size();
            if after >= before {
                tracker.consume((after - before) as i64);
            } else {
                tracker.release((before - after) as i64);
            }
        }
        Ok(())
    }

    fn make_output_chunk(&self, rows: &[(Row, Row)]) -> Result<BlockChunk, String> {
        let num_rows = rows.len();
        let mut columns: Vec<(SlotId, Box<dyn ValueBlock>)> =
            Vec::with_capacity(self.group_slots.len() + self.agg_out_slots.len() + 1);

        for (col, slot) in self.group_slots.iter().enumerate() {
            let mut values = Vec::with_capacity(num_rows);
            for (key, _) in rows {
                if key.len() != self.group_slots.len() {
                    return Err(format!(
                        "group key width mismatch: key has {} values, stage declares {} group-by slots",
                        key.len(),
                        self.group_slots.len()
                    ));
                }
                values.push(key.get(col)?.clone());
            }
            columns.push((*slot, Box::new(MaterializedBlock::new(values))));
        }

        for (idx, slot) in self.agg_out_slots.iter().enumerate() {
            let mut values = Vec::with_capacity(num_rows);
            for (_, state) in rows {
                if state.len() != self.kernels.len() {
                    return Err(format!(
                        "accumulator state width mismatch: state has {} values, {} aggregates compiled",
                        state.len(),
                        self.kernels.len()
                    ));
                }
                values.push(state.get(idx)?.clone());
            }
            columns.push((*slot, Box::new(MaterializedBlock::new(values))));
        }

        // Downstream block stages read the selection slot; every aggregated
        // output row is live.
        columns.push((self.bitmap_slot, Box::new(MonoBlock::all_true(num_rows))));
        BlockChunk::try_new(columns)
    }
}

impl PlanStage for BlockHashAggStage {
    fn open(&mut self, re_open: bool) -> Result<(), String> {
        if self.opened && !re_open {
            return Err("hash aggregation stage is already open".to_string());
        }
        self.reset_exec_state();
        self.stats.opens += 1;
        self.child.open(re_open)?;

        let table_tracker = MemTracker::new_child("group_table", &self.tracker);
        let mut table = GroupTable::new(self.kernels.len(), table_tracker);

        // Build phase: an aggregation barrier. All input is folded before the
        // first output row, so spill writes finish before any cursor read.
        loop {
            self.yield_policy.check_for_interrupt()?;
            let Some(chunk) = self.child.get_next()? else {
                break;
            };
            if chunk.is_empty() {
                continue;
            }
            self.fold_chunk(&mut table, &chunk)?;
            self.spill
                .maybe_spill(&mut table, &mut self.stats, &self.metrics)?;
        }

        self.spilled = self
            .spill
            .finalize_build(&mut table, &mut self.stats, &self.metrics)?;
        if !self.spilled {
            self.resident = table.drain_rows();
        }
        self.opened = true;
        Ok(())
    }

    fn get_next(&mut self) -> Result<Option<BlockChunk>, String> {
        if !self.opened {
            return Err("hash aggregation stage is not open".to_string());
        }
        if self.done {
            return Ok(None);
        }

        let mut rows: Vec<(Row, Row)> = Vec::with_capacity(self.block_out_rows);
        if self.spilled {
            while rows.len() < self.block_out_rows {
                self.yield_policy.check_for_interrupt()?;
                let store = self.spill.store_mut()?;
                match self.merge.next_group(store, &self.kernels)? {
                    Some(group) => rows.push(group),
                    None => break,
                }
            }
        } else {
            self.yield_policy.check_for_interrupt()?;
            let end = (self.resident_pos + self.block_out_rows).min(self.resident.len());
            rows.extend(self.resident[self.resident_pos..end].iter().cloned());
            self.resident_pos = end;
        }

        if rows.is_empty() {
            self.done = true;
            return Ok(None);
        }
        self.stats.rows_produced += rows.len() as u64;
        Ok(Some(self.make_output_chunk(&rows)?))
    }

    fn close(&mut self) {
        self.child.close();
        self.reset_exec_state();
    }

    fn clone_stage(&self) -> Box<dyn PlanStage> {
        Box::new(Self {
            child: self.child.clone_stage(),
            group_slots: self.group_slots.clone(),
            bitmap_slot: self.bitmap_slot,
            agg_data_slots: self.agg_data_slots.clone(),
            agg_out_slots: self.agg_out_slots.clone(),
            functions: self.functions.clone(),
            kernels: self.kernels.clone(),
            allow_disk_use: self.allow_disk_use,
            force_increased_spilling: self.force_increased_spilling,
            partition_limit: self.partition_limit,
            block_out_rows: self.block_out_rows,
            memory_budget: self.memory_budget,
            spill_dir: self.spill_dir.clone(),
            yield_policy: Arc::clone(&self.yield_policy),
            metrics: Arc::clone(&self.metrics),
            tracker: MemTracker::new_root(STAGE_NAME),
            opened: false,
            done: false,
            spilled: false,
            resident: Vec::new(),
            resident_pos: 0,
            spill: SpillPipeline::new(
                self.memory_budget,
                self.force_increased_spilling,
                self.allow_disk_use,
                self.spill_dir.clone(),
            ),
            merge: MergeReader::new(),
            stats: HashAggStats::default(),
        })
    }

    fn get_stats(&self) -> StageStats {
        let mut stats = StageStats::new(STAGE_NAME);
        stats.opens = self.stats.opens;
        stats.rows_produced = self.stats.rows_produced;
        stats.spills = self.stats.spills;
        stats.spilled_bytes = self.stats.spilled_bytes;
        stats.spilled_records = self.stats.spilled_records;

        let slot_list = |slots: &[SlotId]| {
            slots
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        stats.add_info("group_by_slots", slot_list(&self.group_slots));
        stats.add_info("bitmap_slot", self.bitmap_slot.to_string());
        let exprs = |texts: Vec<String>| {
            self.agg_out_slots
                .iter()
                .zip(texts)
                .map(|(slot, text)| format!("{} = {}", slot, text))
                .collect::<Vec<_>>()
                .join(", ")
        };
        stats.add_info(
            "block_accumulators",
            exprs(self.kernels.iter().map(AggKernel::block_text).collect()),
        );
        stats.add_info(
            "row_accumulators",
            exprs(self.kernels.iter().map(AggKernel::row_text).collect()),
        );
        stats.add_info(
            "merging_exprs",
            exprs(self.kernels.iter().map(AggKernel::merge_text).collect()),
        );
        stats.add_info("allow_disk_use", self.allow_disk_use.to_string());
        stats.add_info("memory_peak_bytes", self.tracker.peak().to_string());
        stats.children.push(self.child.get_stats());
        stats
    }
}
