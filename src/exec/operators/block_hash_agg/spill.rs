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
//! Spill side of the hash aggregation: budget checks during the build phase
//! and key-contiguous merging of spilled partials during the output phase.

use std::path::PathBuf;
use std::sync::Arc;

use crate::exec::expr::AggKernel;
use crate::exec::spill::serde::{decode_record, encode_record, encoded_key_bytes};
use crate::exec::spill::store::{FileSpillStore, SpillStore};
use crate::exec::value::Row;
use crate::runtime::metrics::SpillMetrics;

use super::group_table::GroupTable;
use super::HashAggStats;

/// Build-phase spill policy: after each batch the operator asks the pipeline
/// whether the in-memory table has outgrown its budget, and if so the whole
/// table is written out as one key-sorted batch of `(key, partial state)`
/// records and cleared. One group may appear in several spill batches; the
/// store's merged scan keeps its records contiguous so the merge reader can
/// reconcile them at drain time.
pub(crate) struct SpillPipeline {
    budget_bytes: usize,
    force_spill: bool,
    allow_disk_use: bool,
    spill_dir: PathBuf,
    store: Option<FileSpillStore>,
}

impl SpillPipeline {
    pub fn new(
        budget_bytes: usize,
        force_spill: bool,
        allow_disk_use: bool,
        spill_dir: PathBuf,
    ) -> Self {
        Self {
            budget_bytes,
            force_spill,
            allow_disk_use,
            spill_dir,
            store: None,
        }
    }

    pub fn has_spilled(&self) -> bool {
        self.store.is_some()
    }

    pub fn store_mut(&mut self) -> Result<&mut dyn SpillStore, String> {
        match self.store.as_mut() {
            Some(store) => Ok(store),
            None => Err("no spill store exists for this execution".to_string()),
        }
    }

    /// Drop any spilled state. The backing file is removed by the store.
    pub fn reset(&mut self) {
        self.store = None;
    }

    /// Spill the table if it is over budget (or spilling is forced for this
    /// execution). A no-op while the table is empty.
    pub fn maybe_spill(
        &mut self,
        table: &mut GroupTable,
        stats: &mut HashAggStats,
        metrics: &Arc<SpillMetrics>,
    ) -> Result<(), String> {
        if table.is_empty() {
            return Ok(());
        }
        let budget = i64::try_from(self.budget_bytes).unwrap_or(i64::MAX);
        let over_budget = self.force_spill || table.tracked_bytes() > budget;
        if !over_budget {
            return Ok(());
        }
        if !self.allow_disk_use {
            tracing::warn!(
                tracked_bytes = table.tracked_bytes(),
                budget_bytes = self.budget_bytes,
                "hash aggregation over budget with disk use disabled"
            );
            return Err(format!(
                "hash aggregation exceeded its memory budget of {} bytes and spilling is disabled",
                self.budget_bytes
            ));
        }
        self.spill_table(table, stats, metrics)
    }

    /// End of the build phase. Any residual in-memory groups must join the
    /// spilled ones before merging, otherwise a group spilled earlier and
    /// updated since would surface twice. Positions the cursor for reads and
    /// reports whether this execution spilled at all.
    pub fn finalize_build(
        &mut self,
        table: &mut GroupTable,
        stats: &mut HashAggStats,
        metrics: &Arc<SpillMetrics>,
    ) -> Result<bool, String> {
        if self.store.is_some() && !table.is_empty() {
            self.spill_table(table, stats, metrics)?;
        }
        if let Some(store) = self.store.as_mut() {
            store.reset_cursor()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn spill_table(
        &mut self,
        table: &mut GroupTable,
        stats: &mut HashAggStats,
        metrics: &Arc<SpillMetrics>,
    ) -> Result<(), String> {
        if self.store.is_none() {
            self.store = Some(FileSpillStore::create(&self.spill_dir)?);
        }
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| "spill store vanished during spill".to_string())?;

        let rows = table.drain_rows();
        let num_records = rows.len() as u64;
        let mut encoded = Vec::with_capacity(rows.len());
        for (key, state) in &rows {
            let record = encode_record(key, state)?;
            let key_bytes = encoded_key_bytes(&record)?.to_vec();
            encoded.push((key_bytes, record));
        }
        // The store's scan contract wants each sealed batch in key order.
        encoded.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut batch_bytes = 0u64;
        for (_, record) in &encoded {
            // Account the u32 length prefix the store writes per record.
            batch_bytes += record.len() as u64 + 4;
            store.append(record)?;
        }
        store.seal_batch()?;
        store.flush()?;

        stats.spills += 1;
        stats.spilled_records += num_records;
        stats.spilled_bytes += batch_bytes;
        metrics.increment(1, batch_bytes, num_records);
        tracing::debug!(
            records = num_records,
            bytes = batch_bytes,
            total_spills = stats.spills,
            "hash aggregation spilled its in-memory table"
        );
        Ok(())
    }
}

/// Streaming reader over spilled records that re-merges partial states.
///
/// The store's scan keeps records for one key contiguous, so a group is
/// complete as soon as a record with a different key shows up. The store has
/// no peek, so that first foreign record is stashed and served as the start of
/// the next group.
#[derive(Default)]
pub(crate) struct MergeReader {
    stash: Option<(Row, Row)>,
}

impl MergeReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.stash = None;
    }

    /// Produce the next fully merged `(key, state)` group, or `None` once the
    /// spilled data is exhausted.
    pub fn next_group(
        &mut self,
        store: &mut dyn SpillStore,
        kernels: &[AggKernel],
    ) -> Result<Option<(Row, Row)>, String> {
        let (key, first_state) = match self.stash.take() {
            Some(record) => record,
            None => match store.next_record()? {
                Some(bytes) => decode_record(&bytes)?,
                None => return Ok(None),
            },
        };

        let mut state = Row::filled(kernels.len());
        merge_into(kernels, &mut state, &first_state)?;

        while let Some(bytes) = store.next_record()? {
            let (next_key, partial) = decode_record(&bytes)?;
            if next_key != key {
                self.stash = Some((next_key, partial));
                break;
            }
            merge_into(kernels, &mut state, &partial)?;
        }
        Ok(Some((key, state)))
    }
}

fn merge_into(kernels: &[AggKernel], state: &mut Row, partial: &Row) -> Result<(), String> {
    if partial.len() != kernels.len() {
        return Err(format!(
            "spilled state width mismatch: record has {} values, {} aggregates compiled",
            partial.len(),
            kernels.len()
        ));
    }
    for (idx, kernel) in kernels.iter().enumerate() {
        let merged = kernel.merge(state.get(idx)?, partial.get(idx)?)?;
        state.set(idx, merged)?;
    }
    Ok(())
}
