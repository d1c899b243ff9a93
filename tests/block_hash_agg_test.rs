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
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;

use gritstone::runtime::metrics::SpillMetrics;
use gritstone::runtime::yield_policy::CancelFlag;
use gritstone::{
    AggFunction, BlockChunk, BlockHashAggStage, MaterializedBlock, MonoBlock, PlanStage,
    SingletonBlock, SlotId, Value, ValueBlock, ValuesStage,
};

const BITMAP: u32 = 0;
const KEY: u32 = 1;
const DATA: u32 = 2;
const OUT: u32 = 3;

fn slot(id: u32) -> SlotId {
    SlotId::new(id)
}

fn int_block(values: &[i64]) -> Box<dyn ValueBlock> {
    Box::new(MaterializedBlock::new(
        values.iter().map(|v| Value::Int64(*v)).collect(),
    ))
}

fn batch(keys: &[i64], vals: &[i64], bits: Option<&[bool]>) -> BlockChunk {
    let bitmap: Box<dyn ValueBlock> = match bits {
        Some(bits) => Box::new(MaterializedBlock::new(
            bits.iter().map(|b| Value::Bool(*b)).collect(),
        )),
        None => Box::new(MonoBlock::all_true(keys.len())),
    };
    BlockChunk::try_new(vec![
        (slot(BITMAP), bitmap),
        (slot(KEY), int_block(keys)),
        (slot(DATA), int_block(vals)),
    ])
    .expect("chunk")
}

fn sum_stage(chunks: Vec<BlockChunk>, force_spill: bool, dir: &Path) -> BlockHashAggStage {
    gritstone::common::logging::init();
    BlockHashAggStage::try_new(
        Box::new(ValuesStage::new(chunks)),
        vec![slot(KEY)],
        slot(BITMAP),
        vec![slot(DATA)],
        vec![AggFunction::new("sum")],
        vec![slot(OUT)],
        true,
        force_spill,
    )
    .expect("stage")
    .with_spill_dir(dir.to_path_buf())
}

/// Drain the stage and return `(key, aggregate columns)` rows sorted by key,
/// verifying the output bitmap is all true along the way.
fn collect(stage: &mut dyn PlanStage, out_slots: &[u32]) -> Vec<(Value, Vec<Value>)> {
    let mut rows = Vec::new();
    while let Some(chunk) = stage.get_next().expect("get_next") {
        let keys = chunk.column(slot(KEY)).expect("key column").extract().into_owned();
        let outs: Vec<Vec<Value>> = out_slots
            .iter()
            .map(|s| {
                chunk
                    .column(slot(*s))
                    .expect("out column")
                    .extract()
                    .into_owned()
            })
            .collect();
        let bits = chunk
            .column(slot(BITMAP))
            .expect("bitmap column")
            .extract()
            .into_owned();
        assert!(bits.iter().all(|b| *b == Value::Bool(true)));

        for row in 0..chunk.len() {
            rows.push((
                keys[row].clone(),
                outs.iter().map(|col| col[row].clone()).collect(),
            ));
        }
    }
    rows.sort_by_key(|(key, _)| match key {
        Value::Int64(v) => *v,
        _ => i64::MAX,
    });
    rows
}

fn open_and_collect(stage: &mut dyn PlanStage) -> Vec<(Value, Vec<Value>)> {
    stage.open(false).expect("open");
    collect(stage, &[OUT])
}

#[test]
fn sums_groups_without_spilling() {
    let dir = tempdir().expect("tempdir");
    let mut stage = sum_stage(vec![batch(&[1, 1, 2], &[10, 20, 5], None)], false, dir.path());
    let rows = open_and_collect(&mut stage);
    assert_eq!(
        rows,
        vec![
            (Value::Int64(1), vec![Value::Int64(30)]),
            (Value::Int64(2), vec![Value::Int64(5)]),
        ]
    );

    let stats = stage.get_stats();
    assert_eq!(stats.name, "BLOCK_HASH_AGG");
    assert_eq!(stats.opens, 1);
    assert_eq!(stats.rows_produced, 2);
    assert_eq!(stats.spills, 0);
    assert_eq!(stats.children.len(), 1);
}

#[test]
fn forced_spill_across_batches_merges_partials() {
    let dir = tempdir().expect("tempdir");
    let metrics = Arc::new(SpillMetrics::new());
    let mut stage = sum_stage(
        vec![batch(&[1, 2], &[10, 5], None), batch(&[1], &[20], None)],
        true,
        dir.path(),
    )
    .with_metrics(Arc::clone(&metrics));

    let rows = open_and_collect(&mut stage);
    assert_eq!(
        rows,
        vec![
            (Value::Int64(1), vec![Value::Int64(30)]),
            (Value::Int64(2), vec![Value::Int64(5)]),
        ]
    );

    let stats = stage.get_stats();
    assert!(stats.spills >= 2, "expected one spill per batch, got {}", stats.spills);
    assert_eq!(stats.spilled_records, 3);
    assert!(stats.spilled_bytes > 0);
    assert_eq!(metrics.spills(), stats.spills);
    assert_eq!(metrics.spilled_records(), 3);
}

#[test]
fn bitmap_masks_out_rows() {
    let dir = tempdir().expect("tempdir");
    let mut stage = sum_stage(
        vec![batch(&[1, 1], &[10, 20], Some(&[true, false]))],
        false,
        dir.path(),
    );
    let rows = open_and_collect(&mut stage);
    assert_eq!(rows, vec![(Value::Int64(1), vec![Value::Int64(10)])]);
}

#[test]
fn all_false_bitmap_creates_no_groups_and_no_spill() {
    let dir = tempdir().expect("tempdir");
    let mut stage = sum_stage(
        vec![batch(&[1, 2], &[10, 20], Some(&[false, false]))],
        true,
        dir.path(),
    );
    let rows = open_and_collect(&mut stage);
    assert!(rows.is_empty());

    let stats = stage.get_stats();
    assert_eq!(stats.spills, 0);
    assert_eq!(stats.spilled_records, 0);
    assert_eq!(stats.rows_produced, 0);
}

#[test]
fn partition_limit_fallback_matches_tokenized_results() {
    let keys = [4i64, 2, 4, 1, 3, 2, 4];
    let vals = [1i64, 2, 3, 4, 5, 6, 7];

    let dir = tempdir().expect("tempdir");
    let mut tokenized = sum_stage(vec![batch(&keys, &vals, None)], false, dir.path());
    let mut fallback = sum_stage(vec![batch(&keys, &vals, None)], false, dir.path())
        .with_partition_limit(1);

    assert_eq!(
        open_and_collect(&mut tokenized),
        open_and_collect(&mut fallback)
    );
}

#[test]
fn forced_spilling_is_transparent() {
    let mut batches = Vec::new();
    for start in (0i64..48).step_by(8) {
        let keys: Vec<i64> = (start..start + 8).map(|i| i % 7).collect();
        let vals: Vec<i64> = (start..start + 8).collect();
        batches.push(batch(&keys, &vals, None));
    }

    let dir = tempdir().expect("tempdir");
    let mut spilling = sum_stage(batches.clone(), true, dir.path());
    let mut resident = sum_stage(batches, false, dir.path());

    let spilled_rows = open_and_collect(&mut spilling);
    let resident_rows = open_and_collect(&mut resident);
    assert_eq!(spilled_rows, resident_rows);
    assert_eq!(spilled_rows.len(), 7);
    assert!(spilling.get_stats().spills > 0);
    assert_eq!(resident.get_stats().spills, 0);
}

#[test]
fn multiple_aggregates_share_one_pass() {
    let dir = tempdir().expect("tempdir");
    let mut stage = BlockHashAggStage::try_new(
        Box::new(ValuesStage::new(vec![batch(&[1, 1, 2], &[10, 20, 5], None)])),
        vec![slot(KEY)],
        slot(BITMAP),
        vec![slot(DATA), slot(DATA), slot(DATA), slot(DATA)],
        vec![
            AggFunction::new("sum"),
            AggFunction::new("min"),
            AggFunction::new("max"),
            AggFunction::new("count"),
        ],
        vec![slot(3), slot(4), slot(5), slot(6)],
        true,
        false,
    )
    .expect("stage")
    .with_spill_dir(dir.path().to_path_buf());

    stage.open(false).expect("open");
    let rows = collect(&mut stage, &[3, 4, 5, 6]);
    assert_eq!(
        rows,
        vec![
            (
                Value::Int64(1),
                vec![
                    Value::Int64(30),
                    Value::Int64(10),
                    Value::Int64(20),
                    Value::Int64(2)
                ]
            ),
            (
                Value::Int64(2),
                vec![
                    Value::Int64(5),
                    Value::Int64(5),
                    Value::Int64(5),
                    Value::Int64(1)
                ]
            ),
        ]
    );
}

#[test]
fn singleton_blocks_feed_one_row_batches() {
    let dir = tempdir().expect("tempdir");
    let one_row = |key: i64, val: i64| {
        BlockChunk::try_new(vec![
            (
                slot(BITMAP),
                Box::new(SingletonBlock::new(Value::Bool(true))) as Box<dyn ValueBlock>,
            ),
            (slot(KEY), Box::new(SingletonBlock::new(Value::Int64(key)))),
            (slot(DATA), Box::new(SingletonBlock::new(Value::Int64(val)))),
        ])
        .expect("chunk")
    };

    let mut stage = sum_stage(
        vec![one_row(1, 10), one_row(2, 5), one_row(1, 20)],
        false,
        dir.path(),
    );
    let rows = open_and_collect(&mut stage);
    assert_eq!(
        rows,
        vec![
            (Value::Int64(1), vec![Value::Int64(30)]),
            (Value::Int64(2), vec![Value::Int64(5)]),
        ]
    );
}

#[test]
fn nan_keys_group_together() {
    let dir = tempdir().expect("tempdir");
    let chunk = BlockChunk::try_new(vec![
        (
            slot(BITMAP),
            Box::new(MonoBlock::all_true(2)) as Box<dyn ValueBlock>,
        ),
        (
            slot(KEY),
            Box::new(MaterializedBlock::new(vec![
                Value::Float64(f64::NAN),
                Value::Float64(f64::NAN),
            ])),
        ),
        (slot(DATA), int_block(&[1, 2])),
    ])
    .expect("chunk");

    let mut stage = sum_stage(vec![chunk], false, dir.path());
    stage.open(false).expect("open");
    let rows = collect(&mut stage, &[OUT]);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, vec![Value::Int64(3)]);
}

#[test]
fn output_is_batched_by_block_out_rows() {
    let keys: Vec<i64> = (0..10).collect();
    let vals: Vec<i64> = (0..10).collect();
    let dir = tempdir().expect("tempdir");
    let mut stage =
        sum_stage(vec![batch(&keys, &vals, None)], false, dir.path()).with_block_out_rows(4);

    stage.open(false).expect("open");
    let mut sizes = Vec::new();
    while let Some(chunk) = stage.get_next().expect("get_next") {
        sizes.push(chunk.len());
    }
    assert_eq!(sizes, vec![4, 4, 2]);
}

#[test]
fn reopen_after_exhaustion_runs_a_fresh_aggregation() {
    let dir = tempdir().expect("tempdir");
    let mut stage = sum_stage(vec![batch(&[1, 1, 2], &[10, 20, 5], None)], true, dir.path());

    let first = open_and_collect(&mut stage);
    stage.open(true).expect("reopen");
    let second = collect(&mut stage, &[OUT]);
    assert_eq!(first, second);
    assert_eq!(stage.get_stats().opens, 2);

    stage.close();
    stage.open(false).expect("open after close");
    assert_eq!(collect(&mut stage, &[OUT]), first);
}

#[test]
fn cancellation_interrupts_the_build_phase() {
    let dir = tempdir().expect("tempdir");
    let flag = Arc::new(CancelFlag::new());
    flag.cancel();
    let mut stage = sum_stage(vec![batch(&[1], &[10], None)], false, dir.path())
        .with_yield_policy(flag);

    let err = stage.open(false).expect_err("expected interrupt");
    assert!(err.contains("interrupted"), "err={}", err);
}

#[test]
fn stats_describe_the_stage_shape() {
    let dir = tempdir().expect("tempdir");
    let mut stage = sum_stage(vec![batch(&[1], &[10], None)], false, dir.path());
    stage.open(false).expect("open");
    collect(&mut stage, &[OUT]);

    let stats = stage.get_stats();
    let info_keys: Vec<&str> = stats.info.iter().map(|(k, _)| k.as_str()).collect();
    for expected in [
        "group_by_slots",
        "bitmap_slot",
        "block_accumulators",
        "row_accumulators",
        "merging_exprs",
    ] {
        assert!(info_keys.contains(&expected), "missing info key {}", expected);
    }
    let block_exprs = stats
        .info
        .iter()
        .find(|(k, _)| k == "block_accumulators")
        .map(|(_, v)| v.clone())
        .expect("block accumulator info");
    assert!(block_exprs.contains("block_sum"), "info={}", block_exprs);
}
