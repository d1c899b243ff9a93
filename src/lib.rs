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
//! Vectorized block hash-aggregation execution operator with external spill.
//!
//! The crate is organized like an execution engine's exec layer:
//! - `exec::block` holds the tagged-value block contract consumed by operators.
//! - `exec::expr` holds compiled aggregate kernels (block, row, and merge forms).
//! - `exec::stage` holds the pull-based plan-stage iteration protocol.
//! - `exec::spill` holds the batch-sealed spill store and record codec.
//! - `exec::operators::block_hash_agg` holds the aggregation operator itself.

pub mod common;
pub mod exec;
pub mod runtime;

pub use common::ids::SlotId;
pub use exec::block::{BlockChunk, MaterializedBlock, MonoBlock, SingletonBlock, ValueBlock};
pub use exec::expr::AggFunction;
pub use exec::operators::block_hash_agg::BlockHashAggStage;
pub use exec::stage::{PlanStage, StageStats, ValuesStage};
pub use exec::value::{Row, Value};
