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
//! Pull-based plan-stage iteration protocol.

use crate::exec::block::BlockChunk;

/// Cooperative pull iteration driven synchronously by the caller.
///
/// Lifecycle: `open(false)` for the first execution, `get_next()` until it
/// returns `None`, then `close()`. `open(true)` after close (or exhaustion)
/// resets the stage for a fresh execution unaffected by prior state.
pub trait PlanStage {
    fn open(&mut self, re_open: bool) -> Result<(), String>;

    /// Produce the next output batch; `None` signals end of output.
    fn get_next(&mut self) -> Result<Option<BlockChunk>, String>;

    fn close(&mut self);

    /// Deep-clone the stage in its unopened state.
    fn clone_stage(&self) -> Box<dyn PlanStage>;

    fn get_stats(&self) -> StageStats;
}

/// Runtime statistics plus explain-style debug info for one stage.
#[derive(Clone, Debug, Default)]
pub struct StageStats {
    pub name: String,
    pub opens: u64,
    pub rows_produced: u64,
    pub spills: u64,
    pub spilled_bytes: u64,
    pub spilled_records: u64,
    /// Free-form explain entries, e.g. declared slots and expression texts.
    pub info: Vec<(String, String)>,
    pub children: Vec<StageStats>,
}

impl StageStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.info.push((key.into(), value.into()));
    }
}

/// Source stage replaying a fixed list of prebuilt chunks.
pub struct ValuesStage {
    chunks: Vec<BlockChunk>,
    pos: usize,
    opens: u64,
    rows_produced: u64,
}

impl ValuesStage {
    pub fn new(chunks: Vec<BlockChunk>) -> Self {
        Self {
            chunks,
            pos: 0,
            opens: 0,
            rows_produced: 0,
        }
    }
}

impl PlanStage for ValuesStage {
    fn open(&mut self, _re_open: bool) -> Result<(), String> {
        self.pos = 0;
        self.opens += 1;
        Ok(())
    }

    fn get_next(&mut self) -> Result<Option<BlockChunk>, String> {
        let Some(chunk) = self.chunks.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        self.rows_produced += chunk.len() as u64;
        Ok(Some(chunk.clone()))
    }

    fn close(&mut self) {
        self.pos = self.chunks.len();
    }

    fn clone_stage(&self) -> Box<dyn PlanStage> {
        Box::new(ValuesStage::new(self.chunks.clone()))
    }

    fn get_stats(&self) -> StageStats {
        let mut stats = StageStats::new("VALUES");
        stats.opens = self.opens;
        stats.rows_produced = self.rows_produced;
        stats
    }
}
