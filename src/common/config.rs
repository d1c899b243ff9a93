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
//! Execution tuning knobs with hard defaults, overridable per process through
//! `GRITSTONE_*` environment variables.

use std::path::PathBuf;

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse::<usize>().ok()
}

/// Approximate in-memory footprint the aggregation hash table may reach before
/// its contents are spilled to external storage.
pub(crate) fn agg_memory_budget_bytes() -> usize {
    env_usize("GRITSTONE_AGG_MEMORY_BUDGET_BYTES").unwrap_or(100 * 1024 * 1024)
}

/// Maximum number of distinct partitions a batch may produce before the
/// tokenized accumulation path gives up and falls back to element-wise.
pub(crate) fn agg_tokenized_partition_limit() -> usize {
    env_usize("GRITSTONE_AGG_TOKENIZED_PARTITION_LIMIT").unwrap_or(1024)
}

/// Row capacity of output blocks produced while draining aggregate results.
pub(crate) fn agg_block_out_rows() -> usize {
    env_usize("GRITSTONE_AGG_BLOCK_OUT_ROWS").unwrap_or(128)
}

/// Directory that holds spill files. Defaults to the system temp directory.
pub(crate) fn spill_local_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GRITSTONE_SPILL_DIR") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        assert!(agg_memory_budget_bytes() > 0);
        assert!(agg_tokenized_partition_limit() > 1);
        assert!(agg_block_out_rows() > 0);
        assert!(!spill_local_dir().as_os_str().is_empty());
    }
}
