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
use std::sync::atomic::{AtomicU64, Ordering};

/// Spill counters for one query execution context.
///
/// Injected into stages at construction instead of living in process-global
/// statics, so the enclosing context owns the lifetime and several concurrent
/// queries never share counters by accident.
#[derive(Debug, Default)]
pub struct SpillMetrics {
    spills: AtomicU64,
    spilled_bytes: AtomicU64,
    spilled_records: AtomicU64,
}

impl SpillMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, spills: u64, bytes: u64, records: u64) {
        self.spills.fetch_add(spills, Ordering::Relaxed);
        self.spilled_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.spilled_records.fetch_add(records, Ordering::Relaxed);
    }

    pub fn spills(&self) -> u64 {
        self.spills.load(Ordering::Relaxed)
    }

    pub fn spilled_bytes(&self) -> u64 {
        self.spilled_bytes.load(Ordering::Relaxed)
    }

    pub fn spilled_records(&self) -> u64 {
        self.spilled_records.load(Ordering::Relaxed)
    }
}
