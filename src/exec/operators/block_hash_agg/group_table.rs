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
use std::sync::Arc;

use hashbrown::HashMap;
use hashbrown::hash_map::EntryRef;

use crate::exec::value::{Row, Value};
use crate::runtime::mem_tracker::MemTracker;

/// In-memory group state: one entry per distinct group key, holding the
/// accumulator-state tuple for that group.
///
/// Owned bytes are charged to the tracker on insert so the spill manager can
/// read the footprint without walking entries. Lives for one build phase;
/// spilling drains and clears it, and `close()` drops it entirely.
pub(crate) struct GroupTable {
    map: HashMap<Row, Row>,
    num_aggs: usize,
    tracker: Arc<MemTracker>,
}

impl GroupTable {
    pub fn new(num_aggs: usize, tracker: Arc<MemTracker>) -> Self {
        Self {
            map: HashMap::new(),
            num_aggs,
            tracker,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn tracked_bytes(&self) -> i64 {
        self.tracker.current()
    }

    /// Handle for charging state-size deltas while an entry is borrowed.
    pub fn tracker_handle(&self) -> Arc<MemTracker> {
        Arc::clone(&self.tracker)
    }

    /// Find the entry for `key`, materializing the key and an all-`Nothing`
    /// accumulator state on first sight.
    pub fn find_or_insert(&mut self, key: &[Value]) -> &mut Row {
        match self.map.entry_ref(key) {
            EntryRef::Occupied(entry) => entry.into_mut(),
            EntryRef::Vacant(entry) => {
                let key_bytes: usize = key.iter().map(Value::estimated_size).sum();
                let state = Row::filled(self.num_aggs);
                self.tracker
                    .consume((key_bytes + state.estimated_size()) as i64);
                entry.insert(state)
            }
        }
    }

    /// Move every entry out in table order and reset the footprint.
    pub fn drain_rows(&mut self) -> Vec<(Row, Row)> {
        self.tracker.release_all();
        self.map.drain().collect()
    }
}

impl Drop for GroupTable {
    fn drop(&mut self) {
        self.tracker.release_all();
    }
}
