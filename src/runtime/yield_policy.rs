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
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative interrupt check called from long-running stage loops.
///
/// Checks fire between batches during the build phase and between merged
/// groups during the spill drain, so a raised interrupt never leaves a batch
/// half-committed.
pub trait YieldPolicy: Send + Sync {
    /// Returns an error if the enclosing operation has been cancelled.
    fn check_for_interrupt(&self) -> Result<(), String>;
}

/// Policy that never interrupts; the default for embedders without a
/// cancellation source.
#[derive(Debug, Default)]
pub struct NeverYield;

impl YieldPolicy for NeverYield {
    fn check_for_interrupt(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Cancellation flag that can be raised from another thread.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl YieldPolicy for CancelFlag {
    fn check_for_interrupt(&self) -> Result<(), String> {
        if self.is_cancelled() {
            return Err("operation was interrupted".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_raises_after_cancel() {
        let flag = CancelFlag::new();
        assert!(flag.check_for_interrupt().is_ok());
        flag.cancel();
        let err = flag.check_for_interrupt().expect_err("expected interrupt");
        assert!(err.contains("interrupted"), "err={}", err);
    }
}
