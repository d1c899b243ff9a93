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
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::serde::encoded_key_bytes;

/// Record storage consumed by the spill path.
///
/// A store is exclusively owned by one operator execution and all writes
/// happen before the first cursor read. Records arrive in sealed batches: the
/// caller appends one batch in key-sorted order, then calls `seal_batch`. The
/// cursor scan merges sealed batches so that all records sharing an encoded
/// key are returned contiguously, which the merge phase depends on. A key
/// appears at most once per batch, but may recur across batches.
pub trait SpillStore {
    fn append(&mut self, record: &[u8]) -> Result<(), String>;

    /// Mark the end of one key-sorted batch of appends.
    fn seal_batch(&mut self) -> Result<(), String>;

    /// Make appended records durable before cursor reads begin.
    fn flush(&mut self) -> Result<(), String>;

    /// Total bytes held by the store.
    fn storage_size(&self) -> Result<u64, String>;

    /// Position the cursor at the first record of the merged scan.
    fn reset_cursor(&mut self) -> Result<(), String>;

    /// Next record of the merged scan; `None` once exhausted.
    fn next_record(&mut self) -> Result<Option<Vec<u8>>, String>;
}

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

struct Run {
    start: u64,
    end: u64,
}

struct RunCursor {
    reader: BufReader<File>,
    pos: u64,
    end: u64,
    peeked: Option<Vec<u8>>,
}

impl RunCursor {
    /// Pull the next record of this run into the peek slot.
    fn fill(&mut self) -> Result<(), String> {
        if self.pos >= self.end {
            self.peeked = None;
            return Ok(());
        }
        let mut len_buf = [0u8; 4];
        self.reader
            .read_exact(&mut len_buf)
            .map_err(|e| format!("read spill record length failed: {}", e))?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut record = vec![0u8; len];
        self.reader
            .read_exact(&mut record)
            .map_err(|e| format!("read spill record body failed: {}", e))?;
        self.pos += 4 + len as u64;
        if self.pos > self.end {
            return Err("spill record crosses a batch boundary".to_string());
        }
        self.peeked = Some(record);
        Ok(())
    }
}

/// Spill store backed by one length-prefixed file per operator execution.
///
/// Each sealed batch occupies one contiguous byte range of the file. The scan
/// runs a cursor per batch and always yields the record whose encoded key is
/// smallest, so equal keys from different batches surface back to back. The
/// file is removed when the store is dropped.
pub struct FileSpillStore {
    path: PathBuf,
    writer: File,
    write_offset: u64,
    run_start: u64,
    runs: Vec<Run>,
    cursors: Option<Vec<RunCursor>>,
}

impl FileSpillStore {
    pub fn create(dir: &Path) -> Result<Self, String> {
        let pid = std::process::id();
        let mut attempts = 0;
        loop {
            let id = NEXT_FILE_ID.fetch_add(1, Ordering::AcqRel);
            let path = dir.join(format!("spill_{:x}_{:x}.bin", pid, id));
            let file = OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path);
            match file {
                Ok(writer) => {
                    return Ok(Self {
                        path,
                        writer,
                        write_offset: 0,
                        run_start: 0,
                        runs: Vec::new(),
                        cursors: None,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                    continue;
                }
                Err(err) => {
                    return Err(format!("create spill file {} failed: {}", path.display(), err));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpillStore for FileSpillStore {
    fn append(&mut self, record: &[u8]) -> Result<(), String> {
        let len = u32::try_from(record.len())
            .map_err(|_| format!("spill record too large: {} bytes", record.len()))?;
        self.writer
            .write_all(&len.to_le_bytes())
            .and_then(|_| self.writer.write_all(record))
            .map_err(|e| format!("write spill record failed: {}", e))?;
        self.write_offset += 4 + record.len() as u64;
        Ok(())
    }

    fn seal_batch(&mut self) -> Result<(), String> {
        if self.write_offset > self.run_start {
            self.runs.push(Run {
                start: self.run_start,
                end: self.write_offset,
            });
            self.run_start = self.write_offset;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), String> {
        self.writer
            .flush()
            .map_err(|e| format!("flush spill file failed: {}", e))
    }

    fn storage_size(&self) -> Result<u64, String> {
        let meta = std::fs::metadata(&self.path)
            .map_err(|e| format!("stat spill file {} failed: {}", self.path.display(), e))?;
        Ok(meta.len())
    }

    fn reset_cursor(&mut self) -> Result<(), String> {
        // Any records appended since the last seal form a final batch.
        self.seal_batch()?;
        let mut cursors = Vec::with_capacity(self.runs.len());
        for run in &self.runs {
            let mut file = File::open(&self.path)
                .map_err(|e| format!("open spill file {} failed: {}", self.path.display(), e))?;
            file.seek(SeekFrom::Start(run.start))
                .map_err(|e| format!("seek spill file {} failed: {}", self.path.display(), e))?;
            let mut cursor = RunCursor {
                reader: BufReader::new(file),
                pos: run.start,
                end: run.end,
                peeked: None,
            };
            cursor.fill()?;
            cursors.push(cursor);
        }
        self.cursors = Some(cursors);
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Vec<u8>>, String> {
        let cursors = self
            .cursors
            .as_mut()
            .ok_or_else(|| "spill cursor is not positioned; call reset_cursor first".to_string())?;

        let mut best: Option<usize> = None;
        {
            let mut best_key: &[u8] = &[];
            for (idx, cursor) in cursors.iter().enumerate() {
                if let Some(record) = &cursor.peeked {
                    let key = encoded_key_bytes(record)?;
                    if best.is_none() || key < best_key {
                        best = Some(idx);
                        best_key = key;
                    }
                }
            }
        }
        let Some(idx) = best else {
            return Ok(None);
        };
        let cursor = &mut cursors[idx];
        let record = cursor.peeked.take();
        cursor.fill()?;
        Ok(record)
    }
}

impl Drop for FileSpillStore {
    fn drop(&mut self) {
        // Spilled state is scoped to one execution; clean up eagerly.
        let _ = std::fs::remove_file(&self.path);
    }
}
