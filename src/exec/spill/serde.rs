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
//! Codec for spilled `(group key, accumulator state)` records.
//!
//! Layout is private to the spill store: two u32 row lengths followed by the
//! key values and the state values. Each value is one tag byte plus a
//! little-endian payload; strings carry a u32 byte length.

use bytes::{Buf, BufMut, BytesMut};

use crate::exec::value::{Row, Value};

const TAG_NOTHING: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_FLOAT64: u8 = 3;
const TAG_STR: u8 = 4;

pub fn encode_record(key: &Row, state: &Row) -> Result<Vec<u8>, String> {
    let mut buf = BytesMut::with_capacity(16 + key.estimated_size() + state.estimated_size());
    put_row_len(&mut buf, key.len())?;
    put_row_len(&mut buf, state.len())?;
    for value in key.values() {
        put_value(&mut buf, value)?;
    }
    for value in state.values() {
        put_value(&mut buf, value)?;
    }
    Ok(buf.to_vec())
}

pub fn decode_record(bytes: &[u8]) -> Result<(Row, Row), String> {
    let mut buf = bytes;
    let key_len = get_u32(&mut buf, "record key length")? as usize;
    let state_len = get_u32(&mut buf, "record state length")? as usize;
    let mut key = Vec::with_capacity(key_len);
    for _ in 0..key_len {
        key.push(get_value(&mut buf)?);
    }
    let mut state = Vec::with_capacity(state_len);
    for _ in 0..state_len {
        state.push(get_value(&mut buf)?);
    }
    if buf.has_remaining() {
        return Err(format!(
            "spill record has {} trailing bytes",
            buf.remaining()
        ));
    }
    Ok((Row::new(key), Row::new(state)))
}

/// Byte range holding the encoded key values of a record.
///
/// Records sorted or grouped on this slice group equal keys together: the
/// encoding is canonical (floats by bit pattern, strings by UTF-8 bytes), so
/// two keys are equal exactly when their encoded bytes are equal. The order it
/// induces is arbitrary but consistent, which is all the spill scan needs.
pub fn encoded_key_bytes(bytes: &[u8]) -> Result<&[u8], String> {
    let mut buf = bytes;
    let key_len = get_u32(&mut buf, "record key length")? as usize;
    let _ = get_u32(&mut buf, "record state length")?;
    let start = bytes.len() - buf.remaining();
    for _ in 0..key_len {
        get_value(&mut buf)?;
    }
    let end = bytes.len() - buf.remaining();
    Ok(&bytes[start..end])
}

fn put_row_len(buf: &mut BytesMut, len: usize) -> Result<(), String> {
    let len = u32::try_from(len).map_err(|_| format!("row too wide to spill: {} values", len))?;
    buf.put_u32_le(len);
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &Value) -> Result<(), String> {
    match value {
        Value::Nothing => buf.put_u8(TAG_NOTHING),
        Value::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(*b as u8);
        }
        Value::Int64(v) => {
            buf.put_u8(TAG_INT64);
            buf.put_i64_le(*v);
        }
        Value::Float64(v) => {
            buf.put_u8(TAG_FLOAT64);
            buf.put_u64_le(v.to_bits());
        }
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            let len = u32::try_from(s.len())
                .map_err(|_| format!("string too long to spill: {} bytes", s.len()))?;
            buf.put_u32_le(len);
            buf.put_slice(s.as_bytes());
        }
    }
    Ok(())
}

fn get_u32(buf: &mut &[u8], what: &str) -> Result<u32, String> {
    if buf.remaining() < 4 {
        return Err(format!("truncated spill record while reading {}", what));
    }
    Ok(buf.get_u32_le())
}

fn get_value(buf: &mut &[u8]) -> Result<Value, String> {
    if !buf.has_remaining() {
        return Err("truncated spill record while reading value tag".to_string());
    }
    match buf.get_u8() {
        TAG_NOTHING => Ok(Value::Nothing),
        TAG_BOOL => {
            if !buf.has_remaining() {
                return Err("truncated spill record while reading bool".to_string());
            }
            Ok(Value::Bool(buf.get_u8() != 0))
        }
        TAG_INT64 => {
            if buf.remaining() < 8 {
                return Err("truncated spill record while reading int64".to_string());
            }
            Ok(Value::Int64(buf.get_i64_le()))
        }
        TAG_FLOAT64 => {
            if buf.remaining() < 8 {
                return Err("truncated spill record while reading float64".to_string());
            }
            Ok(Value::Float64(f64::from_bits(buf.get_u64_le())))
        }
        TAG_STR => {
            let len = get_u32(buf, "string length")? as usize;
            if buf.remaining() < len {
                return Err("truncated spill record while reading string".to_string());
            }
            let bytes = buf.copy_to_bytes(len);
            let s = std::str::from_utf8(&bytes)
                .map_err(|e| format!("spilled string is not valid UTF-8: {}", e))?;
            Ok(Value::str(s))
        }
        tag => Err(format!("unknown spill value tag {}", tag)),
    }
}
