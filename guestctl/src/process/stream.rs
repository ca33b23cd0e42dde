//! Machine-readable output of guest toolbox processes.
//!
//! The format is a sequence of `key=value` pairs, each terminated by a NUL
//! byte. An empty pair (two NULs in a row) ends a block:
//!
//! ```text
//! name=foo\0ftype=-\0st_size=10\0\0name=bar\0ftype=d\0\0
//! ```

use guestctl_shared::errors::{GuestctlError, GuestctlResult};
use std::collections::BTreeMap;

/// One block of key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamBlock {
    pairs: BTreeMap<String, String>,
}

impl StreamBlock {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Guest result code carried by tools that report one per entry.
    pub fn rc(&self) -> Option<i32> {
        self.get("rc").and_then(|v| v.trim().parse().ok())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.insert(key.into(), value.into());
    }

    /// Serialize back into stream form, terminator included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (k, v) in &self.pairs {
            out.extend_from_slice(k.as_bytes());
            out.push(b'=');
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        out.push(0);
        out
    }
}

/// Incremental parser over accumulated output.
#[derive(Debug, Default)]
pub struct GuestProcessStream {
    buffer: Vec<u8>,
    offset: usize,
    current: StreamBlock,
}

impl GuestProcessStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received and not yet parsed.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }

    /// Next complete block, or `None` if more data is needed.
    pub fn next_block(&mut self) -> GuestctlResult<Option<StreamBlock>> {
        while let Some(len) = self.buffer[self.offset..].iter().position(|&b| b == 0) {
            let pair = &self.buffer[self.offset..self.offset + len];
            self.offset += len + 1;

            if pair.is_empty() {
                return Ok(Some(std::mem::take(&mut self.current)));
            }

            let text = std::str::from_utf8(pair)
                .map_err(|e| GuestctlError::Protocol(format!("non UTF-8 stream pair: {}", e)))?;
            let (key, value) = text.split_once('=').ok_or_else(|| {
                GuestctlError::Protocol(format!("stream pair without '=': \"{}\"", text))
            })?;
            if key.is_empty() {
                return Err(GuestctlError::Protocol("stream pair with empty key".into()));
            }
            self.current.insert(key, value);
        }
        Ok(None)
    }

    /// Parse everything, returning all complete blocks. A trailing block
    /// without terminator is returned too when it holds any pairs.
    pub fn into_blocks(mut self) -> GuestctlResult<Vec<StreamBlock>> {
        let mut blocks = Vec::new();
        while let Some(block) = self.next_block()? {
            blocks.push(block);
        }
        if !self.current.is_empty() {
            blocks.push(std::mem::take(&mut self.current));
        }
        Ok(blocks)
    }
}
