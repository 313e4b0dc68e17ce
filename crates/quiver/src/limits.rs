//! Resource limits for tool invocations

use serde::{Deserialize, Serialize};

/// Resource limits applied to every tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Maximum linear memory of a WebAssembly instance in bytes
    pub max_memory_bytes: u64,
    /// Maximum captured output (stdout + stderr) per invocation in bytes
    pub max_output_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 512 * 1024 * 1024, // 512 MB
            max_output_bytes: 16 * 1024 * 1024,  // 16 MB output
        }
    }
}

const TRUNCATION_MARKER: &[u8] = b"\n... [output truncated] ...\n";

/// Buffer that limits how much data can be written
#[derive(Debug, Clone)]
pub struct LimitedBuffer {
    buffer: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl LimitedBuffer {
    /// Create an empty buffer holding at most `limit` bytes of payload.
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append `data`, truncating at the limit. Always reports the full
    /// length as written so producers never see a short write.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.truncated {
            return data.len();
        }
        let remaining = self.limit.saturating_sub(self.buffer.len());
        let to_write = data.len().min(remaining);
        self.buffer.extend_from_slice(&data[..to_write]);

        if to_write < data.len() {
            self.truncated = true;
            self.buffer.extend_from_slice(TRUNCATION_MARKER);
        }

        data.len()
    }

    /// Drop the contents and reset truncation.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.truncated = false;
    }

    /// Whether data was dropped since the last clear.
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    /// Buffered bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Buffered bytes as text, replacing invalid UTF-8.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}
