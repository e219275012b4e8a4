//! Write options.

use crate::codec::Compression;
use crate::limits::{DEFAULT_COMPRESSION_LEVEL, DEFAULT_COMPRESS_THRESHOLD, DEFAULT_MAX_BUFFER};

/// Options for a [`Modifier`](crate::modify::Modifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyOptions {
    /// Capacity of one write buffer (one batch).
    pub max_buffer_len: usize,
    /// Skip unknown properties and custom validators instead of failing.
    pub unsafe_mode: bool,
    /// Locale for text written as a plain string. Defaults to the first
    /// locale of the schema.
    pub locale: Option<String>,
    /// String payloads above this size are zstd-compressed.
    pub compress_threshold: usize,
    pub compression_level: i32,
}

impl Default for ModifyOptions {
    fn default() -> Self {
        Self {
            max_buffer_len: DEFAULT_MAX_BUFFER,
            unsafe_mode: false,
            locale: None,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl ModifyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options with a smaller (or larger) batch capacity.
    pub fn with_max_buffer_len(max_buffer_len: usize) -> Self {
        Self {
            max_buffer_len,
            ..Self::default()
        }
    }

    /// Options that never compress, so payload bytes are predictable.
    pub fn uncompressed() -> Self {
        Self {
            compress_threshold: usize::MAX,
            ..Self::default()
        }
    }

    pub fn unsafe_mode(mut self) -> Self {
        self.unsafe_mode = true;
        self
    }

    pub fn locale(mut self, code: impl Into<String>) -> Self {
        self.locale = Some(code.into());
        self
    }

    pub(crate) fn compression(&self) -> Option<Compression> {
        (self.compress_threshold != usize::MAX).then_some(Compression {
            threshold: self.compress_threshold,
            level: self.compression_level,
        })
    }
}
