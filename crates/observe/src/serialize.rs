// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Streaming notify serialization.
//!
//! The exchange layer pulls payload chunks at increasing offsets; values are
//! serialized entry by entry, only as far ahead as the requested chunk needs.
//! Nothing is ever re-serialized: if the requested offset does not continue
//! the stream, the chunk is refused and the exchange fails.

use crate::payload::{OutputContext, output_context};
use lwm2m_coap::{ContentFormat, PayloadError, PayloadSource};
use lwm2m_core::{Path, SharedBatch};

/// A self-contained serialization cursor over one observation value.
///
/// Owns shared handles to the value's batches, the format-specific output
/// context rooted at the value's root path, an in-memory spill buffer and the
/// expected next offset. Handed to the exchange layer as the notification's
/// [`PayloadSource`]; also used synchronously to render initial Observe
/// responses.
pub struct SerializationCursor {
    batches: Vec<SharedBatch>,
    out_ctx: Option<Box<dyn OutputContext>>,
    membuf: Vec<u8>,
    read_pos: usize,
    batch_idx: usize,
    entry_idx: usize,
    expected_offset: usize,
}

impl SerializationCursor {
    /// Creates a cursor for `batches`, serialized as `format` relative to
    /// `root`.
    pub fn new(
        root: Path,
        format: ContentFormat,
        batches: Vec<SharedBatch>,
    ) -> Result<SerializationCursor, PayloadError> {
        let out_ctx = output_context(format, root).map_err(|err| PayloadError::Serialize {
            reason: err.to_string(),
        })?;
        Ok(SerializationCursor {
            batches,
            out_ctx: Some(out_ctx),
            membuf: Vec::new(),
            read_pos: 0,
            batch_idx: 0,
            entry_idx: 0,
            expected_offset: 0,
        })
    }

    /// Pulls the whole payload into one buffer; used for the synchronous
    /// initial response.
    pub fn drain(mut self) -> Result<Vec<u8>, PayloadError> {
        let mut all = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let produced = self.pull(all.len(), &mut chunk)?;
            all.extend_from_slice(&chunk[..produced]);
            if produced < chunk.len() {
                return Ok(all);
            }
        }
    }

    fn serialize_step(&mut self) -> Result<(), PayloadError> {
        let Some(out_ctx) = self.out_ctx.as_mut() else {
            return Ok(());
        };
        while self.batch_idx < self.batches.len() {
            let batch = &self.batches[self.batch_idx];
            if let Some(entry) = batch.entries().get(self.entry_idx) {
                self.entry_idx += 1;
                return out_ctx.entry(entry, &mut self.membuf).map_err(|err| {
                    PayloadError::Serialize {
                        reason: err.to_string(),
                    }
                });
            }
            self.batch_idx += 1;
            self.entry_idx = 0;
        }
        // Every entry consumed: flush and drop the output context.
        let result = out_ctx
            .finish(&mut self.membuf)
            .map_err(|err| PayloadError::Serialize {
                reason: err.to_string(),
            });
        self.out_ctx = None;
        result
    }
}

impl PayloadSource for SerializationCursor {
    fn pull(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize, PayloadError> {
        if offset != self.expected_offset {
            return Err(PayloadError::OffsetMismatch {
                expected: self.expected_offset,
                requested: offset,
            });
        }
        let mut written = 0;
        loop {
            let buffered = self.membuf.len() - self.read_pos;
            if buffered > 0 {
                let take = buffered.min(buf.len() - written);
                buf[written..written + take]
                    .copy_from_slice(&self.membuf[self.read_pos..self.read_pos + take]);
                written += take;
                self.read_pos += take;
                if self.read_pos == self.membuf.len() {
                    self.membuf.clear();
                    self.read_pos = 0;
                }
            }
            if written == buf.len() || self.out_ctx.is_none() {
                break;
            }
            self.serialize_step()?;
        }
        self.expected_offset += written;
        Ok(written)
    }
}
