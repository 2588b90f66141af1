//! Pipe configuration.

use crate::error::{CatalogError, CodecError};

bitflags::bitflags! {
    /// Diagnostics toggles; all off in production pipes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u32 {
        /// Trace every executed token.
        const TRACE_TOKENS = 0b0001;
        /// Trace dictionary writes.
        const TRACE_DICTIONARY = 0b0010;
        /// Trace ring publish/release batches.
        const TRACE_RING = 0b0100;
    }
}

/// Sizing and batching knobs for one codec pipe.
///
/// `slab_bits`/`blob_bits` size the ring (powers of two); the batch sizes
/// bound how many fragments a side may retire before making its cursor
/// movement visible to the other side.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// log2 of the slab slot count, in `[6, 24]`.
    pub slab_bits: u32,
    /// log2 of the blob byte count, in `[0, 28]`.
    pub blob_bits: u32,
    /// Fixed per-message header copied verbatim through the ring (0 or 4).
    pub preamble_bytes: u32,
    /// Upper bound on one text field's byte length.
    pub max_text_len: u32,
    /// Upper bound on one byte-vector field's length.
    pub max_byte_vector_len: u32,
    /// Fragments the producer may complete before publishing.
    pub batch_publish_size: u32,
    /// Fragments the consumer may retire before releasing.
    pub batch_release_size: u32,
    /// Diagnostics toggles.
    pub debug_flags: DebugFlags,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            slab_bits: 12,
            blob_bits: 15,
            preamble_bytes: 0,
            max_text_len: 256,
            max_byte_vector_len: 4096,
            batch_publish_size: 1,
            batch_release_size: 1,
            debug_flags: DebugFlags::empty(),
        }
    }
}

impl CodecConfig {
    /// Check the documented ranges and cross-field bounds.
    pub fn validate(&self, max_fragment_slots: usize) -> Result<(), CodecError> {
        let bad = |detail: String| {
            CodecError::Catalog(CatalogError::BadAttribute {
                element: "config".into(),
                detail,
            })
        };
        if !(6..=24).contains(&self.slab_bits) {
            return Err(bad(format!("slab_bits {} outside [6, 24]", self.slab_bits)));
        }
        if self.blob_bits > 28 {
            return Err(bad(format!("blob_bits {} outside [0, 28]", self.blob_bits)));
        }
        if self.preamble_bytes != 0 && self.preamble_bytes != 4 {
            return Err(bad(format!("preamble_bytes {} not 0 or 4", self.preamble_bytes)));
        }
        if max_fragment_slots > 0 {
            let limit = self.max_batch(max_fragment_slots);
            if self.batch_publish_size as usize > limit {
                return Err(bad(format!(
                    "batch_publish_size {} over bound {limit}",
                    self.batch_publish_size
                )));
            }
            if self.batch_release_size as usize > limit {
                return Err(bad(format!(
                    "batch_release_size {} over bound {limit}",
                    self.batch_release_size
                )));
            }
        }
        Ok(())
    }

    /// Largest admissible batch: half the fragments that fit in the slab,
    /// further capped by how many maximal payloads fit in the blob.
    pub fn max_batch(&self, max_fragment_slots: usize) -> usize {
        let slab_fragments = (1usize << self.slab_bits) / max_fragment_slots.max(1);
        let max_var = self.max_text_len.max(self.max_byte_vector_len).max(1) as usize;
        let blob_payloads = (1usize << self.blob_bits) / max_var;
        (slab_fragments.min(blob_payloads.max(1)) / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        CodecConfig::default().validate(64).unwrap();
    }

    #[test]
    fn out_of_range_bits_rejected() {
        let mut config = CodecConfig::default();
        config.slab_bits = 5;
        assert!(config.validate(8).is_err());
        config.slab_bits = 25;
        assert!(config.validate(8).is_err());
        config.slab_bits = 12;
        config.blob_bits = 29;
        assert!(config.validate(8).is_err());
    }

    #[test]
    fn batch_bound_tracks_ring_sizing() {
        let config = CodecConfig {
            slab_bits: 6,
            blob_bits: 10,
            max_text_len: 64,
            max_byte_vector_len: 64,
            ..CodecConfig::default()
        };
        // 64 slots / 8-slot fragments = 8; 1024 bytes / 64-byte payloads
        // = 16; min/2 = 4.
        assert_eq!(config.max_batch(8), 4);
    }
}
