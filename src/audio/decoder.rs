//! Incremental little-endian `f32` decoder

use super::AudioChunk;

/// Size of one encoded sample
pub const BYTES_PER_SAMPLE: usize = 4;

/// Decodes a byte stream of `f32le` samples read by read
///
/// Network reads split samples at arbitrary byte offsets. The 0-3 bytes of
/// an incomplete trailing sample are held back and prefixed to the next read.
#[derive(Debug)]
pub struct PcmDecoder {
    leftover: Vec<u8>,
    sample_rate: u32,
}

impl PcmDecoder {
    /// Create a decoder producing chunks at `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            leftover: Vec::with_capacity(BYTES_PER_SAMPLE),
            sample_rate,
        }
    }

    /// Decode every complete sample available after appending `bytes`
    pub fn push(&mut self, bytes: &[u8]) -> AudioChunk {
        let samples = if self.leftover.is_empty() {
            self.decode_into_leftover(bytes)
        } else {
            let mut data = std::mem::take(&mut self.leftover);
            data.extend_from_slice(bytes);
            self.decode_into_leftover(&data)
        };

        AudioChunk::new(samples, self.sample_rate)
    }

    /// Bytes waiting for the rest of their sample
    #[must_use]
    pub fn leftover_len(&self) -> usize {
        self.leftover.len()
    }

    /// End of stream: drop the incomplete sample, returning how many bytes it had
    pub fn finish(&mut self) -> usize {
        let discarded = self.leftover.len();
        self.leftover.clear();
        discarded
    }

    fn decode_into_leftover(&mut self, data: &[u8]) -> Vec<f32> {
        let whole = data.chunks_exact(BYTES_PER_SAMPLE);
        self.leftover.extend_from_slice(whole.remainder());

        whole
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}
