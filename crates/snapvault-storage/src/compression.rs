//! LZW compression for snapshot streams
//!
//! The codec parameters are fixed so archives stay portable between runs and
//! hosts: least-significant-bit-first code packing with an 8-bit symbol width.

use crate::object_store::ObjectSink;
use bytes::Bytes;
use snapvault_core::{CoreError, CoreResult};
use weezl::{decode::Decoder, encode::Encoder, BitOrder, LzwStatus};

/// Bit order of the emitted code stream.
pub const LZW_BIT_ORDER: BitOrder = BitOrder::Lsb;

/// Symbol width of the input alphabet.
pub const LZW_SYMBOL_BITS: u8 = 8;

/// Size of the scratch buffer encoded output is staged in before it is
/// forwarded to the sink.
const OUTPUT_CHUNK_BYTES: usize = 64 * 1024;

/// Streaming LZW compressor in front of an [`ObjectSink`].
///
/// Bytes passed to [`LzwCompressor::write`] are encoded and forwarded as
/// compressed chunks. [`LzwCompressor::finish`] must be called to emit the
/// trailing codes and end-of-stream marker; it hands the sink back so the
/// caller can commit it separately.
pub struct LzwCompressor {
    encoder: Encoder,
    sink: Box<dyn ObjectSink>,
    scratch: Vec<u8>,
    bytes_in: u64,
    bytes_out: u64,
}

impl LzwCompressor {
    /// Wrap `sink` with the fixed codec parameters.
    pub fn new(sink: Box<dyn ObjectSink>) -> Self {
        Self {
            encoder: Encoder::new(LZW_BIT_ORDER, LZW_SYMBOL_BITS),
            sink,
            scratch: vec![0u8; OUTPUT_CHUNK_BYTES],
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Uncompressed bytes accepted so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Compressed bytes forwarded to the sink so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Compress `data` and forward the output to the sink.
    ///
    /// # Errors
    ///
    /// - `CoreError::CompressionError` if the codec fails
    /// - any error returned by the sink's `write`
    pub async fn write(&mut self, mut data: &[u8]) -> CoreResult<()> {
        self.bytes_in += data.len() as u64;

        while !data.is_empty() {
            let result = self.encoder.encode_bytes(data, &mut self.scratch);
            result
                .status
                .map_err(|e| CoreError::CompressionError(format!("LZW encode failed: {}", e)))?;

            data = &data[result.consumed_in..];
            self.forward(result.consumed_out).await?;

            if result.consumed_in == 0 && result.consumed_out == 0 {
                return Err(CoreError::CompressionError(
                    "LZW encoder made no progress".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Flush trailing codec state and the end-of-stream code.
    ///
    /// Returns the wrapped sink, still uncommitted.
    ///
    /// # Errors
    ///
    /// - `CoreError::CompressionError` if the codec fails or stalls
    /// - any error returned by the sink's `write`
    pub async fn finish(mut self) -> CoreResult<Box<dyn ObjectSink>> {
        self.encoder.finish();

        loop {
            let result = self.encoder.encode_bytes(&[], &mut self.scratch);
            let status = result
                .status
                .map_err(|e| CoreError::CompressionError(format!("LZW finish failed: {}", e)))?;

            self.forward(result.consumed_out).await?;

            match status {
                LzwStatus::Done => break,
                _ if result.consumed_out == 0 => {
                    return Err(CoreError::CompressionError(
                        "LZW encoder stalled while flushing".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(self.sink)
    }

    async fn forward(&mut self, len: usize) -> CoreResult<()> {
        if len == 0 {
            return Ok(());
        }

        self.sink
            .write(Bytes::copy_from_slice(&self.scratch[..len]))
            .await?;
        self.bytes_out += len as u64;
        Ok(())
    }
}

/// Decompress an LZW stream produced by [`LzwCompressor`].
pub fn decompress(data: &[u8]) -> CoreResult<Bytes> {
    Decoder::new(LZW_BIT_ORDER, LZW_SYMBOL_BITS)
        .decode(data)
        .map(Bytes::from)
        .map_err(|e| CoreError::CompressionError(format!("LZW decode failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{
        MockFailure, MockOperation, MockS3ObjectStore, ObjectReader, ObjectStore,
    };

    async fn compress_into(store: &MockS3ObjectStore, key: &str, chunks: &[&[u8]]) -> CoreResult<()> {
        let sink = store.open_sink(key).await?;
        let mut compressor = LzwCompressor::new(sink);
        for chunk in chunks {
            compressor.write(chunk).await?;
        }
        compressor.finish().await?.close().await
    }

    #[tokio::test]
    async fn test_stream_decodes_to_input() {
        let store = MockS3ObjectStore::new();
        let text: &[u8] = b"zfs send stream zfs send stream zfs send stream";

        compress_into(&store, "web/backup-1", &[&text[..10], &text[10..]])
            .await
            .unwrap();

        let stored = store.get("web/backup-1").await.unwrap();
        assert_eq!(decompress(&stored).unwrap().as_ref(), text);
    }

    #[tokio::test]
    async fn test_empty_stream_is_valid() {
        let store = MockS3ObjectStore::new();
        compress_into(&store, "web/empty", &[]).await.unwrap();

        let stored = store.get("web/empty").await.unwrap();
        assert!(!stored.is_empty(), "end-of-stream code must be written");
        assert!(decompress(&stored).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repetitive_data_compresses() {
        let store = MockS3ObjectStore::new();
        let data = vec![0u8; 256 * 1024];

        let sink = store.open_sink("db/zeros").await.unwrap();
        let mut compressor = LzwCompressor::new(sink);
        compressor.write(&data).await.unwrap();
        assert_eq!(compressor.bytes_in(), data.len() as u64);

        let sink = compressor.finish().await.unwrap();
        sink.close().await.unwrap();

        let stored = store.get("db/zeros").await.unwrap();
        let ratio = data.len() as f64 / stored.len() as f64;
        assert!(ratio >= 10.0, "Expected high compression ratio, got {:.2}x", ratio);
        assert_eq!(decompress(&stored).unwrap().len(), data.len());
    }

    #[tokio::test]
    async fn test_sink_write_error_surfaces() {
        let store = MockS3ObjectStore::new();
        store.fail_on(MockOperation::Write, "web/", MockFailure::Transient("connection reset"));

        let result = compress_into(&store, "web/backup-1", &[b"payload"]).await;
        assert!(matches!(result, Err(CoreError::StorageError(_))));
        assert!(!store.contains_key("web/backup-1"));
    }
}
