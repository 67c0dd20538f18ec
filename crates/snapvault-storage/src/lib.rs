//! Object storage backends and the stream compressor used for snapshot uploads.

pub mod compression;
pub mod object_store;

pub use compression::LzwCompressor;
pub use object_store::{
    LocalObjectStore, MockS3ObjectStore, ObjectMetadata, ObjectReader, ObjectSink, ObjectStore,
    S3Config, S3ObjectStore,
};
