//! Function image fetch and cache.
//!
//! Images live in object storage buckets:
//! - `function-manifests/{functionId}/{version}.json` names the runtime image
//!   and how both blobs are compressed
//! - `runtimes/{runtimeImage}` is the root filesystem, `runtimes/<zero uuid>.vmlinux`
//!   the guest kernel
//! - `functions/{functionId}/{version}` is the function overlay
//!
//! Downloads land in `{cache_dir}/_compressed/...`, are decompressed into
//! `{cache_dir}/_extracted/...` and are shared through ref-counted guards.

mod buckets;
mod cache;
mod service;

use thiserror::Error;

pub use buckets::{Buckets, S3Settings, FUNCTION_BUCKET, MANIFEST_BUCKET, RUNTIME_BUCKET};
pub use cache::{CacheStats, CachedImage, ImageCache};
pub use service::{
    FunctionImages, ImageService, ScratchFile, EVICTION_INTERVAL, EVICTION_TTL, KERNEL_OBJECT,
};

/// Errors from fetching images.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("bucket {0} is not configured")]
    UnknownBucket(String),

    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("invalid manifest for {function_id}:{version}: {source}")]
    Manifest {
        function_id: String,
        version: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid image path {0:?}")]
    InvalidPath(String),

    #[error("archive {0} contains no regular file")]
    EmptyArchive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decompression task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
