//! Object storage buckets the node reads images from.

use std::collections::HashMap;
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;

use super::ImageError;

/// Per-version function manifests: `{functionId}/{version}.json`.
pub const MANIFEST_BUCKET: &str = "function-manifests";
/// Runtime root filesystems and the guest kernel.
pub const RUNTIME_BUCKET: &str = "runtimes";
/// Function overlays: `{functionId}/{version}`.
pub const FUNCTION_BUCKET: &str = "functions";

/// S3-compatible endpoint settings.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub allow_http: bool,
}

/// Object stores by bucket name.
#[derive(Clone, Default)]
pub struct Buckets {
    stores: HashMap<String, Arc<dyn ObjectStore>>,
}

impl std::fmt::Debug for Buckets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.stores.keys().collect();
        names.sort();
        f.debug_struct("Buckets").field("buckets", &names).finish()
    }
}

impl Buckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the manifest, runtime and function buckets of an S3 endpoint.
    pub fn s3(settings: &S3Settings) -> Result<Self, ImageError> {
        let mut buckets = Self::new();
        for bucket in [MANIFEST_BUCKET, RUNTIME_BUCKET, FUNCTION_BUCKET] {
            let store = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_endpoint(&settings.endpoint)
                .with_region(&settings.region)
                .with_access_key_id(&settings.access_key)
                .with_secret_access_key(&settings.secret_key)
                .with_allow_http(settings.allow_http)
                .with_virtual_hosted_style_request(false)
                .build()?;
            buckets = buckets.with_bucket(bucket, Arc::new(store));
        }
        Ok(buckets)
    }

    /// Serve `bucket` from `store`.
    pub fn with_bucket(mut self, bucket: &str, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.insert(bucket.to_string(), store);
        self
    }

    pub(crate) fn get(&self, bucket: &str) -> Result<&Arc<dyn ObjectStore>, ImageError> {
        self.stores
            .get(bucket)
            .ok_or_else(|| ImageError::UnknownBucket(bucket.to_string()))
    }
}
