//! Function image fetching.
//!
//! A cold VM needs three files: the runtime root filesystem, the guest
//! kernel and the function overlay. Each is downloaded once per node,
//! decompressed into the cache and shared by reference count. Concurrent
//! requests for the same object wait on a per-object lock and reuse the
//! first download.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flate2::read::DeflateDecoder;
use futures_util::StreamExt;
use object_store::path::Path as ObjectPath;
use tar::Archive;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::buckets::{Buckets, FUNCTION_BUCKET, MANIFEST_BUCKET, RUNTIME_BUCKET};
use super::cache::{CachedImage, ImageCache};
use super::ImageError;
use crate::models::{Compression, FunctionManifest};

/// Guest kernel shared by every runtime.
pub const KERNEL_OBJECT: &str = "00000000-0000-0000-0000-000000000000.vmlinux";

/// Interval of the cache evictor.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(5);

/// Unreferenced cache entries idle longer than this are deleted.
pub const EVICTION_TTL: Duration = Duration::from_secs(300);

/// Images a cold VM boots from.
#[derive(Debug, Clone)]
pub struct FunctionImages {
    pub rootfs: CachedImage,
    pub kernel: CachedImage,
    pub overlay: CachedImage,
}

/// Per-VM writable copy of a file. Deleted on drop.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to delete scratch file");
            }
        }
    }
}

/// Downloads, decompresses and caches function images.
pub struct ImageService {
    buckets: Buckets,
    cache: ImageCache,
    scratch_dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ImageService {
    /// Cache under `cache_dir`; per-VM scratch copies go to `scratch_dir`.
    pub fn new(buckets: Buckets, cache_dir: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            buckets,
            cache: ImageCache::new(cache_dir),
            scratch_dir: scratch_dir.into(),
            locks: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    /// Read `function-manifests/{function_id}/{version}.json`.
    pub async fn fetch_manifest(
        &self,
        function_id: &str,
        version: &str,
    ) -> Result<FunctionManifest, ImageError> {
        check_name(function_id)?;
        check_name(version)?;
        let store = self.buckets.get(MANIFEST_BUCKET)?;
        let path = ObjectPath::from(format!("{}/{}.json", function_id, version));
        let bytes = store.get(&path).await?.bytes().await?;

        serde_json::from_slice(&bytes).map_err(|source| ImageError::Manifest {
            function_id: function_id.to_string(),
            version: version.to_string(),
            source,
        })
    }

    /// Resolve the manifest, then fetch rootfs, kernel and overlay concurrently.
    pub async fn fetch_function(
        &self,
        function_id: &str,
        version: &str,
    ) -> Result<FunctionImages, ImageError> {
        let manifest = self.fetch_manifest(function_id, version).await?;
        let overlay_object = format!("{}/{}", function_id, version);

        let (rootfs, kernel, overlay) = tokio::try_join!(
            self.fetch(RUNTIME_BUCKET, &manifest.runtime_image, manifest.runtime_compression),
            self.fetch(RUNTIME_BUCKET, KERNEL_OBJECT, Compression::None),
            self.fetch(FUNCTION_BUCKET, &overlay_object, manifest.overlay_compression),
        )?;

        Ok(FunctionImages {
            rootfs,
            kernel,
            overlay,
        })
    }

    /// Get `bucket/object` from the cache, downloading it on a miss.
    pub async fn fetch(
        &self,
        bucket: &str,
        object: &str,
        compression: Compression,
    ) -> Result<CachedImage, ImageError> {
        check_object(object)?;
        let key = ImageCache::key(bucket, object);
        if let Some(image) = self.cache.acquire(&key) {
            return Ok(image);
        }

        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        // Another task may have finished the download while we waited.
        if let Some(image) = self.cache.acquire(&key) {
            return Ok(image);
        }

        let (path, size) = self.download(bucket, object, compression).await?;
        Ok(self.cache.insert(&key, path, size))
    }

    async fn download(
        &self,
        bucket: &str,
        object: &str,
        compression: Compression,
    ) -> Result<(PathBuf, u64), ImageError> {
        let store = self.buckets.get(bucket)?;
        info!(bucket = %bucket, object = %object, compression = ?compression, "Downloading image");
        let result = store.get(&ObjectPath::from(object)).await?;

        let compressed = self.cache.compressed_path(bucket, object);
        let extracted = self.cache.extracted_path(bucket, object);
        for path in [&compressed, &extracted] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Files without a cache entry may be partial leftovers.
        let _ = tokio::fs::remove_file(&extracted).await;

        let target = match compression {
            Compression::None => &extracted,
            Compression::Deflate | Compression::Tar => &compressed,
        };

        let mut stream = result.into_stream();
        let mut file = tokio::fs::File::create(target).await?;
        let mut downloaded = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            downloaded += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if compression != Compression::None {
            let (src, dst) = (compressed.clone(), extracted.clone());
            tokio::task::spawn_blocking(move || decompress(&src, &dst, compression)).await??;
            let _ = tokio::fs::remove_file(&compressed).await;
        }

        let size = tokio::fs::metadata(&extracted).await?.len();
        debug!(
            bucket = %bucket,
            object = %object,
            downloaded = downloaded,
            size = size,
            "Image ready"
        );
        Ok((extracted, size))
    }

    /// Copy `image` to a writable per-VM file.
    pub async fn scratch_copy(&self, image: &CachedImage, vm_id: &str) -> Result<ScratchFile, ImageError> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let path = self.scratch_dir.join(format!("overlay-{}.ext4", vm_id));
        tokio::fs::copy(image.path(), &path).await?;
        Ok(ScratchFile { path })
    }

    /// Delete unreferenced images idle longer than `ttl`.
    ///
    /// Entries whose download lock is held are skipped until the next pass.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let mut evicted = 0;
        for key in self.cache.expired_keys(ttl) {
            let lock = self.lock_for(&key);
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };
            if self.cache.remove_if_expired(&key, ttl) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Run the evictor until shutdown.
    pub async fn run_evictor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval = ?EVICTION_INTERVAL, ttl = ?EVICTION_TTL, "Starting image cache evictor");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = self.evict_expired(EVICTION_TTL);
                    if evicted > 0 {
                        debug!(evicted = evicted, "Image cache eviction pass");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Image cache evictor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// A single path segment: a function id or version.
fn check_name(name: &str) -> Result<(), ImageError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ImageError::InvalidPath(name.to_string()));
    }
    Ok(())
}

/// A relative object name that stays inside its cache directory.
fn check_object(object: &str) -> Result<(), ImageError> {
    if object.is_empty() || object.contains('\\') {
        return Err(ImageError::InvalidPath(object.to_string()));
    }
    object
        .split('/')
        .try_for_each(check_name)
        .map_err(|_| ImageError::InvalidPath(object.to_string()))
}

/// Decompress `src` into `dst`.
fn decompress(src: &Path, dst: &Path, compression: Compression) -> Result<(), ImageError> {
    let reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dst)?);

    match compression {
        Compression::None => {
            let mut reader = reader;
            io::copy(&mut reader, &mut writer)?;
        }
        Compression::Deflate => {
            io::copy(&mut DeflateDecoder::new(reader), &mut writer)?;
        }
        Compression::Tar => {
            let mut archive = Archive::new(reader);
            let mut found = false;
            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry.header().entry_type().is_file() {
                    io::copy(&mut entry, &mut writer)?;
                    found = true;
                    break;
                }
            }
            if !found {
                drop(writer);
                let _ = std::fs::remove_file(dst);
                return Err(ImageError::EmptyArchive(src.display().to_string()));
            }
        }
    }

    io::Write::flush(&mut writer)?;
    Ok(())
}
