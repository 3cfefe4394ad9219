//! Per-message dispatch: lease a VM, boot it if cold, hand it the request
//! and produce the reply.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    EnrichError, InboundMessage, MessageHandler, ReplyError, ReplySink, RequestEnricher,
    CORRELATION_ID_HEADER, REPLY_TO_HEADER,
};
use crate::error::ErrorKind;
use crate::firecracker::BootSpec;
use crate::image::{ImageError, ImageService};
use crate::models::InvocationRequest;
use crate::network::NetworkSetupError;
use crate::pool::{LaunchError, Lease, PoolError, ProcessPool};
use crate::store::{PendingRequest, PendingRequestStore, StoreError};

/// Errors from dispatching one message.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message has no {0} header")]
    MissingHeader(&'static str),

    #[error("invalid request payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("request is missing function id or version")]
    MissingFunction,

    #[error(transparent)]
    Enrich(#[from] EnrichError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to fetch images: {0}")]
    Image(#[from] ImageError),

    #[error("failed to boot VM: {0}")]
    Boot(#[source] LaunchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("request {0} was abandoned before a response arrived")]
    Abandoned(String),

    #[error(transparent)]
    Reply(#[from] ReplyError),
}

impl DispatchError {
    /// Failure class for logs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingHeader(_) | Self::Decode(_) | Self::MissingFunction => {
                ErrorKind::ProtocolMismatch
            }
            Self::Pool(PoolError::EmptyFunctionKey) => ErrorKind::ProtocolMismatch,
            Self::Enrich(_) => ErrorKind::TransientIo,
            Self::Pool(PoolError::Network(NetworkSetupError::Command(_))) => {
                ErrorKind::ConfigurationFailure
            }
            Self::Pool(PoolError::Network(_)) => ErrorKind::ResourceExhaustion,
            Self::Pool(PoolError::Launch(LaunchError::Spawn(_))) => ErrorKind::ResourceExhaustion,
            Self::Pool(PoolError::Launch(LaunchError::BinaryNotFound(_))) => {
                ErrorKind::ConfigurationFailure
            }
            Self::Pool(PoolError::Launch(LaunchError::Api(_)) | PoolError::Bridge(_)) => {
                ErrorKind::TransientIo
            }
            Self::Image(
                ImageError::Manifest { .. }
                | ImageError::EmptyArchive(_)
                | ImageError::UnknownBucket(_),
            ) => ErrorKind::ConfigurationFailure,
            Self::Image(ImageError::InvalidPath(_)) => ErrorKind::ProtocolMismatch,
            Self::Image(_) => ErrorKind::TransientIo,
            Self::Boot(_) => ErrorKind::ConfigurationFailure,
            Self::Store(StoreError::DuplicateCorrelationId(_)) => ErrorKind::ProtocolMismatch,
            Self::Store(StoreError::QueueClosed(_)) => ErrorKind::TransientIo,
            Self::Abandoned(_) | Self::Reply(_) => ErrorKind::TransientIo,
        }
    }
}

/// Runs invocations on pooled VMs.
pub struct Dispatcher {
    pool: Arc<ProcessPool>,
    store: Arc<PendingRequestStore>,
    images: Arc<ImageService>,
    replies: Arc<dyn ReplySink>,
    enrichers: Vec<Arc<dyn RequestEnricher>>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<ProcessPool>,
        store: Arc<PendingRequestStore>,
        images: Arc<ImageService>,
        replies: Arc<dyn ReplySink>,
    ) -> Self {
        Self {
            pool,
            store,
            images,
            replies,
            enrichers: Vec::new(),
        }
    }

    /// Run `enrichers`, in order, on every request before dispatch.
    pub fn with_enrichers(mut self, enrichers: Vec<Arc<dyn RequestEnricher>>) -> Self {
        self.enrichers = enrichers;
        self
    }

    async fn enrich(&self, request: &mut InvocationRequest) -> Result<(), DispatchError> {
        for enricher in &self.enrichers {
            if enricher.can_enrich(request) {
                debug!(enricher = %enricher.name(), "Enriching request");
                enricher.enrich(request).await?;
            }
        }
        Ok(())
    }

    /// Fetch images, copy the overlay and boot a cold VM.
    ///
    /// The images and overlay copy stay attached to the VM until it is destroyed.
    async fn configure(
        &self,
        lease: &Lease,
        function_id: &str,
        version: &str,
    ) -> Result<(), DispatchError> {
        let images = self.images.fetch_function(function_id, version).await?;
        let overlay = self.images.scratch_copy(&images.overlay, lease.id()).await?;

        let network = lease.network();
        let spec = BootSpec {
            kernel: images.kernel.path().to_path_buf(),
            rootfs: images.rootfs.path().to_path_buf(),
            overlay: overlay.path().to_path_buf(),
            guest_ip: network.guest_ip,
            host_ip: network.host_ip,
        };
        lease.attach(images);
        lease.attach(overlay);

        lease.boot(&spec).await.map_err(DispatchError::Boot)?;

        info!(
            handle_id = %lease.id(),
            function_id = %function_id,
            version = %version,
            guest_ip = %spec.guest_ip,
            "Booted VM"
        );
        Ok(())
    }

    /// Run `request` on a VM and return once the reply is produced.
    pub async fn dispatch(
        &self,
        mut request: InvocationRequest,
        correlation_id: &str,
        reply_to: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), DispatchError> {
        self.enrich(&mut request).await?;
        let function_key = request.function_key().ok_or(DispatchError::MissingFunction)?;
        let (function_id, version) = request
            .function_ref()
            .map(|(id, version)| (id.to_string(), version.to_string()))
            .ok_or(DispatchError::MissingFunction)?;

        let lease = self.pool.acquire(&function_key).await?;
        debug!(
            handle_id = %lease.id(),
            function_key = %function_key,
            correlation_id = %correlation_id,
            warm = lease.is_warm(),
            "Leased VM"
        );

        if !lease.is_warm() {
            if let Err(e) = self.configure(&lease, &function_id, &version).await {
                warn!(handle_id = %lease.id(), error = %e, "VM configuration failed, destroying");
                lease.invalidate().await;
                return Err(e);
            }
        }

        let (pending, completion) = PendingRequest::new(request, correlation_id, partition, offset);
        if let Err(e) = self.store.write_pending_request(&function_key, pending).await {
            lease.release().await;
            return Err(e.into());
        }

        // No local timeout; the caller's end-to-end timeout bounds this.
        let response = match completion.await {
            Ok(response) => response,
            Err(_) => {
                lease.invalidate().await;
                return Err(DispatchError::Abandoned(correlation_id.to_string()));
            }
        };
        lease.release().await;

        self.replies
            .send_reply(reply_to, &function_key, correlation_id, &response)
            .await?;

        info!(
            correlation_id = %correlation_id,
            function_key = %function_key,
            status = response.status_code,
            partition = partition,
            offset = offset,
            "Invocation completed"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: &InboundMessage) -> Result<(), DispatchError> {
        let correlation_id = message
            .header(CORRELATION_ID_HEADER)
            .ok_or(DispatchError::MissingHeader(CORRELATION_ID_HEADER))?;
        let reply_to = message
            .header(REPLY_TO_HEADER)
            .ok_or(DispatchError::MissingHeader(REPLY_TO_HEADER))?;
        let request: InvocationRequest = serde_json::from_slice(&message.payload)?;

        self.dispatch(request, correlation_id, reply_to, message.partition, message.offset)
            .await
    }
}
