//! Transfer service
//!
//! Entry point for sender and target devices. Authorization happens here;
//! the packetizer, publisher and consumer only move bytes, and every state
//! change goes through a repository compare-and-swap.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::broker::{purge_packets, BrokerClient};
use super::consumer::{Consumer, PayloadLayout};
use super::directory::DeviceDirectory;
use super::packetizer::{ChunkSealer, PassthroughSealer, Packetizer};
use super::publisher::{PublishError, Publisher, RetryPolicy};
use super::reaper::ExpiryReaper;
use super::repository::TransferRepository;
use super::types::{
    Caller, FailureKind, FailureReason, NewTransfer, RegisterTransfer, TransferRecord,
    TransferStatus,
};
use crate::clock::Clock;
use crate::config::{Config, TransferConfig};
use crate::error::{Result, TransferError, ValidationError};

/// Transfer service (cheap to clone)
#[derive(Clone)]
pub struct TransferService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    repository: Arc<dyn TransferRepository>,
    broker: Arc<dyn BrokerClient>,
    directory: Arc<dyn DeviceDirectory>,
    clock: Arc<dyn Clock>,
    publisher: Publisher,
    consumer: Consumer,
    config: TransferConfig,
    /// Transfers with a publish in flight on this service
    publishing: Mutex<HashSet<Uuid>>,
}

/// Exclusive right to publish one transfer, released on drop
struct PublishClaim<'a> {
    claims: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for PublishClaim<'_> {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.id);
    }
}

impl TransferService {
    pub fn new(
        config: &Config,
        repository: Arc<dyn TransferRepository>,
        broker: Arc<dyn BrokerClient>,
        directory: Arc<dyn DeviceDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let publisher = Publisher::new(broker.clone(), RetryPolicy::from(&config.broker));
        let consumer = Consumer::new(broker.clone(), config.broker.read_timeout());

        Self {
            inner: Arc::new(ServiceInner {
                repository,
                broker,
                directory,
                clock,
                publisher,
                consumer,
                config: config.transfer.clone(),
                publishing: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a transfer from the caller's device to a target device
    pub async fn register(
        &self,
        caller: &Caller,
        request: RegisterTransfer,
    ) -> Result<TransferRecord> {
        let config = &self.inner.config;
        let now = self.inner.clock.now();

        let expires_at = match request.ttl_seconds {
            Some(seconds) => chrono::Duration::try_seconds(seconds),
            None => chrono::Duration::try_minutes(config.expires_in_minutes),
        }
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(now);

        let new = NewTransfer {
            file_name: request.file_name,
            content_type: request.content_type,
            size_bytes: request.size_bytes,
            sender_user_id: caller.user_id.clone(),
            target_user_id: request.target_user_id,
            sender_device_id: caller.device_id.clone(),
            target_device_id: request.target_device_id,
            chunk_size_bytes: request
                .chunk_size_bytes
                .unwrap_or(config.chunk_size_bytes as i64),
            encryption_envelope: request.encryption_envelope,
            created_at: now,
            expires_at,
        };

        let record = TransferRecord::create(new, &config.topic_prefix)?;
        if record.chunk_size_bytes() > config.max_chunk_size_bytes {
            return Err(ValidationError::ChunkSizeTooLarge.into());
        }
        let parties = record.parties();

        let directory = &self.inner.directory;
        if !directory
            .device_belongs_to(&parties.sender_user_id, &parties.sender_device_id)
            .await?
            || !directory
                .device_belongs_to(&parties.target_user_id, &parties.target_device_id)
                .await?
        {
            return Err(TransferError::TransferNotOwnedByUser);
        }

        self.inner.repository.create(&record).await?;

        tracing::info!(
            transfer_id = %record.id(),
            sender_device = %parties.sender_device_id,
            target_device = %parties.target_device_id,
            size_bytes = record.descriptor().size_bytes,
            packets = record.packet_count(),
            expires_at = %record.expires_at(),
            "Transfer registered"
        );

        Ok(record)
    }

    // ========================================================================
    // Publish
    // ========================================================================

    /// Publish the transfer's bytes; `source` is already ciphertext
    pub async fn publish<R>(
        &self,
        caller: &Caller,
        id: Uuid,
        source: R,
        cancel: &CancellationToken,
    ) -> Result<TransferRecord>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.publish_with(caller, id, source, Arc::new(PassthroughSealer), cancel)
            .await
    }

    /// Publish, sealing each chunk with `sealer` on the way out
    pub async fn publish_with<R>(
        &self,
        caller: &Caller,
        id: Uuid,
        source: R,
        sealer: Arc<dyn ChunkSealer>,
        cancel: &CancellationToken,
    ) -> Result<TransferRecord>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if !self.load(id).await?.parties().is_sender(caller) {
            return Err(TransferError::TransferNotOwnedByUser);
        }

        // Claim before reading the state the publish will rely on, so a
        // publish that finished in between is seen as `available`.
        let _claim = self.claim_publish(id)?;
        let record = self.load(id).await?;

        record.ensure_publishable()?;
        if self.inner.clock.now() > record.expires_at() {
            return Err(TransferError::TransferExpired);
        }

        let packets = Packetizer::new(&record, source)?
            .with_sealer(sealer)
            .into_stream();

        tracing::info!(
            transfer_id = %id,
            topic = %record.topic(),
            packets = record.packet_count(),
            "Publishing transfer"
        );

        match self.inner.publisher.publish(&record, packets, cancel).await {
            Ok(binding) => {
                let next = record.mark_available(binding)?;
                match self
                    .inner
                    .repository
                    .update_state(id, TransferStatus::Pending, next)
                    .await
                {
                    Ok(updated) => {
                        tracing::info!(
                            transfer_id = %id,
                            partition = binding.partition(),
                            start_offset = binding.start_offset(),
                            end_offset = binding.end_offset(),
                            "Transfer available"
                        );
                        Ok(updated)
                    }
                    Err(TransferError::StaleState { actual, .. }) => {
                        let current = self.load(id).await?;
                        match current.state().binding() {
                            // Packet keys are shared; never tombstone a range
                            // another publish made live.
                            Some(_) => tracing::warn!(
                                transfer_id = %id,
                                status = %actual,
                                "Transfer was published elsewhere, keeping packets"
                            ),
                            None => {
                                tracing::warn!(
                                    transfer_id = %id,
                                    status = %actual,
                                    "Transfer changed while publishing, purging packets"
                                );
                                purge_packets(
                                    self.inner.broker.as_ref(),
                                    &record,
                                    record.packet_count(),
                                )
                                .await;
                            }
                        }
                        Err(current.terminal_error().unwrap_or(TransferError::StaleState {
                            expected: TransferStatus::Pending,
                            actual: current.status(),
                        }))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(PublishError {
                error: TransferError::Cancelled,
                committed: 0,
            }) => {
                tracing::info!(transfer_id = %id, "Publish cancelled before any packet was committed");
                Err(TransferError::Cancelled)
            }
            Err(PublishError { error, committed }) => {
                let reason = FailureReason::from_publish_error(&error);
                tracing::error!(
                    transfer_id = %id,
                    committed = committed,
                    reason = %reason,
                    "Publish failed"
                );

                if self.record_failure(&record, reason).await && committed > 0 {
                    purge_packets(self.inner.broker.as_ref(), &record, committed).await;
                }
                Err(error)
            }
        }
    }

    // ========================================================================
    // Download
    // ========================================================================

    /// Stream the transfer's ciphertext to the target device's sink.
    ///
    /// Cancelling or a failing sink leaves the transfer `downloading` so the
    /// target can try again.
    pub async fn download<W>(
        &self,
        caller: &Caller,
        id: Uuid,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferRecord>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.download_with_layout(caller, id, PayloadLayout::Exact, sink, cancel)
            .await
    }

    /// Download a transfer published through a length-changing [`ChunkSealer`]
    pub async fn download_sealed<W>(
        &self,
        caller: &Caller,
        id: Uuid,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferRecord>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.download_with_layout(caller, id, PayloadLayout::Sealed, sink, cancel)
            .await
    }

    async fn download_with_layout<W>(
        &self,
        caller: &Caller,
        id: Uuid,
        layout: PayloadLayout,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferRecord>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let record = self.load(id).await?;
        self.authorize_target(caller, &record).await?;

        let next = record.begin_download()?;
        if self.inner.clock.now() > record.expires_at() {
            return Err(TransferError::TransferExpired);
        }
        let record = match record.status() {
            TransferStatus::Downloading => record,
            from => match self.inner.repository.update_state(id, from, next).await {
                Ok(updated) => updated,
                Err(TransferError::StaleState { .. }) => {
                    let current = self.load(id).await?;
                    current.begin_download()?;
                    current
                }
                Err(e) => return Err(e),
            },
        };

        tracing::info!(transfer_id = %id, device = %caller.device_id, "Download started");

        match self
            .inner
            .consumer
            .stream_with_layout(&record, layout, sink, cancel)
            .await
        {
            Ok(stats) => {
                let next = record.complete_download(self.inner.clock.now())?;
                match self
                    .inner
                    .repository
                    .update_state(id, TransferStatus::Downloading, next)
                    .await
                {
                    Ok(done) => {
                        tracing::info!(
                            transfer_id = %id,
                            packets = stats.packets,
                            bytes = stats.bytes_written,
                            duplicates = stats.duplicates,
                            skipped = stats.skipped,
                            "Transfer downloaded"
                        );
                        if self.inner.config.purge_on_completion {
                            purge_packets(self.inner.broker.as_ref(), &done, done.packet_count())
                                .await;
                        }
                        Ok(done)
                    }
                    Err(TransferError::StaleState { .. }) => {
                        Err(self.current_error(id, TransferStatus::Downloading).await)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(TransferError::Cancelled) => {
                tracing::info!(transfer_id = %id, "Download cancelled");
                Err(TransferError::Cancelled)
            }
            Err(TransferError::Io(e)) => {
                tracing::warn!(transfer_id = %id, error = %e, "Sink write failed");
                Err(TransferError::Io(e))
            }
            Err(error) => {
                let reason = FailureReason::from_download_error(&error);
                tracing::error!(transfer_id = %id, reason = %reason, "Download failed");
                self.record_failure(&record, reason).await;
                Err(error)
            }
        }
    }

    // ========================================================================
    // Cancel / Reject
    // ========================================================================

    /// Sender abandons a transfer
    pub async fn cancel(&self, caller: &Caller, id: Uuid) -> Result<TransferRecord> {
        let record = self.load(id).await?;
        if !record.parties().is_sender(caller) {
            return Err(TransferError::TransferNotOwnedByUser);
        }

        self.fail_now(
            &record,
            FailureReason::new(FailureKind::Cancelled, "cancelled by sender"),
        )
        .await
    }

    /// Target device declines a transfer
    pub async fn reject(&self, caller: &Caller, id: Uuid) -> Result<TransferRecord> {
        let record = self.load(id).await?;
        self.authorize_target(caller, &record).await?;

        self.fail_now(
            &record,
            FailureReason::new(FailureKind::Rejected, "rejected by target device"),
        )
        .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// A transfer the caller's user is party to
    pub async fn get(&self, caller: &Caller, id: Uuid) -> Result<TransferRecord> {
        let record = self.load(id).await?;
        if !record.parties().involves_user(&caller.user_id) {
            return Err(TransferError::TransferNotOwnedByUser);
        }
        Ok(record)
    }

    /// Every transfer sent or received by the caller's user, newest first
    pub async fn list_for_user(&self, caller: &Caller) -> Result<Vec<TransferRecord>> {
        self.inner.repository.list_for_user(&caller.user_id).await
    }

    /// Unexpired transfers waiting for the caller's device
    pub async fn pending_for_device(&self, caller: &Caller) -> Result<Vec<TransferRecord>> {
        if !self
            .inner
            .directory
            .device_belongs_to(&caller.user_id, &caller.device_id)
            .await?
        {
            return Err(TransferError::TransferNotForDevice);
        }

        let now = self.inner.clock.now();
        let records = self
            .inner
            .repository
            .list_available_for_device(&caller.device_id)
            .await?;

        Ok(records
            .into_iter()
            .filter(|r| r.parties().target_user_id == caller.user_id && now <= r.expires_at())
            .collect())
    }

    /// Reaper sharing this service's repository, clock and purge policy
    pub fn reaper(&self, interval: std::time::Duration) -> ExpiryReaper {
        let reaper = ExpiryReaper::new(
            self.inner.repository.clone(),
            self.inner.clock.clone(),
            interval,
        );
        if self.inner.config.purge_on_completion {
            reaper.with_purge(self.inner.broker.clone())
        } else {
            reaper
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn load(&self, id: Uuid) -> Result<TransferRecord> {
        self.inner
            .repository
            .get(id)
            .await?
            .ok_or(TransferError::TransferNotFound(id))
    }

    /// Caller must be the target user on the target device
    async fn authorize_target(&self, caller: &Caller, record: &TransferRecord) -> Result<()> {
        let parties = record.parties();
        if !parties.involves_user(&caller.user_id) {
            return Err(TransferError::TransferNotOwnedByUser);
        }
        if !parties.is_target(caller) {
            return Err(TransferError::TransferNotForDevice);
        }
        if !self
            .inner
            .directory
            .device_belongs_to(&caller.user_id, &caller.device_id)
            .await?
        {
            return Err(TransferError::TransferNotForDevice);
        }
        Ok(())
    }

    /// Error describing where a record ended up after a lost compare-and-swap
    async fn current_error(&self, id: Uuid, expected: TransferStatus) -> TransferError {
        match self.load(id).await {
            Ok(current) => current
                .terminal_error()
                .unwrap_or(TransferError::StaleState {
                    expected,
                    actual: current.status(),
                }),
            Err(e) => e,
        }
    }

    /// Move to `failed` on behalf of a caller, purging any published packets
    async fn fail_now(&self, record: &TransferRecord, reason: FailureReason) -> Result<TransferRecord> {
        let next = record.fail(reason.clone())?;
        let failed = self
            .inner
            .repository
            .update_state(record.id(), record.status(), next)
            .await?;

        tracing::info!(transfer_id = %record.id(), reason = %reason, "Transfer failed");

        if let Some(binding) = failed.state().binding() {
            purge_packets(self.inner.broker.as_ref(), &failed, binding.span()).await;
        }
        Ok(failed)
    }

    fn claim_publish(&self, id: Uuid) -> Result<PublishClaim<'_>> {
        if !self.inner.publishing.lock().insert(id) {
            tracing::warn!(transfer_id = %id, "Publish already in progress");
            return Err(TransferError::InvalidTransition {
                from: TransferStatus::Pending,
                to: TransferStatus::Available,
            });
        }

        Ok(PublishClaim {
            claims: &self.inner.publishing,
            id,
        })
    }

    /// Best-effort `failed` transition after a publish or download error.
    ///
    /// Returns whether this call moved the record.
    async fn record_failure(&self, record: &TransferRecord, reason: FailureReason) -> bool {
        let next = match record.fail(reason) {
            Ok(next) => next,
            Err(e) => {
                tracing::debug!(transfer_id = %record.id(), reason = %e, "Already terminal");
                return false;
            }
        };

        match self
            .inner
            .repository
            .update_state(record.id(), record.status(), next)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(transfer_id = %record.id(), error = %e, "Could not record transfer failure");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::transfer::broker::{BrokerError, MemoryBroker};
    use crate::transfer::directory::MemoryDeviceDirectory;
    use crate::transfer::repository::MemoryTransferRepository;
    use crate::transfer::test_support::sample_bytes;
    use crate::transfer::types::{BrokerBinding, TransferState};
    use chrono::{DateTime, Utc};
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct Harness {
        service: TransferService,
        broker: MemoryBroker,
        clock: ManualClock,
    }

    async fn harness() -> Harness {
        let mut config = Config::default();
        config.broker.publish_max_retries = 1;
        config.broker.publish_backoff_ms = 1;
        config.broker.publish_backoff_max_ms = 1;

        let directory = MemoryDeviceDirectory::new();
        directory.register("alice", "alice-phone").await;
        directory.register("bob", "bob-laptop").await;
        directory.register("bob", "bob-phone").await;

        let broker = MemoryBroker::new();
        let clock = ManualClock::new(Utc::now());
        let service = TransferService::new(
            &config,
            Arc::new(MemoryTransferRepository::new()),
            Arc::new(broker.clone()),
            Arc::new(directory),
            Arc::new(clock.clone()),
        );

        Harness {
            service,
            broker,
            clock,
        }
    }

    fn alice() -> Caller {
        Caller::new("alice", "alice-phone")
    }

    fn bob() -> Caller {
        Caller::new("bob", "bob-laptop")
    }

    fn request(size: i64, chunk: i64) -> RegisterTransfer {
        RegisterTransfer {
            target_user_id: "bob".into(),
            target_device_id: "bob-laptop".into(),
            file_name: "notes.pdf".into(),
            content_type: "application/pdf".into(),
            size_bytes: size,
            chunk_size_bytes: Some(chunk),
            encryption_envelope: Some("wrapped-key".into()),
            ttl_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_register_validates_input() {
        let h = harness().await;

        let err = h.service.register(&alice(), request(0, 3)).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidArgument(ValidationError::FileSizeMustBePositive)
        ));

        let expired = RegisterTransfer {
            ttl_seconds: Some(-30),
            ..request(10, 3)
        };
        let err = h.service.register(&alice(), expired).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidArgument(ValidationError::ExpiryNotAfterCreation)
        ));

        let no_envelope = RegisterTransfer {
            encryption_envelope: None,
            ..request(10, 3)
        };
        let err = h.service.register(&alice(), no_envelope).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_register_checks_device_ownership() {
        let h = harness().await;

        let stolen = Caller::new("alice", "bob-laptop");
        assert!(matches!(
            h.service.register(&stolen, request(10, 3)).await,
            Err(TransferError::TransferNotOwnedByUser)
        ));

        let wrong_target = RegisterTransfer {
            target_device_id: "alice-phone".into(),
            ..request(10, 3)
        };
        assert!(matches!(
            h.service.register(&alice(), wrong_target).await,
            Err(TransferError::TransferNotOwnedByUser)
        ));
    }

    #[tokio::test]
    async fn test_register_uses_configured_defaults() {
        let h = harness().await;
        let request = RegisterTransfer {
            chunk_size_bytes: None,
            ..request(2 * 1024 * 1024, 1)
        };

        let record = h.service.register(&alice(), request).await.unwrap();
        assert_eq!(record.chunk_size_bytes(), 512 * 1024);
        assert_eq!(record.packet_count(), 4);
        assert_eq!(
            record.expires_at() - record.created_at(),
            chrono::Duration::minutes(60)
        );
        assert!(record.topic().starts_with("relay.transfers."));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let h = harness().await;
        let data = sample_bytes(10);
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();

        let available = h
            .service
            .publish(&alice(), record.id(), Cursor::new(data.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(available.status(), TransferStatus::Available);
        assert_eq!(available.state().binding().unwrap().span(), 4);

        let waiting = h.service.pending_for_device(&bob()).await.unwrap();
        assert_eq!(waiting.len(), 1);

        let mut sink = Vec::new();
        let done = h
            .service
            .download(&bob(), record.id(), &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink, data);
        assert_eq!(done.status(), TransferStatus::Downloaded);
        assert!(done.completed_at().is_some());
        assert!(h.service.pending_for_device(&bob()).await.unwrap().is_empty());

        let partition = done.state().binding().unwrap().partition();
        let log = h.broker.records(done.topic(), partition);
        assert_eq!(log.iter().filter(|r| r.message.is_tombstone()).count(), 4);

        assert!(matches!(
            h.service
                .download(&bob(), record.id(), &mut Vec::new(), &CancellationToken::new())
                .await,
            Err(TransferError::TransferAlreadyCompleted)
        ));
    }

    #[tokio::test]
    async fn test_only_sender_publishes() {
        let h = harness().await;
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();

        let result = h
            .service
            .publish(&bob(), record.id(), Cursor::new(sample_bytes(10)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransferError::TransferNotOwnedByUser)));
    }

    #[tokio::test]
    async fn test_download_authorization() {
        let h = harness().await;
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();
        h.service
            .publish(&alice(), record.id(), Cursor::new(sample_bytes(10)), &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let stranger = Caller::new("mallory", "mallory-pc");
        assert!(matches!(
            h.service.download(&stranger, record.id(), &mut Vec::new(), &cancel).await,
            Err(TransferError::TransferNotOwnedByUser)
        ));

        let other_device = Caller::new("bob", "bob-phone");
        assert!(matches!(
            h.service.download(&other_device, record.id(), &mut Vec::new(), &cancel).await,
            Err(TransferError::TransferNotForDevice)
        ));

        assert!(matches!(
            h.service.download(&alice(), record.id(), &mut Vec::new(), &cancel).await,
            Err(TransferError::TransferNotForDevice)
        ));

        assert!(matches!(
            h.service.get(&stranger, record.id()).await,
            Err(TransferError::TransferNotOwnedByUser)
        ));
        assert_eq!(
            h.service.get(&alice(), record.id()).await.unwrap().status(),
            TransferStatus::Available
        );
    }

    #[tokio::test]
    async fn test_download_before_publish_is_not_available() {
        let h = harness().await;
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();

        let result = h
            .service
            .download(&bob(), record.id(), &mut Vec::new(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(TransferError::TransferNotAvailable(TransferStatus::Pending))
        ));
        assert_eq!(
            h.service.get(&bob(), record.id()).await.unwrap().status(),
            TransferStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_publish_after_expiry_leaves_record_pending() {
        let h = harness().await;
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(61));

        let result = h
            .service
            .publish(&alice(), record.id(), Cursor::new(sample_bytes(10)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransferError::TransferExpired)));
        assert_eq!(
            h.service.get(&alice(), record.id()).await.unwrap().status(),
            TransferStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_short_source_fails_transfer() {
        let h = harness().await;
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();

        let result = h
            .service
            .publish(&alice(), record.id(), Cursor::new(sample_bytes(8)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransferError::SourceRead(_))));

        let failed = h.service.get(&alice(), record.id()).await.unwrap();
        assert_eq!(failed.status(), TransferStatus::Failed);
        assert_eq!(
            failed.state().failure_reason().unwrap().kind,
            FailureKind::SourceReadError
        );
    }

    #[tokio::test]
    async fn test_publish_exhausted_fails_transfer() {
        let h = harness().await;
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();
        h.broker.fail_next_publishes([
            BrokerError::Transient("no leader".into()),
            BrokerError::Transient("no leader".into()),
        ]);

        let result = h
            .service
            .publish(&alice(), record.id(), Cursor::new(sample_bytes(10)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransferError::PublishExhausted { .. })));

        let failed = h.service.get(&alice(), record.id()).await.unwrap();
        assert_eq!(
            failed.state().failure_reason().unwrap().kind,
            FailureKind::PublishExhausted
        );
        assert!(failed.state().binding().is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_commit_stays_pending() {
        let h = harness().await;
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h
            .service
            .publish(&alice(), record.id(), Cursor::new(sample_bytes(10)), &cancel)
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(
            h.service.get(&alice(), record.id()).await.unwrap().status(),
            TransferStatus::Pending
        );
        assert!(!h.broker.has_topic(record.topic()));
    }

    #[tokio::test]
    async fn test_tampered_packet_fails_download() {
        let h = harness().await;
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();
        let available = h
            .service
            .publish(&alice(), record.id(), Cursor::new(sample_bytes(10)), &CancellationToken::new())
            .await
            .unwrap();

        let binding = *available.state().binding().unwrap();
        assert!(h.broker.overwrite_value(
            available.topic(),
            binding.partition(),
            binding.start_offset() + 1,
            vec![0, 0, 0],
        ));

        let result = h
            .service
            .download(&bob(), record.id(), &mut Vec::new(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(TransferError::IntegrityViolation { sequence: 1, .. })
        ));

        let failed = h.service.get(&bob(), record.id()).await.unwrap();
        assert_eq!(
            failed.state().failure_reason().unwrap().kind,
            FailureKind::IntegrityViolation
        );
        assert!(matches!(
            h.service
                .download(&bob(), record.id(), &mut Vec::new(), &CancellationToken::new())
                .await,
            Err(TransferError::TransferFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_download_stays_downloading() {
        let h = harness().await;
        let data = sample_bytes(10);
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();
        h.service
            .publish(&alice(), record.id(), Cursor::new(data.clone()), &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = h
            .service
            .download(&bob(), record.id(), &mut Vec::new(), &cancel)
            .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(
            h.service.get(&bob(), record.id()).await.unwrap().status(),
            TransferStatus::Downloading
        );

        let mut sink = Vec::new();
        let done = h
            .service
            .download(&bob(), record.id(), &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status(), TransferStatus::Downloaded);
        assert_eq!(sink, data);
    }

    #[tokio::test]
    async fn test_sender_cancel_and_target_reject() {
        let h = harness().await;

        let first = h.service.register(&alice(), request(10, 3)).await.unwrap();
        assert!(matches!(
            h.service.cancel(&bob(), first.id()).await,
            Err(TransferError::TransferNotOwnedByUser)
        ));
        let cancelled = h.service.cancel(&alice(), first.id()).await.unwrap();
        assert_eq!(
            cancelled.state().failure_reason().unwrap().kind,
            FailureKind::Cancelled
        );
        assert!(matches!(
            h.service.cancel(&alice(), first.id()).await,
            Err(TransferError::TransferFailed(_))
        ));

        let second = h.service.register(&alice(), request(10, 3)).await.unwrap();
        h.service
            .publish(&alice(), second.id(), Cursor::new(sample_bytes(10)), &CancellationToken::new())
            .await
            .unwrap();
        let rejected = h.service.reject(&bob(), second.id()).await.unwrap();
        assert_eq!(
            rejected.state().failure_reason().unwrap().to_string(),
            "Rejected: rejected by target device"
        );
        assert!(rejected.state().binding().is_some());
    }

    /// Swaps in another state the moment a publish tries to make the
    /// transfer available
    struct RacingRepository {
        inner: MemoryTransferRepository,
        winner: TransferState,
    }

    #[async_trait::async_trait]
    impl TransferRepository for RacingRepository {
        async fn create(&self, record: &TransferRecord) -> Result<()> {
            self.inner.create(record).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<TransferRecord>> {
            self.inner.get(id).await
        }

        async fn update_state(
            &self,
            id: Uuid,
            expected: TransferStatus,
            state: TransferState,
        ) -> Result<TransferRecord> {
            if state.status() == TransferStatus::Available {
                self.inner
                    .update_state(id, expected, self.winner.clone())
                    .await?;
            }
            self.inner.update_state(id, expected, state).await
        }

        async fn list_expirable(&self, now: DateTime<Utc>) -> Result<Vec<TransferRecord>> {
            self.inner.list_expirable(now).await
        }

        async fn list_for_user(&self, user_id: &str) -> Result<Vec<TransferRecord>> {
            self.inner.list_for_user(user_id).await
        }

        async fn list_available_for_device(&self, device_id: &str) -> Result<Vec<TransferRecord>> {
            self.inner.list_available_for_device(device_id).await
        }
    }

    async fn racing_service(winner: TransferState) -> (TransferService, MemoryBroker) {
        let directory = MemoryDeviceDirectory::new();
        directory.register("alice", "alice-phone").await;
        directory.register("bob", "bob-laptop").await;

        let broker = MemoryBroker::with_partitions(1);
        let service = TransferService::new(
            &Config::default(),
            Arc::new(RacingRepository {
                inner: MemoryTransferRepository::new(),
                winner,
            }),
            Arc::new(broker.clone()),
            Arc::new(directory),
            Arc::new(SystemClock),
        );
        (service, broker)
    }

    #[tokio::test]
    async fn test_publish_losing_race_purges_packets() {
        let (service, broker) = racing_service(TransferState::Expired { binding: None }).await;

        let record = service.register(&alice(), request(10, 3)).await.unwrap();
        let result = service
            .publish(&alice(), record.id(), Cursor::new(sample_bytes(10)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransferError::TransferExpired)));

        let log = broker.records(record.topic(), 0);
        assert_eq!(log.len(), 8);
        assert!(log[4..].iter().all(|r| r.message.is_tombstone()));
    }

    #[tokio::test]
    async fn test_publish_losing_to_another_binding_keeps_packets() {
        let binding = BrokerBinding::new(0, 100, 103, 4).unwrap();
        let (service, broker) = racing_service(TransferState::Available { binding }).await;

        let record = service.register(&alice(), request(10, 3)).await.unwrap();
        let result = service
            .publish(&alice(), record.id(), Cursor::new(sample_bytes(10)), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(TransferError::StaleState {
                expected: TransferStatus::Pending,
                actual: TransferStatus::Available,
            })
        ));

        let log = broker.records(record.topic(), 0);
        assert_eq!(log.len(), 4);
        assert!(!log.iter().any(|r| r.message.is_tombstone()));
    }

    #[tokio::test]
    async fn test_concurrent_publish_is_refused() {
        let h = harness().await;
        let data = sample_bytes(10);
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();

        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(&data[..9]).await.unwrap();
        let first = {
            let service = h.service.clone();
            let id = record.id();
            tokio::spawn(async move {
                service
                    .publish(&alice(), id, reader, &CancellationToken::new())
                    .await
            })
        };

        let committed = || {
            (0..3)
                .map(|partition| h.broker.records(record.topic(), partition).len())
                .sum::<usize>()
        };
        for _ in 0..200 {
            if committed() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(committed(), 3);

        let second = h
            .service
            .publish(&alice(), record.id(), Cursor::new(data.clone()), &CancellationToken::new())
            .await;
        assert!(matches!(
            second,
            Err(TransferError::InvalidTransition {
                from: TransferStatus::Pending,
                to: TransferStatus::Available,
            })
        ));
        assert_eq!(committed(), 3);

        writer.write_all(&data[9..]).await.unwrap();
        drop(writer);
        let available = first.await.unwrap().unwrap();
        assert_eq!(available.status(), TransferStatus::Available);
        assert_eq!(committed(), 4);

        let mut sink = Vec::new();
        h.service
            .download(&bob(), record.id(), &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sink, data);

        // claim released; the record itself now refuses another publish
        assert!(matches!(
            h.service
                .publish(&alice(), record.id(), Cursor::new(data), &CancellationToken::new())
                .await,
            Err(TransferError::TransferAlreadyCompleted)
        ));
    }

    #[tokio::test]
    async fn test_download_after_expiry_is_refused() {
        let h = harness().await;
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();
        h.service
            .publish(&alice(), record.id(), Cursor::new(sample_bytes(10)), &CancellationToken::new())
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::minutes(120));
        let result = h
            .service
            .download(&bob(), record.id(), &mut Vec::new(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransferError::TransferExpired)));
        assert_eq!(
            h.service.get(&bob(), record.id()).await.unwrap().status(),
            TransferStatus::Available
        );
    }

    /// Appends a fixed four-byte tag to every chunk
    struct TaggingSealer;

    impl ChunkSealer for TaggingSealer {
        fn seal(&self, _sequence: u64, mut chunk: Vec<u8>) -> Result<Vec<u8>> {
            chunk.extend_from_slice(b"TAG!");
            Ok(chunk)
        }
    }

    #[tokio::test]
    async fn test_sealed_transfer_needs_sealed_download() {
        let h = harness().await;
        let data = sample_bytes(10);
        let expected: Vec<u8> = data
            .chunks(3)
            .flat_map(|chunk| [chunk, b"TAG!".as_slice()].concat())
            .collect();

        let sealed = h.service.register(&alice(), request(10, 3)).await.unwrap();
        h.service
            .publish_with(
                &alice(),
                sealed.id(),
                Cursor::new(data.clone()),
                Arc::new(TaggingSealer),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut sink = Vec::new();
        let done = h
            .service
            .download_sealed(&bob(), sealed.id(), &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status(), TransferStatus::Downloaded);
        assert_eq!(sink, expected);

        let strict = h.service.register(&alice(), request(10, 3)).await.unwrap();
        h.service
            .publish_with(
                &alice(),
                strict.id(),
                Cursor::new(data),
                Arc::new(TaggingSealer),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(
            h.service
                .download(&bob(), strict.id(), &mut Vec::new(), &CancellationToken::new())
                .await,
            Err(TransferError::IntegrityViolation { sequence: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_oversized_chunks() {
        let h = harness().await;

        let err = h
            .service
            .register(&alice(), request(10, 64 * 1024 * 1024))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidArgument(ValidationError::ChunkSizeTooLarge)
        ));
        assert!(h.service.list_for_user(&alice()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listing_and_reaper_wiring() {
        let h = harness().await;
        let record = h.service.register(&alice(), request(10, 3)).await.unwrap();

        assert_eq!(h.service.list_for_user(&alice()).await.unwrap().len(), 1);
        assert_eq!(h.service.list_for_user(&bob()).await.unwrap().len(), 1);

        h.clock.advance(chrono::Duration::minutes(61));
        let report = h
            .service
            .reaper(std::time::Duration::from_secs(60))
            .sweep()
            .await
            .unwrap();
        assert_eq!(report.expired, 1);

        assert!(matches!(
            h.service
                .publish(&alice(), record.id(), Cursor::new(sample_bytes(10)), &CancellationToken::new())
                .await,
            Err(TransferError::TransferExpired)
        ));
    }
}
