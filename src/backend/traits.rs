//! Backend trait: the contract every inference service client implements

use super::types::{BackendResult, BatchMetadata, BatchRequest, BatchResult, StatusReport};
use async_trait::async_trait;

/// An asynchronous batch inference service.
///
/// Abstracts over transport (HTTP, mock) so the submitter doesn't depend on
/// how the service is reached.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Submit a bounded list of requests as one batch.
    ///
    /// Returns the backend-assigned batch id.
    async fn create_batch(
        &self,
        requests: &[BatchRequest],
        metadata: &BatchMetadata,
    ) -> BackendResult<String>;

    /// Current status and request counts of a batch.
    async fn batch_status(&self, batch_id: &str) -> BackendResult<StatusReport>;

    /// Every result the batch produced so far.
    ///
    /// For a failed or expired batch this is whatever subset completed,
    /// plus error lines for requests that did not.
    async fn batch_results(&self, batch_id: &str) -> BackendResult<Vec<BatchResult>>;
}
