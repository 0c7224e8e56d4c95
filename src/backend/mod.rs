//! Inference backend: the asynchronous batch service the pipelines drive
//!
//! Two implementations:
//! - `OpenAiBatchClient`: the OpenAI Batch API over HTTP (feature `openai`)
//! - `MockBackend`: scripted in-process responses (testing)

mod mock;
#[cfg(feature = "openai")]
mod openai;
mod traits;
mod types;

pub use mock::{MockBackend, MockReply, SubmittedBatch};
#[cfg(feature = "openai")]
pub use openai::OpenAiBatchClient;
pub use traits::InferenceBackend;
pub use types::{
    BackendError, BackendResult, BatchMetadata, BatchRequest, BatchResult, ChatBody, ChatMessage,
    RemoteStatus, RequestCounts, ResultError, ResultResponse, StatusReport, CHAT_COMPLETIONS_URL,
};
