//! The HTTP boundary to the telemetry backend.

use std::sync::Mutex;
use std::time::Duration;

use crate::entities::{EntityBatch, SourceTag, SourceTagAction, SourceTagOp};
use crate::errors::SendError;

/// Submits an already-serialized batch to the backend and classifies the
/// response. A concrete client never retries itself — that's the resilient
/// sender decorator's job — it just reports what happened.
pub trait BackendClient: Send + Sync {
    fn submit(
        &self,
        handle: &str,
        batch: &EntityBatch,
    ) -> impl std::future::Future<Output = Result<(), SendError>> + Send;
}

/// Object-safe counterpart of [`BackendClient`].
pub trait BackendClientBoxed: Send + Sync {
    fn submit_boxed<'a>(
        &'a self,
        handle: &'a str,
        batch: &'a EntityBatch,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SendError>> + Send + 'a>>;
}

impl<C: BackendClient> BackendClientBoxed for C {
    fn submit_boxed<'a>(
        &'a self,
        handle: &'a str,
        batch: &'a EntityBatch,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SendError>> + Send + 'a>> {
        Box::pin(self.submit(handle, batch))
    }
}

/// Production client backed by `reqwest`.
pub struct ReqwestBackendClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ReqwestBackendClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn endpoint_for(&self, batch: &EntityBatch) -> String {
        format!("{}/report/{}", self.base_url.trim_end_matches('/'), batch.entity_type().as_str())
    }

    fn source_tag_endpoint(&self, tag: &SourceTag) -> String {
        let kind = match tag.op {
            SourceTagOp::SourceDescription => "description",
            SourceTagOp::SourceTag => "tag",
        };
        format!(
            "{}/api/source/{}/{}",
            self.base_url.trim_end_matches('/'),
            tag.source,
            kind
        )
    }

    /// Source tag/description edits have no batch shape on the wire — the
    /// backend takes one PUT or DELETE per source, unlike every other entity
    /// type's single batched POST.
    async fn submit_source_tags(&self, tags: &[SourceTag]) -> Result<(), SendError> {
        for tag in tags {
            let url = self.source_tag_endpoint(tag);
            let request = match tag.action {
                SourceTagAction::Delete => self.client.delete(url),
                SourceTagAction::Add | SourceTagAction::Save => {
                    self.client.put(url).json(&tag.annotations)
                }
            };
            let response = request
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| SendError::Network(e.to_string()))?;

            let status = response.status().as_u16();
            match status {
                200..=299 => {}
                406 => return Err(SendError::PayloadTooLarge),
                407 | 408 | 429 | 502 | 503 | 504 => return Err(SendError::Retryable { status }),
                _ => return Err(SendError::Rejected { status }),
            }
        }
        Ok(())
    }
}

impl BackendClient for ReqwestBackendClient {
    async fn submit(&self, handle: &str, batch: &EntityBatch) -> Result<(), SendError> {
        if let EntityBatch::SourceTags(tags) = batch {
            return self.submit_source_tags(tags).await;
        }

        let response = self
            .client
            .post(self.endpoint_for(batch))
            .bearer_auth(&self.token)
            .header("X-Proxy-Handle", handle)
            .json(batch)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(()),
            406 => Err(SendError::PayloadTooLarge),
            407 | 408 | 429 | 502 | 503 | 504 => Err(SendError::Retryable { status }),
            _ => Err(SendError::Rejected { status }),
        }
    }
}

/// A canned response the [`RecordingBackendClient`] test double should
/// produce for its next `submit` call.
#[derive(Debug, Clone)]
pub enum CannedResponse {
    Ok,
    TooLarge,
    Retryable(u16),
    Rejected(u16),
    NetworkError,
    Delayed(Duration, Box<CannedResponse>),
}

/// Test double: records every submitted batch and returns scripted
/// responses, modeled on the teacher's `TestExporter`/`FailingExporter`
/// pair.
pub struct RecordingBackendClient {
    responses: Mutex<Vec<CannedResponse>>,
    submitted: Mutex<Vec<(String, EntityBatch)>>,
}

impl RecordingBackendClient {
    pub fn new(responses: Vec<CannedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(vec![])
    }

    pub fn submitted(&self) -> Vec<(String, EntityBatch)> {
        self.submitted.lock().unwrap().clone()
    }
}

impl BackendClient for RecordingBackendClient {
    async fn submit(&self, handle: &str, batch: &EntityBatch) -> Result<(), SendError> {
        self.submitted
            .lock()
            .unwrap()
            .push((handle.to_string(), batch.clone()));

        let next = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                CannedResponse::Ok
            } else {
                responses.remove(0)
            }
        };
        resolve_canned(next).await
    }
}

fn resolve_canned(response: CannedResponse) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SendError>> + Send>> {
    Box::pin(async move {
        match response {
            CannedResponse::Ok => Ok(()),
            CannedResponse::TooLarge => Err(SendError::PayloadTooLarge),
            CannedResponse::Retryable(status) => Err(SendError::Retryable { status }),
            CannedResponse::Rejected(status) => Err(SendError::Rejected { status }),
            CannedResponse::NetworkError => Err(SendError::Network("connection reset".into())),
            CannedResponse::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                resolve_canned(*inner).await
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ReqwestBackendClient {
        ReqwestBackendClient::new("https://example.invalid", "tok")
    }

    #[test]
    fn source_description_endpoint_targets_the_description_path() {
        let tag = SourceTag {
            op: SourceTagOp::SourceDescription,
            action: SourceTagAction::Save,
            source: "host-1".into(),
            annotations: Vec::new(),
        };
        assert_eq!(
            client().source_tag_endpoint(&tag),
            "https://example.invalid/api/source/host-1/description"
        );
    }

    #[test]
    fn source_tag_endpoint_targets_the_tag_path_and_trims_trailing_slash() {
        let tag = SourceTag {
            op: SourceTagOp::SourceTag,
            action: SourceTagAction::Add,
            source: "host-2".into(),
            annotations: Vec::new(),
        };
        let client = ReqwestBackendClient::new("https://example.invalid/", "tok");
        assert_eq!(
            client.source_tag_endpoint(&tag),
            "https://example.invalid/api/source/host-2/tag"
        );
    }

    #[test]
    fn point_batch_endpoint_is_unaffected_by_source_tag_routing() {
        let batch = EntityBatch::Points(Vec::new());
        assert_eq!(client().endpoint_for(&batch), "https://example.invalid/report/points");
    }
}
