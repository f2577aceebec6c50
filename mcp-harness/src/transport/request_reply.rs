//! Streamable HTTP binding: one POST per call
//!
//! The response body is either a single JSON document or an SSE frame
//! sequence. Frames are read incrementally and reading stops at the first
//! frame answering the request, since targets may keep the stream open.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::sse::{SseDecoder, SseFrame};
use super::{
    has_content_type, session_header, Binding, BindingResponse, CallHeaders, ResponseShape,
    TransportError, ACCEPT_BOTH,
};
use crate::protocol::response_id;

/// POST-per-call binding
pub struct RequestReplyBinding {
    client: reqwest::Client,
    endpoint: Url,
}

impl RequestReplyBinding {
    /// Binding posting to `endpoint`
    pub fn new(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    async fn post(
        &self,
        body: &Value,
        headers: &CallHeaders,
    ) -> Result<reqwest::Response, TransportError> {
        let builder = self
            .client
            .post(self.endpoint.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);

        Ok(headers.apply(builder).send().await?)
    }
}

fn answers(frame: &SseFrame, request_id: u64) -> bool {
    serde_json::from_str::<Value>(&frame.data)
        .ok()
        .and_then(|message| response_id(&message))
        == Some(request_id)
}

async fn read_frames(
    response: reqwest::Response,
    request_id: u64,
) -> Result<Vec<SseFrame>, TransportError> {
    let mut decoder = SseDecoder::new();
    let mut frames = Vec::new();
    let mut stream = Box::pin(response.bytes_stream());

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for frame in decoder.push(&chunk) {
            let matched = answers(&frame, request_id);
            frames.push(frame);
            if matched {
                return Ok(frames);
            }
        }
    }

    frames.extend(decoder.finish());
    debug!(
        "Event stream for request {} ended after {} frames without an answer",
        request_id,
        frames.len()
    );
    Ok(frames)
}

#[async_trait]
impl Binding for RequestReplyBinding {
    async fn exchange(
        &self,
        body: &Value,
        request_id: u64,
        headers: &CallHeaders,
    ) -> Result<BindingResponse, TransportError> {
        let response = self.post(body, headers).await?;
        let session_token = session_header(&response);
        let status = response.status();

        if let Err(e) = headers.check_status(status) {
            // Some targets answer declared errors with a 4xx/5xx status
            if matches!(e, TransportError::Http { .. }) {
                let text = response.text().await.unwrap_or_default();
                if let Ok(message) = serde_json::from_str::<Value>(&text) {
                    if response_id(&message) == Some(request_id) {
                        return Ok(BindingResponse {
                            shape: ResponseShape::SingleDocument(text),
                            session_token,
                        });
                    }
                }
            }
            return Err(e);
        }

        let shape = if has_content_type(&response, "text/event-stream") {
            ResponseShape::EventFrames(read_frames(response, request_id).await?)
        } else {
            ResponseShape::SingleDocument(response.text().await?)
        };

        Ok(BindingResponse {
            shape,
            session_token,
        })
    }

    async fn notify(&self, body: &Value, headers: &CallHeaders) -> Result<(), TransportError> {
        let response = self.post(body, headers).await?;
        headers.check_status(response.status())
    }

    async fn close(&self) {}
}
