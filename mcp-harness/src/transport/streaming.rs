//! HTTP+SSE binding: long-lived event stream plus one POST per request
//!
//! The stream is opened lazily on the first call. Its first `endpoint`
//! event names the URL requests are posted to; responses come back as
//! `message` events and a background reader hands each one to the request
//! waiting on its id. A request that stops waiting (timeout, cancellation)
//! unregisters itself, so a late answer is discarded.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::sse::{SseDecoder, SseFrame};
use super::{
    has_content_type, session_header, Binding, BindingResponse, CallHeaders, ResponseShape,
    TransportError,
};
use crate::protocol::response_id;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<SseFrame>>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<SseFrame>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Open event stream and the endpoint it announced
struct Channel {
    post_url: Url,
    session_token: Option<String>,
    pending: PendingMap,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes a pending entry when its request stops waiting
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

/// Event-stream binding
pub struct StreamingBinding {
    client: reqwest::Client,
    stream_url: Url,
    channel: tokio::sync::Mutex<Option<Arc<Channel>>>,
}

impl StreamingBinding {
    /// Binding reading events from `stream_url`
    pub fn new(client: reqwest::Client, stream_url: Url) -> Self {
        Self {
            client,
            stream_url,
            channel: tokio::sync::Mutex::new(None),
        }
    }

    async fn channel(&self, headers: &CallHeaders) -> Result<Arc<Channel>, TransportError> {
        let mut slot = self.channel.lock().await;
        if let Some(ref channel) = *slot {
            if !channel.open.load(Ordering::SeqCst) {
                return Err(TransportError::Stream {
                    message: "event stream closed".to_string(),
                });
            }
            return Ok(channel.clone());
        }

        let channel = Arc::new(self.open_channel(headers).await?);
        *slot = Some(channel.clone());
        Ok(channel)
    }

    async fn open_channel(&self, headers: &CallHeaders) -> Result<Channel, TransportError> {
        let builder = self
            .client
            .get(self.stream_url.clone())
            .header(ACCEPT, "text/event-stream");
        let response = headers.apply(builder).send().await?;
        let header_token = session_header(&response);
        headers.check_status(response.status())?;

        let mut stream = Box::pin(response.bytes_stream());
        let mut decoder = SseDecoder::new();
        let mut early = Vec::new();

        let endpoint = 'endpoint: loop {
            let Some(chunk) = stream.next().await else {
                return Err(TransportError::Stream {
                    message: "event stream ended before the endpoint event".to_string(),
                });
            };

            let mut frames = decoder.push(&chunk?).into_iter();
            while let Some(frame) = frames.next() {
                if frame.event_type() == "endpoint" {
                    early.extend(frames);
                    break 'endpoint frame.data;
                }
                debug!("Discarding {} event received before the endpoint", frame.event_type());
            }
        };

        let post_url = self
            .stream_url
            .join(endpoint.trim())
            .map_err(|e| TransportError::Stream {
                message: format!("invalid endpoint '{}': {}", endpoint, e),
            })?;
        let session_token = header_token.or_else(|| query_session(&post_url));
        info!("Event stream open; posting to {}", post_url);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_events(
            stream,
            decoder,
            early,
            pending.clone(),
            open.clone(),
        ));

        Ok(Channel {
            post_url,
            session_token,
            pending,
            open,
            reader,
        })
    }

    async fn post(
        &self,
        channel: &Channel,
        body: &Value,
        headers: &CallHeaders,
    ) -> Result<reqwest::Response, TransportError> {
        let builder = self.client.post(channel.post_url.clone()).json(body);
        Ok(headers.apply(builder).send().await?)
    }
}

/// Session token carried in the endpoint URL's query
fn query_session(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "session_id" || key == "sessionId")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Hand a `message` event to the request waiting on its id
fn deliver(pending: &PendingMap, frame: SseFrame) {
    if frame.event_type() != "message" {
        debug!("Ignoring {} event", frame.event_type());
        return;
    }

    let id = serde_json::from_str::<Value>(&frame.data)
        .ok()
        .and_then(|message| response_id(&message));

    match id {
        Some(id) => match lock(pending).remove(&id) {
            Some(waiter) => {
                if waiter.send(frame).is_err() {
                    debug!("Request {} stopped waiting before its answer arrived", id);
                }
            }
            None => debug!("Discarding late or unsolicited answer for id {}", id),
        },
        None => debug!("Discarding uncorrelated event"),
    }
}

async fn read_events<S, B>(
    mut stream: S,
    mut decoder: SseDecoder,
    early: Vec<SseFrame>,
    pending: PendingMap,
    open: Arc<AtomicBool>,
) where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    for frame in early {
        deliver(&pending, frame);
    }

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                for frame in decoder.push(chunk.as_ref()) {
                    deliver(&pending, frame);
                }
            }
            Err(e) => {
                warn!("Event stream failed: {}", e);
                break;
            }
        }
    }

    debug!("Event stream ended");
    open.store(false, Ordering::SeqCst);
    lock(&pending).clear();
}

#[async_trait]
impl Binding for StreamingBinding {
    async fn exchange(
        &self,
        body: &Value,
        request_id: u64,
        headers: &CallHeaders,
    ) -> Result<BindingResponse, TransportError> {
        let channel = self.channel(headers).await?;

        let (waiter, answer) = oneshot::channel();
        lock(&channel.pending).insert(request_id, waiter);
        let _guard = PendingGuard {
            pending: channel.pending.clone(),
            id: request_id,
        };

        let response = self.post(&channel, body, headers).await?;
        let session_token = session_header(&response).or_else(|| channel.session_token.clone());
        headers.check_status(response.status())?;

        // Some targets answer inline instead of on the stream
        if has_content_type(&response, "application/json") {
            let text = response.text().await?;
            if let Ok(message) = serde_json::from_str::<Value>(&text) {
                if response_id(&message) == Some(request_id) {
                    return Ok(BindingResponse {
                        shape: ResponseShape::SingleDocument(text),
                        session_token,
                    });
                }
            }
        }

        match answer.await {
            Ok(frame) => Ok(BindingResponse {
                shape: ResponseShape::EventFrames(vec![frame]),
                session_token,
            }),
            Err(_) => Err(TransportError::Stream {
                message: format!("event stream closed before request {} was answered", request_id),
            }),
        }
    }

    async fn notify(&self, body: &Value, headers: &CallHeaders) -> Result<(), TransportError> {
        let channel = self.channel(headers).await?;
        let response = self.post(&channel, body, headers).await?;
        headers.check_status(response.status())
    }

    async fn close(&self) {
        self.channel.lock().await.take();
    }
}
