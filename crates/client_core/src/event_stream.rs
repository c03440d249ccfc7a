use std::collections::VecDeque;

use async_trait::async_trait;
use futures::{stream, stream::BoxStream, Stream, StreamExt};
use reqwest::{header, Client};
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Raw event payloads; an `Err` item or the end of the stream means the
/// connection dropped.
pub type EventStream = BoxStream<'static, ClientResult<String>>;

/// Opens a server-push connection. A successful return is the `open`
/// notification.
#[async_trait]
pub trait EventStreamConnector: Send + Sync {
    async fn open(&self, path: &str) -> ClientResult<EventStream>;
}

/// `text/event-stream` connector sharing the API client's cookie session.
#[derive(Clone)]
pub struct SseConnector {
    http: Client,
    base_url: String,
}

impl SseConnector {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl EventStreamConnector for SseConnector {
    async fn open(&self, path: &str) -> ClientResult<EventStream> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::from_status(
                status.as_u16(),
                "event stream request rejected",
            ));
        }
        debug!(%url, "events: stream opened");
        Ok(decode_event_stream(response.bytes_stream()))
    }
}

/// Incremental parser for server-sent-event framing.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feeds a chunk and returns every event payload completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }
            let mut line = std::mem::take(&mut self.line);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(payload) = self.process_line(&String::from_utf8_lossy(&line)) {
                payloads.push(payload);
            }
        }
        payloads
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let payload = self.data.join("\n");
            self.data.clear();
            return Some(payload);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}

pub fn decode_event_stream<S, B>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let initial = (Box::pin(bytes), SseDecoder::default(), VecDeque::new());
    stream::unfold(Some(initial), |state| async move {
        let (mut bytes, mut decoder, mut ready) = state?;
        loop {
            if let Some(payload) = ready.pop_front() {
                return Some((Ok(payload), Some((bytes, decoder, ready))));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => ready.extend(decoder.feed(chunk.as_ref())),
                Some(Err(err)) => return Some((Err(ClientError::from(err)), None)),
                None => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
#[path = "tests/event_stream_tests.rs"]
mod tests;
