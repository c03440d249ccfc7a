use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    error::{ClientError, ClientResult},
    event_stream::{EventStream, EventStreamConnector},
    transport::{ApiRequest, ApiResponse, HttpApi},
};

type Handler = Box<dyn Fn(&ApiRequest) -> ApiResponse + Send + Sync>;

/// Scripted [`HttpApi`] that records every request.
pub(crate) struct FakeApi {
    handler: Handler,
    requests: StdMutex<Vec<ApiRequest>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeApi {
    pub(crate) fn new(handler: impl Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            requests: StdMutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Each response waits for one permit on `gate`.
    pub(crate) fn gated(
        gate: Arc<Semaphore>,
        handler: impl Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static,
    ) -> Self {
        let mut api = Self::new(handler);
        api.gate = Some(gate);
        api
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().expect("requests").len()
    }

    pub(crate) fn requests_to(&self, path_prefix: &str) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .expect("requests")
            .iter()
            .filter(|request| request.path.starts_with(path_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpApi for FakeApi {
    async fn request(&self, request: ApiRequest) -> ClientResult<ApiResponse> {
        self.requests.lock().expect("requests").push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        Ok((self.handler)(&request))
    }
}

pub(crate) fn ok_json(body: Value) -> ApiResponse {
    ApiResponse::new(200, Some(body))
}

pub(crate) fn user_json(user_id: &str, username: &str) -> Value {
    json!({
        "userId": user_id,
        "username": username,
        "profile": { "firstName": "First", "lastName": "Last" }
    })
}

/// Extracts one query parameter from a recorded request path.
pub(crate) fn query_param(path: &str, name: &str) -> Option<String> {
    let (_, query) = path.split_once('?')?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// In-memory push transport; every `open` creates a new controllable stream.
#[derive(Default)]
pub(crate) struct FakeConnector {
    opened: StdMutex<Vec<String>>,
    streams: StdMutex<Vec<Option<mpsc::UnboundedSender<ClientResult<String>>>>>,
    refuse: AtomicBool,
}

impl FakeConnector {
    pub(crate) fn open_count(&self) -> usize {
        self.opened.lock().expect("opened").len()
    }

    pub(crate) fn opened_paths(&self) -> Vec<String> {
        self.opened.lock().expect("opened").clone()
    }

    pub(crate) fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn push(&self, index: usize, payload: impl Into<String>) {
        let streams = self.streams.lock().expect("streams");
        if let Some(Some(tx)) = streams.get(index) {
            let _ = tx.send(Ok(payload.into()));
        }
    }

    pub(crate) fn fail(&self, index: usize) {
        let mut streams = self.streams.lock().expect("streams");
        if let Some(slot) = streams.get_mut(index) {
            if let Some(tx) = slot.take() {
                let _ = tx.send(Err(ClientError::Transport("connection reset".into())));
            }
        }
    }

    pub(crate) fn is_closed(&self, index: usize) -> bool {
        let streams = self.streams.lock().expect("streams");
        match streams.get(index) {
            Some(Some(tx)) => tx.is_closed(),
            _ => true,
        }
    }
}

#[async_trait]
impl EventStreamConnector for FakeConnector {
    async fn open(&self, path: &str) -> ClientResult<EventStream> {
        self.opened.lock().expect("opened").push(path.to_string());
        if self.refuse.load(Ordering::SeqCst) {
            self.streams.lock().expect("streams").push(None);
            return Err(ClientError::Offline);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().expect("streams").push(Some(tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Polls `condition` until it holds, panicking after a generous bound.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}
