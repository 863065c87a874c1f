//! Scripted transports for unit tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::transport::{HttpResponse, HttpTransport, StreamSession, StreamTransport, TransportError};

#[derive(Clone)]
struct Reply {
    delay: Option<Duration>,
    result: Result<HttpResponse, TransportError>,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// HTTP transport answering from a per-URL script; unknown URLs get a 404
#[derive(Default)]
pub struct MockHttp {
    replies: Mutex<HashMap<String, Reply>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.script(url, None, Ok(HttpResponse { status, body: body.to_string() }));
    }

    pub fn respond_after(&self, url: &str, delay: Duration, status: u16, body: &str) {
        self.script(url, Some(delay), Ok(HttpResponse { status, body: body.to_string() }));
    }

    pub fn fail(&self, url: &str, err: TransportError) {
        self.script(url, None, Err(err));
    }

    fn script(&self, url: &str, delay: Option<Duration>, result: Result<HttpResponse, TransportError>) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), Reply { delay, result });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| r.url == url).count()
    }
}

#[async_trait]
impl HttpTransport for MockHttp {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.to_string(),
            headers: headers.to_vec(),
        });
        let reply = self.replies.lock().unwrap().get(url).cloned();
        match reply {
            Some(reply) => {
                if let Some(delay) = reply.delay {
                    tokio::time::sleep(delay).await;
                }
                reply.result
            }
            None => Ok(HttpResponse { status: 404, body: "not found".into() }),
        }
    }
}

/// Streaming transport whose sessions stay open until the test drops them
#[derive(Default)]
pub struct MockStream {
    opens: Mutex<Vec<Instant>>,
    /// Opens that ran to completion
    completed: AtomicUsize,
    open_delay: Mutex<Option<Duration>>,
    refuse: AtomicBool,
    live: Mutex<Option<mpsc::UnboundedSender<String>>>,
    closed: Arc<AtomicUsize>,
}

impl MockStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent `open` fail
    pub fn refuse_opens(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Hold every subsequent `open` for `delay` before it resolves
    pub fn delay_opens(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    pub fn completed_opens(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Virtual-time instants of every open attempt, successful or not
    pub fn open_attempts(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }

    /// Simulate the peer closing the most recent session
    pub fn drop_latest(&self) {
        self.live.lock().unwrap().take();
    }

    pub fn push(&self, message: &str) -> bool {
        match self.live.lock().unwrap().as_ref() {
            Some(tx) => tx.send(message.to_string()).is_ok(),
            None => false,
        }
    }

    /// Sessions closed from our side via `StreamSession::close`
    pub fn local_closes(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockSession {
    rx: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl StreamTransport for MockStream {
    async fn open(&self, _url: &str) -> Result<Box<dyn StreamSession>, TransportError> {
        self.opens.lock().unwrap().push(Instant::now());
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Stream("connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.live.lock().unwrap() = Some(tx);
        Ok(Box::new(MockSession {
            rx,
            closed: self.closed.clone(),
        }))
    }
}

#[async_trait]
impl StreamSession for MockSession {
    async fn next_message(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Messages of every tracing event emitted while `f` runs on this thread
pub fn captured_messages(f: impl FnOnce()) -> Vec<String> {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::registry().with(Capture(messages.clone()));
    tracing::subscriber::with_default(subscriber, f);
    let captured = messages.lock().unwrap().clone();
    captured
}

struct Capture(Arc<Mutex<Vec<String>>>);

impl<S: Subscriber> Layer<S> for Capture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.0.lock().unwrap().push(visitor.0);
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
