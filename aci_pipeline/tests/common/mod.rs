#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use aci_client::{ApiClient, QueryParam};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{
    Event,
    field::Field,
    span::{Attributes, Id, Record},
    subscriber::{DefaultGuard, Subscriber},
};

/// An [`ApiClient`] serving canned documents by class
#[derive(Debug, Default)]
pub(crate) struct FixtureClient {
    responses: HashMap<String, Value>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FixtureClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(mut self, class: &str, body: Value) -> Self {
        self.responses.insert(class.to_owned(), body);
        self
    }

    /// Serve `count` objects of `class`, with distinguished names `<class>/<i>`
    pub(crate) fn respond_objects(self, class: &str, count: usize) -> Self {
        let body = imdata(class, (0..count).map(|i| format!("{class}/{i}")));
        self.respond(class, body)
    }

    pub(crate) fn fail(mut self, class: &str) -> Self {
        self.failing.insert(class.to_owned());
        self
    }

    pub(crate) fn delay(mut self, class: &str, delay: Duration) -> Self {
        self.delays.insert(class.to_owned(), delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApiClient for FixtureClient {
    async fn get(&self, class: &str, _query: &[QueryParam]) -> aci_client::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(class).copied().unwrap_or_default();
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(class) {
            return Err(aci_client::Error::Other(format!("{class}: connection reset")));
        }
        Ok(self
            .responses
            .get(class)
            .cloned()
            .unwrap_or_else(|| json!({"imdata": []})))
    }
}

/// An APIC class query response holding one object per distinguished name
pub(crate) fn imdata(class: &str, dns: impl IntoIterator<Item = String>) -> Value {
    let objects: Vec<Value> = dns
        .into_iter()
        .map(|dn| json!({ class: {"attributes": {"dn": dn, "name": dn}} }))
        .collect();
    json!({ "totalCount": objects.len().to_string(), "imdata": objects })
}

/// Captures `tracing` events emitted on the current thread as `key = value; ` strings
#[derive(Debug)]
pub(crate) struct LogCapture {
    logs: Arc<Mutex<Vec<String>>>,
    _guard: DefaultGuard,
}

impl LogCapture {
    pub(crate) fn new() -> Self {
        let logs = Arc::new(Mutex::new(Vec::new()));
        let guard = tracing::subscriber::set_default(CaptureSubscriber {
            logs: Arc::clone(&logs),
        });
        Self {
            logs,
            _guard: guard,
        }
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.logs.lock().clone()
    }
}

struct CaptureSubscriber {
    logs: Arc<Mutex<Vec<String>>>,
}

impl Subscriber for CaptureSubscriber {
    fn enabled(&self, _metadata: &tracing::Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, _span: &Attributes<'_>) -> Id {
        Id::from_u64(1)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut line = Line(String::new());
        line.push("level", &event.metadata().level().to_string());
        event.record(&mut line);
        self.logs.lock().push(line.0);
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}

struct Line(String);

impl Line {
    fn push(&mut self, key: &str, value: &str) {
        self.0.push_str(&format!("{key} = {value}; "));
    }
}

impl tracing::field::Visit for Line {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field.name(), value)
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field.name(), &format!("{value:?}"))
    }
}
