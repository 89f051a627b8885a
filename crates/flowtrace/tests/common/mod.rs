#![allow(dead_code)]

use async_trait::async_trait;
use flowtrace::{CheckpointPayload, StoreError, TraceReceipt, TraceStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

pub const TRACE_ID: &str = "trace-1";

#[derive(Debug, Clone)]
pub enum Call {
    Create(CheckpointPayload),
    Update(String, CheckpointPayload),
}

impl Call {
    pub fn payload(&self) -> &CheckpointPayload {
        match self {
            Call::Create(payload) | Call::Update(_, payload) => payload,
        }
    }
}

/// In-memory trace store. Each call is recorded on entry, then waits for a
/// permit on `gate`, so tests can hold a write in flight.
pub struct RecordingStore {
    calls: Mutex<Vec<Call>>,
    gate: Semaphore,
    pub entered: Notify,
    fail: AtomicBool,
}

impl RecordingStore {
    pub fn open() -> Arc<Self> {
        Self::with_permits(10_000)
    }

    /// Every write blocks until `release` is called.
    pub fn gated() -> Arc<Self> {
        Self::with_permits(0)
    }

    fn with_permits(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            gate: Semaphore::new(permits),
            entered: Notify::new(),
            fail: AtomicBool::new(false),
        })
    }

    pub fn failing() -> Arc<Self> {
        let store = Self::open();
        store.fail.store(true, Ordering::SeqCst);
        store
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    async fn record(&self, call: Call) -> Result<TraceReceipt, StoreError> {
        self.calls.lock().push(call);
        self.entered.notify_one();

        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(TraceReceipt {
            trace_id: Some(TRACE_ID.into()),
            ..TraceReceipt::default()
        })
    }
}

#[async_trait]
impl TraceStore for RecordingStore {
    async fn create_trace(&self, payload: &CheckpointPayload) -> Result<TraceReceipt, StoreError> {
        self.record(Call::Create(payload.clone())).await
    }

    async fn update_trace(
        &self,
        trace_id: &str,
        payload: &CheckpointPayload,
    ) -> Result<TraceReceipt, StoreError> {
        self.record(Call::Update(trace_id.to_string(), payload.clone()))
            .await
    }
}

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// In-memory log sink for asserting on emitted warnings.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Capture warnings on the current thread until the guard drops.
/// Pair with a current-thread runtime so spawned tasks log here too.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}
