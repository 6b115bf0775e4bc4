//! ScriptedBackend - 決定的に振る舞う OcrBackend（テスト・デモ用）
//!
//! submit の成否と、受理した各ドキュメントのステータス列を事前に台本として
//! 積んでおきます。台本が無ければ、内容を UTF-8 として読んだテキストで
//! 即座に Completed を返します。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{Fingerprint, OcrError, OcrRequest, OcrResult, OcrStatus, TrackingId};
use crate::ports::OcrBackend;

/// One scripted `get_status` response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Queued { position: u32 },
    Processing { percent: u8 },
    /// Completed with the given result.
    Complete(OcrResult),
    /// Completed with the document bytes echoed back as text.
    CompleteEcho,
    /// Backend-side failure status.
    Fail(String),
    /// The status call itself errors.
    Error(OcrError),
}

struct Tracked {
    steps: VecDeque<ScriptStep>,
    last: Option<OcrStatus>,
    echo: OcrResult,
}

#[derive(Default)]
struct ScriptState {
    submit_outcomes: VecDeque<Result<(), OcrError>>,
    status_scripts: VecDeque<Vec<ScriptStep>>,
    tracked: HashMap<TrackingId, Tracked>,
    submitted: Vec<Fingerprint>,
    next_tracking: u64,
}

#[derive(Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptState>,
    latency: Option<Duration>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue the outcome of the next `submit` call.
    pub async fn push_submit_outcome(&self, outcome: Result<(), OcrError>) {
        self.state.lock().await.submit_outcomes.push_back(outcome);
    }

    /// Make the next `n` submits fail with clones of `error`.
    pub async fn fail_next_submits(&self, error: OcrError, n: usize) {
        let mut state = self.state.lock().await;
        for _ in 0..n {
            state.submit_outcomes.push_back(Err(error.clone()));
        }
    }

    /// Status sequence for the next accepted submission. The last step
    /// repeats once the script runs out.
    pub async fn push_status_script(&self, steps: Vec<ScriptStep>) {
        self.state.lock().await.status_scripts.push_back(steps);
    }

    /// Number of `submit` calls, including failed ones.
    pub fn submit_count(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_count(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Fingerprints of accepted submissions, in order.
    pub async fn accepted(&self) -> Vec<Fingerprint> {
        self.state.lock().await.submitted.clone()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn echo_result(request: &OcrRequest) -> OcrResult {
    let pages = request
        .metadata
        .get("pages")
        .and_then(serde_json::Value::as_u64)
        .and_then(|p| u32::try_from(p).ok())
        .unwrap_or(1);
    OcrResult::new(String::from_utf8_lossy(&request.content), 0.95, pages)
}

#[async_trait]
impl OcrBackend for ScriptedBackend {
    async fn submit(&self, request: &OcrRequest) -> Result<TrackingId, OcrError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if let Some(Err(e)) = state.submit_outcomes.pop_front() {
            return Err(e);
        }

        state.next_tracking += 1;
        let tracking_id = TrackingId::new(format!("trk-{}", state.next_tracking));
        let steps = state
            .status_scripts
            .pop_front()
            .unwrap_or_else(|| vec![ScriptStep::CompleteEcho]);
        state.tracked.insert(
            tracking_id.clone(),
            Tracked {
                steps: steps.into(),
                last: None,
                echo: echo_result(request),
            },
        );
        state.submitted.push(request.fingerprint.clone());
        Ok(tracking_id)
    }

    async fn get_status(&self, tracking_id: &TrackingId) -> Result<OcrStatus, OcrError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        let Some(tracked) = state.tracked.get_mut(tracking_id) else {
            return Err(OcrError::InvalidResponse(format!(
                "unknown tracking id {tracking_id}"
            )));
        };

        let Some(step) = tracked.steps.pop_front() else {
            return tracked.last.clone().ok_or_else(|| {
                OcrError::InvalidResponse(format!("no status scripted for {tracking_id}"))
            });
        };

        let tid = tracking_id.clone();
        let status = match step {
            ScriptStep::Queued { position } => OcrStatus::queued(tid, position),
            ScriptStep::Processing { percent } => OcrStatus::processing(tid, percent),
            ScriptStep::Complete(result) => OcrStatus::completed(tid, result),
            ScriptStep::CompleteEcho => OcrStatus::completed(tid, tracked.echo.clone()),
            ScriptStep::Fail(message) => OcrStatus::failed(tid, message),
            ScriptStep::Error(e) => return Err(e),
        };
        tracked.last = Some(status.clone());
        Ok(status)
    }
}
