//! In-memory fakes for every collaborator trait (testing only)
//!
//! `ScriptedGenerator` replays queued responses and can answer specific
//! system prompts from fixed routes; the rest are small stubs with call
//! counters so tests can assert how often a collaborator was hit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{GenerationError, PreferenceError, Preferences, RetrievalError};
use crate::generation::{GenerationRequest, GenerationResponse, GenerationService};
use crate::preferences::{Interaction, PreferenceStore};
use crate::quality::{AgentResult, DraftContext, QualityAgent, RefinementRequest, Refiner};
use crate::retrieval::{RetrievalQuery, RetrievalService, RetrievedEvidence};

// ---------------------------------------------------------------------------
// ScriptedGenerator
// ---------------------------------------------------------------------------

type Scripted = Result<GenerationResponse, GenerationError>;

/// Generation fake.
///
/// A request whose system prompt contains a route's needle gets that route's
/// fixed reply (routes are checked in insertion order and never consumed).
/// Every other request pops the next queued reply; an empty queue yields a
/// transport error.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    queue: Mutex<VecDeque<Scripted>>,
    routes: Vec<(String, Scripted)>,
    delay: Option<Duration>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.then_response(GenerationResponse::stop(text))
    }

    pub fn then_response(self, response: GenerationResponse) -> Self {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(Ok(response));
        self
    }

    pub fn then_error(self, error: GenerationError) -> Self {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(Err(error));
        self
    }

    /// Answer every request whose system prompt contains `needle` with `text`.
    pub fn route(mut self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.routes
            .push((needle.into(), Ok(GenerationResponse::stop(text))));
        self
    }

    pub fn route_error(mut self, needle: impl Into<String>, error: GenerationError) -> Self {
        self.routes.push((needle.into(), Err(error)));
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Calls whose system prompt contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.system_prompt.contains(needle))
            .count()
    }

    /// Calls answered from the queue rather than a route.
    pub fn queued_calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| !self.is_routed(r))
            .count()
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn is_routed(&self, request: &GenerationRequest) -> bool {
        self.routes
            .iter()
            .any(|(needle, _)| request.system_prompt.contains(needle.as_str()))
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        let routed = self
            .routes
            .iter()
            .find(|(needle, _)| request.system_prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone());
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match routed {
            Some(reply) => reply,
            None => self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| Err(GenerationError::Transport("script exhausted".into()))),
        }
    }
}

// ---------------------------------------------------------------------------
// FailingGenerator
// ---------------------------------------------------------------------------

/// Every call fails with a transport error.
#[derive(Debug, Default)]
pub struct FailingGenerator {
    calls: AtomicUsize,
}

impl FailingGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationService for FailingGenerator {
    async fn generate(
        &self,
        _request: GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(GenerationError::Transport("connection refused".into()))
    }
}

// ---------------------------------------------------------------------------
// FailingRetrieval
// ---------------------------------------------------------------------------

/// Retrieval that errors, optionally after a delay.
#[derive(Debug, Default)]
pub struct FailingRetrieval {
    delay: Option<Duration>,
}

impl FailingRetrieval {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never answers within any sane timeout.
    pub fn hanging() -> Self {
        Self {
            delay: Some(Duration::from_secs(3600)),
        }
    }
}

#[async_trait]
impl RetrievalService for FailingRetrieval {
    async fn retrieve(&self, _query: &RetrievalQuery) -> Result<RetrievedEvidence, RetrievalError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Err(RetrievalError::Unavailable("knowledge store offline".into()))
    }
}

// ---------------------------------------------------------------------------
// MemoryPreferenceStore
// ---------------------------------------------------------------------------

/// Preferences per session plus a log of recorded interactions.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    preferences: Mutex<HashMap<String, Preferences>>,
    interactions: Mutex<Vec<Interaction>>,
    failing: bool,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn with(self, session_id: impl Into<String>, preferences: Preferences) -> Self {
        self.preferences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.into(), preferences);
        self
    }

    pub fn interactions(&self) -> Vec<Interaction> {
        self.interactions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn load(&self, session_id: &str) -> Result<Preferences, PreferenceError> {
        if self.failing {
            return Err(PreferenceError::Unavailable("store offline".into()));
        }
        Ok(self
            .preferences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_interaction(&self, interaction: Interaction) -> Result<(), PreferenceError> {
        if self.failing {
            return Err(PreferenceError::Unavailable("store offline".into()));
        }
        self.interactions.lock().unwrap_or_else(PoisonError::into_inner).push(interaction);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StubAgent / StubRefiner
// ---------------------------------------------------------------------------

/// Quality agent with a canned verdict.
#[derive(Debug)]
pub struct StubAgent<P> {
    verdict: Result<AgentResult<P>, GenerationError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl<P: Default> StubAgent<P> {
    pub fn passing(score: f64) -> Self {
        Self::with_verdict(Ok(AgentResult {
            success: true,
            score,
            confidence: 0.9,
            feedback: Vec::new(),
            payload: P::default(),
        }))
    }

    pub fn failing(score: f64, feedback: &[&str]) -> Self {
        Self::with_verdict(Ok(AgentResult {
            success: false,
            score,
            confidence: 0.9,
            feedback: feedback.iter().map(|f| f.to_string()).collect(),
            payload: P::default(),
        }))
    }

    pub fn erroring() -> Self {
        Self::with_verdict(Err(GenerationError::Transport("agent offline".into())))
    }

    pub fn with_verdict(verdict: Result<AgentResult<P>, GenerationError>) -> Self {
        Self {
            verdict,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P> QualityAgent for StubAgent<P>
where
    P: Default + Clone + Send + Sync,
{
    type Payload = P;

    fn name(&self) -> &'static str {
        "stub"
    }

    async fn evaluate(&self, _draft: &DraftContext<'_>) -> Result<AgentResult<P>, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.verdict.clone()
    }
}

/// Refiner with a canned rewrite; records the issues it was handed.
#[derive(Debug)]
pub struct StubRefiner {
    reply: Result<String, GenerationError>,
    seen_issues: Mutex<Vec<Vec<String>>>,
}

impl StubRefiner {
    pub fn returning(text: impl Into<String>) -> Self {
        Self {
            reply: Ok(text.into()),
            seen_issues: Mutex::new(Vec::new()),
        }
    }

    pub fn erroring() -> Self {
        Self {
            reply: Err(GenerationError::Transport("refiner offline".into())),
            seen_issues: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen_issues.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn seen_issues(&self) -> Vec<Vec<String>> {
        self.seen_issues.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Refiner for StubRefiner {
    async fn refine(&self, request: &RefinementRequest<'_>) -> Result<String, GenerationError> {
        self.seen_issues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.issues.to_vec());
        self.reply.clone()
    }
}
