use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tubeq::*;

/// One scripted handler response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scripted {
    Succeed,
    /// Return a non-success outcome with this code.
    Fail(i64),
    /// Return an error.
    Error(String),
    Panic(String),
}

/// Handler that records every payload it sees and answers from a script,
/// falling back to a fixed response once the script runs out.
#[derive(Clone)]
pub struct MockHandler {
    calls: Arc<Mutex<Vec<Payload>>>,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    fallback: Arc<Mutex<Scripted>>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::with_fallback(Scripted::Succeed)
    }

    pub fn with_fallback(fallback: Scripted) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(fallback)),
        }
    }

    /// Always reports failure code 0.
    pub fn failing() -> Self {
        Self::with_fallback(Scripted::Fail(0))
    }

    pub fn panicking(message: impl Into<String>) -> Self {
        Self::with_fallback(Scripted::Panic(message.into()))
    }

    pub fn with_script(self, script: impl IntoIterator<Item = Scripted>) -> Self {
        self.script.lock().extend(script);
        self
    }

    pub fn set_fallback(&self, fallback: Scripted) {
        *self.fallback.lock() = fallback;
    }

    pub fn calls(&self) -> Vec<Payload> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(actual, expected, "Expected {expected} handler calls, got {actual}");
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Default for MockHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TubeHandler for MockHandler {
    async fn process(&self, payload: &Payload) -> anyhow::Result<HandlerOutcome> {
        self.calls.lock().push(payload.clone());
        let next = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone());
        match next {
            Scripted::Succeed => Ok(HandlerOutcome::success()),
            Scripted::Fail(code) => Ok(HandlerOutcome::failure(code, "scripted failure")),
            Scripted::Error(message) => Err(anyhow::anyhow!(message)),
            Scripted::Panic(message) => panic!("{message}"),
        }
    }
}
