use std::future::Future;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::Payload;

/// Per-tube job handler.
///
/// Invoked by the dispatcher with the decoded `data` object of each job
/// routed to its tube. Returning an outcome whose code is not
/// [`HandlerOutcome::SUCCESS`], returning an error, or panicking all count as
/// a failure and hand the job to the retry policy. Delivery is at-least-once:
/// handlers must tolerate seeing the same payload again.
#[async_trait]
pub trait TubeHandler: Send + Sync {
    async fn process(&self, payload: &Payload) -> anyhow::Result<HandlerOutcome>;
}

/// Result reported by a handler.
///
/// Deserializes from `code`, or from the legacy `recode` key when `code` is
/// absent; when both are present `code` wins.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOutcome")]
pub struct HandlerOutcome {
    pub code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize)]
struct RawOutcome {
    code: Option<i64>,
    recode: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

impl TryFrom<RawOutcome> for HandlerOutcome {
    type Error = String;

    fn try_from(raw: RawOutcome) -> Result<Self, Self::Error> {
        let code = raw
            .code
            .or(raw.recode)
            .ok_or_else(|| "missing field `code`".to_string())?;
        Ok(Self {
            code,
            message: raw.message,
        })
    }
}

impl HandlerOutcome {
    pub const SUCCESS: i64 = 1;

    pub fn success() -> Self {
        Self {
            code: Self::SUCCESS,
            message: None,
        }
    }

    pub fn failure(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Self::SUCCESS
    }

    /// Interpret a loosely shaped handler response. Anything that is not an
    /// object carrying an integer `code` is rejected.
    pub fn from_json(value: Value) -> anyhow::Result<Self> {
        if !value.is_object() {
            return Err(anyhow!("handler returned non-object response: {value}"));
        }
        serde_json::from_value(value).map_err(|err| anyhow!("non-conforming handler response: {err}"))
    }
}

impl std::fmt::Display for HandlerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "code {} ({message})", self.code),
            None => write!(f, "code {}", self.code),
        }
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`TubeHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TubeHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send,
{
    async fn process(&self, payload: &Payload) -> anyhow::Result<HandlerOutcome> {
        (self.0)(payload.clone()).await
    }
}

/// Handler backed by an async closure that answers with raw JSON, for
/// consumers ported from dynamically shaped code.
pub struct JsonFnHandler<F>(F);

pub fn json_handler_fn<F, Fut>(f: F) -> JsonFnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    JsonFnHandler(f)
}

#[async_trait]
impl<F, Fut> TubeHandler for JsonFnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn process(&self, payload: &Payload) -> anyhow::Result<HandlerOutcome> {
        let value = (self.0)(payload.clone()).await?;
        HandlerOutcome::from_json(value)
    }
}
