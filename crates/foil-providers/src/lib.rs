use async_trait::async_trait;
use serde_json::{json, Value};

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("unsupported capability: {0}")]
    Unsupported(String),
    #[error("provider error: {0}")]
    Runtime(String),
    #[error("rejected: {reason}")]
    Rejected { reason: String },
}

/// Abstraction over the external collaborators the engine calls for side
/// effects and drafting. Concrete providers (mail transport, portal sync,
/// the drafting model) are replaceable behind this seam; the engine only
/// sees opaque JSON in and out.
#[async_trait]
pub trait ProviderHost: Send + Sync {
    async fn invoke(&self, capability: &str, input: &Value) -> Result<Value, ProviderError>;
}

/// Host that refuses every capability. Used while bootstrapping and by
/// dry-run replay, which must never reach a real provider.
#[derive(Default, Clone)]
pub struct NoopHost;

#[async_trait]
impl ProviderHost for NoopHost {
    async fn invoke(&self, capability: &str, _input: &Value) -> Result<Value, ProviderError> {
        Err(ProviderError::Unsupported(capability.to_string()))
    }
}

/// In-process host with deterministic stand-ins for the real providers.
/// `draft.analyze` echoes a low-risk followup draft, `email.send` and
/// `portal.sync` acknowledge with a delivery id. Good enough for local
/// runs and for exercising the full engine pipeline in tests.
#[derive(Default, Clone)]
pub struct LocalStubHost;

#[async_trait]
impl ProviderHost for LocalStubHost {
    async fn invoke(&self, capability: &str, input: &Value) -> Result<Value, ProviderError> {
        match capability {
            "draft.analyze" => {
                let action = input
                    .get("suggested_action")
                    .and_then(|v| v.as_str())
                    .unwrap_or("send_followup");
                Ok(json!({
                    "action_type": action,
                    "subject": format!("Re: records request {}", input.get("case_id").and_then(|v| v.as_str()).unwrap_or("")),
                    "body": "Following up on the status of this request.",
                    "reasoning": ["no agency reply within the follow-up window"],
                    "confidence": 0.9,
                    "risk_flags": [],
                    "warnings": [],
                }))
            }
            "email.send" | "portal.sync" => Ok(json!({
                "delivered": true,
                "provider_message_id": uuid::Uuid::new_v4().to_string(),
            })),
            other => Err(ProviderError::Unsupported(other.to_string())),
        }
    }
}
