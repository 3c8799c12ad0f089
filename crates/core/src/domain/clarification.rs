use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::run::RunId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClarificationId(pub String);

impl ClarificationId {
    pub fn generate() -> Self {
        Self(format!("clr_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClarificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationKind {
    OauthAuthorization,
    Confirmation,
    InputRequired,
}

impl ClarificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OauthAuthorization => "oauth_authorization",
            Self::Confirmation => "confirmation",
            Self::InputRequired => "input_required",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "oauth_authorization" => Some(Self::OauthAuthorization),
            "confirmation" => Some(Self::Confirmation),
            "input_required" => Some(Self::InputRequired),
            _ => None,
        }
    }
}

/// Kind-specific data shown to the human.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClarificationPayload {
    OauthAuthorization { auth_url: String },
    Confirmation { action: Option<String> },
    InputRequired { schema: Value },
}

impl ClarificationPayload {
    pub fn kind(&self) -> ClarificationKind {
        match self {
            Self::OauthAuthorization { .. } => ClarificationKind::OauthAuthorization,
            Self::Confirmation { .. } => ClarificationKind::Confirmation,
            Self::InputRequired { .. } => ClarificationKind::InputRequired,
        }
    }
}

/// What a provider hands back when it cannot continue without a human decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub prompt: String,
    pub payload: ClarificationPayload,
    /// Opaque to everything except the provider that produced it.
    pub continuation: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub id: ClarificationId,
    pub run_id: RunId,
    pub prompt: String,
    pub payload: ClarificationPayload,
    pub continuation: String,
    pub created_at: DateTime<Utc>,
}

impl Clarification {
    pub fn raise(run_id: RunId, request: ClarificationRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ClarificationId::generate(),
            run_id,
            prompt: request.prompt,
            payload: request.payload,
            continuation: request.continuation,
            created_at,
        }
    }

    pub fn kind(&self) -> ClarificationKind {
        self.payload.kind()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ClarificationOutcome {
    Authorized,
    Denied,
    Confirmed,
    Cancelled,
    Value(Value),
}

impl ClarificationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authorized => "authorized",
            Self::Denied => "denied",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Value(_) => "value",
        }
    }

    /// `denied` and `cancelled` end the run without fallback.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Denied | Self::Cancelled)
    }

    pub fn accepts(&self, kind: ClarificationKind) -> bool {
        match self {
            Self::Denied | Self::Cancelled => true,
            Self::Authorized => kind == ClarificationKind::OauthAuthorization,
            Self::Confirmed => kind == ClarificationKind::Confirmation,
            Self::Value(_) => kind == ClarificationKind::InputRequired,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClarificationResponse {
    pub clarification_id: ClarificationId,
    pub outcome: ClarificationOutcome,
}
