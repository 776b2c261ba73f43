pub mod action;
pub mod coordinator;
pub mod decide;
pub mod error;
pub mod execution;
pub mod proposals;
pub mod reaper;
pub mod replay;
pub mod retry;
pub mod runs;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    InitialRequest,
    InboundMessage,
    FollowupTrigger,
    Resume,
    Manual,
    Replay,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialRequest => "initial_request",
            Self::InboundMessage => "inbound_message",
            Self::FollowupTrigger => "followup_trigger",
            Self::Resume => "resume",
            Self::Manual => "manual",
            Self::Replay => "replay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial_request" => Some(Self::InitialRequest),
            "inbound_message" => Some(Self::InboundMessage),
            "followup_trigger" => Some(Self::FollowupTrigger),
            "resume" => Some(Self::Resume),
            "manual" => Some(Self::Manual),
            "replay" => Some(Self::Replay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Adjust,
    Dismiss,
    Withdraw,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Adjust => "adjust",
            Self::Dismiss => "dismiss",
            Self::Withdraw => "withdraw",
        }
    }
}
