//! Stages, events and the pure transition function of the deposit flow
//!
//! ```text
//! Start ─► Extracting ─┬─► Confirming ─► AwaitingConfirmation ─► ResolvingRate ─┬─► Finalizing ─► Completed
//!    ▲                 │                         (suspend)                      └─► NoRateAvailable
//!    │                 └─► Chatting ◄─► ToolInvocation
//!    │                        │
//!    └── AwaitingInput ◄──────┘
//! ```
//!
//! Any non-terminal stage may be cancelled, a suspension may expire and a
//! session waiting for input may go idle. All end in `Abandoned`.

use crate::models::{ConfirmationRequest, ToolCall};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    Cancelled,
    Expired,
    /// No client message within the idle timeout
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    Start,
    Extracting,
    Chatting,
    ToolInvocation {
        calls: Vec<ToolCall>,
    },
    /// Waiting for the next client message
    AwaitingInput,
    Confirming,
    /// Suspended until a human resumes or the request expires
    AwaitingConfirmation {
        request: ConfirmationRequest,
        suspended_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    ResolvingRate,
    Finalizing,
    Completed,
    NoRateAvailable,
    Abandoned {
        reason: AbandonReason,
    },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::Extracting => "extracting",
            Stage::Chatting => "chatting",
            Stage::ToolInvocation { .. } => "tool_invocation",
            Stage::AwaitingInput => "awaiting_input",
            Stage::Confirming => "confirming",
            Stage::AwaitingConfirmation { .. } => "awaiting_confirmation",
            Stage::ResolvingRate => "resolving_rate",
            Stage::Finalizing => "finalizing",
            Stage::Completed => "completed",
            Stage::NoRateAvailable => "no_rate_available",
            Stage::Abandoned { .. } => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Stage::Completed | Stage::NoRateAvailable | Stage::Abandoned { .. }
        )
    }

    /// Stages where an invocation stops and control returns to the caller
    pub fn is_halt(&self) -> bool {
        self.is_terminal()
            || matches!(
                self,
                Stage::Start | Stage::AwaitingInput | Stage::AwaitingConfirmation { .. }
            )
    }

    pub fn pending_confirmation(&self) -> Option<&ConfirmationRequest> {
        match self {
            Stage::AwaitingConfirmation { request, .. } => Some(request),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    UserMessage,
    ExtractionFinished { has_both: bool },
    ReplyProduced,
    ToolCallsRequested(Vec<ToolCall>),
    ToolResultsAppended,
    Suspended {
        request: ConfirmationRequest,
        suspended_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    Resumed,
    RateResolved,
    NoRateFound,
    SummaryProduced,
    Cancelled,
    Expired,
    IdleTimeout,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::UserMessage => "user_message",
            Event::ExtractionFinished { .. } => "extraction_finished",
            Event::ReplyProduced => "reply_produced",
            Event::ToolCallsRequested(_) => "tool_calls_requested",
            Event::ToolResultsAppended => "tool_results_appended",
            Event::Suspended { .. } => "suspended",
            Event::Resumed => "resumed",
            Event::RateResolved => "rate_resolved",
            Event::NoRateFound => "no_rate_found",
            Event::SummaryProduced => "summary_produced",
            Event::Cancelled => "cancelled",
            Event::Expired => "expired",
            Event::IdleTimeout => "idle_timeout",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid transition from {state} using event {event}")]
pub struct TransitionError {
    pub state: &'static str,
    pub event: &'static str,
}

pub fn transition(current: &Stage, event: &Event) -> Result<Stage, TransitionError> {
    use Event::{
        Cancelled, ExtractionFinished, NoRateFound, RateResolved, ReplyProduced, Resumed,
        SummaryProduced, Suspended, ToolCallsRequested, ToolResultsAppended, UserMessage,
    };

    let next = match (current, event) {
        (Stage::Start | Stage::AwaitingInput, UserMessage) => Stage::Extracting,

        (Stage::Extracting, ExtractionFinished { has_both: true }) => Stage::Confirming,
        (Stage::Extracting, ExtractionFinished { has_both: false }) => Stage::Chatting,

        (Stage::Chatting, ToolCallsRequested(calls)) => Stage::ToolInvocation {
            calls: calls.clone(),
        },
        (Stage::Chatting, ReplyProduced) => Stage::AwaitingInput,
        (Stage::ToolInvocation { .. }, ToolResultsAppended) => Stage::Chatting,

        (
            Stage::Confirming,
            Suspended {
                request,
                suspended_at,
                expires_at,
            },
        ) => Stage::AwaitingConfirmation {
            request: request.clone(),
            suspended_at: *suspended_at,
            expires_at: *expires_at,
        },
        (Stage::AwaitingConfirmation { .. }, Resumed) => Stage::ResolvingRate,
        (Stage::AwaitingConfirmation { .. }, Event::Expired) => Stage::Abandoned {
            reason: AbandonReason::Expired,
        },

        (Stage::AwaitingInput, Event::IdleTimeout) => Stage::Abandoned {
            reason: AbandonReason::Idle,
        },

        (Stage::ResolvingRate, RateResolved) => Stage::Finalizing,
        (Stage::ResolvingRate, NoRateFound) => Stage::NoRateAvailable,

        (Stage::Finalizing, SummaryProduced) => Stage::Completed,

        (stage, Cancelled) if !stage.is_terminal() => Stage::Abandoned {
            reason: AbandonReason::Cancelled,
        },

        (stage, event) => {
            return Err(TransitionError {
                state: stage.name(),
                event: event.name(),
            })
        }
    };

    Ok(next)
}
