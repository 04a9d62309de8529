//! Deposit conversation orchestrator
//!
//! Drives one session through the stages in `transition`:
//! EXTRACT → (CHAT ↔ TOOLS)* | CONFIRM → suspend → RESOLVE RATE → FINALIZE
//!
//! Every public entry point loads the session, runs steps until a halting
//! stage, and persists the result once. A failed step returns the error and
//! leaves the stored session exactly as it was.

use crate::config::{AppConfig, WorkflowSettings};
use crate::error::AssistantError;
use crate::llm::{Capabilities, Reply};
use crate::models::{ConfirmationRequest, ConversationMessage, RequestKind, ResumePayload};
use crate::rates::{load_rate_table, RateTable};
use crate::state::{build_session_store, ConversationState, RateQuote, Session, SessionStore};
use crate::tools::{create_default_registry, ToolRegistry};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod transition;
pub use transition::{transition, AbandonReason, Event, Stage, TransitionError};

pub const ASSISTANT_SYSTEM_PROMPT: &str = "You are an assistant responsible for providing rates for \
depositing company funds into our bank. Your task is to obtain from the client the deposit amount and \
the duration for which they wish to deposit the funds. Any amount up to 100,000,000 and any duration \
from 1 to 365 days is allowed. Your goal is solely to collect the necessary data. Avoid providing \
advice or specific rates to the client - rates will only be available once the deposit amount and \
duration are confirmed.";

const CONFIRMATION_QUESTION: &str =
    "Please verify the correctness of the deposit amount and duration.";

const EXTRACTION_STEP: &str = "extract_amount_and_duration";
const CONFIRMATION_STEP: &str = "confirm_amount_and_duration";
const RATES_STEP: &str = "get_rates";
const LIFECYCLE_STEP: &str = "session";

const RETRY_BACKOFF_MS: u64 = 200;

/// What one invocation produced
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub session_id: Uuid,
    pub stage: Stage,
    /// Messages appended during this invocation
    pub messages: Vec<ConversationMessage>,
    pub confirmation: Option<ConfirmationRequest>,
    pub rates: Option<RateQuote>,
}

impl TurnOutcome {
    fn from_session(session: &Session, first_new: usize) -> Self {
        let messages = session.state.messages();
        Self {
            session_id: session.session_id,
            stage: session.stage.clone(),
            messages: messages[first_new.min(messages.len())..].to_vec(),
            confirmation: session.stage.pending_confirmation().cloned(),
            rates: session.state.rates().copied(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub idle: usize,
    pub purged: usize,
    /// Sessions skipped because loading or saving them failed
    pub failed: usize,
}

enum SweepAction {
    Kept,
    Expired,
    Idle,
    Purged,
}

/// Main orchestrator that coordinates the deposit workflow
pub struct Orchestrator {
    capabilities: Capabilities,
    tools: ToolRegistry,
    rate_table: Arc<RateTable>,
    store: Arc<dyn SessionStore>,
    settings: WorkflowSettings,
    session_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        capabilities: Capabilities,
        tools: ToolRegistry,
        rate_table: Arc<RateTable>,
        store: Arc<dyn SessionStore>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            capabilities,
            tools,
            rate_table,
            store,
            settings,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wire capabilities, tools, rates and storage from configuration
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let capabilities = Capabilities::from_config(config)?;
        let rate_table = load_rate_table(config).await;
        let store = build_session_store(config);

        info!(
            provider = ?config.provider,
            bands = rate_table.bands().len(),
            "Orchestrator initialized"
        );

        Ok(Self::new(
            capabilities,
            create_default_registry(config.available_cash),
            Arc::new(rate_table),
            store,
            config.workflow.clone(),
        ))
    }

    /// Feed one client message into a session, creating it if needed
    pub async fn handle_message(&self, session_id: Uuid, text: &str) -> Result<TurnOutcome> {
        self.with_session_lock(session_id, || self.run_message(session_id, text))
            .await
    }

    /// Resume a session suspended at the confirmation checkpoint
    pub async fn resume(&self, session_id: Uuid, payload: ResumePayload) -> Result<TurnOutcome> {
        self.with_session_lock(session_id, || self.run_resume(session_id, &payload))
            .await
    }

    /// Abandon a session that has not finished yet
    pub async fn cancel(&self, session_id: Uuid) -> Result<TurnOutcome> {
        self.with_session_lock(session_id, || self.run_cancel(session_id))
            .await
    }

    pub async fn session(&self, session_id: Uuid) -> Result<Session> {
        self.store
            .get(session_id)
            .await?
            .ok_or(AssistantError::SessionNotFound(session_id))
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Abandon expired confirmations and idle sessions, then delete closed
    /// sessions past retention. A session that fails is logged and skipped.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for session_id in self.store.list_ids().await? {
            let guard = self.lock_session(session_id).await;

            match self.sweep_session(session_id, now).await {
                Ok(SweepAction::Kept) => {}
                Ok(SweepAction::Expired) => report.expired += 1,
                Ok(SweepAction::Idle) => report.idle += 1,
                Ok(SweepAction::Purged) => {
                    report.purged += 1;
                    self.release_lock(session_id, guard).await;
                }
                Err(error) => {
                    warn!(%session_id, "Skipping session during sweep: {}", error);
                    report.failed += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                idle = report.idle,
                purged = report.purged,
                failed = report.failed,
                "Session sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<SweepAction> {
        let Some(mut session) = self.store.get(session_id).await? else {
            return Ok(SweepAction::Kept);
        };
        let idle_for = now - session.updated_at;

        match &session.stage {
            Stage::AwaitingConfirmation { expires_at, .. } if now >= *expires_at => {
                self.expire(&mut session).await?;
                Ok(SweepAction::Expired)
            }
            Stage::AwaitingInput if idle_for >= to_chrono(self.settings.idle_timeout) => {
                apply(&mut session, Event::IdleTimeout)?;
                session.state.push_message(ConversationMessage::step(
                    LIFECYCLE_STEP,
                    "The conversation was closed after a period of inactivity.",
                ));
                self.persist(&mut session).await?;
                info!(%session_id, "Idle session abandoned");
                Ok(SweepAction::Idle)
            }
            stage
                if stage.is_terminal()
                    && idle_for >= to_chrono(self.settings.session_retention) =>
            {
                self.store.delete(session_id).await?;
                Ok(SweepAction::Purged)
            }
            _ => Ok(SweepAction::Kept),
        }
    }

    async fn run_message(&self, session_id: Uuid, text: &str) -> Result<TurnOutcome> {
        let mut session = match self.store.get(session_id).await? {
            Some(session) => session,
            None => {
                info!(%session_id, "Starting new deposit session");
                let mut session = Session::new(session_id);
                session
                    .state
                    .push_message(ConversationMessage::system(ASSISTANT_SYSTEM_PROMPT));
                session
            }
        };

        if session.stage.is_terminal() {
            return Err(AssistantError::SessionClosed(session_id));
        }
        if let Stage::AwaitingConfirmation { expires_at, .. } = &session.stage {
            if Utc::now() >= *expires_at {
                self.expire(&mut session).await?;
                return Err(AssistantError::ConfirmationExpired(session_id));
            }
            return Err(AssistantError::AwaitingConfirmation(session_id));
        }

        let first_new = session.state.messages().len();
        session.state.push_message(ConversationMessage::user(text));
        apply(&mut session, Event::UserMessage)?;

        self.drive(&mut session).await?;
        self.persist(&mut session).await?;

        Ok(TurnOutcome::from_session(&session, first_new))
    }

    async fn run_resume(&self, session_id: Uuid, payload: &ResumePayload) -> Result<TurnOutcome> {
        let mut session = self
            .store
            .get(session_id)
            .await?
            .ok_or(AssistantError::SessionNotFound(session_id))?;

        let (request, expires_at) = match &session.stage {
            Stage::AwaitingConfirmation {
                request,
                expires_at,
                ..
            } => (request.clone(), *expires_at),
            stage if stage.is_terminal() => return Err(AssistantError::SessionClosed(session_id)),
            _ => return Err(AssistantError::NotAwaitingConfirmation(session_id)),
        };

        if Utc::now() >= expires_at {
            self.expire(&mut session).await?;
            return Err(AssistantError::ConfirmationExpired(session_id));
        }

        if let Some(received) = payload.request_id {
            if received != request.request_id {
                return Err(AssistantError::RequestMismatch {
                    expected: request.request_id,
                    received,
                });
            }
        }

        let (amount, duration, note) = resolve_confirmation(&request, payload)?;
        info!(
            %session_id,
            amount,
            duration,
            confirmed = payload.is_confirmation(),
            "Resuming after confirmation"
        );

        let first_new = session.state.messages().len();
        session.state.confirm(amount, duration)?;
        session
            .state
            .push_message(ConversationMessage::step(CONFIRMATION_STEP, note));
        apply(&mut session, Event::Resumed)?;

        self.drive(&mut session).await?;
        self.persist(&mut session).await?;

        Ok(TurnOutcome::from_session(&session, first_new))
    }

    async fn run_cancel(&self, session_id: Uuid) -> Result<TurnOutcome> {
        let mut session = self
            .store
            .get(session_id)
            .await?
            .ok_or(AssistantError::SessionNotFound(session_id))?;

        if session.stage.is_terminal() {
            return Err(AssistantError::SessionClosed(session_id));
        }

        let first_new = session.state.messages().len();
        apply(&mut session, Event::Cancelled)?;
        session.state.push_message(ConversationMessage::step(
            LIFECYCLE_STEP,
            "The deposit request was cancelled.",
        ));
        self.persist(&mut session).await?;

        info!(%session_id, "Session cancelled");
        Ok(TurnOutcome::from_session(&session, first_new))
    }

    /// Run `op` holding the session lock. When the call fails and nothing is
    /// stored under the id, the lock entry is released again.
    async fn with_session_lock<T, F, Fut>(&self, session_id: Uuid, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.lock_session(session_id).await;
        let result = op().await;

        if result.is_err() && matches!(self.store.get(session_id).await, Ok(None)) {
            self.release_lock(session_id, guard).await;
        }
        result
    }

    async fn lock_session(&self, session_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.session_locks.lock().await;
            locks.entry(session_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the map entry unless another caller already holds or awaits it
    async fn release_lock(&self, session_id: Uuid, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.session_locks.lock().await;
        if locks
            .get(&session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&session_id);
        }
    }

    async fn persist(&self, session: &mut Session) -> Result<()> {
        session.touch();
        self.store.put(session).await
    }

    async fn expire(&self, session: &mut Session) -> Result<()> {
        apply(session, Event::Expired)?;
        session.state.push_message(ConversationMessage::step(
            LIFECYCLE_STEP,
            "The confirmation request expired before it was answered.",
        ));
        warn!(session_id = %session.session_id, "Confirmation request expired");
        self.persist(session).await
    }

    /// Run steps until the session reaches a halting stage
    async fn drive(&self, session: &mut Session) -> Result<()> {
        let mut tool_rounds = 0;

        while !session.stage.is_halt() {
            let event = self.step(session, &mut tool_rounds).await?;
            apply(session, event)?;
        }

        debug!(
            session_id = %session.session_id,
            stage = session.stage.name(),
            "Session halted"
        );
        Ok(())
    }

    async fn step(&self, session: &mut Session, tool_rounds: &mut u32) -> Result<Event> {
        let state = &mut session.state;

        match session.stage.clone() {
            Stage::Extracting => {
                let conditions = self
                    .call_external("extract", || {
                        self.capabilities.extractor.extract(state.messages())
                    })
                    .await?;

                let has_both = state.apply_extraction(&conditions);
                state.push_message(ConversationMessage::step(
                    EXTRACTION_STEP,
                    extraction_prompt(state),
                ));
                Ok(Event::ExtractionFinished { has_both })
            }

            Stage::Chatting => {
                if *tool_rounds >= self.settings.max_tool_rounds {
                    return Err(AssistantError::ToolLoopExceeded(*tool_rounds));
                }

                let specs = self.tools.specs();
                let reply = self
                    .call_external("respond", || {
                        self.capabilities.responder.respond(state.messages(), &specs)
                    })
                    .await?;

                match reply {
                    Reply::Message(text) => {
                        state.push_message(ConversationMessage::agent(text));
                        Ok(Event::ReplyProduced)
                    }
                    Reply::ToolCalls(calls) => {
                        *tool_rounds += 1;
                        state.push_message(ConversationMessage::tool_request("", calls.clone()));
                        Ok(Event::ToolCallsRequested(calls))
                    }
                }
            }

            Stage::ToolInvocation { calls } => {
                // Tool failures go back to the model as the tool's result.
                for call in &calls {
                    let content = match self.tools.invoke(call).await {
                        Ok(content) => content,
                        Err(error) => {
                            warn!(tool_name = %call.name, "Tool call failed: {}", error);
                            format!("Error: {}", error)
                        }
                    };
                    debug!(tool_name = %call.name, "Tool result appended");
                    state.push_message(ConversationMessage::tool_result(call, content));
                }
                Ok(Event::ToolResultsAppended)
            }

            Stage::Confirming => {
                let (amount, duration) = known_conditions(state)?;
                let suspended_at = Utc::now();
                let expires_at = deadline(suspended_at, self.settings.confirmation_timeout);

                let request = ConfirmationRequest {
                    request_id: Uuid::new_v4(),
                    kind: RequestKind::ConfirmAmountAndDuration,
                    question: CONFIRMATION_QUESTION.to_string(),
                    proposed_amount: amount,
                    proposed_duration: duration,
                };

                info!(
                    session_id = %session.session_id,
                    request_id = %request.request_id,
                    amount,
                    duration,
                    "Suspending for confirmation"
                );

                Ok(Event::Suspended {
                    request,
                    suspended_at,
                    expires_at,
                })
            }

            Stage::ResolvingRate => {
                let (amount, duration) = known_conditions(state)?;

                match self.rate_table.resolve(amount, duration) {
                    Ok(range) => {
                        let quote = state.apply_rates(range)?;
                        state.push_message(ConversationMessage::step(
                            RATES_STEP,
                            format!(
                                "For the given deposit conditions, current rates are {}-{}% per annum. \
                                 The recommended rate is {}%.",
                                quote.min_rate, quote.max_rate, quote.agreed_rate
                            ),
                        ));
                        Ok(Event::RateResolved)
                    }
                    Err(error @ AssistantError::RateNotFound { .. }) => {
                        warn!(session_id = %session.session_id, amount, duration, "No rate band matches");
                        state.push_message(ConversationMessage::step(
                            RATES_STEP,
                            error.user_message(),
                        ));
                        Ok(Event::NoRateFound)
                    }
                    Err(error) => Err(error),
                }
            }

            Stage::Finalizing => {
                let (amount, duration) = known_conditions(state)?;
                let rate = state.agreed_rate().ok_or_else(|| {
                    AssistantError::StateError("finalizing without an agreed rate".to_string())
                })?;

                let summary = self
                    .call_external("summarize", || {
                        self.capabilities.summarizer.summarize(amount, duration, rate)
                    })
                    .await?;
                state.push_message(ConversationMessage::agent(summary));
                Ok(Event::SummaryProduced)
            }

            other => Err(AssistantError::StateError(format!(
                "stage {} has no step to run",
                other.name()
            ))),
        }
    }

    /// Call an external capability with a timeout and bounded retries
    async fn call_external<T, F, Fut>(&self, label: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.settings.llm_max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.settings.llm_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(AssistantError::LlmTimeout(self.settings.llm_timeout)),
            };

            match result {
                Err(error) if error.is_recoverable() && attempt < max_attempts => {
                    warn!(label, attempt, "External call failed, retrying: {}", error);
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64))
                        .await;
                }
                other => return other,
            }
        }
    }
}

fn apply(session: &mut Session, event: Event) -> Result<()> {
    let next = transition(&session.stage, &event)?;
    debug!(
        session_id = %session.session_id,
        from = session.stage.name(),
        to = next.name(),
        event = event.name(),
        "Stage transition"
    );
    session.stage = next;
    Ok(())
}

fn known_conditions(state: &ConversationState) -> Result<(u64, u32)> {
    match (state.deposit_amount(), state.deposit_duration()) {
        (Some(amount), Some(duration)) => Ok((amount, duration)),
        _ => Err(AssistantError::StateError(
            "deposit amount and duration are not both known".to_string(),
        )),
    }
}

fn extraction_prompt(state: &ConversationState) -> String {
    match (state.deposit_amount(), state.deposit_duration()) {
        (Some(amount), Some(duration)) => format!(
            "Understood, deposit amount of {} euros for {} days. \
             Please confirm the correctness of the data or adjust it.",
            amount, duration
        ),
        (Some(amount), None) => format!(
            "Please specify the duration for the deposit amount of {} euros.",
            amount
        ),
        (None, Some(duration)) => format!(
            "Please specify the amount you would like to deposit for {} days.",
            duration
        ),
        (None, None) => "Please specify the amount and duration for the deposit.".to_string(),
    }
}

/// Confirmed values and the note recorded in the conversation
fn resolve_confirmation(
    request: &ConfirmationRequest,
    payload: &ResumePayload,
) -> Result<(u64, u32, String)> {
    if payload.is_confirmation() {
        return Ok((
            request.proposed_amount,
            request.proposed_duration,
            "The client confirmed the correctness of the data.".to_string(),
        ));
    }

    let amount = match payload.deposit_amount {
        None => request.proposed_amount,
        Some(value) => u64::try_from(value)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                AssistantError::InvalidResume(format!("deposit amount {} must be positive", value))
            })?,
    };
    let duration = match payload.deposit_duration {
        None => request.proposed_duration,
        Some(value) => u32::try_from(value)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                AssistantError::InvalidResume(format!("deposit duration {} must be positive", value))
            })?,
    };

    Ok((
        amount,
        duration,
        format!(
            "The client adjusted the data: deposit amount {} euros, duration {} days.",
            amount, duration
        ),
    ))
}

/// Saturates instead of overflowing
fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `from + after`, or the far future when that is not representable
fn deadline(from: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    from.checked_add_signed(to_chrono(after))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Extractor, MockLanguageModel, Responder, Summarizer};
    use crate::models::{DepositConditions, MessageRole, ToolCall, ToolSpec};
    use crate::state::InMemorySessionStore;
    use crate::tools::AvailableCashTool;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct ScriptedModel {
        extractions: std::sync::Mutex<VecDeque<DepositConditions>>,
        replies: std::sync::Mutex<VecDeque<Reply>>,
        extract_failures: AtomicU32,
        always_call_tools: AtomicBool,
        fail_summary: AtomicBool,
        respond_calls: AtomicU32,
        summary_calls: AtomicU32,
    }

    impl ScriptedModel {
        fn with_extractions(extractions: Vec<DepositConditions>) -> Arc<Self> {
            let model = Self::default();
            *model.extractions.lock().unwrap() = extractions.into();
            Arc::new(model)
        }
    }

    #[async_trait]
    impl Extractor for ScriptedModel {
        async fn extract(&self, _conversation: &[ConversationMessage]) -> Result<DepositConditions> {
            let pending = self.extract_failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.extract_failures.store(pending - 1, Ordering::SeqCst);
                return Err(AssistantError::LlmError("model overloaded".to_string()));
            }
            Ok(self.extractions.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    #[async_trait]
    impl Responder for ScriptedModel {
        async fn respond(&self, _conversation: &[ConversationMessage], _tools: &[ToolSpec]) -> Result<Reply> {
            self.respond_calls.fetch_add(1, Ordering::SeqCst);
            if self.always_call_tools.load(Ordering::SeqCst) {
                return Ok(Reply::ToolCalls(vec![ToolCall::new(
                    AvailableCashTool::NAME,
                    serde_json::json!({}),
                )]));
            }
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Reply::Message("How much and for how long?".to_string())))
        }
    }

    #[async_trait]
    impl Summarizer for ScriptedModel {
        async fn summarize(&self, amount: u64, duration: u32, rate: Decimal) -> Result<String> {
            self.summary_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_summary.load(Ordering::SeqCst) {
                return Err(AssistantError::LlmError("summary unavailable".to_string()));
            }
            Ok(format!("Deposit of {} euros for {} days at {}%.", amount, duration, rate))
        }
    }

    fn conditions(amount: u64, duration: u32) -> DepositConditions {
        DepositConditions {
            deposit_amount: Some(amount),
            deposit_duration: Some(duration),
        }
    }

    fn rate(tenths: i64) -> Decimal {
        Decimal::new(tenths, 1)
    }

    fn test_settings() -> WorkflowSettings {
        WorkflowSettings {
            llm_max_attempts: 1,
            ..WorkflowSettings::default()
        }
    }

    fn build<M>(model: Arc<M>, settings: WorkflowSettings) -> (Orchestrator, Arc<InMemorySessionStore>)
    where
        M: Extractor + Responder + Summarizer + 'static,
    {
        let store = Arc::new(InMemorySessionStore::new());
        let orchestrator = Orchestrator::new(
            Capabilities::from_model(model),
            create_default_registry(1_000_000),
            Arc::new(RateTable::seeded()),
            store.clone(),
            settings,
        );
        (orchestrator, store)
    }

    fn step_names(session: &Session) -> Vec<&str> {
        session
            .state
            .messages()
            .iter()
            .filter_map(|m| m.name.as_deref())
            .collect()
    }

    #[tokio::test]
    async fn test_scripted_conversation_with_mock_model() {
        let (orchestrator, _) = build(Arc::new(MockLanguageModel::new()), test_settings());
        let session_id = Uuid::new_v4();

        let first = orchestrator
            .handle_message(session_id, "Please clarify the current balances on our accounts.")
            .await
            .unwrap();
        assert_eq!(first.stage, Stage::AwaitingInput);
        assert!(first
            .messages
            .iter()
            .any(|m| m.role == MessageRole::Tool && m.content == "1000000"));

        let second = orchestrator
            .handle_message(
                session_id,
                "Yes, let's deposit the entire amount currently available in our accounts.",
            )
            .await
            .unwrap();
        assert_eq!(second.stage, Stage::AwaitingInput);

        let third = orchestrator
            .handle_message(session_id, "Let's do it for 10 days.")
            .await
            .unwrap();
        let request = third.confirmation.expect("confirmation request");
        assert_eq!(request.proposed_amount, 1_000_000);
        assert_eq!(request.proposed_duration, 10);
        assert_eq!(request.kind, RequestKind::ConfirmAmountAndDuration);

        let done = orchestrator
            .resume(
                session_id,
                ResumePayload {
                    deposit_amount: Some(505_000),
                    ..ResumePayload::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(done.stage, Stage::Completed);
        let rates = done.rates.unwrap();
        assert_eq!(rates.min_rate, rate(164));
        assert_eq!(rates.max_rate, rate(168));
        assert_eq!(rates.agreed_rate, rate(164));

        let session = orchestrator.session(session_id).await.unwrap();
        assert_eq!(session.state.deposit_amount(), Some(505_000));
        assert_eq!(session.state.deposit_duration(), Some(10));
        assert_eq!(session.state.messages()[0].role, MessageRole::System);
        assert!(done.messages.last().unwrap().content.contains("505000"));
    }

    #[tokio::test]
    async fn test_both_values_always_lead_to_confirmation() {
        let model = ScriptedModel::with_extractions(vec![conditions(350_000, 30)]);
        let (orchestrator, _) = build(model.clone(), test_settings());

        let outcome = orchestrator
            .handle_message(Uuid::new_v4(), "350000 for a month please")
            .await
            .unwrap();

        assert!(matches!(outcome.stage, Stage::AwaitingConfirmation { .. }));
        assert_eq!(model.respond_calls.load(Ordering::SeqCst), 0);
        assert!(outcome.rates.is_none());
        assert!(outcome
            .messages
            .last()
            .unwrap()
            .content
            .starts_with("Understood, deposit amount of 350000 euros for 30 days."));
    }

    #[tokio::test]
    async fn test_confirmed_values_are_kept() {
        let model = ScriptedModel::with_extractions(vec![conditions(350_000, 30)]);
        let (orchestrator, _) = build(model, test_settings());
        let session_id = Uuid::new_v4();

        orchestrator.handle_message(session_id, "350000, 30 days").await.unwrap();
        let outcome = orchestrator
            .resume(session_id, ResumePayload::confirmed())
            .await
            .unwrap();

        assert_eq!(outcome.stage, Stage::Completed);
        let rates = outcome.rates.unwrap();
        assert_eq!((rates.min_rate, rates.max_rate), (rate(152), rate(154)));
        assert_eq!(rates.agreed_rate, rates.min_rate);

        let session = orchestrator.session(session_id).await.unwrap();
        assert_eq!(session.state.deposit_amount(), Some(350_000));
        assert_eq!(session.state.deposit_duration(), Some(30));
        assert_eq!(
            step_names(&session),
            vec![EXTRACTION_STEP, CONFIRMATION_STEP, RATES_STEP]
        );
        assert!(outcome.messages[0]
            .content
            .contains("confirmed the correctness"));
    }

    #[tokio::test]
    async fn test_override_changes_only_amount() {
        let model = ScriptedModel::with_extractions(vec![conditions(1_000_000, 10)]);
        let (orchestrator, _) = build(model, test_settings());
        let session_id = Uuid::new_v4();

        orchestrator.handle_message(session_id, "all of it for 10 days").await.unwrap();
        let payload: ResumePayload = serde_json::from_str(r#"{"deposit_amount": 505000}"#).unwrap();
        orchestrator.resume(session_id, payload).await.unwrap();

        let session = orchestrator.session(session_id).await.unwrap();
        assert_eq!(session.state.deposit_amount(), Some(505_000));
        assert_eq!(session.state.deposit_duration(), Some(10));
        assert_eq!(session.state.agreed_rate(), Some(rate(164)));
    }

    #[tokio::test]
    async fn test_no_rate_available_is_terminal() {
        let model = ScriptedModel::with_extractions(vec![conditions(200_000_000, 10)]);
        let (orchestrator, _) = build(model.clone(), test_settings());
        let session_id = Uuid::new_v4();

        orchestrator.handle_message(session_id, "200 million for 10 days").await.unwrap();
        let outcome = orchestrator
            .resume(session_id, ResumePayload::confirmed())
            .await
            .unwrap();

        assert_eq!(outcome.stage, Stage::NoRateAvailable);
        assert!(outcome.rates.is_none());
        assert!(outcome
            .messages
            .last()
            .unwrap()
            .content
            .contains("no deposit rate is available"));
        assert_eq!(model.summary_calls.load(Ordering::SeqCst), 0);

        let err = orchestrator.handle_message(session_id, "hello?").await.unwrap_err();
        assert!(matches!(err, AssistantError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn test_capability_failure_leaves_session_untouched() {
        let model = ScriptedModel::with_extractions(vec![]);
        let (orchestrator, store) = build(model.clone(), test_settings());
        let session_id = Uuid::new_v4();

        orchestrator.handle_message(session_id, "hi").await.unwrap();
        let before = store.get(session_id).await.unwrap().unwrap();

        model.extract_failures.store(1, Ordering::SeqCst);
        let err = orchestrator.handle_message(session_id, "100000").await.unwrap_err();
        assert!(err.is_recoverable());

        let after = store.get(session_id).await.unwrap().unwrap();
        assert_eq!(after, before);

        // A brand-new session that fails is never stored.
        model.extract_failures.store(1, Ordering::SeqCst);
        let fresh = Uuid::new_v4();
        assert_err!(orchestrator.handle_message(fresh, "hi").await);
        assert!(store.get(fresh).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let model = ScriptedModel::with_extractions(vec![conditions(50_000, 20)]);
        model.extract_failures.store(1, Ordering::SeqCst);
        let settings = WorkflowSettings {
            llm_max_attempts: 2,
            ..WorkflowSettings::default()
        };
        let (orchestrator, _) = build(model, settings);

        let outcome = assert_ok!(orchestrator.handle_message(Uuid::new_v4(), "50000 for 20 days").await);
        assert!(outcome.confirmation.is_some());
    }

    #[tokio::test]
    async fn test_summary_failure_keeps_suspension() {
        let model = ScriptedModel::with_extractions(vec![conditions(350_000, 30)]);
        let (orchestrator, store) = build(model.clone(), test_settings());
        let session_id = Uuid::new_v4();

        orchestrator.handle_message(session_id, "350000 for 30 days").await.unwrap();
        let suspended = store.get(session_id).await.unwrap().unwrap();

        model.fail_summary.store(true, Ordering::SeqCst);
        let err = orchestrator
            .resume(session_id, ResumePayload::confirmed())
            .await
            .unwrap_err();
        assert!(err.is_recoverable());

        let stored = store.get(session_id).await.unwrap().unwrap();
        assert_eq!(stored, suspended);
        assert!(stored.state.rates().is_none());

        model.fail_summary.store(false, Ordering::SeqCst);
        let outcome = orchestrator
            .resume(session_id, ResumePayload::confirmed())
            .await
            .unwrap();
        assert_eq!(outcome.stage, Stage::Completed);
    }

    #[tokio::test]
    async fn test_resume_reconstructs_suspended_state() {
        let model = ScriptedModel::with_extractions(vec![conditions(350_000, 30)]);
        let (orchestrator, store) = build(model, test_settings());
        let session_id = Uuid::new_v4();

        orchestrator.handle_message(session_id, "350000 for 30 days").await.unwrap();
        let suspended = store.get(session_id).await.unwrap().unwrap();

        orchestrator
            .resume(session_id, ResumePayload::confirmed())
            .await
            .unwrap();
        let resumed = store.get(session_id).await.unwrap().unwrap();

        let before = suspended.state.messages();
        assert_eq!(&resumed.state.messages()[..before.len()], before);
        assert_eq!(resumed.created_at, suspended.created_at);
        assert_eq!(resumed.state.deposit_amount(), suspended.state.deposit_amount());
        assert_eq!(resumed.state.deposit_duration(), suspended.state.deposit_duration());
    }

    #[tokio::test]
    async fn test_invalid_resume_keeps_suspension() {
        let model = ScriptedModel::with_extractions(vec![conditions(350_000, 30)]);
        let (orchestrator, store) = build(model, test_settings());
        let session_id = Uuid::new_v4();

        let outcome = orchestrator.handle_message(session_id, "350000 for 30 days").await.unwrap();
        let request = outcome.confirmation.unwrap();

        let err = orchestrator
            .resume(
                session_id,
                ResumePayload {
                    deposit_amount: Some(0),
                    ..ResumePayload::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::InvalidResume(_)));

        let err = orchestrator
            .resume(
                session_id,
                ResumePayload {
                    request_id: Some(Uuid::new_v4()),
                    correct: Some(true),
                    ..ResumePayload::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::RequestMismatch { .. }));

        let stored = store.get(session_id).await.unwrap().unwrap();
        assert_eq!(stored.stage.pending_confirmation(), Some(&request));

        let err = orchestrator.handle_message(session_id, "and?").await.unwrap_err();
        assert!(matches!(err, AssistantError::AwaitingConfirmation(_)));
    }

    #[tokio::test]
    async fn test_expired_confirmation_is_abandoned() {
        let model = ScriptedModel::with_extractions(vec![conditions(350_000, 30)]);
        let settings = WorkflowSettings {
            confirmation_timeout: Duration::ZERO,
            ..test_settings()
        };
        let (orchestrator, _) = build(model, settings);
        let session_id = Uuid::new_v4();

        orchestrator.handle_message(session_id, "350000 for 30 days").await.unwrap();
        let err = orchestrator
            .resume(session_id, ResumePayload::confirmed())
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::ConfirmationExpired(_)));

        let session = orchestrator.session(session_id).await.unwrap();
        assert_eq!(
            session.stage,
            Stage::Abandoned {
                reason: AbandonReason::Expired
            }
        );
        assert!(session.state.rates().is_none());
    }

    #[tokio::test]
    async fn test_cancel_suspended_session() {
        let model = ScriptedModel::with_extractions(vec![conditions(350_000, 30)]);
        let (orchestrator, _) = build(model, test_settings());
        let session_id = Uuid::new_v4();

        orchestrator.handle_message(session_id, "350000 for 30 days").await.unwrap();
        let outcome = orchestrator.cancel(session_id).await.unwrap();
        assert_eq!(
            outcome.stage,
            Stage::Abandoned {
                reason: AbandonReason::Cancelled
            }
        );
        assert!(outcome.confirmation.is_none());

        assert!(matches!(
            orchestrator.cancel(session_id).await.unwrap_err(),
            AssistantError::SessionClosed(_)
        ));
        assert!(matches!(
            orchestrator
                .resume(session_id, ResumePayload::confirmed())
                .await
                .unwrap_err(),
            AssistantError::SessionClosed(_)
        ));
        assert!(matches!(
            orchestrator.cancel(Uuid::new_v4()).await.unwrap_err(),
            AssistantError::SessionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_tool_rounds_are_bounded() {
        let model = ScriptedModel::with_extractions(vec![]);
        model.always_call_tools.store(true, Ordering::SeqCst);
        let (orchestrator, _) = build(model.clone(), test_settings());

        let err = orchestrator
            .handle_message(Uuid::new_v4(), "what is my balance?")
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::ToolLoopExceeded(5)));
        assert_eq!(model.respond_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_sweep_expires_then_purges() {
        let model = ScriptedModel::with_extractions(vec![conditions(350_000, 30)]);
        let settings = WorkflowSettings {
            confirmation_timeout: Duration::from_secs(60),
            session_retention: Duration::from_secs(3_600),
            idle_timeout: Duration::from_secs(86_400),
            ..test_settings()
        };
        let (orchestrator, store) = build(model, settings);
        let suspended_id = Uuid::new_v4();
        let chatting_id = Uuid::new_v4();

        orchestrator.handle_message(suspended_id, "350000 for 30 days").await.unwrap();
        orchestrator.handle_message(chatting_id, "hello").await.unwrap();

        let report = orchestrator.sweep_at(Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let report = orchestrator.sweep_at(later).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                expired: 1,
                ..SweepReport::default()
            }
        );

        let much_later = Utc::now() + chrono::Duration::seconds(7_200);
        let report = orchestrator.sweep_at(much_later).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                purged: 1,
                ..SweepReport::default()
            }
        );

        assert!(store.get(suspended_id).await.unwrap().is_none());
        assert!(store.get(chatting_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_idle_sessions_are_abandoned_then_purged() {
        let model = ScriptedModel::with_extractions(vec![]);
        let settings = WorkflowSettings {
            idle_timeout: Duration::from_secs(600),
            session_retention: Duration::from_secs(3_600),
            ..test_settings()
        };
        let (orchestrator, store) = build(model.clone(), settings);

        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            orchestrator.handle_message(*id, "hello").await.unwrap();
        }

        // A first turn that fails stores nothing and keeps no lock.
        model.extract_failures.store(1, Ordering::SeqCst);
        assert_err!(orchestrator.handle_message(Uuid::new_v4(), "hello").await);
        assert_err!(orchestrator.resume(Uuid::new_v4(), ResumePayload::confirmed()).await);
        assert_eq!(orchestrator.session_locks.lock().await.len(), 3);

        let report = orchestrator
            .sweep_at(Utc::now() + chrono::Duration::seconds(700))
            .await
            .unwrap();
        assert_eq!(
            report,
            SweepReport {
                idle: 3,
                ..SweepReport::default()
            }
        );
        let session = orchestrator.session(ids[0]).await.unwrap();
        assert_eq!(
            session.stage,
            Stage::Abandoned {
                reason: AbandonReason::Idle
            }
        );
        assert!(matches!(
            orchestrator.handle_message(ids[0], "still there?").await.unwrap_err(),
            AssistantError::SessionClosed(_)
        ));

        let report = orchestrator
            .sweep_at(Utc::now() + chrono::Duration::seconds(5_000))
            .await
            .unwrap();
        assert_eq!(report.purged, 3);
        assert!(store.list_ids().await.unwrap().is_empty());
        assert!(orchestrator.session_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_huge_timeouts_saturate() {
        let model = ScriptedModel::with_extractions(vec![conditions(350_000, 30)]);
        let settings = WorkflowSettings {
            confirmation_timeout: Duration::from_secs(9_000_000_000_000_000),
            session_retention: Duration::from_secs(u64::MAX),
            idle_timeout: Duration::from_secs(u64::MAX),
            ..test_settings()
        };
        let (orchestrator, _) = build(model, settings);
        let session_id = Uuid::new_v4();

        let outcome = orchestrator
            .handle_message(session_id, "350000 for 30 days")
            .await
            .unwrap();
        match outcome.stage {
            Stage::AwaitingConfirmation { expires_at, .. } => {
                assert_eq!(expires_at, DateTime::<Utc>::MAX_UTC)
            }
            other => panic!("expected a suspension, got {:?}", other),
        }

        orchestrator.cancel(session_id).await.unwrap();
        for now in [Utc::now(), Utc::now() + chrono::Duration::days(365)] {
            let report = orchestrator.sweep_at(now).await.unwrap();
            assert_eq!(report, SweepReport::default());
        }
        assert!(orchestrator.session(session_id).await.is_ok());
        assert_eq!(to_chrono(Duration::from_secs(u64::MAX)), chrono::Duration::MAX);
    }

    /// In-memory store that fails to load one chosen session
    struct FlakyStore {
        inner: InMemorySessionStore,
        broken: std::sync::Mutex<Option<Uuid>>,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn get(&self, session_id: Uuid) -> Result<Option<Session>> {
            let broken = *self.broken.lock().unwrap();
            if broken == Some(session_id) {
                return Err(AssistantError::DatabaseError("corrupt payload".to_string()));
            }
            self.inner.get(session_id).await
        }

        async fn put(&self, session: &Session) -> Result<()> {
            self.inner.put(session).await
        }

        async fn delete(&self, session_id: Uuid) -> Result<()> {
            self.inner.delete(session_id).await
        }

        async fn list_ids(&self) -> Result<Vec<Uuid>> {
            self.inner.list_ids().await
        }
    }

    #[tokio::test]
    async fn test_sweep_skips_failing_sessions() {
        let store = Arc::new(FlakyStore {
            inner: InMemorySessionStore::new(),
            broken: std::sync::Mutex::new(None),
        });
        let orchestrator = Orchestrator::new(
            Capabilities::from_model(ScriptedModel::with_extractions(vec![])),
            create_default_registry(1_000_000),
            Arc::new(RateTable::seeded()),
            store.clone(),
            WorkflowSettings {
                session_retention: Duration::ZERO,
                ..test_settings()
            },
        );
        let healthy = Uuid::new_v4();
        let corrupt = Uuid::new_v4();
        for id in [healthy, corrupt] {
            orchestrator.handle_message(id, "hello").await.unwrap();
            orchestrator.cancel(id).await.unwrap();
        }

        *store.broken.lock().unwrap() = Some(corrupt);
        let report = orchestrator
            .sweep_at(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(report.purged, 1);
        assert_eq!(report.failed, 1);
        assert!(store.inner.get(healthy).await.unwrap().is_none());
        assert!(store.inner.get(corrupt).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_tool_result_goes_back_to_model() {
        let model = ScriptedModel::with_extractions(vec![]);
        *model.replies.lock().unwrap() = vec![
            Reply::ToolCalls(vec![ToolCall::new("wire_transfer", serde_json::json!({}))]),
            Reply::Message("I can only look up your available cash.".to_string()),
        ]
        .into();
        let (orchestrator, _) = build(model.clone(), test_settings());

        let outcome = orchestrator
            .handle_message(Uuid::new_v4(), "send the money now")
            .await
            .unwrap();

        assert_eq!(outcome.stage, Stage::AwaitingInput);
        let tool_message = outcome
            .messages
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .expect("tool result");
        assert!(tool_message.content.starts_with("Error:"));
        assert!(tool_message.content.contains("wire_transfer"));
        assert_eq!(model.respond_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_isolated() {
        let (orchestrator, _) = build(Arc::new(MockLanguageModel::new()), test_settings());
        let orchestrator = Arc::new(orchestrator);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let a = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.handle_message(first, "Deposit 40000 for 15 days").await })
        };
        let b = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.handle_message(second, "Deposit 900000 for 200 days").await })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        assert_eq!(a.confirmation.unwrap().proposed_amount, 40_000);
        assert_eq!(b.confirmation.unwrap().proposed_amount, 900_000);

        let session_a = orchestrator.session(first).await.unwrap();
        let session_b = orchestrator.session(second).await.unwrap();
        assert_eq!(session_a.state.deposit_duration(), Some(15));
        assert_eq!(session_b.state.deposit_duration(), Some(200));
        assert!(session_a
            .state
            .messages()
            .iter()
            .all(|m| !m.content.contains("900000")));
    }

    #[test]
    fn test_extraction_prompts() {
        let mut state = ConversationState::new();
        assert_eq!(
            extraction_prompt(&state),
            "Please specify the amount and duration for the deposit."
        );
        state.apply_extraction(&DepositConditions {
            deposit_amount: None,
            deposit_duration: Some(10),
        });
        assert_eq!(
            extraction_prompt(&state),
            "Please specify the amount you would like to deposit for 10 days."
        );
    }
}
