//! Session state and persistence layer
//!
//! `ConversationState` is the record threaded through the workflow.
//! `SessionStore` keeps one `Session` per id; in-memory by default,
//! Postgres when a database url is configured.

use crate::config::AppConfig;
use crate::error::AssistantError;
use crate::models::{ConversationMessage, DepositConditions};
use crate::rates::RateRange;
use crate::workflow::Stage;
use crate::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub mod postgres;
pub use postgres::PostgresSessionStore;

/// Resolved rates. Present as a whole or not at all, so the agreed rate
/// can never exist without its interval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateQuote {
    pub min_rate: Decimal,
    pub max_rate: Decimal,
    pub agreed_rate: Decimal,
}

impl From<RateRange> for RateQuote {
    fn from(range: RateRange) -> Self {
        Self {
            min_rate: range.min_rate,
            max_rate: range.max_rate,
            // No negotiation: the recommended rate is the bottom of the range.
            agreed_rate: range.min_rate,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    messages: Vec<ConversationMessage>,
    deposit_amount: Option<u64>,
    deposit_duration: Option<u32>,
    #[serde(default)]
    confirmed: bool,
    #[serde(default)]
    rates: Option<RateQuote>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn push_message(&mut self, message: ConversationMessage) {
        self.messages.push(message);
    }

    pub fn deposit_amount(&self) -> Option<u64> {
        self.deposit_amount
    }

    pub fn deposit_duration(&self) -> Option<u32> {
        self.deposit_duration
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn rates(&self) -> Option<&RateQuote> {
        self.rates.as_ref()
    }

    pub fn min_rate(&self) -> Option<Decimal> {
        self.rates.map(|r| r.min_rate)
    }

    pub fn max_rate(&self) -> Option<Decimal> {
        self.rates.map(|r| r.max_rate)
    }

    pub fn agreed_rate(&self) -> Option<Decimal> {
        self.rates.map(|r| r.agreed_rate)
    }

    pub fn has_both(&self) -> bool {
        self.deposit_amount.is_some() && self.deposit_duration.is_some()
    }

    /// Merge an extraction result. Values that were not recovered keep
    /// whatever an earlier turn extracted.
    pub fn apply_extraction(&mut self, conditions: &DepositConditions) -> bool {
        if let Some(amount) = conditions.deposit_amount {
            self.deposit_amount = Some(amount);
        }
        if let Some(duration) = conditions.deposit_duration {
            self.deposit_duration = Some(duration);
        }
        self.has_both()
    }

    pub fn confirm(&mut self, amount: u64, duration: u32) -> Result<()> {
        if amount == 0 || duration == 0 {
            return Err(AssistantError::InvalidResume(
                "deposit amount and duration must be positive".to_string(),
            ));
        }
        self.deposit_amount = Some(amount);
        self.deposit_duration = Some(duration);
        self.confirmed = true;
        Ok(())
    }

    pub fn apply_rates(&mut self, range: RateRange) -> Result<RateQuote> {
        if !self.confirmed {
            return Err(AssistantError::StateError(
                "rates can only be set after amount and duration are confirmed".to_string(),
            ));
        }
        let quote = RateQuote::from(range);
        self.rates = Some(quote);
        Ok(quote)
    }
}

/// Everything persisted for one conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: Uuid,
    pub stage: Stage,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            stage: Stage::Start,
            state: ConversationState::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Trait for session persistence
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: Uuid) -> Result<Option<Session>>;
    async fn put(&self, session: &Session) -> Result<()>;
    async fn delete(&self, session_id: Uuid) -> Result<()>;
    async fn list_ids(&self) -> Result<Vec<Uuid>>;
}

/// In-memory session store for development and tests
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: Uuid) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&session_id).cloned())
    }

    async fn put(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn delete(&self, session_id: Uuid) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&session_id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.keys().copied().collect())
    }
}

/// Pick the storage backend from configuration
pub fn build_session_store(config: &AppConfig) -> Arc<dyn SessionStore> {
    if let Some(url) = config.database_url.as_deref() {
        match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
        {
            Ok(pool) => {
                info!("Session store backend: postgres");
                return Arc::new(PostgresSessionStore::new(pool));
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres session store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Session store backend: in-memory");
    Arc::new(InMemorySessionStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(tenths: i64) -> Decimal {
        Decimal::new(tenths, 1)
    }

    #[test]
    fn test_extraction_keeps_earlier_values() {
        let mut state = ConversationState::new();

        let has_both = state.apply_extraction(&DepositConditions {
            deposit_amount: Some(1_000_000),
            deposit_duration: None,
        });
        assert!(!has_both);

        let has_both = state.apply_extraction(&DepositConditions {
            deposit_amount: None,
            deposit_duration: Some(10),
        });
        assert!(has_both);
        assert_eq!(state.deposit_amount(), Some(1_000_000));
        assert_eq!(state.deposit_duration(), Some(10));
    }

    #[test]
    fn test_rates_require_confirmation() {
        let mut state = ConversationState::new();
        let range = RateRange {
            min_rate: rate(152),
            max_rate: rate(154),
        };

        assert!(state.apply_rates(range).is_err());
        assert!(state.agreed_rate().is_none());

        state.confirm(350_000, 30).unwrap();
        let quote = state.apply_rates(range).unwrap();
        assert_eq!(quote.agreed_rate, rate(152));
        assert_eq!(state.min_rate(), Some(rate(152)));
        assert_eq!(state.max_rate(), Some(rate(154)));
        assert_eq!(state.agreed_rate(), state.min_rate());
    }

    #[test]
    fn test_confirm_rejects_zero() {
        let mut state = ConversationState::new();
        assert!(state.confirm(0, 30).is_err());
        assert!(!state.is_confirmed());
        assert!(state.deposit_amount().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store_isolates_sessions() {
        let store = InMemorySessionStore::new();
        let mut first = Session::new(Uuid::new_v4());
        let second = Session::new(Uuid::new_v4());

        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        first.state.push_message(ConversationMessage::user("hello"));
        store.put(&first).await.unwrap();

        let loaded_second = store.get(second.session_id).await.unwrap().unwrap();
        assert!(loaded_second.state.messages().is_empty());

        let loaded_first = store.get(first.session_id).await.unwrap().unwrap();
        assert_eq!(loaded_first.state.messages().len(), 1);

        store.delete(first.session_id).await.unwrap();
        assert!(store.get(first.session_id).await.unwrap().is_none());
        assert_eq!(store.list_ids().await.unwrap(), vec![second.session_id]);
    }

    #[test]
    fn test_session_serialization_round_trip() {
        let mut session = Session::new(Uuid::new_v4());
        session.state.push_message(ConversationMessage::user("deposit 350000 for 30 days"));
        session.state.confirm(350_000, 30).unwrap();
        session
            .state
            .apply_rates(RateRange {
                min_rate: rate(152),
                max_rate: rate(154),
            })
            .unwrap();

        let json = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, session);
    }
}
