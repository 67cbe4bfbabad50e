//! Short-lived in-memory processing sessions.
//!
//! A session tracks one unit of work and the results each agent produced for
//! it. Sessions expire after a period of inactivity; expired sessions are
//! never returned and are purged lazily on access and by a periodic task.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::models::Fields;

pub const MIN_TTL_SECONDS: u64 = 60;
pub const MAX_TTL_SECONDS: u64 = 86_400;
pub const MAX_AGENT_NAME_LEN: usize = 100;

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(String),

    #[error("Agent result '{agent}' not found for session {session_id}")]
    ResultNotFound { session_id: String, agent: String },

    #[error("session_ttl must be between 60 and 86400 seconds, got {0}")]
    InvalidTtl(u64),

    #[error("agent_name must be 1 to 100 characters")]
    InvalidAgentName,

    #[error("error_message is required when status is error")]
    MissingErrorMessage,

    #[error("execution_time must be a non-negative number")]
    InvalidExecutionTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Created,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Running,
    #[default]
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentResult {
    pub result: Value,
    pub status: AgentStatus,
    pub timestamp: DateTime<Utc>,
    /// Seconds.
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub input_data: Fields,
    pub agent_results: BTreeMap<String, AgentResult>,
    pub metadata: Fields,
    /// Overrides the manager's TTL for this session.
    pub session_ttl: Option<u64>,
    pub agent_count: usize,
}

/// Lightweight listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub agent_count: usize,
    pub metadata_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSession {
    #[serde(default)]
    pub input_data: Fields,
    #[serde(default)]
    pub metadata: Fields,
    pub session_ttl: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    /// Replaces the session metadata.
    pub metadata: Option<Fields>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreAgentResult {
    pub agent_name: String,
    pub result: Value,
    #[serde(default)]
    pub status: AgentStatus,
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
}

impl StoreAgentResult {
    pub fn success(agent_name: impl Into<String>, result: Value, execution_time: f64) -> Self {
        Self {
            agent_name: agent_name.into(),
            result,
            status: AgentStatus::Success,
            execution_time: Some(execution_time),
            error_message: None,
        }
    }

    fn validate(&self) -> Result<(), SessionError> {
        let len = self.agent_name.chars().count();
        if len == 0 || len > MAX_AGENT_NAME_LEN {
            return Err(SessionError::InvalidAgentName);
        }
        if self.status == AgentStatus::Error
            && self.error_message.as_deref().map_or(true, str::is_empty)
        {
            return Err(SessionError::MissingErrorMessage);
        }
        if let Some(t) = self.execution_time {
            if !t.is_finite() || t < 0.0 {
                return Err(SessionError::InvalidExecutionTime);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub total_sessions: usize,
    /// Sessions still created or processing.
    pub active_sessions: usize,
    pub status_distribution: BTreeMap<SessionStatus, usize>,
    pub backend_type: &'static str,
    pub backend_connected: bool,
    pub memory_config: MetricsConfig,
    pub uptime_seconds: f64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsConfig {
    pub max_sessions: usize,
    pub session_ttl: u64,
}

/// In-memory session store with TTL expiry and capacity eviction.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    max_sessions: usize,
    session_ttl: u64,
    started: Instant,
    last_cleanup: Mutex<Option<DateTime<Utc>>>,
}

impl SessionManager {
    pub fn new(max_sessions: usize, session_ttl: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
            session_ttl: session_ttl.clamp(MIN_TTL_SECONDS, MAX_TTL_SECONDS),
            started: Instant::now(),
            last_cleanup: Mutex::new(None),
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.max_sessions, config.session_ttl_seconds)
    }

    /// Purge expired sessions every `interval` until the handle is aborted.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.purge_expired();
            }
        })
    }

    pub fn create(&self, request: CreateSession) -> Result<String, SessionError> {
        if let Some(ttl) = request.session_ttl {
            if !(MIN_TTL_SECONDS..=MAX_TTL_SECONDS).contains(&ttl) {
                return Err(SessionError::InvalidTtl(ttl));
            }
        }

        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            created_at: now,
            last_activity: now,
            status: SessionStatus::Created,
            input_data: request.input_data,
            agent_results: BTreeMap::new(),
            metadata: request.metadata,
            session_ttl: request.session_ttl,
            agent_count: 0,
        };
        let id = session.session_id.clone();

        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            self.evict_oldest(&mut sessions);
        }
        sessions.insert(id.clone(), session);
        debug!(session_id = %id, "Created session");
        Ok(id)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        let now = Utc::now();
        {
            let sessions = self.sessions.read();
            match sessions.get(session_id) {
                None => return None,
                Some(s) if !self.is_expired(s, now) => return Some(s.clone()),
                Some(_) => {}
            }
        }
        self.sessions.write().remove(session_id);
        debug!(session_id, "Removed expired session");
        None
    }

    pub fn update(&self, session_id: &str, update: SessionUpdate) -> Result<Session, SessionError> {
        self.with_session(session_id, |session| {
            if let Some(status) = update.status {
                session.status = status;
            }
            if let Some(metadata) = update.metadata {
                session.metadata = metadata;
            }
        })
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), SessionError> {
        self.with_session(session_id, |session| session.status = status)
            .map(|_| ())
    }

    pub fn store_agent_result(
        &self,
        session_id: &str,
        request: StoreAgentResult,
    ) -> Result<(), SessionError> {
        request.validate()?;
        self.with_session(session_id, |session| {
            let result = AgentResult {
                result: request.result,
                status: request.status,
                timestamp: Utc::now(),
                execution_time: request.execution_time,
                error_message: request.error_message,
                retry_count: 0,
            };
            session.agent_results.insert(request.agent_name, result);
            session.agent_count = session.agent_results.len();
        })?;
        Ok(())
    }

    pub fn get_agent_result(
        &self,
        session_id: &str,
        agent_name: &str,
    ) -> Result<AgentResult, SessionError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session
            .agent_results
            .get(agent_name)
            .cloned()
            .ok_or_else(|| SessionError::ResultNotFound {
                session_id: session_id.to_string(),
                agent: agent_name.to_string(),
            })
    }

    /// Live sessions, most recent activity first.
    pub fn list(&self, limit: usize) -> Vec<SessionSummary> {
        let now = Utc::now();
        let sessions = self.sessions.read();
        let mut live: Vec<&Session> = sessions
            .values()
            .filter(|s| !self.is_expired(s, now))
            .collect();
        live.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        live.into_iter()
            .take(limit)
            .map(|s| SessionSummary {
                session_id: s.session_id.clone(),
                created_at: s.created_at,
                last_activity: s.last_activity,
                status: s.status,
                agent_count: s.agent_results.len(),
                metadata_keys: s.metadata.keys().cloned().collect(),
            })
            .collect()
    }

    /// Returns whether a session was removed.
    pub fn delete(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            info!(session_id, "Deleted session");
        }
        removed
    }

    pub fn metrics(&self) -> SessionMetrics {
        let now = Utc::now();
        let sessions = self.sessions.read();
        let mut status_distribution = BTreeMap::new();
        let mut total = 0;
        let mut active = 0;
        for session in sessions.values().filter(|s| !self.is_expired(s, now)) {
            total += 1;
            if matches!(
                session.status,
                SessionStatus::Created | SessionStatus::Processing
            ) {
                active += 1;
            }
            *status_distribution.entry(session.status).or_insert(0) += 1;
        }

        SessionMetrics {
            total_sessions: total,
            active_sessions: active,
            status_distribution,
            backend_type: "in_memory",
            backend_connected: true,
            memory_config: MetricsConfig {
                max_sessions: self.max_sessions,
                session_ttl: self.session_ttl,
            },
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            last_cleanup: *self.last_cleanup.lock(),
        }
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !self.is_expired(s, now));
        let removed = before - sessions.len();
        drop(sessions);

        *self.last_cleanup.lock() = Some(now);
        if removed > 0 {
            info!(removed, "Cleaned up expired sessions");
        }
        removed
    }

    fn with_session<F>(&self, session_id: &str, apply: F) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session),
    {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let expired = match sessions.get(session_id) {
            None => return Err(SessionError::NotFound(session_id.to_string())),
            Some(s) => self.is_expired(s, now),
        };
        if expired {
            sessions.remove(session_id);
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        apply(session);
        session.last_activity = now;
        Ok(session.clone())
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        let ttl = session.session_ttl.unwrap_or(self.session_ttl);
        let ttl = chrono::Duration::seconds(ttl.min(i64::MAX as u64) as i64);
        session.last_activity + ttl < now
    }

    /// Remove the least recently active tenth of the sessions, at least one.
    fn evict_oldest(&self, sessions: &mut HashMap<String, Session>) {
        let mut by_age: Vec<(String, DateTime<Utc>)> = sessions
            .iter()
            .map(|(id, s)| (id.clone(), s.last_activity))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);

        let count = (by_age.len() / 10).max(1);
        for (id, _) in by_age.into_iter().take(count) {
            sessions.remove(&id);
        }
        info!(count, "Evicted oldest sessions at capacity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create(manager: &SessionManager) -> String {
        manager.create(CreateSession::default()).unwrap()
    }

    fn age(manager: &SessionManager, id: &str, seconds: i64) {
        let mut sessions = manager.sessions.write();
        let session = sessions.get_mut(id).unwrap();
        session.last_activity = session.last_activity - chrono::Duration::seconds(seconds);
    }

    #[test]
    fn test_create_and_get() {
        let manager = SessionManager::new(10, 3600);
        let mut input = Fields::new();
        input.insert("source".into(), json!("invoice.pdf"));
        let id = manager
            .create(CreateSession {
                input_data: input,
                ..Default::default()
            })
            .unwrap();

        let session = manager.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Created);
        assert_eq!(session.input_data["source"], "invoice.pdf");
        assert!(manager.get("missing").is_none());
    }

    #[test]
    fn test_ttl_validation() {
        let manager = SessionManager::new(10, 3600);
        for ttl in [59, 86_401] {
            let err = manager
                .create(CreateSession {
                    session_ttl: Some(ttl),
                    ..Default::default()
                })
                .unwrap_err();
            assert_eq!(err, SessionError::InvalidTtl(ttl));
        }
        assert!(manager
            .create(CreateSession {
                session_ttl: Some(60),
                ..Default::default()
            })
            .is_ok());
    }

    #[test]
    fn test_expired_sessions_are_invisible() {
        let manager = SessionManager::new(10, 3600);
        let old = create(&manager);
        let fresh = create(&manager);
        age(&manager, &old, 3601);

        assert!(manager.get(&old).is_none());
        assert_eq!(manager.list(10).len(), 1);
        assert_eq!(manager.metrics().total_sessions, 1);
        assert!(matches!(
            manager.set_status(&old, SessionStatus::Completed),
            Err(SessionError::NotFound(_))
        ));
        assert!(manager.get(&fresh).is_some());
    }

    #[test]
    fn test_per_session_ttl() {
        let manager = SessionManager::new(10, 3600);
        let id = manager
            .create(CreateSession {
                session_ttl: Some(60),
                ..Default::default()
            })
            .unwrap();
        age(&manager, &id, 61);
        assert_eq!(manager.purge_expired(), 1);
        assert!(manager.metrics().last_cleanup.is_some());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let manager = SessionManager::new(3, 3600);
        let first = create(&manager);
        let second = create(&manager);
        let third = create(&manager);
        age(&manager, &first, 30);
        age(&manager, &second, 20);
        age(&manager, &third, 10);

        let fourth = create(&manager);
        assert!(manager.get(&first).is_none());
        assert!(manager.get(&second).is_some());
        assert!(manager.get(&fourth).is_some());
        assert_eq!(manager.list(10).len(), 3);
    }

    #[test]
    fn test_update_refreshes_activity() {
        let manager = SessionManager::new(10, 3600);
        let a = create(&manager);
        let b = create(&manager);
        age(&manager, &a, 100);
        age(&manager, &b, 50);

        let mut metadata = Fields::new();
        metadata.insert("user".into(), json!("u1"));
        let session = manager
            .update(
                &a,
                SessionUpdate {
                    status: Some(SessionStatus::Processing),
                    metadata: Some(metadata),
                },
            )
            .unwrap();
        assert_eq!(session.status, SessionStatus::Processing);

        let listed = manager.list(10);
        assert_eq!(listed[0].session_id, a);
        assert_eq!(listed[0].metadata_keys, vec!["user"]);
        assert_eq!(manager.list(1).len(), 1);
    }

    #[test]
    fn test_agent_results() {
        let manager = SessionManager::new(10, 3600);
        let id = create(&manager);
        manager
            .store_agent_result(
                &id,
                StoreAgentResult::success("pdf_agent", json!({"valid": true}), 0.25),
            )
            .unwrap();

        let result = manager.get_agent_result(&id, "pdf_agent").unwrap();
        assert_eq!(result.status, AgentStatus::Success);
        assert_eq!(result.result["valid"], true);
        assert_eq!(manager.get(&id).unwrap().agent_count, 1);
        assert!(matches!(
            manager.get_agent_result(&id, "email_agent"),
            Err(SessionError::ResultNotFound { .. })
        ));
    }

    #[test]
    fn test_agent_result_validation() {
        let manager = SessionManager::new(10, 3600);
        let id = create(&manager);

        let mut request = StoreAgentResult::success("", json!({}), 0.0);
        assert_eq!(
            manager.store_agent_result(&id, request.clone()),
            Err(SessionError::InvalidAgentName)
        );

        request.agent_name = "a".repeat(101);
        assert_eq!(
            manager.store_agent_result(&id, request.clone()),
            Err(SessionError::InvalidAgentName)
        );

        request.agent_name = "ocr".into();
        request.status = AgentStatus::Error;
        assert_eq!(
            manager.store_agent_result(&id, request.clone()),
            Err(SessionError::MissingErrorMessage)
        );

        request.status = AgentStatus::Success;
        request.execution_time = Some(-1.0);
        assert_eq!(
            manager.store_agent_result(&id, request),
            Err(SessionError::InvalidExecutionTime)
        );
    }

    #[test]
    fn test_metrics_and_delete() {
        let manager = SessionManager::new(5, 120);
        let a = create(&manager);
        let b = create(&manager);
        manager.set_status(&b, SessionStatus::Completed).unwrap();

        let metrics = manager.metrics();
        assert_eq!(metrics.total_sessions, 2);
        assert_eq!(metrics.active_sessions, 1);
        assert_eq!(metrics.status_distribution[&SessionStatus::Completed], 1);
        assert_eq!(metrics.backend_type, "in_memory");
        assert_eq!(metrics.memory_config.session_ttl, 120);

        assert!(manager.delete(&a));
        assert!(!manager.delete(&a));
        assert_eq!(manager.metrics().total_sessions, 1);
    }

    #[test]
    fn test_default_ttl_is_clamped() {
        let huge = SessionManager::new(5, u64::MAX);
        assert_eq!(huge.metrics().memory_config.session_ttl, MAX_TTL_SECONDS);
        let id = huge.create(CreateSession::default()).unwrap();
        assert!(huge.get(&id).is_some());

        let tiny = SessionManager::new(5, 1);
        assert_eq!(tiny.metrics().memory_config.session_ttl, MIN_TTL_SECONDS);
    }

    #[tokio::test]
    async fn test_cleanup_task_purges() {
        let manager = Arc::new(SessionManager::new(5, 60));
        let id = create(&manager);
        age(&manager, &id, 120);

        let handle = manager.spawn_cleanup(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.sessions.read().is_empty());
        handle.abort();
    }
}
