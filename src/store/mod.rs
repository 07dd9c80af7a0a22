//! Durable-store contract and an in-process implementation.
//!
//! Modeled as one async trait so the agent loop, mesh, and proxy can each
//! be tested against a fake without a real database. The concurrent map is
//! `dashmap` rather than a hand-rolled `Mutex<HashMap<...>>`, since this
//! store is read and written from more than one worker.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Open,
    InProgress,
    Done,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
}

/// Recall-fact category enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallCategory {
    User,
    Preference,
    Fact,
    Rule,
    Context,
    Identity,
}

/// `(id, category, content, importance ∈ [1,10], score_when_returned)`.
#[derive(Debug, Clone)]
pub struct RecallFact {
    pub id: String,
    pub category: RecallCategory,
    pub content: String,
    pub importance: u8,
    pub score_when_returned: f64,
}

#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub kind: String,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct LlmLogEntry {
    pub caller: String,
    pub provider: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub latency_ms: u64,
    pub status: String,
    pub extra: String,
}

/// The durable-store contract consumed by the core.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn task_list(&self) -> Result<Vec<Task>, CoreError>;
    async fn task_create(&self, title: &str) -> Result<Task, CoreError>;
    async fn task_update_status(&self, id: &str, status: TaskStatus) -> Result<(), CoreError>;

    async fn recall_store(&self, fact: RecallFact) -> Result<(), CoreError>;
    /// Ranked retrieval: the store ranks, the agent loop only composes.
    async fn recall_query(&self, query: &str, limit: usize) -> Result<Vec<RecallFact>, CoreError>;
    async fn recall_forget(&self, id: &str) -> Result<bool, CoreError>;
    async fn recall_forget_category(&self, category: RecallCategory) -> Result<usize, CoreError>;

    async fn log_event(&self, kind: &str, subject: &str, detail: &str) -> Result<(), CoreError>;

    #[allow(clippy::too_many_arguments)]
    async fn llm_log(
        &self,
        caller: &str,
        provider: &str,
        model: &str,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
        latency_ms: u64,
        status: &str,
        extra: &str,
    ) -> Result<(), CoreError>;
    /// Day-to-date sum for `caller`, used by the proxy's budget gate.
    async fn llm_total_tokens(&self, caller: &str) -> Result<u64, CoreError>;

    async fn read_bootstrap(&self, file_name: &str) -> Result<Option<String>, CoreError>;
    async fn read_memory(&self, key: &str) -> Result<Option<String>, CoreError>;
    async fn write_memory(&self, key: &str, value: &str) -> Result<(), CoreError>;
    async fn append_memory(&self, key: &str, value: &str) -> Result<(), CoreError>;
    async fn append_daily(&self, caller: &str, tokens: u64) -> Result<(), CoreError>;
    async fn read_daily(&self, caller: &str) -> Result<u64, CoreError>;
}

fn today_key(caller: &str) -> String {
    format!("{caller}:{}", Utc::now().date_naive())
}

/// Concurrent-map-backed `DurableStore` for tests and standalone use. Not
/// a SQL-backed implementation; this one never touches disk.
pub struct InMemoryStore {
    tasks: DashMap<String, Task>,
    next_task_id: AtomicU64,
    recall: DashMap<String, RecallFact>,
    events: Mutex<Vec<AuditLogEntry>>,
    llm_logs: Mutex<Vec<LlmLogEntry>>,
    daily_tokens: DashMap<String, u64>,
    bootstrap: DashMap<String, String>,
    memory: DashMap<String, String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            tasks: DashMap::new(),
            next_task_id: AtomicU64::new(1),
            recall: DashMap::new(),
            events: Mutex::new(Vec::new()),
            llm_logs: Mutex::new(Vec::new()),
            daily_tokens: DashMap::new(),
            bootstrap: DashMap::new(),
            memory: DashMap::new(),
        }
    }

    /// Seeds a bootstrap document (operator-authored identity/notes),
    /// mainly useful for tests that exercise `read_bootstrap`.
    pub fn seed_bootstrap(&self, file_name: &str, content: impl Into<String>) {
        self.bootstrap.insert(file_name.to_string(), content.into());
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn task_list(&self) -> Result<Vec<Task>, CoreError> {
        Ok(self.tasks.iter().map(|e| e.value().clone()).collect())
    }

    async fn task_create(&self, title: &str) -> Result<Task, CoreError> {
        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst).to_string();
        let task = Task {
            id: id.clone(),
            title: title.to_string(),
            status: TaskStatus::Open,
        };
        self.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn task_update_status(&self, id: &str, status: TaskStatus) -> Result<(), CoreError> {
        match self.tasks.get_mut(id) {
            Some(mut task) => {
                task.status = status;
                Ok(())
            }
            None => Err(CoreError::NotFound {
                what: format!("task '{id}'"),
            }),
        }
    }

    async fn recall_store(&self, fact: RecallFact) -> Result<(), CoreError> {
        self.recall.insert(fact.id.clone(), fact);
        Ok(())
    }

    async fn recall_query(&self, query: &str, limit: usize) -> Result<Vec<RecallFact>, CoreError> {
        let needle = query.to_ascii_lowercase();
        let mut matches: Vec<RecallFact> = self
            .recall
            .iter()
            .filter(|e| e.value().content.to_ascii_lowercase().contains(&needle))
            .map(|e| e.value().clone())
            .collect();
        matches.sort_by(|a, b| {
            b.importance
                .cmp(&a.importance)
                .then(b.score_when_returned.total_cmp(&a.score_when_returned))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn recall_forget(&self, id: &str) -> Result<bool, CoreError> {
        Ok(self.recall.remove(id).is_some())
    }

    async fn recall_forget_category(&self, category: RecallCategory) -> Result<usize, CoreError> {
        let before = self.recall.len();
        self.recall.retain(|_, fact| fact.category != category);
        Ok(before - self.recall.len())
    }

    async fn log_event(&self, kind: &str, subject: &str, detail: &str) -> Result<(), CoreError> {
        self.events.lock().unwrap().push(AuditLogEntry {
            kind: kind.to_string(),
            subject: subject.to_string(),
            detail: detail.to_string(),
        });
        Ok(())
    }

    async fn llm_log(
        &self,
        caller: &str,
        provider: &str,
        model: &str,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
        latency_ms: u64,
        status: &str,
        extra: &str,
    ) -> Result<(), CoreError> {
        self.llm_logs.lock().unwrap().push(LlmLogEntry {
            caller: caller.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            tokens_in,
            tokens_out,
            cost,
            latency_ms,
            status: status.to_string(),
            extra: extra.to_string(),
        });
        self.append_daily(caller, tokens_in + tokens_out).await
    }

    async fn llm_total_tokens(&self, caller: &str) -> Result<u64, CoreError> {
        self.read_daily(caller).await
    }

    async fn read_bootstrap(&self, file_name: &str) -> Result<Option<String>, CoreError> {
        Ok(self.bootstrap.get(file_name).map(|v| v.clone()))
    }

    async fn read_memory(&self, key: &str) -> Result<Option<String>, CoreError> {
        Ok(self.memory.get(key).map(|v| v.clone()))
    }

    async fn write_memory(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.memory.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn append_memory(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.memory
            .entry(key.to_string())
            .and_modify(|existing| {
                existing.push('\n');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
        Ok(())
    }

    async fn append_daily(&self, caller: &str, tokens: u64) -> Result<(), CoreError> {
        *self.daily_tokens.entry(today_key(caller)).or_insert(0) += tokens;
        Ok(())
    }

    async fn read_daily(&self, caller: &str) -> Result<u64, CoreError> {
        Ok(self
            .daily_tokens
            .get(&today_key(caller))
            .map(|v| *v)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn task_create_then_update_status() {
        let store = InMemoryStore::new();
        let task = store.task_create("write tests").await.unwrap();
        store.task_update_status(&task.id, TaskStatus::Done).await.unwrap();
        let tasks = store.task_list().await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn recall_query_ranks_by_importance() {
        let store = InMemoryStore::new();
        store
            .recall_store(RecallFact {
                id: "a".to_string(),
                category: RecallCategory::Fact,
                content: "likes rust".to_string(),
                importance: 3,
                score_when_returned: 0.0,
            })
            .await
            .unwrap();
        store
            .recall_store(RecallFact {
                id: "b".to_string(),
                category: RecallCategory::Preference,
                content: "likes rust coffee".to_string(),
                importance: 9,
                score_when_returned: 0.0,
            })
            .await
            .unwrap();
        let results = store.recall_query("rust", 10).await.unwrap();
        assert_eq!(results[0].id, "b");
    }

    #[tokio::test]
    async fn llm_log_accumulates_daily_tokens() {
        let store = InMemoryStore::new();
        store
            .llm_log("agent-zero", "openai", "gpt", 100, 50, 0.01, 200, "200", "")
            .await
            .unwrap();
        store
            .llm_log("agent-zero", "openai", "gpt", 100, 50, 0.01, 200, "200", "")
            .await
            .unwrap();
        assert_eq!(store.llm_total_tokens("agent-zero").await.unwrap(), 300);
    }

    #[tokio::test]
    async fn forget_removes_fact() {
        let store = InMemoryStore::new();
        store
            .recall_store(RecallFact {
                id: "a".to_string(),
                category: RecallCategory::Fact,
                content: "x".to_string(),
                importance: 1,
                score_when_returned: 0.0,
            })
            .await
            .unwrap();
        assert!(store.recall_forget("a").await.unwrap());
        assert!(store.recall_query("x", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_bootstrap_returns_seeded_content() {
        let store = InMemoryStore::new();
        store.seed_bootstrap("identity.md", "You are Sea.");
        assert_eq!(
            store.read_bootstrap("identity.md").await.unwrap(),
            Some("You are Sea.".to_string())
        );
    }
}
