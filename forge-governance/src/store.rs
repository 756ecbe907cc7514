//! Persistence seam for governance state.
//!
//! Nothing is persisted implicitly. The owner decides when to call
//! [`crate::Governor::persist`] and [`crate::Governor::restore`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::action::AutomatedAction;
use crate::approval::ApprovalRequest;
use crate::broadcaster::StateSnapshot;

const KIND_PROJECT: &str = "project";
const KIND_ACTION: &str = "action";
const KIND_APPROVAL: &str = "approval";
const PROJECT_ID: &str = "current";

/// Snapshot/restore hooks for project state, action history, and approval
/// history.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_project_state(&self, snapshot: &StateSnapshot) -> Result<()>;
    async fn load_project_state(&self) -> Result<Option<StateSnapshot>>;

    /// Upsert actions by id.
    async fn save_actions(&self, actions: &[AutomatedAction]) -> Result<()>;
    async fn load_actions(&self) -> Result<Vec<AutomatedAction>>;

    /// Upsert approval requests by id.
    async fn save_approvals(&self, approvals: &[ApprovalRequest]) -> Result<()>;
    async fn load_approvals(&self) -> Result<Vec<ApprovalRequest>>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct MemoryDocs {
    project: Option<StateSnapshot>,
    actions: Vec<AutomatedAction>,
    approvals: Vec<ApprovalRequest>,
}

/// Process-local store, mostly for tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    docs: Arc<Mutex<MemoryDocs>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryDocs> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn upsert_by_id<T: Clone>(existing: &mut Vec<T>, incoming: &[T], id: impl Fn(&T) -> &str) {
    for item in incoming {
        match existing.iter_mut().find(|e| id(e) == id(item)) {
            Some(slot) => *slot = item.clone(),
            None => existing.push(item.clone()),
        }
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save_project_state(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.lock().project = Some(snapshot.clone());
        Ok(())
    }

    async fn load_project_state(&self) -> Result<Option<StateSnapshot>> {
        Ok(self.lock().project.clone())
    }

    async fn save_actions(&self, actions: &[AutomatedAction]) -> Result<()> {
        upsert_by_id(&mut self.lock().actions, actions, |a| a.id.as_str());
        Ok(())
    }

    async fn load_actions(&self) -> Result<Vec<AutomatedAction>> {
        Ok(self.lock().actions.clone())
    }

    async fn save_approvals(&self, approvals: &[ApprovalRequest]) -> Result<()> {
        upsert_by_id(&mut self.lock().approvals, approvals, |r| r.id.as_str());
        Ok(())
    }

    async fn load_approvals(&self) -> Result<Vec<ApprovalRequest>> {
        Ok(self.lock().approvals.clone())
    }
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite-backed store keeping each entity as a JSON document.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and apply the schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open snapshot store at {}", db_path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))
            .context("Failed to initialize snapshot store schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
            f(&mut conn)
        })
        .await
        .context("Snapshot store task panicked")?
    }

    async fn put_all<T>(&self, kind: &'static str, docs: Vec<(String, T)>) -> Result<()>
    where
        T: Serialize + Send + 'static,
    {
        let count = docs.len();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().to_rfc3339();
            for (id, doc) in &docs {
                let body = serde_json::to_string(doc)?;
                tx.execute(
                    r"
                    INSERT INTO governance_documents (kind, id, body, updated_at)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(kind, id) DO UPDATE SET
                        body = excluded.body,
                        updated_at = excluded.updated_at
                    ",
                    params![kind, id, body, now],
                )
                .with_context(|| format!("Failed to save {} '{}'", kind, id))?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        tracing::debug!(kind, count, "Snapshot documents saved");
        Ok(())
    }

    async fn get_all<T>(&self, kind: &'static str) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, body FROM governance_documents WHERE kind = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![kind], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut docs = Vec::new();
            for row in rows {
                let (id, body) = row?;
                let doc = serde_json::from_str(&body)
                    .with_context(|| format!("Corrupt {} document '{}'", kind, id))?;
                docs.push(doc);
            }
            Ok(docs)
        })
        .await
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn save_project_state(&self, snapshot: &StateSnapshot) -> Result<()> {
        self.put_all(KIND_PROJECT, vec![(PROJECT_ID.to_string(), snapshot.clone())])
            .await
    }

    async fn load_project_state(&self) -> Result<Option<StateSnapshot>> {
        let body: Option<String> = self
            .blocking(|conn| {
                conn.query_row(
                    "SELECT body FROM governance_documents WHERE kind = ?1 AND id = ?2",
                    params![KIND_PROJECT, PROJECT_ID],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to load project state")
            })
            .await?;

        body.map(|b| serde_json::from_str(&b).context("Corrupt project state document"))
            .transpose()
    }

    async fn save_actions(&self, actions: &[AutomatedAction]) -> Result<()> {
        let docs = actions.iter().map(|a| (a.id.clone(), a.clone())).collect();
        self.put_all(KIND_ACTION, docs).await
    }

    async fn load_actions(&self) -> Result<Vec<AutomatedAction>> {
        self.get_all(KIND_ACTION).await
    }

    async fn save_approvals(&self, approvals: &[ApprovalRequest]) -> Result<()> {
        let docs = approvals.iter().map(|r| (r.id.clone(), r.clone())).collect();
        self.put_all(KIND_APPROVAL, docs).await
    }

    async fn load_approvals(&self) -> Result<Vec<ApprovalRequest>> {
        self.get_all(KIND_APPROVAL).await
    }
}
