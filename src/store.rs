//! Durable transcript store for deliberations.
//!
//! SQLite-backed, append-only in spirit: questions are appended as they
//! arrive, answers exist only through [`TranscriptStore::commit_answer`],
//! which writes every stage artifact in one transaction. There is no
//! placeholder-then-fill surface, so a crash can never leave a partial
//! answer behind; [`TranscriptStore::startup_cleanup`] removes any legacy
//! residue on boot.
//!
//! The connection is wrapped in an async mutex so every store operation is a
//! suspension point for the cooperative runtime.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::artifacts::{
    parse_json_field, Answer, ContextSummary, PanelResponse, QuestionRecord, RankingBallot,
    StoredMessage, Synthesis,
};
use crate::error::{QuorumError, Result};
use crate::ledger::{CreditLedger, Role};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT UNIQUE,
        role TEXT NOT NULL DEFAULT 'user',
        credits INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    );

    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        title TEXT NOT NULL DEFAULT 'New Deliberation',
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT,
        stage1 TEXT,
        stage1_5 TEXT,
        stage2 TEXT,
        stage3 TEXT,
        mode TEXT,
        is_rerun INTEGER NOT NULL DEFAULT 0,
        rerun_input TEXT,
        revision_number INTEGER NOT NULL DEFAULT 0,
        parent_message_id INTEGER REFERENCES messages(id) ON DELETE SET NULL,
        context_summary TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
    );

    CREATE INDEX IF NOT EXISTS idx_conversations_owner
    ON conversations(owner_id);

    CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
    ON messages(conversation_id, created_at);

    CREATE INDEX IF NOT EXISTS idx_messages_role_created
    ON messages(role, created_at);
";

const ANSWER_COLUMNS: &str = "id, stage1, stage1_5, stage2, stage3, mode, is_rerun, \
     rerun_input, revision_number, parent_message_id, context_summary, created_at";

/// All artifacts of a finished run, handed to [`TranscriptStore::commit_answer`].
#[derive(Debug, Clone)]
pub struct AnswerDraft {
    pub stage1: Vec<PanelResponse>,
    pub stage1_5: Option<Vec<PanelResponse>>,
    pub stage2: Vec<RankingBallot>,
    pub stage3: Synthesis,
    pub mode: String,
    pub is_rerun: bool,
    pub rerun_input: Option<String>,
    pub parent_message_id: Option<i64>,
}

/// Deliberation metadata for list views.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeliberationMeta {
    pub id: String,
    pub title: String,
    pub created_at: String,
    /// Count of question messages, not all messages.
    pub message_count: i64,
}

/// One page of a principal's deliberations.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeliberationPage {
    pub items: Vec<DeliberationMeta>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

/// A full deliberation with its messages in chronological order.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeliberationView {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub messages: Vec<StoredMessage>,
}

/// A provisioned principal.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub email: Option<String>,
    pub role: Role,
    pub credits: i64,
}

/// SQLite-backed transcript store. Cheap to clone via [`Arc`]; share one per
/// process.
pub struct TranscriptStore {
    conn: Arc<Mutex<Connection>>,
}

impl TranscriptStore {
    /// Open or create the store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// Open an in-memory store (for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Credit ledger backed by the same database.
    pub fn ledger(&self) -> CreditLedger {
        CreditLedger::new(self.conn.clone())
    }

    /// Delete any assistant message missing its stage-3 synthesis.
    ///
    /// Runs at startup. The atomic commit path never produces such rows;
    /// this removes residue from older deployments or torn writes.
    pub async fn startup_cleanup(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM messages WHERE role = 'assistant' AND stage3 IS NULL",
            [],
        )?;
        if deleted > 0 {
            tracing::warn!(count = deleted, "removed incomplete assistant messages");
        }
        Ok(deleted)
    }

    // ── principals ─────────────────────────────────────────────────────

    /// Fetch a principal, provisioning it with the starting grant when new.
    pub async fn get_or_create_user(
        &self,
        id: &str,
        email: Option<&str>,
        starting_credits: i64,
    ) -> Result<UserRecord> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, email, credits) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO NOTHING",
            params![id, email, starting_credits],
        )?;
        let record = conn.query_row(
            "SELECT id, email, role, credits FROM users WHERE id = ?1",
            [id],
            user_from_row,
        )?;
        Ok(record)
    }

    /// Look up a principal.
    pub async fn user(&self, id: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT id, email, role, credits FROM users WHERE id = ?1",
                [id],
                user_from_row,
            )
            .optional()?)
    }

    /// Change a principal's role tag.
    pub async fn set_user_role(&self, id: &str, role: Role) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE users SET role = ?1 WHERE id = ?2",
            params![role.as_str(), id],
        )?;
        if updated == 0 {
            return Err(QuorumError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    // ── deliberations ──────────────────────────────────────────────────

    /// Create an empty deliberation owned by the principal.
    pub async fn create_deliberation(&self, owner: &str) -> Result<DeliberationMeta> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conversations (id, owner_id) VALUES (?1, ?2)",
            params![id, owner],
        )?;
        let (title, created_at) = conn.query_row(
            "SELECT title, created_at FROM conversations WHERE id = ?1",
            [&id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(DeliberationMeta {
            id,
            title,
            created_at,
            message_count: 0,
        })
    }

    /// Verify the deliberation exists and belongs to the principal.
    pub async fn assert_owner(&self, deliberation: &str, owner: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM conversations WHERE id = ?1 AND owner_id = ?2",
                params![deliberation, owner],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            Some(_) => Ok(()),
            None => Err(QuorumError::NotFound(format!(
                "deliberation {deliberation}"
            ))),
        }
    }

    /// Load a deliberation with all its messages. Owner-checked. Assistant
    /// rows with no stage data (legacy partials) are filtered out of the view.
    pub async fn get_deliberation(
        &self,
        deliberation: &str,
        owner: &str,
    ) -> Result<DeliberationView> {
        self.assert_owner(deliberation, owner).await?;
        let conn = self.conn.lock().await;
        let (title, created_at): (String, String) = conn.query_row(
            "SELECT title, created_at FROM conversations WHERE id = ?1",
            [deliberation],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT role, content, {ANSWER_COLUMNS} FROM messages
             WHERE conversation_id = ?1 ORDER BY created_at, id"
        ))?;
        let mut rows = stmt.query([deliberation])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            let role: String = row.get(0)?;
            if role == "user" {
                messages.push(StoredMessage::User {
                    id: row.get(2)?,
                    content: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    created_at: row.get(13)?,
                });
            } else if let Some(answer) = answer_from_row(row, 2)? {
                messages.push(StoredMessage::Assistant(answer));
            }
        }

        Ok(DeliberationView {
            id: deliberation.to_string(),
            title,
            created_at,
            messages,
        })
    }

    /// Delete a deliberation and cascade to its messages. Returns whether a
    /// row owned by the principal was removed.
    pub async fn delete_deliberation(&self, deliberation: &str, owner: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM conversations WHERE id = ?1 AND owner_id = ?2",
            params![deliberation, owner],
        )?;
        Ok(deleted > 0)
    }

    /// Rename a deliberation.
    pub async fn update_title(&self, deliberation: &str, title: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE conversations SET title = ?1 WHERE id = ?2",
            params![title, deliberation],
        )?;
        Ok(())
    }

    /// Page through a principal's deliberations, newest first. The message
    /// count covers question messages only.
    pub async fn list_by_owner(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<DeliberationPage> {
        let limit = limit.clamp(1, 100);
        let offset = offset.max(0);
        let conn = self.conn.lock().await;

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations WHERE owner_id = ?1",
            [owner],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT c.id, c.title, c.created_at,
                    (SELECT COUNT(*) FROM messages m
                     WHERE m.conversation_id = c.id AND m.role = 'user') AS question_count
             FROM conversations c
             WHERE c.owner_id = ?1
             ORDER BY c.created_at DESC, c.id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let items = stmt
            .query_map(params![owner, limit, offset], |row| {
                Ok(DeliberationMeta {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                    message_count: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let has_more = (offset + items.len() as i64) < total;
        Ok(DeliberationPage {
            items,
            total,
            limit,
            offset,
            has_more,
        })
    }

    // ── questions ──────────────────────────────────────────────────────

    /// Append a question message.
    pub async fn append_question(&self, deliberation: &str, content: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content) VALUES (?1, 'user', ?2)",
            params![deliberation, content],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch a question by id.
    pub async fn question_by_id(
        &self,
        deliberation: &str,
        message_id: i64,
    ) -> Result<Option<QuestionRecord>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT id, content, created_at FROM messages
                 WHERE id = ?1 AND conversation_id = ?2 AND role = 'user'",
                params![message_id, deliberation],
                question_from_row,
            )
            .optional()?)
    }

    /// Delete a message, permitted only when the target is a question.
    /// Used by the retry path to remove an orphan before re-dispatch.
    pub async fn delete_question_by_id(&self, deliberation: &str, message_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM messages WHERE id = ?1 AND conversation_id = ?2",
                params![message_id, deliberation],
                |row| row.get(0),
            )
            .optional()?;
        match role.as_deref() {
            None => Err(QuorumError::NotFound(format!("message {message_id}"))),
            Some("user") => {
                conn.execute("DELETE FROM messages WHERE id = ?1", [message_id])?;
                Ok(())
            }
            Some(_) => Err(QuorumError::InvalidInput(
                "only question messages can be deleted".into(),
            )),
        }
    }

    /// The first question in the deliberation, if any.
    pub async fn original_question(&self, deliberation: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT content FROM messages
                 WHERE conversation_id = ?1 AND role = 'user'
                 ORDER BY created_at, id LIMIT 1",
                [deliberation],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// The trailing question: the chronologically last message, iff it is a
    /// question with no answer after it. Indicates a failed prior submission.
    pub async fn trailing_question(&self, deliberation: &str) -> Result<Option<QuestionRecord>> {
        let conn = self.conn.lock().await;
        let last: Option<(String, i64, Option<String>, String)> = conn
            .query_row(
                "SELECT role, id, content, created_at FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                [deliberation],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        Ok(match last {
            Some((role, id, content, created_at)) if role == "user" => Some(QuestionRecord {
                id,
                content: content.unwrap_or_default(),
                created_at,
            }),
            _ => None,
        })
    }

    // ── answers ────────────────────────────────────────────────────────

    /// Commit a fully-formed answer in one transaction.
    ///
    /// This is the only path that creates an answer row. The revision number
    /// is computed inside the same transaction: `max(sibling revisions) + 1`
    /// for reruns, 0 otherwise.
    pub async fn commit_answer(&self, deliberation: &str, draft: &AnswerDraft) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let revision_number: i64 = match (draft.is_rerun, draft.parent_message_id) {
            (true, Some(parent)) => tx.query_row(
                "SELECT COALESCE(MAX(revision_number), 0) + 1 FROM messages
                 WHERE parent_message_id = ?1 OR id = ?1",
                [parent],
                |row| row.get(0),
            )?,
            _ => 0,
        };

        tx.execute(
            "INSERT INTO messages (
                 conversation_id, role, stage1, stage1_5, stage2, stage3,
                 mode, is_rerun, rerun_input, revision_number, parent_message_id
             ) VALUES (?1, 'assistant', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                deliberation,
                serde_json::to_string(&draft.stage1)?,
                draft
                    .stage1_5
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&draft.stage2)?,
                serde_json::to_string(&draft.stage3)?,
                draft.mode,
                draft.is_rerun,
                draft.rerun_input,
                revision_number,
                draft.parent_message_id,
            ],
        )?;
        let message_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(message_id)
    }

    /// Attach the derived context summary to an already-committed answer.
    pub async fn save_context_summary(
        &self,
        message_id: i64,
        summary: &ContextSummary,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE messages SET context_summary = ?1
             WHERE id = ?2 AND role = 'assistant'",
            params![serde_json::to_string(summary)?, message_id],
        )?;
        if updated == 0 {
            return Err(QuorumError::NotFound(format!("answer {message_id}")));
        }
        Ok(())
    }

    /// The most recent committed answer.
    pub async fn last_answer(&self, deliberation: &str) -> Result<Option<Answer>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ANSWER_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND role = 'assistant' AND stage3 IS NOT NULL
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query([deliberation])?;
        match rows.next()? {
            Some(row) => Ok(answer_from_row(row, 0)?),
            None => Ok(None),
        }
    }

    /// A specific committed answer.
    pub async fn answer_by_id(
        &self,
        deliberation: &str,
        message_id: i64,
    ) -> Result<Option<Answer>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ANSWER_COLUMNS} FROM messages
             WHERE id = ?1 AND conversation_id = ?2
               AND role = 'assistant' AND stage3 IS NOT NULL"
        ))?;
        let mut rows = stmt.query(params![message_id, deliberation])?;
        match rows.next()? {
            Some(row) => Ok(answer_from_row(row, 0)?),
            None => Ok(None),
        }
    }

    /// Stage-3 synthesis of a specific answer.
    pub async fn stage3_by_id(
        &self,
        deliberation: &str,
        message_id: i64,
    ) -> Result<Option<Synthesis>> {
        Ok(self
            .answer_by_id(deliberation, message_id)
            .await?
            .map(|a| a.stage3))
    }

    /// Stage-3 synthesis of the most recent answer.
    pub async fn stage3_latest(&self, deliberation: &str) -> Result<Option<Synthesis>> {
        Ok(self.last_answer(deliberation).await?.map(|a| a.stage3))
    }

    /// Whether a committed answer is missing its synthesis. Legacy-only probe;
    /// startup cleanup removes such rows.
    pub async fn has_incomplete_answer(&self, deliberation: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND role = 'assistant' AND stage3 IS NULL",
            [deliberation],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// An answer and every rerun chained to it, in revision order.
    pub async fn answer_revisions(
        &self,
        deliberation: &str,
        message_id: i64,
    ) -> Result<Vec<Answer>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ANSWER_COLUMNS} FROM messages
             WHERE (id = ?1 OR parent_message_id = ?1)
               AND conversation_id = ?2 AND role = 'assistant' AND stage3 IS NOT NULL
             ORDER BY revision_number, created_at, id"
        ))?;
        let mut rows = stmt.query(params![message_id, deliberation])?;
        let mut answers = Vec::new();
        while let Some(row) = rows.next()? {
            if let Some(answer) = answer_from_row(row, 0)? {
                answers.push(answer);
            }
        }
        Ok(answers)
    }
}

impl TranscriptStore {
    /// Raw SQL escape hatch for tests that need to plant legacy rows.
    #[cfg(test)]
    pub(crate) async fn raw_execute(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute(sql, params)?)
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let role_tag: String = row.get(2)?;
    Ok(UserRecord {
        id: row.get(0)?,
        email: row.get(1)?,
        role: Role::parse(&role_tag),
        credits: row.get(3)?,
    })
}

fn question_from_row(row: &Row<'_>) -> rusqlite::Result<QuestionRecord> {
    Ok(QuestionRecord {
        id: row.get(0)?,
        content: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        created_at: row.get(2)?,
    })
}

/// Map an answer row starting at column `base`. Returns `None` when the
/// stage-3 column is unreadable (legacy partial rows are not surfaced).
fn answer_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<Option<Answer>> {
    let stage3: Option<Synthesis> = parse_json_field(row.get(base + 4)?);
    let Some(stage3) = stage3 else {
        return Ok(None);
    };
    Ok(Some(Answer {
        id: row.get(base)?,
        stage1: parse_json_field(row.get(base + 1)?).unwrap_or_default(),
        stage1_5: parse_json_field(row.get(base + 2)?),
        stage2: parse_json_field(row.get(base + 3)?).unwrap_or_default(),
        stage3,
        mode: row
            .get::<_, Option<String>>(base + 5)?
            .unwrap_or_else(|| "standard".to_string()),
        is_rerun: row.get::<_, Option<bool>>(base + 6)?.unwrap_or(false),
        rerun_input: row.get(base + 7)?,
        revision_number: row.get::<_, Option<i64>>(base + 8)?.unwrap_or(0),
        parent_message_id: row.get(base + 9)?,
        context_summary: parse_json_field(row.get(base + 10)?),
        created_at: row.get(base + 11)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_user() -> (TranscriptStore, String) {
        let store = TranscriptStore::open_in_memory().await.unwrap();
        store
            .get_or_create_user("user-1", Some("u@example.com"), 5)
            .await
            .unwrap();
        let meta = store.create_deliberation("user-1").await.unwrap();
        (store, meta.id)
    }

    fn draft() -> AnswerDraft {
        AnswerDraft {
            stage1: vec![PanelResponse {
                model: "v/m1".into(),
                response: "r1".into(),
                refined: false,
            }],
            stage1_5: None,
            stage2: vec![],
            stage3: Synthesis {
                model: "v/mod".into(),
                response: "final".into(),
            },
            mode: "quick".into(),
            is_rerun: false,
            rerun_input: None,
            parent_message_id: None,
        }
    }

    #[tokio::test]
    async fn test_provisioning_is_idempotent() {
        let store = TranscriptStore::open_in_memory().await.unwrap();
        let first = store
            .get_or_create_user("u", Some("a@b.c"), 5)
            .await
            .unwrap();
        assert_eq!(first.credits, 5);
        assert_eq!(first.role, Role::User);
        // A second call must not re-grant starting credits.
        store.ledger().reserve("u", 2).await.unwrap();
        let again = store.get_or_create_user("u", Some("a@b.c"), 5).await.unwrap();
        assert_eq!(again.credits, 3);
    }

    #[tokio::test]
    async fn test_owner_isolation() {
        let (store, deliberation) = store_with_user().await;
        store.get_or_create_user("intruder", None, 5).await.unwrap();

        assert!(store.assert_owner(&deliberation, "user-1").await.is_ok());
        let err = store.assert_owner(&deliberation, "intruder").await;
        assert!(matches!(err, Err(QuorumError::NotFound(_))));
        let err = store.get_deliberation(&deliberation, "intruder").await;
        assert!(matches!(err, Err(QuorumError::NotFound(_))));
        assert!(!store
            .delete_deliberation(&deliberation, "intruder")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_commit_then_read_back() {
        let (store, deliberation) = store_with_user().await;
        store.append_question(&deliberation, "q?").await.unwrap();
        let id = store.commit_answer(&deliberation, &draft()).await.unwrap();

        let answer = store.last_answer(&deliberation).await.unwrap().unwrap();
        assert_eq!(answer.id, id);
        assert_eq!(answer.stage3.response, "final");
        assert_eq!(answer.stage1.len(), 1);
        assert!(answer.stage2.is_empty());
        assert_eq!(answer.revision_number, 0);

        let view = store.get_deliberation(&deliberation, "user-1").await.unwrap();
        assert_eq!(view.messages.len(), 2);
        assert!(matches!(&view.messages[0], StoredMessage::User { content, .. } if content == "q?"));
        assert!(matches!(&view.messages[1], StoredMessage::Assistant(a) if a.id == id));
    }

    #[tokio::test]
    async fn test_rerun_revision_numbers_increment() {
        let (store, deliberation) = store_with_user().await;
        let original = store.commit_answer(&deliberation, &draft()).await.unwrap();

        let mut rerun = draft();
        rerun.is_rerun = true;
        rerun.parent_message_id = Some(original);
        rerun.rerun_input = Some("new info".into());
        let first = store.commit_answer(&deliberation, &rerun).await.unwrap();
        let second = store.commit_answer(&deliberation, &rerun).await.unwrap();

        let revisions = store
            .answer_revisions(&deliberation, original)
            .await
            .unwrap();
        assert_eq!(
            revisions.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![original, first, second]
        );
        assert_eq!(
            revisions
                .iter()
                .map(|a| a.revision_number)
                .collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(revisions[1].is_rerun);
        assert_eq!(revisions[2].rerun_input.as_deref(), Some("new info"));
    }

    #[tokio::test]
    async fn test_trailing_question_orphan_detection() {
        let (store, deliberation) = store_with_user().await;
        assert!(store.trailing_question(&deliberation).await.unwrap().is_none());

        store.append_question(&deliberation, "lost?").await.unwrap();
        let orphan = store.trailing_question(&deliberation).await.unwrap().unwrap();
        assert_eq!(orphan.content, "lost?");

        store.commit_answer(&deliberation, &draft()).await.unwrap();
        assert!(store.trailing_question(&deliberation).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_startup_cleanup_removes_partial_answers() {
        let (store, deliberation) = store_with_user().await;
        store.commit_answer(&deliberation, &draft()).await.unwrap();
        // Plant a legacy partial row behind the public API's back.
        {
            let conn = store.conn.lock().await;
            conn.execute(
                "INSERT INTO messages (conversation_id, role, stage1)
                 VALUES (?1, 'assistant', '[]')",
                [&deliberation],
            )
            .unwrap();
        }
        assert!(store.has_incomplete_answer(&deliberation).await.unwrap());

        let deleted = store.startup_cleanup().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(!store.has_incomplete_answer(&deliberation).await.unwrap());
        // The complete answer survives.
        assert!(store.last_answer(&deliberation).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_partial_rows_filtered_from_view() {
        let (store, deliberation) = store_with_user().await;
        {
            let conn = store.conn.lock().await;
            conn.execute(
                "INSERT INTO messages (conversation_id, role, stage1)
                 VALUES (?1, 'assistant', '[]')",
                [&deliberation],
            )
            .unwrap();
        }
        let view = store.get_deliberation(&deliberation, "user-1").await.unwrap();
        assert!(view.messages.is_empty());
    }

    #[tokio::test]
    async fn test_delete_question_guard() {
        let (store, deliberation) = store_with_user().await;
        let question = store.append_question(&deliberation, "q").await.unwrap();
        let answer = store.commit_answer(&deliberation, &draft()).await.unwrap();

        assert!(matches!(
            store.delete_question_by_id(&deliberation, answer).await,
            Err(QuorumError::InvalidInput(_))
        ));
        assert!(matches!(
            store.delete_question_by_id(&deliberation, 9999).await,
            Err(QuorumError::NotFound(_))
        ));
        store
            .delete_question_by_id(&deliberation, question)
            .await
            .unwrap();
        assert!(store
            .question_by_id(&deliberation, question)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_counts_questions_only() {
        let (store, deliberation) = store_with_user().await;
        store.append_question(&deliberation, "q1").await.unwrap();
        store.commit_answer(&deliberation, &draft()).await.unwrap();
        store.append_question(&deliberation, "q2").await.unwrap();

        let page = store.list_by_owner("user-1", 50, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].message_count, 2);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let store = TranscriptStore::open_in_memory().await.unwrap();
        store.get_or_create_user("u", None, 5).await.unwrap();
        for _ in 0..3 {
            store.create_deliberation("u").await.unwrap();
        }
        let page = store.list_by_owner("u", 2, 0).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 3);
        assert!(page.has_more);
        let rest = store.list_by_owner("u", 2, 2).await.unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn test_original_question_and_stage3_lookups() {
        let (store, deliberation) = store_with_user().await;
        store.append_question(&deliberation, "first").await.unwrap();
        let id = store.commit_answer(&deliberation, &draft()).await.unwrap();
        store.append_question(&deliberation, "second").await.unwrap();

        assert_eq!(
            store.original_question(&deliberation).await.unwrap().as_deref(),
            Some("first")
        );
        assert_eq!(
            store
                .stage3_by_id(&deliberation, id)
                .await
                .unwrap()
                .unwrap()
                .response,
            "final"
        );
        assert_eq!(
            store
                .stage3_latest(&deliberation)
                .await
                .unwrap()
                .unwrap()
                .response,
            "final"
        );
    }

    #[tokio::test]
    async fn test_context_summary_update_only() {
        let (store, deliberation) = store_with_user().await;
        let id = store.commit_answer(&deliberation, &draft()).await.unwrap();

        let summary = ContextSummary {
            original_question: "q".into(),
            verdict_summary: "final".into(),
            key_dissenting_points: vec![],
            aggregate_rankings: vec![],
            stage1_models: vec!["v/m1".into()],
        };
        store.save_context_summary(id, &summary).await.unwrap();
        let answer = store.last_answer(&deliberation).await.unwrap().unwrap();
        assert_eq!(answer.context_summary.unwrap().verdict_summary, "final");

        assert!(matches!(
            store.save_context_summary(9999, &summary).await,
            Err(QuorumError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tolerant_read_of_double_encoded_rows() {
        let (store, deliberation) = store_with_user().await;
        let stage3_inner = serde_json::to_string(&Synthesis {
            model: "v/mod".into(),
            response: "old row".into(),
        })
        .unwrap();
        let stage3_doubled = serde_json::to_string(&stage3_inner).unwrap();
        {
            let conn = store.conn.lock().await;
            conn.execute(
                "INSERT INTO messages (conversation_id, role, stage1, stage2, stage3)
                 VALUES (?1, 'assistant', '[]', '[]', ?2)",
                params![deliberation, stage3_doubled],
            )
            .unwrap();
        }
        let answer = store.last_answer(&deliberation).await.unwrap().unwrap();
        assert_eq!(answer.stage3.response, "old row");
    }
}
