use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::notify::Mailer;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub events: broadcast::Sender<ProgressEvent>,
    pub mailer: Arc<dyn Mailer>,
}

impl AppState {
    pub fn new(db: SqlitePool, mailer: Arc<dyn Mailer>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { db, events, mailer }
    }
}

/// Structured payload published once per recorded progress entry. SSE
/// subscribers filter on (subject_kind, subject_id), which stands in for a
/// topic keyed by the parent id.
#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub subject_kind: String,
    pub subject_id: String,
    pub stage: String,
    pub percentage: i64,
    pub remarks: Option<String>,
    pub updated_by: String,
    pub timestamp: String,
    /// Status the subject transitioned to, when the stage vocabulary
    /// produced an applied transition.
    pub new_status: Option<String>,
    #[serde(skip)]
    pub customer: Option<EventRecipient>,
}

/// Owning customer of the subject, resolved while recording so the fan-out
/// does not have to probe stores again.
#[derive(Clone, Debug)]
pub struct EventRecipient {
    pub user_id: String,
    pub display_name: String,
    pub email: String,
}

impl ProgressEvent {
    pub fn subject_label(&self) -> String {
        format!("{} {}", self.subject_kind, self.subject_id)
    }
}
