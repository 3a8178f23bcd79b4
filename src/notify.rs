use askama::Template;
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    auth::new_id,
    error::ApiError,
    models::{NotificationRow, NOTIFICATION_PROGRESS_UPDATE},
    state::ProgressEvent,
};

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail transport error: {0}")]
    Transport(String),
}

/// Outbound mail channel. The transport itself is an external collaborator;
/// this crate only hands a rendered message over. Best-effort: callers log
/// failures and move on.
pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Development mailer: writes the message to the log instead of sending.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), MailError> {
        log::info!("Mail to {to}: {subject}");
        Ok(())
    }
}

#[derive(Template)]
#[template(path = "progress_email.txt")]
struct ProgressEmail<'a> {
    customer_name: &'a str,
    subject_label: &'a str,
    stage: &'a str,
    percentage: i64,
    remarks: &'a str,
}

/// Deliver one progress event three ways: a persisted in-app notification, a
/// broadcast for live subscribers, and an email. Each delivery is guarded on
/// its own; a failure is logged and never reaches the caller, so the
/// already-recorded progress entry stands regardless of channel health.
pub async fn dispatch(
    pool: &SqlitePool,
    events: &broadcast::Sender<ProgressEvent>,
    mailer: &dyn Mailer,
    event: &ProgressEvent,
) {
    let message = format!(
        "Progress updated for {}: {} ({}%)",
        event.subject_label(),
        event.stage,
        event.percentage
    );

    // The owning customer is the notification target; the author only when
    // the subject never resolved to one.
    let target = event
        .customer
        .as_ref()
        .map(|customer| customer.user_id.as_str())
        .unwrap_or(&event.updated_by);

    if let Err(err) = persist_notification(pool, target, &message).await {
        log::error!("Failed to persist notification for {target}: {err}");
    }

    // Fire-and-forget: an error only means nobody is subscribed right now.
    if events.send(event.clone()).is_err() {
        log::debug!("No live subscribers for {}", event.subject_label());
    }

    match &event.customer {
        Some(customer) => {
            let label = event.subject_label();
            let email = ProgressEmail {
                customer_name: &customer.display_name,
                subject_label: &label,
                stage: &event.stage,
                percentage: event.percentage,
                remarks: event.remarks.as_deref().unwrap_or("N/A"),
            };
            let subject = format!("Progress Update - {label}");
            match email.render() {
                Ok(body) => {
                    if let Err(err) = mailer.send(&customer.email, &subject, &body) {
                        log::warn!("Failed to send progress email to {}: {err}", customer.email);
                    }
                }
                Err(err) => log::error!("Failed to render progress email: {err}"),
            }
        }
        None => log::debug!(
            "No recipient resolved for {}; email skipped",
            event.subject_label()
        ),
    }
}

async fn persist_notification(
    pool: &SqlitePool,
    user_id: &str,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO notifications (id, user_id, type, message, is_read, created_at)
           VALUES (?, ?, ?, ?, 0, ?)"#,
    )
    .bind(new_id())
    .bind(user_id)
    .bind(NOTIFICATION_PROGRESS_UPDATE)
    .bind(message)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// A user's notification feed, newest first.
pub async fn notifications_for_user(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Vec<NotificationRow>, ApiError> {
    let rows = sqlx::query_as::<_, NotificationRow>(
        r#"SELECT id, user_id, type, message, is_read, created_at
           FROM notifications
           WHERE user_id = ?
           ORDER BY created_at DESC, id"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Mark one of the user's own notifications as read. Idempotent.
pub async fn mark_read(
    pool: &SqlitePool,
    user_id: &str,
    notification_id: &str,
) -> Result<(), ApiError> {
    let result = sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ? AND user_id = ?")
        .bind(notification_id)
        .bind(user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::not_found(format!(
            "Notification not found with id {notification_id}"
        )));
    }
    Ok(())
}
