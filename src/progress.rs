use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::{
    db::{fetch_appointment, fetch_project, fetch_user},
    error::ApiError,
    models::{
        ProgressRow, PROJECT_CANCELLED, PROJECT_COMPLETED, PROJECT_IN_PROGRESS, PROJECT_ON_HOLD,
        PROJECT_PLANNED, STATUS_CANCELLED, STATUS_COMPLETED,
    },
    state::{EventRecipient, ProgressEvent},
};

/// What a progress entry is recorded against. Supplied explicitly by the
/// caller, so an appointment id is never probed against the project store
/// or vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Appointment,
    Project,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Appointment => "appointment",
            SubjectKind::Project => "project",
        }
    }

    pub fn from_path(value: &str) -> Result<Self, ApiError> {
        match value {
            "appointment" => Ok(SubjectKind::Appointment),
            "project" => Ok(SubjectKind::Project),
            other => Err(ApiError::validation(format!(
                "Unknown progress subject kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressRequest {
    pub stage: String,
    pub percentage: i64,
    pub remarks: Option<String>,
}

enum Transition {
    Apply,
    Noop,
}

fn is_terminal(status: &str) -> bool {
    status == STATUS_COMPLETED || status == STATUS_CANCELLED
}

/// Transition table keyed by (current, derived). Equal statuses are no-ops,
/// and completed/cancelled are terminal: a derived transition away from them
/// is silently dropped rather than rejected, because recording progress must
/// never fail on account of the status side-effect.
fn plan_transition(current: &str, derived: &str) -> Transition {
    if current == derived || is_terminal(current) {
        Transition::Noop
    } else {
        Transition::Apply
    }
}

fn derive_appointment_status(stage: &str, percentage: i64) -> Option<&'static str> {
    let stage = stage.trim().to_lowercase();
    if stage == "completed" || percentage >= 100 {
        Some(STATUS_COMPLETED)
    } else if stage == "cancelled" {
        Some(STATUS_CANCELLED)
    } else {
        None
    }
}

fn derive_project_status(stage: &str, percentage: i64) -> Option<&'static str> {
    let stage = stage.trim().to_lowercase();
    if stage == "completed" || percentage >= 100 {
        Some(PROJECT_COMPLETED)
    } else {
        match stage.as_str() {
            "in progress" | "in_progress" => Some(PROJECT_IN_PROGRESS),
            "paused" => Some(PROJECT_ON_HOLD),
            "cancelled" => Some(PROJECT_CANCELLED),
            "not started" | "not_started" => Some(PROJECT_PLANNED),
            _ => None,
        }
    }
}

async fn resolve_recipient(
    pool: &SqlitePool,
    customer_id: &str,
) -> Result<Option<EventRecipient>, sqlx::Error> {
    let Some(user) = fetch_user(pool, customer_id).await? else {
        return Ok(None);
    };
    Ok(Some(EventRecipient {
        user_id: user.id,
        display_name: user.display_name,
        email: user.email,
    }))
}

/// Apply the stage-derived status to the resolved subject. Returns the new
/// status when a transition was applied, plus the subject's owning customer.
async fn apply_status(
    pool: &SqlitePool,
    kind: SubjectKind,
    subject_id: &str,
    stage: &str,
    percentage: i64,
) -> Result<(Option<String>, Option<EventRecipient>), sqlx::Error> {
    match kind {
        SubjectKind::Appointment => {
            let Some(appointment) = fetch_appointment(pool, subject_id).await? else {
                log::warn!("Progress recorded for unknown appointment {subject_id}; status derivation skipped");
                return Ok((None, None));
            };
            let recipient = resolve_recipient(pool, &appointment.customer_id).await?;

            let Some(derived) = derive_appointment_status(stage, percentage) else {
                return Ok((None, recipient));
            };
            match plan_transition(&appointment.status, derived) {
                Transition::Noop => Ok((None, recipient)),
                Transition::Apply => {
                    sqlx::query("UPDATE appointments SET status = ? WHERE id = ?")
                        .bind(derived)
                        .bind(subject_id)
                        .execute(pool)
                        .await?;
                    log::info!("Appointment {subject_id} status {} -> {derived}", appointment.status);
                    Ok((Some(derived.to_string()), recipient))
                }
            }
        }
        SubjectKind::Project => {
            let Some(project) = fetch_project(pool, subject_id).await? else {
                log::warn!("Progress recorded for unknown project {subject_id}; status derivation skipped");
                return Ok((None, None));
            };
            let recipient = resolve_recipient(pool, &project.customer_id).await?;

            let Some(derived) = derive_project_status(stage, percentage) else {
                return Ok((None, recipient));
            };
            match plan_transition(&project.status, derived) {
                Transition::Noop => Ok((None, recipient)),
                Transition::Apply => {
                    sqlx::query("UPDATE projects SET status = ? WHERE id = ?")
                        .bind(derived)
                        .bind(subject_id)
                        .execute(pool)
                        .await?;
                    log::info!("Project {subject_id} status {} -> {derived}", project.status);
                    Ok((Some(derived.to_string()), recipient))
                }
            }
        }
    }
}

/// Record a progress entry against a subject and derive its status change.
///
/// The entry is immutable once written; a missing subject skips the status
/// side-effect but keeps the entry. The returned ProgressEvent is the
/// effects value the fan-out executor dispatches. This function itself
/// touches no delivery channel.
pub async fn record(
    pool: &SqlitePool,
    kind: SubjectKind,
    subject_id: &str,
    request: &ProgressRequest,
    author_id: &str,
) -> Result<(ProgressRow, ProgressEvent), ApiError> {
    if request.stage.trim().is_empty() {
        return Err(ApiError::validation("Stage must not be blank"));
    }
    if !(0..=100).contains(&request.percentage) {
        return Err(ApiError::validation("Percentage must be between 0 and 100"));
    }

    let remarks = request
        .remarks
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let now = Utc::now().to_rfc3339();

    let result = sqlx::query(
        r#"INSERT INTO progress_updates (subject_kind, subject_id, stage, percentage, remarks, updated_by, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(kind.as_str())
    .bind(subject_id)
    .bind(request.stage.trim())
    .bind(request.percentage)
    .bind(&remarks)
    .bind(author_id)
    .bind(&now)
    .execute(pool)
    .await?;
    let entry_id = result.last_insert_rowid();

    let (new_status, customer) =
        apply_status(pool, kind, subject_id, &request.stage, request.percentage).await?;

    let entry = sqlx::query_as::<_, ProgressRow>(
        r#"SELECT id, subject_kind, subject_id, stage, percentage, remarks, updated_by, created_at
           FROM progress_updates
           WHERE id = ?"#,
    )
    .bind(entry_id)
    .fetch_one(pool)
    .await?;

    let event = ProgressEvent {
        subject_kind: entry.subject_kind.clone(),
        subject_id: entry.subject_id.clone(),
        stage: entry.stage.clone(),
        percentage: entry.percentage,
        remarks: entry.remarks.clone(),
        updated_by: entry.updated_by.clone(),
        timestamp: entry.created_at.clone(),
        new_status,
        customer,
    };

    Ok((entry, event))
}

/// All entries for a subject in creation order. Empty when none exist.
pub async fn history(
    pool: &SqlitePool,
    kind: SubjectKind,
    subject_id: &str,
) -> Result<Vec<ProgressRow>, ApiError> {
    let rows = sqlx::query_as::<_, ProgressRow>(
        r#"SELECT id, subject_kind, subject_id, stage, percentage, remarks, updated_by, created_at
           FROM progress_updates
           WHERE subject_kind = ? AND subject_id = ?
           ORDER BY id ASC"#,
    )
    .bind(kind.as_str())
    .bind(subject_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Percentage of the most recently appended entry; 0 when none exist.
pub async fn latest_percentage(
    pool: &SqlitePool,
    kind: SubjectKind,
    subject_id: &str,
) -> Result<i64, ApiError> {
    let latest: Option<i64> = sqlx::query_scalar(
        r#"SELECT percentage FROM progress_updates
           WHERE subject_kind = ? AND subject_id = ?
           ORDER BY id DESC
           LIMIT 1"#,
    )
    .bind(kind.as_str())
    .bind(subject_id)
    .fetch_optional(pool)
    .await?;
    Ok(latest.unwrap_or(0))
}

/// Integer-truncated mean of all entries' percentages; 0 when none exist.
pub async fn average_percentage(
    pool: &SqlitePool,
    kind: SubjectKind,
    subject_id: &str,
) -> Result<i64, ApiError> {
    let percentages: Vec<i64> = sqlx::query_scalar(
        "SELECT percentage FROM progress_updates WHERE subject_kind = ? AND subject_id = ?",
    )
    .bind(kind.as_str())
    .bind(subject_id)
    .fetch_all(pool)
    .await?;

    if percentages.is_empty() {
        return Ok(0);
    }
    let sum: i64 = percentages.iter().sum();
    Ok(sum / percentages.len() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppointmentRow, STATUS_UPCOMING};
    use crate::slots::{book, BookingRequest};
    use crate::testutil;

    fn request(stage: &str, percentage: i64, remarks: Option<&str>) -> ProgressRequest {
        ProgressRequest {
            stage: stage.to_string(),
            percentage,
            remarks: remarks.map(str::to_string),
        }
    }

    async fn upcoming_appointment(pool: &SqlitePool, customer: &str, employee: &str) -> AppointmentRow {
        let mut booking = BookingRequest {
            vehicle: "ABC-1234".to_string(),
            service: "Engine Repair".to_string(),
            date: "2025-06-10".to_string(),
            start_time: "09:00".to_string(),
            end_time: "10:00".to_string(),
            employee_id: None,
        };
        booking.employee_id = Some(employee.to_string());
        book(pool, customer, booking).await.unwrap()
    }

    #[actix_web::test]
    async fn rejects_blank_stage_and_out_of_range_percentage() {
        let pool = testutil::pool().await;
        let employee = testutil::employee(&pool, "e1").await;

        let err = record(
            &pool,
            SubjectKind::Appointment,
            "apt1",
            &request("   ", 50, None),
            &employee,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        for percentage in [-1, 101] {
            let err = record(
                &pool,
                SubjectKind::Appointment,
                "apt1",
                &request("Inspection", percentage, None),
                &employee,
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)));
        }

        assert!(history(&pool, SubjectKind::Appointment, "apt1")
            .await
            .unwrap()
            .is_empty());
    }

    #[actix_web::test]
    async fn history_appends_without_mutating_prior_entries() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;
        let employee = testutil::employee(&pool, "e1").await;
        let appointment = upcoming_appointment(&pool, &customer, &employee).await;

        record(
            &pool,
            SubjectKind::Appointment,
            &appointment.id,
            &request("Inspection", 20, Some("checked brakes")),
            &employee,
        )
        .await
        .unwrap();

        let before = history(&pool, SubjectKind::Appointment, &appointment.id)
            .await
            .unwrap();
        assert_eq!(before.len(), 1);

        record(
            &pool,
            SubjectKind::Appointment,
            &appointment.id,
            &request("Repair", 60, None),
            &employee,
        )
        .await
        .unwrap();

        let after = history(&pool, SubjectKind::Appointment, &appointment.id)
            .await
            .unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0], before[0]);
        assert!(after[0].id < after[1].id);
    }

    #[actix_web::test]
    async fn latest_percentage_is_last_appended_not_maximum() {
        let pool = testutil::pool().await;
        let employee = testutil::employee(&pool, "e1").await;
        let customer = testutil::customer(&pool, "c1").await;
        let appointment = upcoming_appointment(&pool, &customer, &employee).await;

        for (stage, pct) in [("Diagnosis", 80), ("Rework", 30)] {
            record(
                &pool,
                SubjectKind::Appointment,
                &appointment.id,
                &request(stage, pct, None),
                &employee,
            )
            .await
            .unwrap();
        }

        assert_eq!(
            latest_percentage(&pool, SubjectKind::Appointment, &appointment.id)
                .await
                .unwrap(),
            30
        );
        // (80 + 30) / 2 truncates to 55.
        assert_eq!(
            average_percentage(&pool, SubjectKind::Appointment, &appointment.id)
                .await
                .unwrap(),
            55
        );
    }

    #[actix_web::test]
    async fn empty_history_yields_zero_percentages() {
        let pool = testutil::pool().await;
        assert!(history(&pool, SubjectKind::Project, "none")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            latest_percentage(&pool, SubjectKind::Project, "none")
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            average_percentage(&pool, SubjectKind::Project, "none")
                .await
                .unwrap(),
            0
        );
    }

    #[actix_web::test]
    async fn completed_stage_finishes_an_upcoming_appointment() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;
        let employee = testutil::employee(&pool, "e1").await;
        let appointment = upcoming_appointment(&pool, &customer, &employee).await;
        assert_eq!(appointment.status, STATUS_UPCOMING);

        let (entry, event) = record(
            &pool,
            SubjectKind::Appointment,
            &appointment.id,
            &request("Completed", 100, Some("done")),
            &employee,
        )
        .await
        .unwrap();

        assert_eq!(entry.percentage, 100);
        assert_eq!(event.new_status.as_deref(), Some(STATUS_COMPLETED));
        assert_eq!(event.customer.as_ref().unwrap().user_id, customer);

        let updated = fetch_appointment(&pool, &appointment.id).await.unwrap().unwrap();
        assert_eq!(updated.status, STATUS_COMPLETED);
        assert_eq!(
            latest_percentage(&pool, SubjectKind::Appointment, &appointment.id)
                .await
                .unwrap(),
            100
        );
    }

    #[actix_web::test]
    async fn full_percentage_completes_regardless_of_stage_wording() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;
        let employee = testutil::employee(&pool, "e1").await;
        let appointment = upcoming_appointment(&pool, &customer, &employee).await;

        let (_, event) = record(
            &pool,
            SubjectKind::Appointment,
            &appointment.id,
            &request("Final polish", 100, None),
            &employee,
        )
        .await
        .unwrap();

        assert_eq!(event.new_status.as_deref(), Some(STATUS_COMPLETED));
    }

    #[actix_web::test]
    async fn unrecognised_stage_leaves_status_untouched() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;
        let employee = testutil::employee(&pool, "e1").await;
        let appointment = upcoming_appointment(&pool, &customer, &employee).await;

        let (_, event) = record(
            &pool,
            SubjectKind::Appointment,
            &appointment.id,
            &request("Waiting on parts", 40, None),
            &employee,
        )
        .await
        .unwrap();

        assert!(event.new_status.is_none());
        let unchanged = fetch_appointment(&pool, &appointment.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, STATUS_UPCOMING);
    }

    #[actix_web::test]
    async fn terminal_statuses_never_regress() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;
        let employee = testutil::employee(&pool, "e1").await;
        let appointment = upcoming_appointment(&pool, &customer, &employee).await;

        record(
            &pool,
            SubjectKind::Appointment,
            &appointment.id,
            &request("completed", 100, None),
            &employee,
        )
        .await
        .unwrap();

        // Recording a cancellation after completion still succeeds, but the
        // terminal status stands.
        let (_, event) = record(
            &pool,
            SubjectKind::Appointment,
            &appointment.id,
            &request("cancelled", 0, None),
            &employee,
        )
        .await
        .unwrap();

        assert!(event.new_status.is_none());
        let kept = fetch_appointment(&pool, &appointment.id).await.unwrap().unwrap();
        assert_eq!(kept.status, STATUS_COMPLETED);
        assert_eq!(
            history(&pool, SubjectKind::Appointment, &appointment.id)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[actix_web::test]
    async fn project_stage_vocabulary_maps_to_project_statuses() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;
        let employee = testutil::employee(&pool, "e1").await;
        let project = testutil::project(&pool, &customer, "Restoration", PROJECT_IN_PROGRESS).await;

        let (_, event) = record(
            &pool,
            SubjectKind::Project,
            &project,
            &request("Paused", 40, Some("waiting on parts")),
            &employee,
        )
        .await
        .unwrap();
        assert_eq!(event.new_status.as_deref(), Some(PROJECT_ON_HOLD));

        let (_, event) = record(
            &pool,
            SubjectKind::Project,
            &project,
            &request("in_progress", 45, None),
            &employee,
        )
        .await
        .unwrap();
        assert_eq!(event.new_status.as_deref(), Some(PROJECT_IN_PROGRESS));

        let (_, event) = record(
            &pool,
            SubjectKind::Project,
            &project,
            &request("Not Started", 0, None),
            &employee,
        )
        .await
        .unwrap();
        assert_eq!(event.new_status.as_deref(), Some(PROJECT_PLANNED));

        let entries = history(&pool, SubjectKind::Project, &project).await.unwrap();
        assert_eq!(entries.last().unwrap().percentage, 0);
        assert_eq!(entries.len(), 3);
    }

    #[actix_web::test]
    async fn freshly_created_project_advances_from_planned() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;
        let employee = testutil::employee(&pool, "e1").await;
        let project = crate::db::insert_project(&pool, &customer, "Restoration", None, None)
            .await
            .unwrap();

        let (_, event) = record(
            &pool,
            SubjectKind::Project,
            &project,
            &request("In Progress", 10, None),
            &employee,
        )
        .await
        .unwrap();

        assert_eq!(event.new_status.as_deref(), Some(PROJECT_IN_PROGRESS));
        assert_eq!(event.customer.as_ref().unwrap().user_id, customer);
        let updated = fetch_project(&pool, &project).await.unwrap().unwrap();
        assert_eq!(updated.status, PROJECT_IN_PROGRESS);
    }

    #[actix_web::test]
    async fn unknown_subject_still_persists_the_entry() {
        let pool = testutil::pool().await;
        let employee = testutil::employee(&pool, "e1").await;

        let (entry, event) = record(
            &pool,
            SubjectKind::Appointment,
            "no-such-appointment",
            &request("Inspection", 10, None),
            &employee,
        )
        .await
        .unwrap();

        assert_eq!(entry.subject_id, "no-such-appointment");
        assert!(event.new_status.is_none());
        assert!(event.customer.is_none());
        assert_eq!(
            history(&pool, SubjectKind::Appointment, "no-such-appointment")
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
