use serde::Serialize;
use sqlx::SqlitePool;

use crate::{
    db::{fetch_appointment, fetch_user},
    error::ApiError,
    models::{
        AppointmentRow, UserRow, ROLE_ADMIN, ROLE_EMPLOYEE, STATUS_CANCELLED, STATUS_COMPLETED,
        STATUS_UPCOMING,
    },
    slots::parse_date,
};

/// An employee is considered available while they hold fewer than this many
/// non-cancelled appointments on a given day. Advisory only: manual
/// assignment may exceed it.
const AVAILABILITY_THRESHOLD: i64 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct EmployeeAvailability {
    pub employee_id: String,
    pub display_name: String,
    pub email: String,
    pub role: String,
    pub appointment_count: i64,
    pub available: bool,
}

/// Per-employee load for a date: non-cancelled appointment count and the
/// advisory availability flag. No ordering guarantee.
pub async fn availability(
    pool: &SqlitePool,
    date: &str,
) -> Result<Vec<EmployeeAvailability>, ApiError> {
    let date = parse_date(date)?.to_string();

    let staff = sqlx::query_as::<_, UserRow>(
        r#"SELECT id, username, display_name, email, role, password_hash, active, joined_date, created_at
           FROM users
           WHERE role IN (?, ?) AND active = 1"#,
    )
    .bind(ROLE_EMPLOYEE)
    .bind(ROLE_ADMIN)
    .fetch_all(pool)
    .await?;

    let mut result = Vec::with_capacity(staff.len());
    for user in staff {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM appointments WHERE employee_id = ? AND date = ? AND status != ?",
        )
        .bind(&user.id)
        .bind(&date)
        .bind(STATUS_CANCELLED)
        .fetch_one(pool)
        .await?;

        result.push(EmployeeAvailability {
            employee_id: user.id,
            display_name: user.display_name,
            email: user.email,
            role: user.role,
            appointment_count: count,
            available: count < AVAILABILITY_THRESHOLD,
        });
    }

    Ok(result)
}

/// Attach an employee to an appointment, advancing pending appointments to
/// upcoming. Re-assignment of an upcoming appointment overwrites the
/// employee without checking their load.
pub async fn assign(
    pool: &SqlitePool,
    appointment_id: &str,
    employee_id: &str,
) -> Result<AppointmentRow, ApiError> {
    let appointment = fetch_appointment(pool, appointment_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("Appointment not found with id {appointment_id}"))
        })?;

    let employee = fetch_user(pool, employee_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Employee not found with id {employee_id}")))?;
    if employee.role != ROLE_EMPLOYEE && employee.role != ROLE_ADMIN {
        return Err(ApiError::not_found(format!(
            "Employee not found with id {employee_id}"
        )));
    }

    if appointment.status == STATUS_COMPLETED || appointment.status == STATUS_CANCELLED {
        return Err(ApiError::validation(format!(
            "Cannot assign a {} appointment",
            appointment.status
        )));
    }

    sqlx::query("UPDATE appointments SET employee_id = ?, status = ? WHERE id = ?")
        .bind(employee_id)
        .bind(STATUS_UPCOMING)
        .bind(appointment_id)
        .execute(pool)
        .await?;

    fetch_appointment(pool, appointment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Appointment vanished after update"))
}
