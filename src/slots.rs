use std::collections::HashSet;

use chrono::{NaiveDate, NaiveTime, Timelike, Utc};
use sqlx::SqlitePool;

use crate::{
    auth::new_id,
    db::fetch_appointment,
    error::{is_unique_violation, ApiError},
    models::{
        AppointmentRow, BlockedIntervalRow, STATUS_CANCELLED, STATUS_COMPLETED, STATUS_PENDING,
        STATUS_UPCOMING,
    },
};

/// Business hours: 09:00-18:00 on a 30-minute grid, last bookable start 17:30.
const OPENING_MINUTE: u32 = 9 * 60;
const CLOSING_MINUTE: u32 = 18 * 60;
const SLOT_MINUTES: u32 = 30;

pub struct BookingRequest {
    pub vehicle: String,
    pub service: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub employee_id: Option<String>,
}

pub fn parse_date(value: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ApiError::validation(format!("Invalid date '{value}', expected YYYY-MM-DD")))
}

pub fn parse_time(value: &str) -> Result<NaiveTime, ApiError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|_| ApiError::validation(format!("Invalid time '{value}', expected HH:MM")))
}

fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

fn format_minute(minute: u32) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

fn slot_grid() -> impl Iterator<Item = u32> {
    (OPENING_MINUTE..CLOSING_MINUTE).step_by(SLOT_MINUTES as usize)
}

fn validate_slot_start(start: NaiveTime) -> Result<(), ApiError> {
    let minute = minute_of_day(start);
    if minute % SLOT_MINUTES != 0 {
        return Err(ApiError::validation(
            "Start time must fall on a 30-minute boundary",
        ));
    }
    if minute < OPENING_MINUTE || minute >= CLOSING_MINUTE {
        return Err(ApiError::validation(
            "Start time must be within business hours (09:00-17:30)",
        ));
    }
    Ok(())
}

/// Blocked intervals live on the same 30-minute grid as bookings, so both
/// boundaries must be aligned. Returns the normalized (start, end) pair.
pub fn validate_blocked_interval(
    start_time: &str,
    end_time: &str,
) -> Result<(String, String), ApiError> {
    let start = minute_of_day(parse_time(start_time)?);
    let end = minute_of_day(parse_time(end_time)?);
    if start % SLOT_MINUTES != 0 || end % SLOT_MINUTES != 0 {
        return Err(ApiError::validation(
            "Blocked interval boundaries must fall on a 30-minute mark",
        ));
    }
    if end <= start {
        return Err(ApiError::validation("End time must be after start time"));
    }
    Ok((format_minute(start), format_minute(end)))
}

async fn blocked_intervals_for(
    pool: &SqlitePool,
    date: &str,
) -> Result<Vec<BlockedIntervalRow>, sqlx::Error> {
    sqlx::query_as::<_, BlockedIntervalRow>(
        "SELECT id, date, start_time, end_time, reason, created_at FROM blocked_intervals WHERE date = ?",
    )
    .bind(date)
    .fetch_all(pool)
    .await
}

fn time_to_minute(value: &str) -> Option<u32> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .ok()
        .map(minute_of_day)
}

/// A slot start is blocked when it lies within [interval.start, interval.end).
fn start_is_blocked(minute: u32, intervals: &[BlockedIntervalRow]) -> bool {
    intervals.iter().any(|interval| {
        match (
            time_to_minute(&interval.start_time),
            time_to_minute(&interval.end_time),
        ) {
            (Some(from), Some(until)) => minute >= from && minute < until,
            _ => false,
        }
    })
}

/// Free slot starts for a date: the business-hours grid minus non-cancelled
/// appointment starts and blocked-interval cover. Returned sorted so the
/// HTTP payload is stable, though ordering is not part of the contract.
pub async fn available_slots(pool: &SqlitePool, date: &str) -> Result<Vec<String>, ApiError> {
    let date = parse_date(date)?.to_string();

    let booked: Vec<(String,)> = sqlx::query_as(
        "SELECT start_time FROM appointments WHERE date = ? AND status != ?",
    )
    .bind(&date)
    .bind(STATUS_CANCELLED)
    .fetch_all(pool)
    .await?;
    let booked: HashSet<String> = booked.into_iter().map(|(start,)| start).collect();

    let intervals = blocked_intervals_for(pool, &date).await?;

    let mut free: Vec<String> = slot_grid()
        .filter(|minute| {
            !booked.contains(&format_minute(*minute)) && !start_is_blocked(*minute, &intervals)
        })
        .map(format_minute)
        .collect();

    free.sort();
    Ok(free)
}

async fn slot_taken(
    pool: &SqlitePool,
    date: &str,
    start: &str,
    exclude_appointment: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM appointments WHERE date = ? AND start_time = ? AND status != ? AND id != ?",
    )
    .bind(date)
    .bind(start)
    .bind(STATUS_CANCELLED)
    .bind(exclude_appointment.unwrap_or(""))
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

async fn customer_holds_slot(
    pool: &SqlitePool,
    customer_id: &str,
    date: &str,
    start: &str,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM appointments WHERE customer_id = ? AND date = ? AND start_time = ? AND status != ?",
    )
    .bind(customer_id)
    .bind(date)
    .bind(start)
    .bind(STATUS_CANCELLED)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

fn validate_slot_request(
    date: &str,
    start_time: &str,
    end_time: &str,
) -> Result<(String, String, String), ApiError> {
    let date = parse_date(date)?;
    let start = parse_time(start_time)?;
    let end = parse_time(end_time)?;
    validate_slot_start(start)?;
    if end <= start {
        return Err(ApiError::validation("End time must be after start time"));
    }
    if minute_of_day(end) > CLOSING_MINUTE {
        return Err(ApiError::validation("End time must not exceed closing (18:00)"));
    }
    Ok((
        date.to_string(),
        format_minute(minute_of_day(start)),
        format_minute(minute_of_day(end)),
    ))
}

async fn ensure_slot_free(
    pool: &SqlitePool,
    date: &str,
    start: &str,
    exclude_appointment: Option<&str>,
) -> Result<(), ApiError> {
    if slot_taken(pool, date, start, exclude_appointment).await? {
        return Err(ApiError::slot_conflict(format!(
            "Slot {date} {start} is already booked"
        )));
    }
    let intervals = blocked_intervals_for(pool, date).await?;
    let start_minute = minute_of_day(parse_time(start)?);
    if start_is_blocked(start_minute, &intervals) {
        return Err(ApiError::slot_conflict(format!(
            "Slot {date} {start} is blocked"
        )));
    }
    Ok(())
}

/// Book a slot for a customer. Creates a pending appointment, or an upcoming
/// one when an employee is attached up front.
pub async fn book(
    pool: &SqlitePool,
    customer_id: &str,
    request: BookingRequest,
) -> Result<AppointmentRow, ApiError> {
    if request.vehicle.trim().is_empty() {
        return Err(ApiError::validation("Vehicle is required"));
    }
    if request.service.trim().is_empty() {
        return Err(ApiError::validation("Service is required"));
    }

    let (date, start, end) =
        validate_slot_request(&request.date, &request.start_time, &request.end_time)?;

    ensure_slot_free(pool, &date, &start, None).await?;
    if customer_holds_slot(pool, customer_id, &date, &start).await? {
        return Err(ApiError::slot_conflict(format!(
            "You already hold an appointment at {date} {start}"
        )));
    }

    let employee_id = request
        .employee_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let status = if employee_id.is_some() {
        STATUS_UPCOMING
    } else {
        STATUS_PENDING
    };

    let appointment_id = new_id();
    let now = Utc::now().to_rfc3339();
    let insert = sqlx::query(
        r#"INSERT INTO appointments
           (id, customer_id, vehicle, service, date, start_time, end_time, status, employee_id, requested_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&appointment_id)
    .bind(customer_id)
    .bind(request.vehicle.trim())
    .bind(request.service.trim())
    .bind(&date)
    .bind(&start)
    .bind(&end)
    .bind(status)
    .bind(&employee_id)
    .bind(&now)
    .execute(pool)
    .await;

    match insert {
        Ok(_) => {}
        // A concurrent booking won the race between our check and the insert.
        Err(err) if is_unique_violation(&err) => {
            return Err(ApiError::slot_conflict(format!(
                "Slot {date} {start} is already booked"
            )));
        }
        Err(err) => return Err(err.into()),
    }

    fetch_appointment(pool, &appointment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Appointment vanished after insert"))
}

/// Move an appointment to a new slot. Rescheduling to the appointment's own
/// current (date, start) always succeeds.
pub async fn reschedule(
    pool: &SqlitePool,
    appointment_id: &str,
    date: &str,
    start_time: &str,
    end_time: &str,
) -> Result<AppointmentRow, ApiError> {
    let appointment = fetch_appointment(pool, appointment_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("Appointment not found with id {appointment_id}"))
        })?;

    if appointment.status == STATUS_COMPLETED || appointment.status == STATUS_CANCELLED {
        return Err(ApiError::validation(format!(
            "Cannot reschedule a {} appointment",
            appointment.status
        )));
    }

    let (date, start, end) = validate_slot_request(date, start_time, end_time)?;

    let own_slot = appointment.date == date && appointment.start_time == start;
    if !own_slot {
        ensure_slot_free(pool, &date, &start, Some(appointment_id)).await?;
    }

    let update = sqlx::query(
        "UPDATE appointments SET date = ?, start_time = ?, end_time = ? WHERE id = ?",
    )
    .bind(&date)
    .bind(&start)
    .bind(&end)
    .bind(appointment_id)
    .execute(pool)
    .await;

    match update {
        Ok(_) => {}
        Err(err) if is_unique_violation(&err) => {
            return Err(ApiError::slot_conflict(format!(
                "Slot {date} {start} is already booked"
            )));
        }
        Err(err) => return Err(err.into()),
    }

    fetch_appointment(pool, appointment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Appointment vanished after update"))
}

/// Cancel an appointment, freeing its slot for others. Cancelling twice is a
/// no-op; a completed appointment cannot be cancelled.
pub async fn cancel(pool: &SqlitePool, appointment_id: &str) -> Result<AppointmentRow, ApiError> {
    let appointment = fetch_appointment(pool, appointment_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("Appointment not found with id {appointment_id}"))
        })?;

    if appointment.status == STATUS_CANCELLED {
        return Ok(appointment);
    }
    if appointment.status == STATUS_COMPLETED {
        return Err(ApiError::validation(
            "Cannot cancel a completed appointment",
        ));
    }

    sqlx::query("UPDATE appointments SET status = ? WHERE id = ?")
        .bind(STATUS_CANCELLED)
        .bind(appointment_id)
        .execute(pool)
        .await?;

    fetch_appointment(pool, appointment_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Appointment vanished after update"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn booking(date: &str, start: &str, end: &str) -> BookingRequest {
        BookingRequest {
            vehicle: "ABC-1234".to_string(),
            service: "Full Service".to_string(),
            date: date.to_string(),
            start_time: start.to_string(),
            end_time: end.to_string(),
            employee_id: None,
        }
    }

    #[actix_web::test]
    async fn booking_creates_pending_appointment() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;

        let appointment = book(&pool, &customer, booking("2025-06-10", "09:00", "09:30"))
            .await
            .unwrap();

        assert_eq!(appointment.status, STATUS_PENDING);
        assert_eq!(appointment.date, "2025-06-10");
        assert_eq!(appointment.start_time, "09:00");
        assert_eq!(appointment.employee_id, None);
    }

    #[actix_web::test]
    async fn booking_with_employee_is_upcoming() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;
        let employee = testutil::employee(&pool, "e1").await;

        let mut request = booking("2025-06-10", "10:00", "10:30");
        request.employee_id = Some(employee.clone());
        let appointment = book(&pool, &customer, request).await.unwrap();

        assert_eq!(appointment.status, STATUS_UPCOMING);
        assert_eq!(appointment.employee_id, Some(employee));
    }

    #[actix_web::test]
    async fn second_booking_for_same_slot_conflicts() {
        let pool = testutil::pool().await;
        let c1 = testutil::customer(&pool, "c1").await;
        let c2 = testutil::customer(&pool, "c2").await;

        book(&pool, &c1, booking("2025-06-10", "09:00", "09:30"))
            .await
            .unwrap();
        let err = book(&pool, &c2, booking("2025-06-10", "09:00", "09:30"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::SlotConflict(_)));

        let free = available_slots(&pool, "2025-06-10").await.unwrap();
        assert!(!free.contains(&"09:00".to_string()));
        assert!(free.contains(&"09:30".to_string()));
    }

    #[actix_web::test]
    async fn grid_covers_business_hours() {
        let pool = testutil::pool().await;
        let free = available_slots(&pool, "2025-06-10").await.unwrap();

        assert_eq!(free.len(), 18);
        assert_eq!(free.first().unwrap(), "09:00");
        assert_eq!(free.last().unwrap(), "17:30");
    }

    #[actix_web::test]
    async fn blocked_interval_removes_covered_starts() {
        let pool = testutil::pool().await;
        testutil::block(&pool, "2025-06-10", "10:00", "11:00", "maintenance").await;

        let free = available_slots(&pool, "2025-06-10").await.unwrap();

        // [10:00, 11:00) covers the 10:00 and 10:30 starts; 11:00 stays free.
        assert!(!free.contains(&"10:00".to_string()));
        assert!(!free.contains(&"10:30".to_string()));
        assert!(free.contains(&"11:00".to_string()));
    }

    #[test]
    fn blocked_interval_boundaries_must_align_with_the_grid() {
        for (start, end) in [("10:15", "11:00"), ("10:00", "10:45"), ("11:00", "10:00")] {
            let err = validate_blocked_interval(start, end).unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)), "{start}-{end}");
        }

        let (start, end) = validate_blocked_interval("10:00", "11:30").unwrap();
        assert_eq!(start, "10:00");
        assert_eq!(end, "11:30");
    }

    #[actix_web::test]
    async fn booking_into_blocked_interval_conflicts() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;
        testutil::block(&pool, "2025-06-10", "10:00", "11:00", "maintenance").await;

        let err = book(&pool, &customer, booking("2025-06-10", "10:30", "11:00"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SlotConflict(_)));
    }

    #[actix_web::test]
    async fn cancel_liberates_the_slot() {
        let pool = testutil::pool().await;
        let c1 = testutil::customer(&pool, "c1").await;
        let c2 = testutil::customer(&pool, "c2").await;

        let appointment = book(&pool, &c1, booking("2025-06-10", "09:00", "09:30"))
            .await
            .unwrap();
        let cancelled = cancel(&pool, &appointment.id).await.unwrap();
        assert_eq!(cancelled.status, STATUS_CANCELLED);

        // Cancelling again is a no-op.
        cancel(&pool, &appointment.id).await.unwrap();

        let rebooked = book(&pool, &c2, booking("2025-06-10", "09:00", "09:30"))
            .await
            .unwrap();
        assert_eq!(rebooked.status, STATUS_PENDING);
    }

    #[actix_web::test]
    async fn reschedule_to_own_slot_is_idempotent() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;

        let appointment = book(&pool, &customer, booking("2025-06-10", "09:00", "09:30"))
            .await
            .unwrap();
        let updated = reschedule(&pool, &appointment.id, "2025-06-10", "09:00", "10:00")
            .await
            .unwrap();

        assert_eq!(updated.start_time, "09:00");
        assert_eq!(updated.end_time, "10:00");
        assert_eq!(updated.status, appointment.status);
    }

    #[actix_web::test]
    async fn reschedule_into_taken_slot_conflicts() {
        let pool = testutil::pool().await;
        let c1 = testutil::customer(&pool, "c1").await;
        let c2 = testutil::customer(&pool, "c2").await;

        book(&pool, &c1, booking("2025-06-10", "09:00", "09:30"))
            .await
            .unwrap();
        let other = book(&pool, &c2, booking("2025-06-10", "11:00", "11:30"))
            .await
            .unwrap();

        let err = reschedule(&pool, &other.id, "2025-06-10", "09:00", "09:30")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SlotConflict(_)));
    }

    #[actix_web::test]
    async fn malformed_input_is_rejected_before_any_write() {
        let pool = testutil::pool().await;
        let customer = testutil::customer(&pool, "c1").await;

        for (date, start, end) in [
            ("not-a-date", "09:00", "09:30"),
            ("2025-06-10", "09:15", "09:45"),
            ("2025-06-10", "08:30", "09:00"),
            ("2025-06-10", "18:00", "18:30"),
            ("2025-06-10", "09:30", "09:00"),
        ] {
            let err = book(&pool, &customer, booking(date, start, end))
                .await
                .unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)), "{date} {start}");
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM appointments")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
