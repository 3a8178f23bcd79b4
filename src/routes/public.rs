use actix_web::{web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::{customer_validator, AuthUser},
    db::{fetch_appointment, fetch_project, insert_user},
    error::{is_unique_violation, ApiError},
    models::{AppointmentRow, ProjectRow, ROLE_CUSTOMER},
    notify, progress,
    progress::SubjectKind,
    slots,
    state::AppState,
};

#[derive(Deserialize)]
struct SignupForm {
    username: String,
    display_name: String,
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct SlotQuery {
    date: String,
}

#[derive(Deserialize)]
struct BookingForm {
    vehicle: String,
    service: String,
    date: String,
    start_time: String,
    end_time: String,
    employee_id: Option<String>,
}

#[derive(Deserialize)]
struct RescheduleForm {
    date: String,
    start_time: String,
    end_time: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/signup").route(web::post().to(signup)))
        .service(web::resource("/slots").route(web::get().to(free_slots)))
        .service(
            web::scope("/appointments")
                .wrap(HttpAuthentication::basic(customer_validator))
                .service(
                    web::resource("")
                        .route(web::get().to(list_my_appointments))
                        .route(web::post().to(book_appointment)),
                )
                .service(web::resource("/{id}").route(web::get().to(appointment_detail)))
                .service(
                    web::resource("/{id}/reschedule")
                        .route(web::put().to(reschedule_appointment)),
                )
                .service(web::resource("/{id}/cancel").route(web::post().to(cancel_appointment)))
                .service(web::resource("/{id}/progress").route(web::get().to(appointment_progress))),
        )
        .service(
            web::scope("/projects")
                .wrap(HttpAuthentication::basic(customer_validator))
                .service(web::resource("").route(web::get().to(list_my_projects)))
                .service(web::resource("/{id}/progress").route(web::get().to(project_progress))),
        )
        .service(
            web::scope("/notifications")
                .wrap(HttpAuthentication::basic(customer_validator))
                .service(web::resource("").route(web::get().to(list_notifications)))
                .service(web::resource("/{id}/read").route(web::post().to(read_notification))),
        );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

async fn signup(
    state: web::Data<AppState>,
    form: web::Json<SignupForm>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    if form.username.trim().is_empty() {
        return Err(ApiError::validation("Username is required"));
    }
    if form.display_name.trim().is_empty() {
        return Err(ApiError::validation("Display name is required"));
    }
    if form.email.trim().is_empty() || !form.email.contains('@') {
        return Err(ApiError::validation("A valid email address is required"));
    }
    if form.password.trim().len() < 6 {
        return Err(ApiError::validation("Password must be at least 6 characters"));
    }

    let result = insert_user(
        &state.db,
        form.username.trim(),
        form.display_name.trim(),
        form.email.trim(),
        ROLE_CUSTOMER,
        &form.password,
    )
    .await;

    match result {
        Ok(id) => Ok(HttpResponse::Created().json(json!({ "id": id }))),
        Err(err) if is_unique_violation(&err) => {
            Err(ApiError::validation("Username is already taken"))
        }
        Err(err) => Err(err.into()),
    }
}

async fn free_slots(
    state: web::Data<AppState>,
    query: web::Query<SlotQuery>,
) -> Result<HttpResponse, ApiError> {
    let available = slots::available_slots(&state.db, &query.date).await?;
    Ok(HttpResponse::Ok().json(json!({ "date": query.date, "available": available })))
}

async fn book_appointment(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<BookingForm>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    let appointment = slots::book(
        &state.db,
        &auth.id,
        slots::BookingRequest {
            vehicle: form.vehicle,
            service: form.service,
            date: form.date,
            start_time: form.start_time,
            end_time: form.end_time,
            employee_id: form.employee_id,
        },
    )
    .await?;

    log::info!(
        "Appointment {} booked by {} for {} {}",
        appointment.id,
        auth.display_name,
        appointment.date,
        appointment.start_time
    );
    Ok(HttpResponse::Created().json(appointment))
}

async fn list_my_appointments(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let rows = sqlx::query_as::<_, AppointmentRow>(
        r#"SELECT id, customer_id, vehicle, service, date, start_time, end_time, status, employee_id, requested_at
           FROM appointments
           WHERE customer_id = ?
           ORDER BY date, start_time"#,
    )
    .bind(&auth.id)
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}

/// Fetch an appointment the caller owns; anyone else sees a 404.
async fn owned_appointment(
    state: &AppState,
    appointment_id: &str,
    customer_id: &str,
) -> Result<AppointmentRow, ApiError> {
    let appointment = fetch_appointment(&state.db, appointment_id)
        .await?
        .filter(|appointment| appointment.customer_id == customer_id);
    appointment.ok_or_else(|| {
        ApiError::not_found(format!("Appointment not found with id {appointment_id}"))
    })
}

async fn appointment_detail(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let appointment = owned_appointment(&state, &path.into_inner(), &auth.id).await?;
    Ok(HttpResponse::Ok().json(appointment))
}

async fn reschedule_appointment(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
    form: web::Json<RescheduleForm>,
) -> Result<HttpResponse, ApiError> {
    let appointment_id = path.into_inner();
    owned_appointment(&state, &appointment_id, &auth.id).await?;

    let updated = slots::reschedule(
        &state.db,
        &appointment_id,
        &form.date,
        &form.start_time,
        &form.end_time,
    )
    .await?;
    Ok(HttpResponse::Ok().json(updated))
}

async fn cancel_appointment(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let appointment_id = path.into_inner();
    owned_appointment(&state, &appointment_id, &auth.id).await?;

    let cancelled = slots::cancel(&state.db, &appointment_id).await?;
    log::info!("Appointment {appointment_id} cancelled by {}", auth.display_name);
    Ok(HttpResponse::Ok().json(cancelled))
}

async fn appointment_progress(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let appointment_id = path.into_inner();
    owned_appointment(&state, &appointment_id, &auth.id).await?;

    let entries = progress::history(&state.db, SubjectKind::Appointment, &appointment_id).await?;
    let latest = progress::latest_percentage(&state.db, SubjectKind::Appointment, &appointment_id)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "entries": entries, "latest_percentage": latest })))
}

async fn list_my_projects(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let rows = sqlx::query_as::<_, ProjectRow>(
        r#"SELECT id, customer_id, name, description, status, start_date, end_date
           FROM projects
           WHERE customer_id = ?
           ORDER BY name"#,
    )
    .bind(&auth.id)
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}

async fn project_progress(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let project_id = path.into_inner();
    fetch_project(&state.db, &project_id)
        .await?
        .filter(|project| project.customer_id == auth.id)
        .ok_or_else(|| ApiError::not_found(format!("Project not found with id {project_id}")))?;

    let entries = progress::history(&state.db, SubjectKind::Project, &project_id).await?;
    let latest = progress::latest_percentage(&state.db, SubjectKind::Project, &project_id).await?;
    Ok(HttpResponse::Ok().json(json!({ "entries": entries, "latest_percentage": latest })))
}

async fn list_notifications(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let rows = notify::notifications_for_user(&state.db, &auth.id).await?;
    Ok(HttpResponse::Ok().json(rows))
}

async fn read_notification(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    notify::mark_read(&state.db, &auth.id, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}
