use actix_web::{web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::{
    assign,
    auth::{admin_validator, new_id, AuthUser},
    db::{fetch_user, insert_project, insert_user},
    error::{is_unique_violation, ApiError},
    models::{
        AppointmentRow, BlockedIntervalRow, ProjectRow, ROLE_CUSTOMER, ROLE_EMPLOYEE,
        STATUS_PENDING,
    },
    slots::{parse_date, validate_blocked_interval},
    state::AppState,
};

#[derive(Deserialize)]
struct AvailabilityQuery {
    date: String,
}

#[derive(Deserialize)]
struct AssignForm {
    employee_id: String,
}

#[derive(Deserialize)]
struct EmployeeCreateForm {
    username: String,
    display_name: String,
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct BlockedIntervalForm {
    date: String,
    start_time: String,
    end_time: String,
    reason: String,
}

#[derive(Deserialize)]
struct BlockedQuery {
    date: String,
}

#[derive(Deserialize)]
struct ProjectCreateForm {
    customer_id: String,
    name: String,
    description: Option<String>,
    start_date: Option<String>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .wrap(HttpAuthentication::basic(admin_validator))
            .service(
                web::resource("/appointments/pending").route(web::get().to(pending_appointments)),
            )
            .service(
                web::resource("/appointments/{id}/assign")
                    .route(web::put().to(assign_appointment)),
            )
            .service(
                web::resource("/employees/availability")
                    .route(web::get().to(employee_availability)),
            )
            .service(web::resource("/employees").route(web::post().to(create_employee)))
            .service(
                web::resource("/projects")
                    .route(web::get().to(list_projects))
                    .route(web::post().to(create_project)),
            )
            .service(
                web::resource("/blocked")
                    .route(web::get().to(list_blocked))
                    .route(web::post().to(create_blocked)),
            ),
    );
}

async fn pending_appointments(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let rows = sqlx::query_as::<_, AppointmentRow>(
        r#"SELECT id, customer_id, vehicle, service, date, start_time, end_time, status, employee_id, requested_at
           FROM appointments
           WHERE status = ?
           ORDER BY date, start_time"#,
    )
    .bind(STATUS_PENDING)
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}

async fn employee_availability(
    state: web::Data<AppState>,
    query: web::Query<AvailabilityQuery>,
) -> Result<HttpResponse, ApiError> {
    let report = assign::availability(&state.db, &query.date).await?;
    Ok(HttpResponse::Ok().json(report))
}

async fn assign_appointment(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
    form: web::Json<AssignForm>,
) -> Result<HttpResponse, ApiError> {
    let appointment_id = path.into_inner();
    let assigned = assign::assign(&state.db, &appointment_id, &form.employee_id).await?;

    log::info!(
        "{} assigned appointment {} to employee {}",
        auth.display_name,
        appointment_id,
        form.employee_id
    );
    Ok(HttpResponse::Ok().json(assigned))
}

async fn create_employee(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<EmployeeCreateForm>,
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
        ROLE_EMPLOYEE,
        &form.password,
    )
    .await;

    match result {
        Ok(id) => {
            log::info!("{} created employee {}", auth.display_name, form.username);
            Ok(HttpResponse::Created().json(json!({ "id": id })))
        }
        Err(err) if is_unique_violation(&err) => {
            Err(ApiError::validation("Username is already taken"))
        }
        Err(err) => Err(err.into()),
    }
}

async fn list_projects(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let rows = sqlx::query_as::<_, ProjectRow>(
        r#"SELECT id, customer_id, name, description, status, start_date, end_date
           FROM projects
           ORDER BY name"#,
    )
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}

async fn create_project(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<ProjectCreateForm>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    if form.name.trim().is_empty() {
        return Err(ApiError::validation("Project name is required"));
    }
    let start_date = match form.start_date.as_deref() {
        Some(value) => Some(parse_date(value)?.to_string()),
        None => None,
    };

    let customer = fetch_user(&state.db, &form.customer_id)
        .await?
        .filter(|user| user.role == ROLE_CUSTOMER)
        .ok_or_else(|| {
            ApiError::not_found(format!("Customer not found with id {}", form.customer_id))
        })?;

    let id = insert_project(
        &state.db,
        &customer.id,
        form.name.trim(),
        form.description.as_deref().map(str::trim),
        start_date.as_deref(),
    )
    .await?;

    log::info!(
        "{} created project {} for customer {}",
        auth.display_name,
        form.name.trim(),
        customer.username
    );
    Ok(HttpResponse::Created().json(json!({ "id": id })))
}

async fn list_blocked(
    state: web::Data<AppState>,
    query: web::Query<BlockedQuery>,
) -> Result<HttpResponse, ApiError> {
    let date = parse_date(&query.date)?.to_string();
    let rows = sqlx::query_as::<_, BlockedIntervalRow>(
        r#"SELECT id, date, start_time, end_time, reason, created_at
           FROM blocked_intervals
           WHERE date = ?
           ORDER BY start_time"#,
    )
    .bind(&date)
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}

async fn create_blocked(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<BlockedIntervalForm>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    let date = parse_date(&form.date)?.to_string();
    let (start, end) = validate_blocked_interval(&form.start_time, &form.end_time)?;
    if form.reason.trim().is_empty() {
        return Err(ApiError::validation("Reason is required"));
    }

    let id = new_id();
    sqlx::query(
        r#"INSERT INTO blocked_intervals (id, date, start_time, end_time, reason, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(&date)
    .bind(&start)
    .bind(&end)
    .bind(form.reason.trim())
    .bind(Utc::now().to_rfc3339())
    .execute(&state.db)
    .await?;

    log::info!(
        "{} blocked {} {}-{}: {}",
        auth.display_name,
        date,
        start,
        end,
        form.reason.trim()
    );
    Ok(HttpResponse::Created().json(json!({ "id": id })))
}
