use actix_web::{web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use serde_json::json;

use crate::{
    auth::{employee_validator, AuthUser},
    error::ApiError,
    models::AppointmentRow,
    notify, progress,
    progress::{ProgressRequest, SubjectKind},
    state::AppState,
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/employee")
            .wrap(HttpAuthentication::basic(employee_validator))
            .service(web::resource("/appointments").route(web::get().to(my_appointments)))
            .service(
                web::resource("/progress/{kind}/{id}")
                    .route(web::put().to(record_progress))
                    .route(web::get().to(progress_history)),
            )
            .service(
                web::resource("/progress/{kind}/{id}/summary")
                    .route(web::get().to(progress_summary)),
            ),
    );
}

async fn my_appointments(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let rows = sqlx::query_as::<_, AppointmentRow>(
        r#"SELECT id, customer_id, vehicle, service, date, start_time, end_time, status, employee_id, requested_at
           FROM appointments
           WHERE employee_id = ?
           ORDER BY date, start_time"#,
    )
    .bind(&auth.id)
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(rows))
}

/// Record a progress entry and fan the update out. The fan-out runs after
/// the entry is committed and cannot fail the request.
async fn record_progress(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<(String, String)>,
    request: web::Json<ProgressRequest>,
) -> Result<HttpResponse, ApiError> {
    let (kind, subject_id) = path.into_inner();
    let kind = SubjectKind::from_path(&kind)?;

    log::info!(
        "Progress update for {} {} by {}: {} ({}%)",
        kind.as_str(),
        subject_id,
        auth.display_name,
        request.stage,
        request.percentage
    );

    let (entry, event) = progress::record(&state.db, kind, &subject_id, &request, &auth.id).await?;
    notify::dispatch(&state.db, &state.events, state.mailer.as_ref(), &event).await;

    Ok(HttpResponse::Created().json(entry))
}

async fn progress_history(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (kind, subject_id) = path.into_inner();
    let kind = SubjectKind::from_path(&kind)?;
    let entries = progress::history(&state.db, kind, &subject_id).await?;
    Ok(HttpResponse::Ok().json(entries))
}

async fn progress_summary(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (kind, subject_id) = path.into_inner();
    let kind = SubjectKind::from_path(&kind)?;
    let latest = progress::latest_percentage(&state.db, kind, &subject_id).await?;
    let average = progress::average_percentage(&state.db, kind, &subject_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "subject_kind": kind.as_str(),
        "subject_id": subject_id,
        "latest_percentage": latest,
        "average_percentage": average,
    })))
}
