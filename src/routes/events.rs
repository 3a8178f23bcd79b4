use actix_web::{http::header, web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::{
    auth::employee_validator,
    error::ApiError,
    progress::SubjectKind,
    state::{AppState, ProgressEvent},
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/progress/{kind}/{id}/events")
            .wrap(HttpAuthentication::basic(employee_validator))
            .route(web::get().to(stream_progress_events)),
    );
}

/// Server-sent events for one subject's progress. Messages published while
/// nobody listens are simply gone; subscribers only see updates from the
/// moment they connect.
async fn stream_progress_events(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let (kind, subject_id) = path.into_inner();
    let kind = SubjectKind::from_path(&kind)?;

    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |result| {
        let event = match result {
            Ok(event) => event,
            Err(_) => return None,
        };
        if event.subject_kind != kind.as_str() || event.subject_id != subject_id {
            return None;
        }
        Some(Ok::<web::Bytes, actix_web::Error>(event_to_bytes(&event)))
    });

    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream))
}

fn event_to_bytes(event: &ProgressEvent) -> web::Bytes {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    web::Bytes::from(format!("event: progress\ndata: {}\n\n", payload))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{http::StatusCode, test, App};

    use super::*;
    use crate::notify::LogMailer;
    use crate::testutil;

    #[actix_web::test]
    async fn stream_requires_staff_credentials() {
        let pool = testutil::pool().await;
        testutil::employee(&pool, "e1").await;
        let state = AppState::new(pool, Arc::new(LogMailer));

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let anonymous = test::TestRequest::get()
            .uri("/progress/appointment/apt1/events")
            .to_request();
        let response = test::call_service(&app, anonymous).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // e1:password
        let staff = test::TestRequest::get()
            .uri("/progress/appointment/apt1/events")
            .insert_header((header::AUTHORIZATION, "Basic ZTE6cGFzc3dvcmQ="))
            .to_request();
        let response = test::call_service(&app, staff).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
