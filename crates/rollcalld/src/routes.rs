//! HTTP surface of the daemon.

use crate::stream::{self, StreamContext};
use axum::body::Body;
use axum::extract::rejection::FormRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use rollcall_hw::{CameraError, CameraSlot};
use rollcall_store::{SessionController, SessionDetail, SessionSummary, Status, StoreError};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const DEFAULT_OPERATOR: &str = "operator";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("camera is in use by another stream")]
    CameraBusy,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            StoreError::InvalidStatus(_) | StoreError::Conflict(_) => Self::BadRequest(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CameraError> for ApiError {
    fn from(err: CameraError) -> Self {
        match err {
            CameraError::DeviceBusy => Self::CameraBusy,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::CameraBusy => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub stream: StreamContext,
    pub camera: CameraSlot,
}

impl AppState {
    fn controller(&self) -> &SessionController {
        &self.stream.controller
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/classrooms/:classroom_id/start", post(start_session))
        .route("/sessions/:session_id", get(session_detail))
        .route("/sessions/:session_id/take", get(take_attendance))
        .route("/sessions/:session_id/video", get(video_feed))
        .route("/sessions/:session_id/end", post(end_session))
        .route("/sessions/:session_id/status", get(session_status))
        .route("/records/:record_id/update", post(update_record_status).get(update_record_wrong_method))
        .route("/reports", get(reports))
        .with_state(state)
}

/// Run a store call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("store task failed: {e}")))?
        .map_err(ApiError::from)
}

#[derive(Deserialize)]
struct StartForm {
    #[serde(default)]
    taken_by: Option<String>,
}

async fn start_session(
    State(state): State<AppState>,
    Path(classroom_id): Path<i64>,
    Form(form): Form<StartForm>,
) -> Result<Redirect, ApiError> {
    let taken_by = form
        .taken_by
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_OPERATOR.to_string());
    let controller = state.controller().clone();
    let session = blocking(move || controller.start(classroom_id, &taken_by)).await?;
    Ok(Redirect::to(&format!("/sessions/{}/take", session.id)))
}

async fn take_attendance(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<Html<String>, ApiError> {
    let controller = state.controller().clone();
    let session = blocking(move || controller.session(session_id)).await?;
    Ok(Html(format!(
        "<!doctype html>\n<html><head><title>Attendance session {id}</title></head>\n<body>\n\
         <img src=\"/sessions/{id}/video\" alt=\"live\">\n\
         <form method=\"post\" action=\"/sessions/{id}/end\"><button>End session</button></form>\n\
         <ul id=\"present\"></ul>\n\
         <script>setInterval(async () => {{\n\
           const r = await fetch('/sessions/{id}/status');\n\
           const d = await r.json();\n\
           document.getElementById('present').innerHTML =\n\
             d.present_students.map(s => `<li>${{s.roll_no}} ${{s.name}}</li>`).join('');\n\
         }}, 2000);</script>\n</body></html>\n",
        id = session.id
    )))
}

async fn video_feed(State(state): State<AppState>, Path(session_id): Path<i64>) -> Result<Response, ApiError> {
    let controller = state.controller().clone();
    if blocking(move || controller.is_closed(session_id)).await? {
        return Err(ApiError::BadRequest(format!("session {session_id} is closed")));
    }

    let lease = state.camera.try_acquire()?;
    let rx = stream::spawn_stream(state.stream.clone(), lease, session_id)
        .map_err(|e| ApiError::Internal(format!("cannot start stream thread: {e}")))?;

    let parts = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|part| (Ok::<_, std::io::Error>(part), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, stream::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(parts))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn end_session(State(state): State<AppState>, Path(session_id): Path<i64>) -> Result<Redirect, ApiError> {
    let controller = state.controller().clone();
    let session = blocking(move || controller.close(session_id)).await?;
    Ok(Redirect::to(&format!("/sessions/{}", session.id)))
}

async fn session_detail(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<Json<SessionDetail>, ApiError> {
    let controller = state.controller().clone();
    Ok(Json(blocking(move || controller.session_detail(session_id)).await?))
}

async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let controller = state.controller().clone();
    let present = blocking(move || {
        controller.session(session_id)?;
        controller.present_students(session_id)
    })
    .await?;
    Ok(Json(json!({ "present_students": present })))
}

#[derive(Deserialize)]
struct UpdateForm {
    status: Option<String>,
}

fn update_failed(status: StatusCode) -> Response {
    (status, Json(json!({ "success": false }))).into_response()
}

async fn update_record_status(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
    form: Result<Form<UpdateForm>, FormRejection>,
) -> Response {
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            tracing::debug!(record = record_id, %rejection, "unreadable status form");
            return update_failed(StatusCode::BAD_REQUEST);
        }
    };
    let Some(Ok(status)) = form.status.as_deref().map(str::parse::<Status>) else {
        return update_failed(StatusCode::BAD_REQUEST);
    };
    let controller = state.controller().clone();
    match blocking(move || controller.override_status(record_id, status)).await {
        Ok(_) => Json(json!({ "success": true })).into_response(),
        Err(ApiError::NotFound(_)) => update_failed(StatusCode::NOT_FOUND),
        Err(err) => {
            tracing::error!(record = record_id, error = %err, "status override failed");
            update_failed(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn update_record_wrong_method() -> Response {
    update_failed(StatusCode::BAD_REQUEST)
}

async fn reports(State(state): State<AppState>) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let controller = state.controller().clone();
    Ok(Json(blocking(move || controller.session_summaries()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use image::RgbImage;
    use rollcall_core::testing::{engine, paint};
    use rollcall_core::{Annotator, Embedding, FrameRecognizer, RecognitionConfig};
    use rollcall_hw::testing::ScriptedSource;
    use rollcall_store::{EmbeddingStore, NewStudent, Store};
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    const FORM: &str = "application/x-www-form-urlencoded";

    struct Fixture {
        _dir: tempfile::TempDir,
        state: AppState,
        classroom: i64,
        students: Vec<i64>,
    }

    fn face(color: [u8; 3]) -> RgbImage {
        let mut img = RgbImage::new(32, 24);
        paint(&mut img, 4, 4, 8, 8, color);
        img
    }

    /// Classroom "CSE-1" with students A, B, C whose embeddings are pure
    /// red, green, and blue.
    fn fixture(frames: Vec<RgbImage>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let classroom = store.create_classroom("CSE-1").unwrap().id;
        let embeddings = EmbeddingStore::new(dir.path(), "mean_rgb");
        let students = [("A", [1.0, 0.0, 0.0]), ("B", [0.0, 1.0, 0.0]), ("C", [0.0, 0.0, 1.0])]
            .iter()
            .map(|(roll, v)| {
                let s = store
                    .create_student(&NewStudent {
                        roll_no: roll.to_string(),
                        name: format!("Student {roll}"),
                        classroom_id: classroom,
                        photo: None,
                    })
                    .unwrap();
                embeddings.upsert(s.id, &Embedding::new(v.to_vec())).unwrap();
                s.id
            })
            .collect();

        let state = AppState {
            stream: StreamContext {
                engine: Arc::new(Mutex::new(engine())),
                recognizer: Arc::new(FrameRecognizer::new(RecognitionConfig::default(), Annotator::default())),
                embeddings,
                controller: SessionController::new(store),
                jpeg_quality: 80,
            },
            camera: CameraSlot::new(ScriptedSource::new(frames)),
        };
        Fixture { _dir: dir, state, classroom, students }
    }

    async fn send(fx: &Fixture, req: Request<Body>) -> Response {
        router(fx.state.clone()).oneshot(req).await.unwrap()
    }

    fn post_form(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri).header(header::CONTENT_TYPE, FORM).body(Body::from(body.to_string())).unwrap()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    async fn start(fx: &Fixture) -> i64 {
        let resp = send(fx, post_form(&format!("/classrooms/{}/start", fx.classroom), "taken_by=jdoe")).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let location = resp.headers()[header::LOCATION].to_str().unwrap().to_string();
        location
            .trim_start_matches("/sessions/")
            .trim_end_matches("/take")
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_seeds_absent_and_redirects() {
        let fx = fixture(vec![]);
        let session = start(&fx).await;

        let resp = send(&fx, Request::get(format!("/sessions/{session}/status")).body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "present_students": [] }));

        let records = fx.state.stream.controller.records(session).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == Status::Absent));
    }

    #[tokio::test]
    async fn test_start_unknown_classroom_is_404() {
        let fx = fixture(vec![]);
        let resp = send(&fx, post_form("/classrooms/999/start", "")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_end_to_end_classroom_walkthrough() {
        let blank = RgbImage::new(32, 24);
        let fx = fixture(vec![face([255, 0, 0]), blank.clone(), blank, face([0, 255, 0])]);
        let session = start(&fx).await;

        let resp = send(&fx, Request::get(format!("/sessions/{session}/video")).body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "multipart/x-mixed-replace; boundary=frame");
        let body = body_bytes(resp).await;
        let head = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        assert!(body.starts_with(head));
        assert_eq!(body.windows(head.len()).filter(|w| *w == head).count(), 4);
        assert!(!fx.state.camera.is_busy());

        let resp = send(&fx, Request::get(format!("/sessions/{session}/status")).body(Body::empty()).unwrap()).await;
        let present = body_json(resp).await["present_students"].clone();
        let rolls: Vec<_> = present.as_array().unwrap().iter().map(|p| p["roll_no"].as_str().unwrap()).collect();
        assert_eq!(rolls, vec!["A", "B"]);

        let records = fx.state.stream.controller.records(session).unwrap();
        let c = records.iter().find(|r| r.student_id == fx.students[2]).unwrap();
        assert_eq!(c.status, Status::Absent);
    }

    #[tokio::test]
    async fn test_video_while_camera_busy_is_409() {
        let fx = fixture(vec![face([255, 0, 0])]);
        let session = start(&fx).await;
        let _held = fx.state.camera.try_acquire().unwrap();

        let resp = send(&fx, Request::get(format!("/sessions/{session}/video")).body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_end_session_redirects_to_detail() {
        let fx = fixture(vec![]);
        let session = start(&fx).await;

        let resp = send(&fx, post_form(&format!("/sessions/{session}/end"), "")).await;
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()[header::LOCATION], format!("/sessions/{session}").as_str());
        assert!(fx.state.stream.controller.is_closed(session).unwrap());

        let resp = send(&fx, Request::get(format!("/sessions/{session}")).body(Body::empty()).unwrap()).await;
        let detail = body_json(resp).await;
        assert_eq!(detail["absent"], 3);
        assert_eq!(detail["records"].as_array().unwrap().len(), 3);

        let resp = send(&fx, Request::get(format!("/sessions/{session}/video")).body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_record_status() {
        let fx = fixture(vec![]);
        let session = start(&fx).await;
        let record = fx.state.stream.controller.records(session).unwrap()[0].id;

        let resp = send(&fx, post_form(&format!("/records/{record}/update"), "status=PRESENT")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "success": true }));
        assert_eq!(fx.state.stream.controller.present_students(session).unwrap().len(), 1);

        let resp = send(&fx, post_form(&format!("/records/{record}/update"), "status=LATE")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await, json!({ "success": false }));

        let resp = send(&fx, post_form("/records/9999/update", "status=ABSENT")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send(&fx, Request::get(format!("/records/{record}/update")).body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_record_without_form_body_is_json_400() {
        let fx = fixture(vec![]);
        let session = start(&fx).await;
        let record = fx.state.stream.controller.records(session).unwrap()[0].id;
        let uri = format!("/records/{record}/update");

        let bare = Request::post(&uri).body(Body::from("status=PRESENT")).unwrap();
        let json_body = Request::post(&uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"status":"PRESENT"}"#))
            .unwrap();
        for req in [bare, json_body] {
            let resp = send(&fx, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(resp).await, json!({ "success": false }));
        }
        assert!(fx.state.stream.controller.present_students(session).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reports_newest_first() {
        let fx = fixture(vec![]);
        let first = start(&fx).await;
        let second = start(&fx).await;

        let resp = send(&fx, Request::get("/reports").body(Body::empty()).unwrap()).await;
        let list = body_json(resp).await;
        let ids: Vec<_> = list.as_array().unwrap().iter().map(|s| s["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![second, first]);
        assert_eq!(list[0]["absent"], 3);
        assert_eq!(list[0]["classroom"], "CSE-1");
    }

    #[tokio::test]
    async fn test_take_page_embeds_video() {
        let fx = fixture(vec![]);
        let session = start(&fx).await;
        let resp = send(&fx, Request::get(format!("/sessions/{session}/take")).body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let html = String::from_utf8(body_bytes(resp).await).unwrap();
        assert!(html.contains(&format!("/sessions/{session}/video")));

        let resp = send(&fx, Request::get("/sessions/999/take").body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
