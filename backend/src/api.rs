use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{
    error::BlockingError,
    get,
    http::{header, StatusCode},
    middleware::Logger,
    post,
    web::{self, Data},
    App, HttpRequest, HttpResponse, HttpServer, Responder, ResponseError,
};
use common::req::{
    ActivateRequest, BatchUpload, CommandResponse, ErrorResponse, IngestResponse, SessionDetail,
    SessionInfo, SessionList, SingleUpload,
};
use log::{error, warn};

use crate::auth::DeviceDirectory;
use crate::config::Config;
use crate::error::CoreError;
use crate::ingest::IngestOutcome;
use crate::service::Service;
use crate::session::{DEFAULT_DURATION_SEC, DEFAULT_PAGE_LIMIT};

pub const AUTH_HEADER: &str = "X-Auth-Token";

pub struct AppState {
    pub service: Arc<Service>,
    pub devices: Arc<dyn DeviceDirectory>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("blocking task failed")]
    Blocking(#[from] BlockingError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Core(CoreError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Core(CoreError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Core(CoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Core(CoreError::Persistence(_)) | Self::Blocking(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error = match self {
            Self::Core(CoreError::Validation(msg))
            | Self::Core(CoreError::Conflict(msg))
            | Self::Core(CoreError::NotFound(msg)) => msg.clone(),
            Self::Core(CoreError::Persistence(_)) | Self::Blocking(_) => {
                error!("{self}");
                "internal".to_owned()
            }
            Self::Unauthorized => "unauthorized".to_owned(),
            Self::Forbidden => "forbidden".to_owned(),
        };
        HttpResponse::build(self.status_code()).json(ErrorResponse { error })
    }
}

fn invalid(msg: impl Into<String>) -> ApiError {
    ApiError::Core(CoreError::validation(msg))
}

fn auth_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}

/// Resolves the calling device from its token header.
async fn authenticate(req: &HttpRequest, state: &AppState) -> Result<String, ApiError> {
    let token = auth_token(req).ok_or(ApiError::Unauthorized)?;
    let devices = state.devices.clone();
    let device_id = web::block(move || devices.verify(&token)).await??;
    device_id.ok_or_else(|| {
        warn!("rejected token from {:?}", req.peer_addr());
        ApiError::Unauthorized
    })
}

fn require_loopback(req: &HttpRequest) -> Result<(), ApiError> {
    match req.peer_addr() {
        Some(addr) if addr.ip().is_loopback() => Ok(()),
        _ => Err(ApiError::Forbidden),
    }
}

fn ingest_response(outcome: IngestOutcome) -> HttpResponse {
    HttpResponse::Created().json(IngestResponse {
        ok: true,
        inserted: outcome.inserted,
        session_closed: outcome.session_closed,
    })
}

fn session_id_of(id: Option<i64>) -> Result<i64, ApiError> {
    match id {
        Some(id) if id > 0 => Ok(id),
        _ => Err(invalid("invalid payload: session_id")),
    }
}

#[get("/")]
async fn hello() -> impl Responder {
    HttpResponse::Ok().body("backend")
}

#[get("/command")]
async fn device_command(
    req: HttpRequest,
    state: Data<AppState>,
) -> Result<web::Json<CommandResponse>, ApiError> {
    let device_id = authenticate(&req, &state).await?;
    let service = state.service.clone();
    let command = web::block(move || service.command(&device_id)).await??;
    Ok(web::Json(command.to_response()))
}

#[derive(serde::Deserialize, Debug)]
struct AdminCommandQuery {
    device_id: String,
}

#[get("/admin/command")]
async fn admin_command(
    req: HttpRequest,
    query: web::Query<AdminCommandQuery>,
    state: Data<AppState>,
) -> Result<web::Json<CommandResponse>, ApiError> {
    require_loopback(&req)?;
    let device_id = query.into_inner().device_id;

    let devices = state.devices.clone();
    let service = state.service.clone();
    let command = web::block(move || {
        if !devices.exists(&device_id)? {
            return Err(CoreError::not_found(format!("unknown device {device_id}")));
        }
        service.command(&device_id)
    })
    .await??;
    Ok(web::Json(command.to_response()))
}

/// Sessions are opened by an operator on the host, on behalf of a device.
#[post("/activate")]
async fn activate(
    req: HttpRequest,
    body: web::Bytes,
    state: Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    require_loopback(&req)?;
    let device_id = authenticate(&req, &state).await?;

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ActivateRequest::default()
    } else {
        serde_json::from_slice::<ActivateRequest>(&body)
            .map_err(|e| invalid(format!("invalid payload: {e}")))?
    };
    let duration_sec = request.duration_sec.unwrap_or(DEFAULT_DURATION_SEC);

    let service = state.service.clone();
    let session = web::block(move || service.create_session(&device_id, duration_sec)).await??;
    Ok(HttpResponse::Created().json(session.to_info()))
}

#[derive(serde::Deserialize, Debug)]
struct ListQuery {
    filter_device_id: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[get("/session")]
async fn list_sessions(
    query: web::Query<ListQuery>,
    state: Data<AppState>,
) -> Result<web::Json<SessionList>, ApiError> {
    let query = query.into_inner();
    let filter = query.filter_device_id.filter(|d| !d.is_empty());
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let service = state.service.clone();
    let page = web::block(move || service.list_sessions(filter.as_deref(), limit, offset)).await??;
    Ok(web::Json(SessionList {
        items: page.items.iter().map(|s| s.to_info()).collect::<Vec<SessionInfo>>(),
        total: page.total,
        limit: page.limit,
    }))
}

#[post("/session")]
async fn upload_batch(
    req: HttpRequest,
    body: web::Json<BatchUpload>,
    state: Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let device_id = authenticate(&req, &state).await?;
    let body = body.into_inner();
    let session_id = session_id_of(body.session_id)?;
    let readings = body
        .readings
        .ok_or_else(|| invalid("invalid payload: readings"))?;

    let service = state.service.clone();
    let outcome =
        web::block(move || service.ingest_batch(session_id, &device_id, &readings)).await??;
    Ok(ingest_response(outcome))
}

#[post("/session/reading")]
async fn upload_reading(
    req: HttpRequest,
    body: web::Json<SingleUpload>,
    state: Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let device_id = authenticate(&req, &state).await?;
    let body = body.into_inner();
    let session_id = session_id_of(body.session_id)?;

    let service = state.service.clone();
    let outcome =
        web::block(move || service.ingest_single(session_id, &device_id, &body.reading)).await??;
    Ok(ingest_response(outcome))
}

#[derive(serde::Deserialize, Debug)]
struct LastQuery {
    device_id: Option<String>,
}

#[get("/session/last")]
async fn last_session(
    query: web::Query<LastQuery>,
    state: Data<AppState>,
) -> Result<web::Json<SessionDetail>, ApiError> {
    let filter = query.into_inner().device_id.filter(|d| !d.is_empty());

    let service = state.service.clone();
    let report = web::block(move || service.last_finished(filter.as_deref()))
        .await??
        .ok_or_else(|| ApiError::Core(CoreError::not_found("no finished session")))?;
    Ok(web::Json(report.to_response()))
}

#[get("/session/{id}")]
async fn session_detail(
    path: web::Path<i64>,
    state: Data<AppState>,
) -> Result<web::Json<SessionDetail>, ApiError> {
    let session_id = path.into_inner();
    let service = state.service.clone();
    let report = web::block(move || service.session_detail(session_id)).await??;
    Ok(web::Json(report.to_response()))
}

/// Routes plus extractor configs. `/session/last` must precede `/session/{id}`.
pub fn configure(cfg: &mut web::ServiceConfig, state: Data<AppState>) {
    cfg.app_data(state)
        .app_data(web::JsonConfig::default().error_handler(|err, _req| {
            invalid(format!("invalid payload: {err}")).into()
        }))
        .app_data(web::QueryConfig::default().error_handler(|err, _req| {
            invalid(format!("invalid query: {err}")).into()
        }))
        .app_data(web::PathConfig::default().error_handler(|err, _req| {
            invalid(format!("invalid path: {err}")).into()
        }))
        .service(hello)
        .service(device_command)
        .service(admin_command)
        .service(activate)
        .service(list_sessions)
        .service(upload_batch)
        .service(upload_reading)
        .service(last_session)
        .service(session_detail);
}

fn cors(origin: Option<&str>) -> Cors {
    let cors = match origin {
        Some(origin) => Cors::default().allowed_origin(origin),
        None => Cors::default().allow_any_origin(),
    };
    cors.allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![header::CONTENT_TYPE, header::ACCEPT])
        .allowed_header(AUTH_HEADER)
        .max_age(86400)
}

pub async fn new_http_server(state: Data<AppState>, config: &Config) -> std::io::Result<()> {
    let cors_origin = config.cors_origin.clone();
    HttpServer::new(move || {
        let state = state.clone();
        App::new()
            .configure(|cfg| configure(cfg, state))
            .wrap(cors(cors_origin.as_deref()))
            .wrap(Logger::default())
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use actix_web::{body::MessageBody, dev::ServiceResponse, test};
    use chrono::{DateTime, TimeZone, Utc};
    use common::req::Reading;

    use super::*;
    use crate::auth::{register_device, SqlDeviceDirectory};
    use crate::clock::ManualClock;
    use crate::db::Db;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 20, 16, 30, 0).unwrap()
    }

    fn state() -> Data<AppState> {
        let mut db = Db::in_memory().unwrap();
        register_device(db.conn(), "dev-a", "tok-a").unwrap();
        register_device(db.conn(), "dev-b", "tok-b").unwrap();
        let db = Arc::new(Mutex::new(db));

        let clock = Arc::new(ManualClock::new(start()));
        Data::new(AppState {
            service: Arc::new(Service::new(db.clone(), clock)),
            devices: Arc::new(SqlDeviceDirectory::new(db)),
        })
    }

    fn local_peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn batch() -> Vec<Reading> {
        (0..60)
            .map(|seq| Reading::new(seq, 1_697_382_000_000 + seq * 1000, 1.0 + seq as f64, 500))
            .collect()
    }

    async fn error_of<B: MessageBody>(resp: ServiceResponse<B>) -> String {
        let body: ErrorResponse = test::read_body_json(resp).await;
        body.error
    }

    macro_rules! app {
        ($state:expr) => {{
            let state = $state.clone();
            test::init_service(App::new().configure(move |cfg| configure(cfg, state))).await
        }};
    }

    #[actix_web::test]
    async fn command_requires_token() {
        let app = app!(state());

        let req = test::TestRequest::get().uri("/command").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::get()
            .uri("/command")
            .insert_header((AUTH_HEADER, "nope"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_of(resp).await, "unauthorized");

        let req = test::TestRequest::get()
            .uri("/command")
            .insert_header((AUTH_HEADER, " tok-a "))
            .to_request();
        let resp: CommandResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp, CommandResponse::Idle);
    }

    #[actix_web::test]
    async fn activate_then_command() {
        let app = app!(state());

        let req = test::TestRequest::post()
            .uri("/activate")
            .peer_addr(local_peer())
            .insert_header((AUTH_HEADER, "tok-a"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let session: SessionInfo = test::read_body_json(resp).await;
        assert_eq!(session.device_id, "dev-a");
        assert_eq!(session.started_at, "2025-10-20T16:30:00.000Z");
        assert_eq!(session.active_until, "2025-10-20T16:35:00.000Z");

        let req = test::TestRequest::get()
            .uri("/command")
            .insert_header((AUTH_HEADER, "tok-a"))
            .to_request();
        let resp: CommandResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(
            resp,
            CommandResponse::Start {
                session_id: session.session_id,
                expires_at: "2025-10-20T16:35:00.000Z".to_owned(),
            }
        );

        // other devices are unaffected
        let req = test::TestRequest::get()
            .uri("/command")
            .insert_header((AUTH_HEADER, "tok-b"))
            .to_request();
        let resp: CommandResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp, CommandResponse::Idle);

        let req = test::TestRequest::post()
            .uri("/activate")
            .peer_addr(local_peer())
            .insert_header((AUTH_HEADER, "tok-a"))
            .set_json(ActivateRequest {
                duration_sec: Some(120),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn activate_is_loopback_only() {
        let app = app!(state());

        let req = test::TestRequest::post()
            .uri("/activate")
            .peer_addr("10.0.0.5:40000".parse().unwrap())
            .insert_header((AUTH_HEADER, "tok-a"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::post()
            .uri("/activate")
            .insert_header((AUTH_HEADER, "tok-a"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        // the token is still required from the host
        let req = test::TestRequest::post()
            .uri("/activate")
            .peer_addr(local_peer())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::get()
            .uri("/command")
            .insert_header((AUTH_HEADER, "tok-a"))
            .to_request();
        let resp: CommandResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp, CommandResponse::Idle);
    }

    #[actix_web::test]
    async fn activate_rejects_bad_input() {
        let app = app!(state());

        let req = test::TestRequest::post()
            .uri("/activate")
            .peer_addr(local_peer())
            .insert_header((AUTH_HEADER, "tok-a"))
            .set_json(ActivateRequest {
                duration_sec: Some(30),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/activate")
            .peer_addr(local_peer())
            .insert_header((AUTH_HEADER, "tok-a"))
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(error_of(resp).await.starts_with("invalid payload"));
    }

    #[actix_web::test]
    async fn batch_upload_closes_session() {
        let app = app!(state());

        let req = test::TestRequest::post()
            .uri("/activate")
            .peer_addr(local_peer())
            .insert_header((AUTH_HEADER, "tok-a"))
            .to_request();
        let session: SessionInfo = test::call_and_read_body_json(&app, req).await;

        // a foreign device cannot upload into it
        let req = test::TestRequest::post()
            .uri("/session")
            .insert_header((AUTH_HEADER, "tok-b"))
            .set_json(BatchUpload {
                session_id: Some(session.session_id),
                readings: Some(batch()),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/session")
            .insert_header((AUTH_HEADER, "tok-a"))
            .set_json(BatchUpload {
                session_id: Some(session.session_id),
                readings: Some(batch()),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let ingested: IngestResponse = test::read_body_json(resp).await;
        assert_eq!(
            ingested,
            IngestResponse {
                ok: true,
                inserted: 60,
                session_closed: true,
            }
        );

        let req = test::TestRequest::get()
            .uri("/command")
            .insert_header((AUTH_HEADER, "tok-a"))
            .to_request();
        let resp: CommandResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp, CommandResponse::Idle);

        let req = test::TestRequest::get()
            .uri(&format!("/session/{}", session.session_id))
            .to_request();
        let detail: SessionDetail = test::call_and_read_body_json(&app, req).await;
        assert_eq!(detail.measurements.len(), 60);
        assert_eq!(detail.measurements[0].device_recorded_at, "2023-10-15T15:00:00.000Z");
        assert_eq!(detail.stats.count, 60);
        assert_eq!(detail.stats.mean, Some(30.5));
        assert_eq!(detail.stats.range, Some(59.0));

        let req = test::TestRequest::get()
            .uri("/session/last?device_id=dev-a")
            .to_request();
        let last: SessionDetail = test::call_and_read_body_json(&app, req).await;
        assert_eq!(last.session.session_id, session.session_id);
    }

    #[actix_web::test]
    async fn batch_upload_validation() {
        let app = app!(state());

        let req = test::TestRequest::post()
            .uri("/session")
            .insert_header((AUTH_HEADER, "tok-a"))
            .set_json(BatchUpload {
                session_id: None,
                readings: Some(batch()),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let mut short = batch();
        short.pop();
        let req = test::TestRequest::post()
            .uri("/session")
            .insert_header((AUTH_HEADER, "tok-a"))
            .set_json(BatchUpload {
                session_id: Some(1),
                readings: Some(short),
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn single_reading_upload() {
        let app = app!(state());

        let req = test::TestRequest::post()
            .uri("/activate")
            .peer_addr(local_peer())
            .insert_header((AUTH_HEADER, "tok-a"))
            .to_request();
        let session: SessionInfo = test::call_and_read_body_json(&app, req).await;

        let body = serde_json::json!({
            "session_id": session.session_id,
            "seq": 7,
            "epoch_ms": 1_697_382_000_123_i64,
            "ntu": 2.5,
            "raw_mv": 512,
        });
        let req = test::TestRequest::post()
            .uri("/session/reading")
            .insert_header((AUTH_HEADER, "tok-a"))
            .set_json(&body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let ingested: IngestResponse = test::read_body_json(resp).await;
        assert_eq!(ingested.inserted, 1);
        assert!(!ingested.session_closed);

        let req = test::TestRequest::post()
            .uri("/session/reading")
            .insert_header((AUTH_HEADER, "tok-a"))
            .set_json(&body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn session_lookups() {
        let app = app!(state());

        let req = test::TestRequest::get().uri("/session/last").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/session/999").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/session/abc").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri("/session?limit=500")
            .to_request();
        let list: SessionList = test::call_and_read_body_json(&app, req).await;
        assert_eq!(list.limit, 100);
        assert_eq!(list.total, 0);
        assert!(list.items.is_empty());

        let req = test::TestRequest::get()
            .uri("/session?limit=ten")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn admin_command_is_loopback_only() {
        let app = app!(state());
        let local = local_peer();
        let remote: SocketAddr = "10.0.0.5:40000".parse().unwrap();

        let req = test::TestRequest::get()
            .uri("/admin/command?device_id=dev-a")
            .peer_addr(remote)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::get()
            .uri("/admin/command?device_id=dev-a")
            .peer_addr(local)
            .to_request();
        let resp: CommandResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp, CommandResponse::Idle);

        let req = test::TestRequest::get()
            .uri("/admin/command?device_id=ghost")
            .peer_addr(local)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
