use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::{Deserialize, Serialize};
use std::path::{Component, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::chart::{self, GraphOptions};
use crate::error::{DashError, Result};
use crate::handlers::{self, AppContext, DataUploads, Event, Reply, SessionContext};
use crate::query::PlotOutcome;
use crate::store::SessionReference;
use crate::upload::{self, ChunkedUploads};
use crate::video::EditParams;

const SESSION_COOKIE: &str = "session";

#[derive(Serialize)]
struct ErrorResponse {
    status: String,
    message: String,
}

impl IntoResponse for DashError {
    fn into_response(self) -> Response {
        let status = match &self {
            e if e.is_user_error() => StatusCode::BAD_REQUEST,
            DashError::SessionNotFound(_) | DashError::InvalidPath(_) => StatusCode::NOT_FOUND,
            DashError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("{self}");
        } else {
            log::warn!("{self}");
        }
        let body = ErrorResponse {
            status: "error".to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct AxesQuery {
    x: Option<String>,
    y: Option<String>,
}

impl AxesQuery {
    fn into_event(self) -> Event {
        let pick = |v: Option<String>| v.filter(|s| !s.is_empty());
        Event::AxesChanged {
            x: pick(self.x),
            y: pick(self.y),
        }
    }
}

#[derive(Deserialize)]
struct VideoRequest {
    #[serde(default)]
    uploads: Option<ChunkedUploads>,
    #[serde(flatten)]
    params: EditParams,
}

/// Build the router for both pages and their API.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(serve_data_page))
        .route("/video", get(serve_video_page))
        .route("/api/upload", post(upload_files))
        .route("/api/data/uploads", post(uploads_changed))
        .route("/api/data/process", post(process_data))
        .route("/api/data/plot", get(plot_json))
        .route("/api/data/plot.png", get(plot_png))
        .route("/api/video/upload", post(video_uploaded))
        .route("/api/video/preview", post(video_preview))
        .route("/api/video/render", post(video_render))
        .route("/downloads/*path", get(download))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

pub async fn run(ctx: Arc<AppContext>) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let addr = ctx.config.bind_addr;
    let app = router(ctx);

    let listener = TcpListener::bind(addr).await?;
    log::info!("Listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn serve_data_page() -> Html<&'static str> {
    Html(include_str!("./static/data.html"))
}

async fn serve_video_page() -> Html<&'static str> {
    Html(include_str!("./static/video.html"))
}

fn session_from(jar: &CookieJar) -> SessionContext {
    SessionContext {
        reference: jar
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .filter(|id| !id.is_empty())
            .map(|table_id| SessionReference { table_id }),
    }
}

/// Run one event through the dispatcher on the blocking pool.
async fn dispatch(ctx: Arc<AppContext>, mut session: SessionContext, event: Event) -> Result<(SessionContext, Reply)> {
    tokio::task::spawn_blocking(move || {
        let reply = handlers::dispatch(&ctx, &mut session, event)?;
        Ok((session, reply))
    })
    .await
    .map_err(|e| DashError::Io(std::io::Error::other(e)))?
}

/// Stream every file field of the form to `<temp>/<uuid>/<name>`.
async fn upload_files(State(ctx): State<Arc<AppContext>>, mut multipart: Multipart) -> Result<Json<ChunkedUploads>> {
    let bad = |e: axum::extract::multipart::MultipartError| DashError::InvalidUpload(e.to_string());
    let mut saved = ChunkedUploads::new();

    while let Some(mut field) = multipart.next_field().await.map_err(bad)? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let name = upload::sanitize_filename(&file_name)?;
        let dir = upload::new_upload_dir(&ctx.config.temp_dir)?;
        let path = dir.join(name);

        let mut file = tokio::fs::File::create(&path).await?;
        let mut size = 0usize;
        while let Some(chunk) = field.chunk().await.map_err(bad)? {
            size += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        log::info!("received {} ({size} bytes)", path.display());
        saved.insert(saved.len(), path);
    }

    if saved.is_empty() {
        return Err(DashError::InvalidUpload("No file data received".to_string()));
    }
    Ok(Json(saved))
}

async fn uploads_changed(
    State(ctx): State<Arc<AppContext>>,
    Json(uploads): Json<DataUploads>,
) -> Result<Json<Reply>> {
    let (_, reply) = dispatch(ctx, SessionContext::default(), Event::UploadsChanged(uploads)).await?;
    Ok(Json(reply))
}

async fn process_data(
    State(ctx): State<Arc<AppContext>>,
    jar: CookieJar,
    Json(uploads): Json<DataUploads>,
) -> Result<(CookieJar, Json<Reply>)> {
    let (session, reply) = dispatch(ctx, session_from(&jar), Event::ProcessData(uploads)).await?;

    let mut cookie = Cookie::new(SESSION_COOKIE, session.reference.map(|r| r.table_id).unwrap_or_default());
    cookie.set_path("/");
    Ok((jar.add(cookie), Json(reply)))
}

async fn plot_json(
    State(ctx): State<Arc<AppContext>>,
    jar: CookieJar,
    Query(axes): Query<AxesQuery>,
) -> Result<Json<Reply>> {
    let (_, reply) = dispatch(ctx, session_from(&jar), axes.into_event()).await?;
    Ok(Json(reply))
}

/// Same as [`plot_json`], but a figure is returned as a PNG chart.
async fn plot_png(
    State(ctx): State<Arc<AppContext>>,
    jar: CookieJar,
    Query(axes): Query<AxesQuery>,
) -> Result<Response> {
    let (_, reply) = dispatch(ctx, session_from(&jar), axes.into_event()).await?;
    let Reply::Plot(PlotOutcome::Figure(figure)) = reply else {
        return Ok(Json(reply).into_response());
    };

    let png = tokio::task::spawn_blocking(move || {
        let options = GraphOptions {
            title: format!("{} vs {}", figure.y_label, figure.x_label),
            ..GraphOptions::default()
        };
        chart::render_png(&figure, &options)
    })
    .await
    .map_err(|e| DashError::Chart(e.to_string()))??;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

async fn video_uploaded(
    State(ctx): State<Arc<AppContext>>,
    Json(uploads): Json<ChunkedUploads>,
) -> Result<Json<Reply>> {
    let (_, reply) = dispatch(ctx, SessionContext::default(), Event::VideoUploaded(uploads)).await?;
    Ok(Json(reply))
}

async fn video_preview(State(ctx): State<Arc<AppContext>>, Json(req): Json<VideoRequest>) -> Result<Json<Reply>> {
    let event = Event::VideoSettingsChanged {
        uploads: req.uploads,
        params: req.params,
    };
    let (_, reply) = dispatch(ctx, SessionContext::default(), event).await?;
    Ok(Json(reply))
}

async fn video_render(State(ctx): State<Arc<AppContext>>, Json(req): Json<VideoRequest>) -> Result<Json<Reply>> {
    let event = Event::ProcessVideo {
        uploads: req.uploads,
        params: req.params,
    };
    let (_, reply) = dispatch(ctx, SessionContext::default(), event).await?;
    Ok(Json(reply))
}

/// Resolve a request path inside the downloads directory.
fn download_path(root: &std::path::Path, requested: &str) -> Result<PathBuf> {
    let relative = PathBuf::from(requested);
    let plain = relative.components().all(|c| matches!(c, Component::Normal(_)));
    if !plain || relative.as_os_str().is_empty() {
        return Err(DashError::InvalidPath(requested.to_string()));
    }
    Ok(root.join(relative))
}

/// Serve a rendered file as an attachment.
async fn download(State(ctx): State<Arc<AppContext>>, Path(requested): Path<String>) -> Result<Response> {
    let path = download_path(&ctx.config.downloads_dir, &requested)?;
    let bytes = tokio::fs::read(&path).await?;

    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", urlencoding::encode(&file_name)),
        )
        .body(Body::from(bytes))
        .map_err(|e| DashError::Io(std::io::Error::other(e)))
}
