//! Event dispatch for both pages.
//!
//! Every user action the pages can produce is an [`Event`]. [`dispatch`]
//! hands each event to exactly one handler function, together with the
//! shared [`AppContext`] and the caller's [`SessionContext`]. Handlers do
//! blocking I/O and are meant to run off the async executor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::Result;
use crate::parser;
use crate::query::{self, PlotOutcome};
use crate::store::{SessionReference, SessionStore};
use crate::upload::{ChunkedUploads, InlineUploads, UploadSet, check_chunked_paths};
use crate::video::{EditParams, RenderedVideo, UploadDefaults, VideoBackend, VideoPipeline};

/// Process-wide collaborators shared by all handlers.
#[derive(Clone)]
pub struct AppContext {
    pub config: AppConfig,
    pub store: SessionStore,
    pub video: VideoPipeline,
}

impl AppContext {
    pub fn new(config: AppConfig, backend: Arc<dyn VideoBackend>) -> Self {
        Self {
            store: SessionStore::new(&config.temp_dir),
            video: VideoPipeline::new(backend, &config),
            config,
        }
    }
}

/// Per-browser state carried between requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub reference: Option<SessionReference>,
}

/// Files of the data page, from either upload channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataUploads {
    #[serde(default)]
    pub chunked: Option<ChunkedUploads>,
    #[serde(default)]
    pub inline: Option<InlineUploads>,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Either upload channel changed on the data page.
    UploadsChanged(DataUploads),
    /// "Process Data" was pressed.
    ProcessData(DataUploads),
    /// An axis selection changed.
    AxesChanged {
        x: Option<String>,
        y: Option<String>,
    },
    /// A video finished uploading.
    VideoUploaded(ChunkedUploads),
    /// Any video edit setting changed.
    VideoSettingsChanged {
        uploads: Option<ChunkedUploads>,
        params: EditParams,
    },
    /// "Process Video" was pressed.
    ProcessVideo {
        uploads: Option<ChunkedUploads>,
        params: EditParams,
    },
}

impl Event {
    fn chunked_uploads(&self) -> Option<&ChunkedUploads> {
        match self {
            Event::UploadsChanged(u) | Event::ProcessData(u) => u.chunked.as_ref(),
            Event::VideoUploaded(u) => Some(u),
            Event::VideoSettingsChanged { uploads, .. } | Event::ProcessVideo { uploads, .. } => {
                uploads.as_ref()
            }
            Event::AxesChanged { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AxisOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reply", content = "data", rename_all = "snake_case")]
pub enum Reply {
    ProcessButton { disabled: bool },
    Processed { options: Vec<AxisOption> },
    Plot(PlotOutcome),
    /// No video uploaded yet; processing stays disabled.
    VideoDisabled,
    VideoDefaults(UploadDefaults),
    Frame { image: String },
    Rendered(RenderedVideo),
    /// Inputs are incomplete; the page keeps what it shows.
    NoUpdate,
}

/// Route one page event to its handler.
///
/// Chunked upload paths carried by the event are checked against the temp
/// directory before any handler runs.
///
/// # Arguments
/// * `ctx` - Shared store, video pipeline and configuration
/// * `session` - Caller's session; only `ProcessData` replaces its reference
/// * `event` - What the page reported
///
/// # Returns
/// * `Result<Reply>` - The reply for the page, or the handler's error
pub fn dispatch(ctx: &AppContext, session: &mut SessionContext, event: Event) -> Result<Reply> {
    if let Some(uploads) = event.chunked_uploads() {
        check_chunked_paths(&ctx.config.temp_dir, uploads)?;
    }
    match event {
        Event::UploadsChanged(uploads) => on_uploads_changed(&uploads),
        Event::ProcessData(uploads) => on_process_data(ctx, session, &uploads),
        Event::AxesChanged { x, y } => on_axes_changed(ctx, session, x.as_deref(), y.as_deref()),
        Event::VideoUploaded(uploads) => on_video_uploaded(ctx, &uploads),
        Event::VideoSettingsChanged { uploads, params } => {
            on_video_settings_changed(ctx, uploads.as_ref(), &params)
        }
        Event::ProcessVideo { uploads, params } => on_process_video(ctx, uploads.as_ref(), &params),
    }
}

fn upload_set(uploads: &DataUploads) -> Result<UploadSet> {
    UploadSet::select(uploads.chunked.as_ref(), uploads.inline.as_ref())
}

pub fn on_uploads_changed(uploads: &DataUploads) -> Result<Reply> {
    let ready = upload_set(uploads)?.is_ready()?;
    Ok(Reply::ProcessButton { disabled: !ready })
}

/// Parse the uploads into a new session table and offer its columns as axes.
pub fn on_process_data(ctx: &AppContext, session: &mut SessionContext, uploads: &DataUploads) -> Result<Reply> {
    let set = upload_set(uploads)?;
    if set.is_empty() {
        session.reference = None;
        return Ok(Reply::Processed { options: Vec::new() });
    }

    let dataset = parser::parse_uploads(&set)?;
    let reference = ctx.store.create(&dataset)?;
    log::info!(
        "processed {} file(s) into {} rows, table {}",
        set.len(),
        dataset.num_rows(),
        reference.table_id
    );
    session.reference = Some(reference);

    let options = dataset
        .columns
        .iter()
        .map(|c| AxisOption {
            label: c.clone(),
            value: c.clone(),
        })
        .collect();
    Ok(Reply::Processed { options })
}

pub fn on_axes_changed(
    ctx: &AppContext,
    session: &SessionContext,
    x: Option<&str>,
    y: Option<&str>,
) -> Result<Reply> {
    let outcome = query::plot(&ctx.store, session.reference.as_ref(), x, y, ctx.config.tail_rows)?;
    Ok(Reply::Plot(outcome))
}

fn first_upload(uploads: Option<&ChunkedUploads>) -> Option<&PathBuf> {
    uploads.and_then(|u| u.values().next())
}

pub fn on_video_uploaded(ctx: &AppContext, uploads: &ChunkedUploads) -> Result<Reply> {
    match first_upload(Some(uploads)) {
        Some(path) => Ok(Reply::VideoDefaults(ctx.video.upload(path)?)),
        None => Ok(Reply::VideoDisabled),
    }
}

pub fn on_video_settings_changed(
    ctx: &AppContext,
    uploads: Option<&ChunkedUploads>,
    params: &EditParams,
) -> Result<Reply> {
    let Some(path) = first_upload(uploads) else {
        return Ok(Reply::NoUpdate);
    };
    match ctx.video.preview(path, params)? {
        Some(image) => Ok(Reply::Frame { image }),
        None => Ok(Reply::NoUpdate),
    }
}

pub fn on_process_video(ctx: &AppContext, uploads: Option<&ChunkedUploads>, params: &EditParams) -> Result<Reply> {
    let Some(path) = first_upload(uploads) else {
        return Ok(Reply::NoUpdate);
    };
    Ok(Reply::Rendered(ctx.video.render(path, params)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DashError;
    use crate::query::Axis;
    use crate::video::ClipInfo;
    use crate::video::fake::FakeBackend;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    fn context(dir: &std::path::Path) -> AppContext {
        let info = ClipInfo {
            duration: 10.0,
            width: 320,
            height: 240,
            fps: 25.0,
        };
        AppContext::new(AppConfig::rooted_at(dir), Arc::new(FakeBackend::new(info)))
    }

    fn inline(files: &[(&str, &str)]) -> DataUploads {
        DataUploads {
            chunked: None,
            inline: Some(InlineUploads {
                contents: files
                    .iter()
                    .map(|(_, text)| format!("data:text/plain;base64,{}", STANDARD.encode(text)))
                    .collect(),
                filenames: files.iter().map(|(name, _)| name.to_string()).collect(),
            }),
        }
    }

    #[test]
    fn process_button_follows_uploads() {
        assert_eq!(
            on_uploads_changed(&DataUploads::default()).unwrap(),
            Reply::ProcessButton { disabled: true }
        );
        assert_eq!(
            on_uploads_changed(&inline(&[("a.txt", "\n{\"x\": 1}\n")])).unwrap(),
            Reply::ProcessButton { disabled: false }
        );
    }

    #[test]
    fn process_then_plot() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut session = SessionContext::default();

        let reply = dispatch(
            &ctx,
            &mut session,
            Event::ProcessData(inline(&[
                ("a.txt", "{\"t\": 0, \"v\": 1.0}\n{\"t\": 1, \"v\": 2.0}\n"),
                ("b.txt", "{\"t\": 0, \"v\": 5.0}\n"),
            ])),
        )
        .unwrap();
        let Reply::Processed { options } = reply else {
            panic!("unexpected reply {reply:?}");
        };
        let values: Vec<_> = options.iter().map(|o| o.value.as_str()).collect();
        assert_eq!(values, vec!["_source", "t", "v"]);
        assert!(session.reference.is_some());

        let reply = dispatch(
            &ctx,
            &mut session,
            Event::AxesChanged {
                x: Some("t".into()),
                y: Some("v".into()),
            },
        )
        .unwrap();
        let Reply::Plot(PlotOutcome::Figure(figure)) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        let names: Vec<_> = figure.series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(figure.series[0].y.len(), 2);
    }

    #[test]
    fn plot_before_processing_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let reply = on_axes_changed(&ctx, &SessionContext::default(), Some("x"), Some("y")).unwrap();
        assert!(matches!(reply, Reply::Plot(PlotOutcome::Prompt { .. })));
    }

    #[test]
    fn plot_with_missing_column_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut session = SessionContext::default();
        on_process_data(&ctx, &mut session, &inline(&[("a.txt", "{\"t\": 0}\n")])).unwrap();

        let reply = on_axes_changed(&ctx, &session, Some("t"), Some("missing")).unwrap();
        assert!(matches!(
            reply,
            Reply::Plot(PlotOutcome::Alert { axis: Axis::Y, .. })
        ));
    }

    #[test]
    fn malformed_upload_fails_and_keeps_old_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut session = SessionContext::default();
        on_process_data(&ctx, &mut session, &inline(&[("a.txt", "{\"t\": 0}\n")])).unwrap();
        let before = session.clone();

        let err = on_process_data(&ctx, &mut session, &inline(&[("b.txt", "{oops}\n")])).unwrap_err();
        assert!(matches!(err, DashError::MalformedInput { .. }));
        assert_eq!(session, before);
    }

    #[test]
    fn processing_nothing_clears_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut session = SessionContext::default();
        on_process_data(&ctx, &mut session, &inline(&[("a.txt", "{\"t\": 0}\n")])).unwrap();

        let reply = on_process_data(&ctx, &mut session, &DataUploads::default()).unwrap();
        assert_eq!(reply, Reply::Processed { options: vec![] });
        assert_eq!(session.reference, None);
    }

    #[test]
    fn video_events() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut uploads = ChunkedUploads::new();
        uploads.insert(0, ctx.config.temp_dir.join("clip.mp4"));

        assert_eq!(
            on_video_uploaded(&ctx, &ChunkedUploads::new()).unwrap(),
            Reply::VideoDisabled
        );
        let Reply::VideoDefaults(defaults) = on_video_uploaded(&ctx, &uploads).unwrap() else {
            panic!("expected defaults");
        };
        assert_eq!(defaults.t_end, 10.0);
        assert_eq!(defaults.width, 320);

        let incomplete = EditParams::default();
        assert_eq!(
            on_video_settings_changed(&ctx, Some(&uploads), &incomplete).unwrap(),
            Reply::NoUpdate
        );
        assert_eq!(
            on_process_video(&ctx, None, &incomplete).unwrap(),
            Reply::NoUpdate
        );

        let bad = EditParams {
            crop_top: Some(240),
            ..Default::default()
        };
        assert!(matches!(
            on_process_video(&ctx, Some(&uploads), &bad),
            Err(DashError::Transform(_))
        ));

        let reply = on_process_video(&ctx, Some(&uploads), &EditParams::default()).unwrap();
        assert!(matches!(reply, Reply::Rendered(_)));
    }

    #[test]
    fn chunked_paths_outside_temp_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut session = SessionContext::default();
        let mut uploads = ChunkedUploads::new();
        uploads.insert(0, PathBuf::from("/etc/hostname"));

        let err = dispatch(&ctx, &mut session, Event::VideoUploaded(uploads)).unwrap_err();
        assert!(matches!(err, DashError::InvalidPath(_)));
    }
}
