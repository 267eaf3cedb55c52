//! Video editing pipeline.
//!
//! A source clip is resized to a chosen width, trimmed to `[t_start, t_end)`,
//! cropped vertically, and masked by a text overlay (white text on black,
//! used as the clip's alpha over a white background). Editing produces either
//! a single preview still or two rendered files: a small 540px/5fps WebM
//! preview and a full-resolution MP4.
//!
//! Decoding and encoding go through [`VideoBackend`]; [`FfmpegBackend`]
//! shells out to the `ffmpeg`/`ffprobe` binaries.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageOutputFormat, Rgba, RgbImage, RgbaImage};
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::chart::rgb_len;
use crate::config::AppConfig;
use crate::error::{DashError, Result};

/// Largest frame side accepted for resizing.
pub const MAX_DIMENSION: u32 = 16_384;

/// Font families the text overlay can be drawn with. The first is the default.
pub const FONTS: &[&str] = &["sans-serif", "serif", "monospace"];

pub fn available_fonts() -> Vec<String> {
    FONTS.iter().map(|f| f.to_string()).collect()
}

/// Properties of a source clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipInfo {
    /// Seconds
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Edit settings as entered by the user. Unset fields fall back to the
/// clip's own values where that makes sense.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditParams {
    pub width: Option<i64>,
    pub t_start: Option<f64>,
    pub t_end: Option<f64>,
    pub crop_top: Option<i64>,
    pub crop_bottom: Option<i64>,
    pub text: Option<String>,
    pub font: Option<String>,
}

impl EditParams {
    /// The still preview is only recomputed once all of these are set.
    pub fn is_complete_for_preview(&self) -> bool {
        self.width.is_some()
            && self.crop_top.is_some()
            && self.crop_bottom.is_some()
            && self.text.is_some()
            && self.font.is_some()
    }
}

/// Validated transform chain: resize, subclip, crop, text mask.
#[derive(Debug, Clone, PartialEq)]
pub struct EditPlan {
    pub source: ClipInfo,
    /// Width after resizing
    pub width: u32,
    /// Height after resizing, before cropping
    pub scaled_height: u32,
    pub t_start: f64,
    pub t_end: f64,
    pub crop_top: u32,
    pub crop_bottom: u32,
    pub text: String,
    pub font: String,
}

fn transform_err(msg: impl Into<String>) -> DashError {
    DashError::Transform(msg.into())
}

impl EditPlan {
    pub fn new(info: &ClipInfo, params: &EditParams) -> Result<Self> {
        if info.width == 0 || info.height == 0 {
            return Err(transform_err("source clip has no frame size"));
        }

        let width = params.width.unwrap_or(i64::from(info.width));
        if width <= 0 {
            return Err(transform_err(format!("width must be positive, got {width}")));
        }
        let width = u32::try_from(width)
            .ok()
            .filter(|w| *w <= MAX_DIMENSION)
            .ok_or_else(|| transform_err(format!("width {width} exceeds {MAX_DIMENSION}")))?;
        let scaled_height =
            (f64::from(info.height) * f64::from(width) / f64::from(info.width)).round();
        if scaled_height > f64::from(MAX_DIMENSION) {
            return Err(transform_err(format!(
                "resized height {scaled_height} exceeds {MAX_DIMENSION}"
            )));
        }
        let scaled_height = scaled_height as u32;

        let t_start = params.t_start.unwrap_or(0.0);
        let t_end = params.t_end.unwrap_or(info.duration);
        if !t_start.is_finite() || !t_end.is_finite() {
            return Err(transform_err("subclip bounds must be numbers"));
        }
        if t_start < 0.0 || t_end > info.duration + 1e-6 {
            return Err(transform_err(format!(
                "subclip {t_start}s..{t_end}s is outside the clip (0s..{}s)",
                info.duration
            )));
        }
        if t_end <= t_start {
            return Err(transform_err(format!(
                "subclip end {t_end}s must be after start {t_start}s"
            )));
        }

        let crop_bound = |value: Option<i64>, side: &str| {
            u32::try_from(value.unwrap_or(0))
                .map_err(|_| transform_err(format!("crop {side} must be between 0 and {scaled_height}")))
        };
        let crop_top = crop_bound(params.crop_top, "top")?;
        let crop_bottom = crop_bound(params.crop_bottom, "bottom")?;
        if u64::from(crop_top) + u64::from(crop_bottom) >= u64::from(scaled_height) {
            return Err(transform_err(format!(
                "crop of {crop_top}px top and {crop_bottom}px bottom leaves no rows of {scaled_height}"
            )));
        }

        let font = params.font.clone().unwrap_or_else(|| FONTS[0].to_string());
        if !FONTS.contains(&font.as_str()) {
            return Err(transform_err(format!("unknown font {font:?}")));
        }

        Ok(Self {
            source: *info,
            width,
            scaled_height,
            t_start,
            t_end,
            crop_top,
            crop_bottom,
            text: params.text.clone().unwrap_or_default(),
            font,
        })
    }

    /// Seconds of the subclip.
    pub fn duration(&self) -> f64 {
        self.t_end - self.t_start
    }

    /// Frame size after resize and crop.
    pub fn output_size(&self) -> (u32, u32) {
        (self.width, self.scaled_height - self.crop_top - self.crop_bottom)
    }

    /// Output size scaled to `width`, keeping the aspect ratio.
    pub fn scaled_to(&self, width: u32) -> (u32, u32) {
        let (w, h) = self.output_size();
        let height = (f64::from(h) * f64::from(width) / f64::from(w)).round() as u32;
        (width, height.max(1))
    }
}

/// Per-request progress of the video page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStage {
    Uploaded,
    Previewed,
    Rendering,
    Rendered,
}

impl VideoStage {
    /// Any settings change re-enters `Previewed`, except while rendering.
    pub fn on_preview(self) -> Self {
        match self {
            VideoStage::Rendering => VideoStage::Rendering,
            _ => VideoStage::Previewed,
        }
    }

    pub fn on_render_start(self) -> Result<Self> {
        match self {
            VideoStage::Rendering => Err(transform_err("a render is already running")),
            _ => Ok(VideoStage::Rendering),
        }
    }

    pub fn on_render_done(self) -> Result<Self> {
        match self {
            VideoStage::Rendering => Ok(VideoStage::Rendered),
            other => Err(transform_err(format!("no render running (stage {other:?})"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mp4,
    WebM,
}

/// One encoder invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub source: PathBuf,
    /// Grayscale PNG of the output frame size used as alpha
    pub mask: PathBuf,
    pub plan: EditPlan,
    /// Rescale the finished frame to this width
    pub scale_width: Option<u32>,
    pub fps: f64,
    pub container: Container,
    pub output: PathBuf,
}

/// Decoder/encoder used by the pipeline.
pub trait VideoBackend: Send + Sync {
    fn probe(&self, source: &Path) -> Result<ClipInfo>;

    /// Frame at `t` seconds, scaled to `width` x `height`.
    fn frame_at(&self, source: &Path, t: f64, width: u32, height: u32) -> Result<RgbImage>;

    fn encode(&self, job: &EncodeJob) -> Result<()>;
}

/// Draw `text` white on black, centred and sized to fit, as a `width` x `height` mask.
pub fn text_mask(text: &str, font: &str, width: u32, height: u32) -> Result<GrayImage> {
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(transform_err(format!("mask of {width}x{height} is out of range")));
    }
    let len = rgb_len(width, height).ok_or_else(|| transform_err("mask too large"))?;
    let mut pixels = vec![0u8; len];
    if !text.trim().is_empty() {
        let root = BitMapBackend::with_buffer(&mut pixels, (width, height)).into_drawing_area();
        root.fill(&BLACK).map_err(transform_err_display)?;

        let mut size = f64::from(height) * 0.8;
        loop {
            let style = TextStyle::from((font, size).into_font());
            let (tw, th) = root
                .estimate_text_size(text, &style)
                .map_err(transform_err_display)?;
            if (u64::from(tw) * 100 <= u64::from(width) * 95 && th <= height) || size <= 6.0 {
                break;
            }
            size *= 0.9;
        }

        let style = TextStyle::from((font, size).into_font())
            .color(&WHITE)
            .pos(Pos::new(HPos::Center, VPos::Center));
        root.draw_text(text, &style, ((width / 2) as i32, (height / 2) as i32))
            .map_err(transform_err_display)?;
        root.present().map_err(transform_err_display)?;
    }

    let luma: Vec<u8> = pixels.chunks_exact(3).map(|px| px[0]).collect();
    GrayImage::from_raw(width, height, luma).ok_or_else(|| transform_err("mask buffer size mismatch"))
}

fn transform_err_display(e: impl std::fmt::Display) -> DashError {
    DashError::Transform(e.to_string())
}

/// Crop a resized frame, scale it to the preview width and attach the mask
/// as alpha.
pub fn compose_preview(frame: &RgbImage, mask: &GrayImage, plan: &EditPlan, preview_width: u32) -> Result<RgbaImage> {
    let (w, h) = plan.output_size();
    if frame.width() != plan.width || frame.height() < plan.crop_top + h {
        return Err(transform_err(format!(
            "frame is {}x{}, expected {}x{}",
            frame.width(),
            frame.height(),
            plan.width,
            plan.scaled_height
        )));
    }
    let cropped = imageops::crop_imm(frame, 0, plan.crop_top, w, h).to_image();

    let (pw, ph) = plan.scaled_to(preview_width);
    let frame = imageops::resize(&cropped, pw, ph, FilterType::Triangle);
    let mask = imageops::resize(mask, pw, ph, FilterType::Triangle);

    Ok(RgbaImage::from_fn(pw, ph, |x, y| {
        let [r, g, b] = frame.get_pixel(x, y).0;
        Rgba([r, g, b, mask.get_pixel(x, y).0[0]])
    }))
}

pub fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// Defaults offered once a clip is uploaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadDefaults {
    pub info: ClipInfo,
    pub t_start: f64,
    pub t_end: f64,
    pub width: u32,
    pub fonts: Vec<String>,
    pub stage: VideoStage,
}

/// Files written by a render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedVideo {
    /// `data:video/webm;base64,...` of the preview file
    pub preview_data_uri: String,
    /// `/downloads/<id>.mp4`
    pub download_href: String,
    pub full_path: PathBuf,
    pub preview_path: PathBuf,
    pub stage: VideoStage,
}

type ActiveRenders = Arc<Mutex<HashSet<PathBuf>>>;

fn lock_active(active: &ActiveRenders) -> MutexGuard<'_, HashSet<PathBuf>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks one source as rendering until dropped.
struct RenderSlot {
    active: ActiveRenders,
    source: PathBuf,
}

impl Drop for RenderSlot {
    fn drop(&mut self) {
        lock_active(&self.active).remove(&self.source);
    }
}

/// Drives a [`VideoBackend`] through the upload, preview and render steps.
///
/// Clones share the set of sources currently being rendered.
#[derive(Clone)]
pub struct VideoPipeline {
    backend: Arc<dyn VideoBackend>,
    temp_dir: PathBuf,
    downloads_dir: PathBuf,
    preview_width: u32,
    preview_fps: u32,
    active: ActiveRenders,
}

impl VideoPipeline {
    pub fn new(backend: Arc<dyn VideoBackend>, config: &AppConfig) -> Self {
        Self {
            backend,
            temp_dir: config.temp_dir.clone(),
            downloads_dir: config.downloads_dir.clone(),
            preview_width: config.preview_width,
            preview_fps: config.preview_fps,
            active: ActiveRenders::default(),
        }
    }

    /// Current stage of `source`: `Rendering` while another render of it runs.
    pub fn stage_of(&self, source: &Path) -> VideoStage {
        if lock_active(&self.active).contains(source) {
            VideoStage::Rendering
        } else {
            VideoStage::Previewed
        }
    }

    fn begin_render(&self, source: &Path) -> Result<(VideoStage, RenderSlot)> {
        let mut active = lock_active(&self.active);
        let current = if active.contains(source) {
            VideoStage::Rendering
        } else {
            VideoStage::Previewed
        };
        let stage = current.on_render_start()?;
        active.insert(source.to_path_buf());
        Ok((
            stage,
            RenderSlot {
                active: self.active.clone(),
                source: source.to_path_buf(),
            },
        ))
    }

    pub fn upload(&self, source: &Path) -> Result<UploadDefaults> {
        let info = self.backend.probe(source)?;
        Ok(UploadDefaults {
            info,
            t_start: 0.0,
            t_end: info.duration,
            width: info.width,
            fonts: available_fonts(),
            stage: VideoStage::Uploaded,
        })
    }

    /// PNG data URI of the first frame of the edited clip, or `None` while
    /// the settings are incomplete.
    pub fn preview(&self, source: &Path, params: &EditParams) -> Result<Option<String>> {
        if !params.is_complete_for_preview() {
            return Ok(None);
        }
        let info = self.backend.probe(source)?;
        let plan = EditPlan::new(&info, params)?;

        let frame = self
            .backend
            .frame_at(source, plan.t_start, plan.width, plan.scaled_height)?;
        let (w, h) = plan.output_size();
        let mask = text_mask(&plan.text, &plan.font, w, h)?;
        let still = compose_preview(&frame, &mask, &plan, self.preview_width)?;

        let mut png = Cursor::new(Vec::new());
        still.write_to(&mut png, ImageOutputFormat::Png)?;
        Ok(Some(data_uri("image/png", png.get_ref())))
    }

    /// Render the preview and full-resolution files. Blocks until both are written.
    ///
    /// # Arguments
    /// * `source` - Uploaded clip
    /// * `params` - Edit settings from the video page
    ///
    /// # Returns
    /// * `Result<RenderedVideo>` - Preview data URI and download link, a `Transform`
    ///   error for invalid settings or while `source` is already rendering, or a
    ///   `Codec` error from the encoder
    pub fn render(&self, source: &Path, params: &EditParams) -> Result<RenderedVideo> {
        let (stage, _slot) = self.begin_render(source)?;
        let info = self.backend.probe(source)?;
        let plan = EditPlan::new(&info, params)?;

        fs::create_dir_all(&self.downloads_dir)?;
        fs::create_dir_all(&self.temp_dir)?;

        let (w, h) = plan.output_size();
        let mask = text_mask(&plan.text, &plan.font, w, h)?;
        let mask_file = tempfile::Builder::new()
            .prefix("mask_")
            .suffix(".png")
            .tempfile_in(&self.temp_dir)?;
        mask.save_with_format(mask_file.path(), image::ImageFormat::Png)?;

        let id = Uuid::new_v4();
        let full_path = self.downloads_dir.join(format!("{id}.mp4"));
        let preview_path = self.downloads_dir.join(format!("{id}preview_.webm"));

        let preview_job = EncodeJob {
            source: source.to_path_buf(),
            mask: mask_file.path().to_path_buf(),
            plan: plan.clone(),
            scale_width: Some(self.preview_width),
            fps: f64::from(self.preview_fps),
            container: Container::WebM,
            output: preview_path.clone(),
        };
        self.backend.encode(&preview_job)?;

        let full_job = EncodeJob {
            scale_width: None,
            fps: info.fps,
            container: Container::Mp4,
            output: full_path.clone(),
            ..preview_job
        };
        self.backend.encode(&full_job)?;

        let preview_bytes = fs::read(&preview_path)?;
        log::info!(
            "rendered {} ({}x{}, {:.2}s) and {}",
            full_path.display(),
            w,
            h,
            plan.duration(),
            preview_path.display()
        );

        Ok(RenderedVideo {
            preview_data_uri: data_uri("video/webm", &preview_bytes),
            download_href: format!("/downloads/{id}.mp4"),
            full_path,
            preview_path,
            stage: stage.on_render_done()?,
        })
    }
}

/// [`VideoBackend`] backed by the `ffmpeg` and `ffprobe` command-line tools.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl FfmpegBackend {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_bin.clone(),
            ffprobe: config.ffprobe_bin.clone(),
        }
    }
}

fn run(cmd: &mut Command, what: &str) -> Result<Vec<u8>> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| DashError::Codec(format!("{what}: cannot start: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        return Err(DashError::Codec(format!("{what} failed: {stderr}")));
    }
    Ok(output.stdout)
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse `ffprobe -of json` output for the first video stream.
pub fn parse_probe(json: &str) -> Result<ClipInfo> {
    let probe: ProbeOutput =
        serde_json::from_str(json).map_err(|e| DashError::Codec(format!("ffprobe output: {e}")))?;
    let stream = probe
        .streams
        .first()
        .ok_or_else(|| DashError::Codec("no video stream".into()))?;

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| DashError::Codec("unknown duration".into()))?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(DashError::Codec("unknown frame size".into()));
    };
    let fps = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .ok_or_else(|| DashError::Codec("unknown frame rate".into()))?;

    Ok(ClipInfo {
        duration,
        width,
        height,
        fps,
    })
}

/// `"30000/1001"` or `"25"` to frames per second.
fn parse_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => num.trim().parse::<f64>().ok()? / den.trim().parse::<f64>().ok()?,
        None => rate.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Filter graph: scale, crop, alpha from the mask, over white.
pub fn filter_graph(job: &EncodeJob) -> String {
    let plan = &job.plan;
    let (w, h) = plan.output_size();
    let fps = job.fps;
    let finish = match job.scale_width {
        Some(pw) => format!(",scale={pw}:-2"),
        None => ",scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string(),
    };
    format!(
        "[0:v]scale={w}:{sh},crop={w}:{h}:0:{top},setsar=1,format=rgba[v];\
         [1:v]format=gray,scale={w}:{h}[m];\
         [v][m]alphamerge[a];\
         color=c=white:s={w}x{h}:r={fps}[bg];\
         [bg][a]overlay=shortest=1{finish},format=yuv420p[out]",
        sh = plan.scaled_height,
        top = plan.crop_top,
    )
}

/// Command-line arguments for one encode, without the program name.
pub fn encode_args(job: &EncodeJob) -> Vec<String> {
    let plan = &job.plan;
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y"]
        .map(String::from)
        .to_vec();
    args.extend([
        "-ss".to_string(),
        format!("{:.3}", plan.t_start),
        "-t".to_string(),
        format!("{:.3}", plan.duration()),
        "-i".to_string(),
    ]);
    args.push(job.source.to_string_lossy().into_owned());
    args.extend(["-loop", "1", "-i"].map(String::from));
    args.push(job.mask.to_string_lossy().into_owned());
    args.extend([
        "-filter_complex".to_string(),
        filter_graph(job),
        "-map".to_string(),
        "[out]".to_string(),
        "-an".to_string(),
        "-r".to_string(),
        format!("{}", job.fps),
        "-t".to_string(),
        format!("{:.3}", plan.duration()),
    ]);
    let codec: &[&str] = match job.container {
        Container::Mp4 => &["-c:v", "libx264", "-movflags", "+faststart"],
        Container::WebM => &["-c:v", "libvpx-vp9", "-b:v", "0", "-crf", "40"],
    };
    args.extend(codec.iter().map(|s| s.to_string()));
    args.push(job.output.to_string_lossy().into_owned());
    args
}

impl VideoBackend for FfmpegBackend {
    fn probe(&self, source: &Path) -> Result<ClipInfo> {
        let stdout = run(
            Command::new(&self.ffprobe)
                .args(["-v", "error", "-select_streams", "v:0"])
                .args(["-show_entries", "stream=width,height,r_frame_rate,duration:format=duration"])
                .args(["-of", "json"])
                .arg(source),
            "ffprobe",
        )?;
        parse_probe(&String::from_utf8_lossy(&stdout))
    }

    fn frame_at(&self, source: &Path, t: f64, width: u32, height: u32) -> Result<RgbImage> {
        let stdout = run(
            Command::new(&self.ffmpeg)
                .args(["-hide_banner", "-loglevel", "error"])
                .arg("-ss")
                .arg(format!("{:.3}", t.max(0.0)))
                .arg("-i")
                .arg(source)
                .args(["-frames:v", "1"])
                .arg("-vf")
                .arg(format!("scale={width}:{height}"))
                .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"]),
            "ffmpeg frame",
        )?;
        let expected = rgb_len(width, height)
            .ok_or_else(|| DashError::Codec(format!("frame of {width}x{height} is too large")))?;
        if stdout.len() < expected {
            return Err(DashError::Codec(format!(
                "frame at {t}s: got {} bytes, expected {expected}",
                stdout.len()
            )));
        }
        RgbImage::from_raw(width, height, stdout[..expected].to_vec())
            .ok_or_else(|| DashError::Codec("frame buffer size mismatch".into()))
    }

    fn encode(&self, job: &EncodeJob) -> Result<()> {
        log::debug!("encoding {}", job.output.display());
        run(Command::new(&self.ffmpeg).args(encode_args(job)), "ffmpeg encode")?;
        Ok(())
    }
}
