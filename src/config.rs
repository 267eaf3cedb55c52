use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Tables and upload directories older than this are removed by the sweep.
pub const MAX_TABLE_AGE: Duration = Duration::from_secs(10_000);

/// Number of most recent rows kept per source file when plotting.
pub const TAIL_ROWS: usize = 200_000;

pub const PREVIEW_WIDTH: u32 = 540;
pub const PREVIEW_FPS: u32 = 5;

/// Runtime configuration shared by every handler.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Address the web server listens on
    pub bind_addr: SocketAddr,

    /// Shared directory for chunked uploads and session tables
    pub temp_dir: PathBuf,

    /// Directory rendered videos are written to and served from
    pub downloads_dir: PathBuf,

    pub max_table_age: Duration,

    /// How often the maintenance task sweeps `temp_dir`
    pub sweep_interval: Duration,

    pub tail_rows: usize,
    pub preview_width: u32,
    pub preview_fps: u32,

    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            temp_dir: PathBuf::from("temp"),
            downloads_dir: PathBuf::from("downloads"),
            max_table_age: MAX_TABLE_AGE,
            sweep_interval: Duration::from_secs(600),
            tail_rows: TAIL_ROWS,
            preview_width: PREVIEW_WIDTH,
            preview_fps: PREVIEW_FPS,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

impl AppConfig {
    /// Configuration rooted in `dir`, used by tests and throwaway instances.
    pub fn rooted_at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            temp_dir: dir.join("temp"),
            downloads_dir: dir.join("downloads"),
            ..Self::default()
        }
    }
}
