#![cfg(not(tarpaulin_include))]

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use datadash::app;
use datadash::config::{self, AppConfig};
use datadash::handlers::AppContext;
use datadash::maintenance;
use datadash::video::FfmpegBackend;

/// Web dashboard for line-delimited JSON data and short video edits
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "DATADASH_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// Directory for uploads and session tables
    #[arg(long, env = "DATADASH_TEMP_DIR", default_value = "temp")]
    temp_dir: PathBuf,

    /// Directory for rendered videos
    #[arg(long, env = "DATADASH_DOWNLOADS_DIR", default_value = "downloads")]
    downloads_dir: PathBuf,

    /// Seconds after which session tables and uploads are swept
    #[arg(long, env = "DATADASH_MAX_AGE", default_value_t = config::MAX_TABLE_AGE.as_secs())]
    max_age: u64,

    /// Seconds between sweeps
    #[arg(long, env = "DATADASH_SWEEP_INTERVAL", default_value_t = 600)]
    sweep_interval: u64,

    /// Most recent rows plotted per source file
    #[arg(long, env = "DATADASH_TAIL_ROWS", default_value_t = config::TAIL_ROWS)]
    tail_rows: usize,

    /// Width of the rendered WebM preview
    #[arg(long, env = "DATADASH_PREVIEW_WIDTH", default_value_t = config::PREVIEW_WIDTH)]
    preview_width: u32,

    /// Frame rate of the rendered WebM preview
    #[arg(long, env = "DATADASH_PREVIEW_FPS", default_value_t = config::PREVIEW_FPS)]
    preview_fps: u32,

    #[arg(long, env = "DATADASH_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: String,

    #[arg(long, env = "DATADASH_FFPROBE", default_value = "ffprobe")]
    ffprobe: String,
}

impl Cli {
    fn into_config(self) -> std::io::Result<AppConfig> {
        std::fs::create_dir_all(&self.temp_dir)?;
        std::fs::create_dir_all(&self.downloads_dir)?;

        Ok(AppConfig {
            bind_addr: self.bind,
            // Chunked uploads hand absolute paths to the browser.
            temp_dir: std::fs::canonicalize(&self.temp_dir)?,
            downloads_dir: std::fs::canonicalize(&self.downloads_dir)?,
            max_table_age: Duration::from_secs(self.max_age),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            tail_rows: self.tail_rows,
            preview_width: self.preview_width,
            preview_fps: self.preview_fps,
            ffmpeg_bin: self.ffmpeg,
            ffprobe_bin: self.ffprobe,
        })
    }
}

/// Main entry point for the web application
///
/// Reads the configuration, starts the periodic sweep of stale session data
/// and serves both pages until the process is stopped.
///
/// # Returns
/// * `Result<(), Box<dyn std::error::Error>>` - Success or error object
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config()?;
    log::info!(
        "temp dir {}, downloads dir {}",
        config.temp_dir.display(),
        config.downloads_dir.display()
    );

    let backend = Arc::new(FfmpegBackend::new(&config));
    let ctx = Arc::new(AppContext::new(config, backend));

    let sweeper = maintenance::spawn_sweeper(
        ctx.store.clone(),
        ctx.config.sweep_interval,
        ctx.config.max_table_age,
    );

    let served = app::run(ctx).await;
    sweeper.abort();
    served
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_setting_has_a_flag() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "website",
            "--temp-dir",
            dir.path().join("t").to_str().unwrap(),
            "--downloads-dir",
            dir.path().join("d").to_str().unwrap(),
            "--tail-rows",
            "50",
            "--preview-width",
            "320",
            "--preview-fps",
            "10",
            "--max-age",
            "60",
        ])
        .unwrap();
        let config = cli.into_config().unwrap();
        assert_eq!(config.tail_rows, 50);
        assert_eq!(config.preview_width, 320);
        assert_eq!(config.preview_fps, 10);
        assert_eq!(config.max_table_age, Duration::from_secs(60));
        assert!(config.temp_dir.is_absolute());
    }

    #[test]
    fn defaults_match_the_library() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "website",
            "--temp-dir",
            dir.path().join("t").to_str().unwrap(),
            "--downloads-dir",
            dir.path().join("d").to_str().unwrap(),
        ])
        .unwrap();
        let config = cli.into_config().unwrap();
        let defaults = AppConfig::default();
        assert_eq!(config.tail_rows, defaults.tail_rows);
        assert_eq!(config.preview_width, defaults.preview_width);
        assert_eq!(config.preview_fps, defaults.preview_fps);
        assert_eq!(config.max_table_age, defaults.max_table_age);
        assert_eq!(config.sweep_interval, defaults.sweep_interval);
    }
}
