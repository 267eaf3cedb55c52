/*!
# Data Dashboard

A browser-based dashboard for line-delimited JSON data, with a small video editor
on a second page, built in Rust.

## Overview

Users upload one or more files of JSON records, one record per line. The records
are tagged with the file they came from, merged into a single table and stored in
a per-session SQLite file. Choosing an x and a y column plots one line per source
file, limited to the most recent rows of each file.

The video page takes one uploaded clip, lets the user resize, trim, crop and
overlay text on it, shows a still preview, and renders a small WebM preview plus
a full resolution MP4 that can be downloaded.

## Architecture

### Frontend Layer
- **Technologies**: HTML, JavaScript
- **Key Components**:
  - Data page - upload channels, "Process Data", axis selectors, chart
  - Video page - upload, edit settings, still preview, render and download

### Backend Layer
- **Technologies**: Rust, axum, tokio
- **Core Components**:
  - Upload Receiver - chunked and inline upload channels
  - Record Parser - JSON lines to a tagged, merged table
  - Session Store - one SQLite file per processing request, swept by age
  - Query Stage - per-file series of the selected columns
  - Video Pipeline - edit plan, text mask, preview frame, ffmpeg renders
  - Dispatcher - maps every page event to exactly one handler

## Modules

- **error**: Crate error type
- **config**: Defaults and runtime configuration
- **upload**: Upload channels and upload sets
- **parser**: Record parsing and merging
- **store**: Session tables and the age-based sweep
- **query**: Plot requests and figures
- **chart**: PNG rendering of figures
- **video**: Video edit plans and rendering
- **handlers**: Events, replies and the dispatcher
- **maintenance**: Periodic sweep task
- **app**: Routing

## REST API Endpoints

- `POST /api/upload` - Streams files to the server, returns `index -> path`
- `POST /api/data/uploads` - Whether the current uploads can be processed
- `POST /api/data/process` - Builds a session table, returns axis options
- `GET /api/data/plot`, `GET /api/data/plot.png` - Figure for the selected axes
- `POST /api/video/upload`, `/api/video/preview`, `/api/video/render` - Video page events
- `GET /downloads/{file}` - Rendered video as an attachment
*/

pub mod chart;
pub mod config;
pub mod error;
pub mod parser;
pub mod query;
pub mod store;
pub mod upload;
pub mod video;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod handlers;
#[cfg(feature = "web")]
pub mod maintenance;

pub use error::{DashError, Result};
