//! Upload receiver.
//!
//! Files reach the server through one of two channels:
//!
//! - **chunked**: large files are streamed to disk under the shared temp
//!   directory and the browser keeps an `index -> absolute path` map;
//! - **inline**: small files travel inside the request as
//!   `data:<mime>;base64,<payload>` strings next to their original names and
//!   are decoded in memory.
//!
//! Both channels end up as an [`UploadSet`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Cursor};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{DashError, Result};

/// Index -> absolute path map produced by the chunked channel.
pub type ChunkedUploads = BTreeMap<usize, PathBuf>;

/// Files supplied through the inline channel, as sent by the browser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InlineUploads {
    /// One `data:<mime>;base64,<payload>` string per file
    pub contents: Vec<String>,

    /// Original filenames, parallel to `contents`
    pub filenames: Vec<String>,
}

/// Where the bytes of an uploaded file live.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Buffer(Vec<u8>),
}

/// A named byte source, consumed once during parsing.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Name used to tag the records of this file
    pub name: String,
    pub source: FileSource,
}

impl UploadedFile {
    /// File on the shared filesystem, tagged by its stem.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            name,
            source: FileSource::Path(path),
        }
    }

    pub fn from_buffer(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source: FileSource::Buffer(bytes),
        }
    }

    /// Decode one inline upload. The content must look like `<mime>,<base64>`.
    pub fn from_data_uri(name: &str, content: &str) -> Result<Self> {
        let (_content_type, payload) = content
            .split_once(',')
            .ok_or_else(|| DashError::InvalidUpload(format!("{name}: missing ',' separator")))?;
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| DashError::InvalidUpload(format!("{name}: {e}")))?;
        Ok(Self::from_buffer(name, bytes))
    }

    /// All bytes of the file.
    pub fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        match &self.source {
            FileSource::Path(path) => Ok(Cow::Owned(fs::read(path)?)),
            FileSource::Buffer(bytes) => Ok(Cow::Borrowed(bytes)),
        }
    }

    /// First line that is not empty or whitespace-only, without reading the
    /// whole file.
    pub fn first_record_line(&self) -> Result<Option<String>> {
        match &self.source {
            FileSource::Path(path) => first_non_blank(BufReader::new(File::open(path)?)),
            FileSource::Buffer(bytes) => first_non_blank(Cursor::new(bytes)),
        }
    }
}

fn first_non_blank(reader: impl BufRead) -> Result<Option<String>> {
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

/// Files of one request, keyed by an arbitrary index.
#[derive(Debug, Clone, Default)]
pub struct UploadSet {
    files: BTreeMap<usize, UploadedFile>,
}

impl UploadSet {
    pub fn from_chunked(paths: &ChunkedUploads) -> Self {
        let files = paths
            .iter()
            .map(|(i, path)| (*i, UploadedFile::from_path(path)))
            .collect();
        Self { files }
    }

    pub fn from_inline(inline: &InlineUploads) -> Result<Self> {
        if inline.contents.len() != inline.filenames.len() {
            return Err(DashError::InvalidUpload(format!(
                "{} contents for {} filenames",
                inline.contents.len(),
                inline.filenames.len()
            )));
        }
        let mut files = BTreeMap::new();
        for (i, (content, name)) in inline.contents.iter().zip(&inline.filenames).enumerate() {
            files.insert(i, UploadedFile::from_data_uri(name, content)?);
        }
        Ok(Self { files })
    }

    /// Pick the channel that supplied files. Inline uploads take precedence;
    /// neither channel yields an empty set.
    pub fn select(chunked: Option<&ChunkedUploads>, inline: Option<&InlineUploads>) -> Result<Self> {
        match (inline, chunked) {
            (Some(inline), _) if !inline.filenames.is_empty() => Self::from_inline(inline),
            (_, Some(chunked)) => Ok(Self::from_chunked(chunked)),
            _ => Ok(Self::default()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> impl Iterator<Item = &UploadedFile> {
        self.files.values()
    }

    pub fn first(&self) -> Option<&UploadedFile> {
        self.files.values().next()
    }

    /// Whether the set can be processed: at least one file, and every file
    /// has a record line.
    pub fn is_ready(&self) -> Result<bool> {
        if self.files.is_empty() {
            return Ok(false);
        }
        for file in self.files.values() {
            if file.first_record_line()?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Create a fresh `<temp>/<uuid>/` directory for one chunked upload.
pub fn new_upload_dir(temp_dir: &Path) -> Result<PathBuf> {
    let dir = temp_dir.join(Uuid::new_v4().to_string());
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Reduce a browser-supplied filename to its final component.
pub fn sanitize_filename(name: &str) -> Result<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(DashError::InvalidUpload(format!("bad filename {name:?}")));
    }
    Ok(base.to_string())
}

/// Reject chunked paths that do not point into `temp_dir`.
///
/// The index -> path map round-trips through the browser, so it is checked
/// before any handler opens a file from it.
pub fn check_chunked_paths(temp_dir: &Path, uploads: &ChunkedUploads) -> Result<()> {
    use std::path::Component;

    for path in uploads.values() {
        let inside = path.starts_with(temp_dir)
            && path
                .components()
                .all(|c| !matches!(c, Component::ParentDir | Component::CurDir));
        if !inside {
            return Err(DashError::InvalidPath(path.display().to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn data_uri(text: &str) -> String {
        format!("data:text/plain;base64,{}", STANDARD.encode(text))
    }

    #[test]
    fn inline_upload_is_decoded_in_memory() {
        let inline = InlineUploads {
            contents: vec![data_uri("{\"a\": 1}\n")],
            filenames: vec!["a.txt".into()],
        };
        let set = UploadSet::from_inline(&inline).unwrap();
        assert_eq!(set.len(), 1);
        let file = set.first().unwrap();
        assert_eq!(file.name, "a.txt");
        assert_eq!(&*file.bytes().unwrap(), b"{\"a\": 1}\n");
    }

    #[test]
    fn inline_upload_without_separator_is_rejected() {
        let err = UploadedFile::from_data_uri("x.txt", "no separator").unwrap_err();
        assert!(matches!(err, DashError::InvalidUpload(_)));
    }

    #[test]
    fn inline_upload_with_bad_base64_is_rejected() {
        let err = UploadedFile::from_data_uri("x.txt", "data:;base64,@@@").unwrap_err();
        assert!(matches!(err, DashError::InvalidUpload(_)));
    }

    #[test]
    fn mismatched_inline_lists_are_rejected() {
        let inline = InlineUploads {
            contents: vec![data_uri("{}")],
            filenames: vec![],
        };
        assert!(UploadSet::from_inline(&inline).is_err());
    }

    #[test]
    fn chunked_upload_is_tagged_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my_data_10.txt");
        fs::write(&path, "\n\n{\"a\": 1}\n").unwrap();

        let mut paths = ChunkedUploads::new();
        paths.insert(0, path);
        let set = UploadSet::from_chunked(&paths);
        let file = set.first().unwrap();
        assert_eq!(file.name, "my_data_10");
        assert_eq!(file.first_record_line().unwrap().as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn no_channel_means_empty_not_error() {
        let set = UploadSet::select(None, None).unwrap();
        assert!(set.is_empty());
        assert!(!set.is_ready().unwrap());
    }

    #[test]
    fn inline_channel_wins_over_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        fs::write(&path, "{\"a\": 1}\n").unwrap();
        let mut paths = ChunkedUploads::new();
        paths.insert(0, path);
        let inline = InlineUploads {
            contents: vec![data_uri("{\"b\": 2}")],
            filenames: vec!["small.txt".into()],
        };

        let set = UploadSet::select(Some(&paths), Some(&inline)).unwrap();
        assert_eq!(set.first().unwrap().name, "small.txt");
    }

    #[test]
    fn blank_only_file_is_not_ready() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "   ").unwrap();
        writeln!(file).unwrap();
        let mut paths = ChunkedUploads::new();
        paths.insert(0, file.path().to_path_buf());
        assert!(!UploadSet::from_chunked(&paths).is_ready().unwrap());
    }

    #[test]
    fn filenames_are_reduced_to_their_last_component() {
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("C:\\data\\a.txt").unwrap(), "a.txt");
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename("dir/").is_err());
    }

    #[test]
    fn chunked_paths_must_stay_in_temp() {
        let temp = Path::new("/srv/temp");
        let mut ok = ChunkedUploads::new();
        ok.insert(0, temp.join("abc").join("a.txt"));
        assert!(check_chunked_paths(temp, &ok).is_ok());

        let mut outside = ChunkedUploads::new();
        outside.insert(0, PathBuf::from("/etc/passwd"));
        assert!(matches!(
            check_chunked_paths(temp, &outside),
            Err(DashError::InvalidPath(_))
        ));

        let mut escaping = ChunkedUploads::new();
        escaping.insert(0, temp.join("..").join("secret"));
        assert!(check_chunked_paths(temp, &escaping).is_err());
    }
}
