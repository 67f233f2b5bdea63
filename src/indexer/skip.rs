//! Skip predicates applied before any extraction work.
use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use crate::extract::extension_of;

const EXECUTABLE_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "bin", "msi", "com", "o", "obj", "a", "lib", "class", "pyc",
    "wasm", "app", "apk",
];

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "ico", "webp", "svg", "heic", "psd", "raw",
];

const MEDIA_EXTENSIONS: &[&str] = &[
    "mp3", "wav", "flac", "ogg", "aac", "m4a", "wma", "mp4", "mkv", "avi", "mov", "wmv", "webm",
    "flv", "m4v",
];

const ARCHIVE_EXTENSIONS: &[&str] = &[
    "zip", "tar", "gz", "tgz", "bz2", "xz", "7z", "rar", "zst", "iso", "dmg", "jar", "cab",
];

/// Why a file was left out of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Hidden,
    System,
    TooLarge { size: u64, limit: u64 },
    BinaryExecutable,
    Image,
    Media,
    Archive,
    IndexDatabase,
    Unsupported { extension: Option<String> },
    EmptyContent,
    Unchanged,
}

impl SkipReason {
    /// Stable key used when grouping skips in reports.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Hidden => "hidden",
            Self::System => "system",
            Self::TooLarge { .. } => "too_large",
            Self::BinaryExecutable => "binary_executable",
            Self::Image => "image",
            Self::Media => "media",
            Self::Archive => "archive",
            Self::IndexDatabase => "index_database",
            Self::Unsupported { .. } => "unsupported_type",
            Self::EmptyContent => "empty_content",
            Self::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hidden => write!(f, "hidden file"),
            Self::System => write!(f, "system file"),
            Self::TooLarge { size, limit } => {
                write!(f, "file too large ({size} bytes, limit {limit} bytes)")
            }
            Self::BinaryExecutable => write!(f, "binary executable"),
            Self::Image => write!(f, "image file"),
            Self::Media => write!(f, "audio/video file"),
            Self::Archive => write!(f, "archive"),
            Self::IndexDatabase => write!(f, "index database file"),
            Self::Unsupported {
                extension: Some(ext),
            } => write!(f, "no extractor for type .{ext}"),
            Self::Unsupported { extension: None } => {
                write!(f, "no extractor for files without an extension")
            }
            Self::EmptyContent => write!(f, "no extractable text"),
            Self::Unchanged => write!(f, "unchanged since last index"),
        }
    }
}

/// Name starts with a dot.
pub fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}

#[cfg(windows)]
fn is_system(metadata: &Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;
    metadata.file_attributes() & FILE_ATTRIBUTE_SYSTEM != 0
}

#[cfg(not(windows))]
fn is_system(_metadata: &Metadata) -> bool {
    false
}

/// The ordered predicates checked for every walked file.
#[derive(Debug, Clone)]
pub struct SkipRules {
    pub max_file_size: u64,
    /// The index database; it and its WAL side files are never indexed.
    pub db_path: Option<PathBuf>,
}

impl SkipRules {
    pub fn new(max_file_size: u64, db_path: Option<PathBuf>) -> Self {
        Self {
            max_file_size,
            db_path,
        }
    }

    /// First matching reason, in order: hidden, system, size, extension class.
    pub fn check(&self, path: &Path, metadata: &Metadata) -> Option<SkipReason> {
        if path.file_name().is_some_and(is_hidden) {
            return Some(SkipReason::Hidden);
        }
        if is_system(metadata) {
            return Some(SkipReason::System);
        }
        if metadata.len() > self.max_file_size {
            return Some(SkipReason::TooLarge {
                size: metadata.len(),
                limit: self.max_file_size,
            });
        }
        if self.is_index_database(path) {
            return Some(SkipReason::IndexDatabase);
        }

        let ext = extension_of(path)?;
        let ext = ext.as_str();
        if EXECUTABLE_EXTENSIONS.contains(&ext) {
            Some(SkipReason::BinaryExecutable)
        } else if IMAGE_EXTENSIONS.contains(&ext) {
            Some(SkipReason::Image)
        } else if MEDIA_EXTENSIONS.contains(&ext) {
            Some(SkipReason::Media)
        } else if ARCHIVE_EXTENSIONS.contains(&ext) {
            Some(SkipReason::Archive)
        } else {
            None
        }
    }

    fn is_index_database(&self, path: &Path) -> bool {
        let Some(db) = &self.db_path else {
            return false;
        };
        let Some(db_name) = db.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if path.parent() != db.parent() {
            return false;
        }
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| {
                name == db_name
                    || ["-wal", "-shm", "-journal"]
                        .iter()
                        .any(|suffix| name.strip_suffix(suffix) == Some(db_name))
            })
    }
}
