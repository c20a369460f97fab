use std::path::PathBuf;

/// error type for image-build operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{codec} compression failed: {message}")]
    Compression {
        codec: &'static str,
        message: String,
    },

    #[error("unknown compressor: {0}")]
    UnknownCompressor(String),

    #[error("entry name too long ({len} bytes): {name}")]
    NameTooLong { name: String, len: usize },

    #[error("invalid entry name: {0}")]
    InvalidEntryName(String),

    #[error("type conflict at {name}: cannot replace {existing} with {requested}")]
    TypeConflict {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("id table full: more than 65536 distinct uids/gids")]
    IdTableFull,

    #[error("writer thread failed; image is unusable")]
    WriterFailed,

    #[error("unsupported file type at {0}")]
    UnsupportedFileType(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
