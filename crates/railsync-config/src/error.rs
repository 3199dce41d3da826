use std::path::PathBuf;

/// Why `config.ron` could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not valid RON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    #[error("cannot serialise config: {0}")]
    Serialize(#[from] ron::Error),

    /// A setting is out of range.
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: &'static str },

    #[error("no configuration directory available on this platform")]
    NoConfigDir,
}
