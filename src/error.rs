use thiserror::Error;

/// Errors raised by the cluster table engine, the checker and their collaborators.
#[derive(Error, Debug)]
pub enum FatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no free clusters left on the volume")]
    NoSpace,

    #[error("corrupt cluster chain at cluster {cluster}: {detail}")]
    Corrupt { cluster: u32, detail: String },

    #[error("cluster {cluster} is outside the chain or the table")]
    OutOfRange { cluster: u32 },

    #[error("media changed during operation")]
    MediaChanged,

    #[error("device is read-only")]
    ReadOnly,

    #[error("invalid FAT volume: {0}")]
    InvalidVolume(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl FatError {
    pub(crate) fn corrupt(cluster: u32, detail: impl Into<String>) -> Self {
        FatError::Corrupt {
            cluster,
            detail: detail.into(),
        }
    }
}

pub type Result<T, E = FatError> = std::result::Result<T, E>;
