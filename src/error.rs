use thiserror::Error;

/// Everything the core can report to a caller.
///
/// The first five kinds describe the on-disk state and are recoverable in the
/// sense that repair commands may still run against the open device. The rest
/// are I/O or user-input failures and abort the invocation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no GPT signature present")]
    NotGpt,

    #[error("unexpected on-disk layout: {0}")]
    Unexpected(&'static str),

    #[error("header integrity check failed")]
    Corrupt,

    #[error("partition array integrity check failed")]
    CorruptPtable,

    #[error("backup table is faulty")]
    CorruptBackup,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse UUID: {0:?}")]
    BadUuid(String),

    #[error("label longer than {0} UTF-16 code units")]
    LabelTooLong(usize),

    #[error("no free span fits the requested range")]
    NoFit,

    #[error("could not parse {0}: {1:?}")]
    Parse(&'static str, String),
}

impl Error {
    /// True for the kinds that describe table state rather than a failed
    /// operation. The print path reports these and carries on.
    pub fn is_table_state(&self) -> bool {
        matches!(
            self,
            Error::NotGpt
                | Error::Unexpected(_)
                | Error::Corrupt
                | Error::CorruptPtable
                | Error::CorruptBackup
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
