//! Error types for payload parsing

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{what} too short: expected {expected} bytes, got {actual} bytes")]
    TooShort {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unexpected reply code: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedCode { expected: u8, actual: u8 },
}

impl Error {
    pub(crate) fn too_short(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::TooShort {
            what,
            expected,
            actual,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Parse(e.to_string())
    }
}
