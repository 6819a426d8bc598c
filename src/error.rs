use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("suite spec conflict: {0}")]
    SpecConflict(String),

    #[error("result parse error: {0}")]
    ResultParse(String),

    #[error("suite infra failure: {0}")]
    Infra(String),

    #[error("backend dispatch failure: {0}")]
    Dispatch(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("build cancelled")]
    Cancelled,
}

impl Error {
    /// True for failures that poison a single suite but must not abort the
    /// rest of the build. Cancellation and config errors never are.
    pub fn is_suite_scoped(&self) -> bool {
        matches!(
            self,
            Error::ResultParse(_) | Error::Infra(_) | Error::Dispatch(_) | Error::Process(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
