use segfetch_engine::DownloadError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No downloadable stream: {0}")]
    NoStream(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Download(err) if err.is_cancelled())
    }
}

impl From<hls::HlsError> for AppError {
    fn from(err: hls::HlsError) -> Self {
        AppError::Download(err.into())
    }
}

impl From<dash::DashError> for AppError {
    fn from(err: dash::DashError) -> Self {
        AppError::Download(err.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
