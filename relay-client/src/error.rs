use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Push notifications are not supported here")]
    Unsupported,

    #[error("Sign in required")]
    NotSignedIn,

    #[error("Push notifications are not configured: {0}")]
    NotConfigured(String),

    #[error("Notification permission denied")]
    PermissionDenied,

    #[error("Notification permission prompt dismissed")]
    PermissionDismissed,

    #[error("Another subscription operation is in progress")]
    Busy,

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Failed to save subscription: {0}")]
    StoreWrite(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Invalid worker configuration: {0}")]
    Configuration(String),

    #[error("Resubscribe rejected: {0}")]
    Resubscribe(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
