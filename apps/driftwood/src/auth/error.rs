use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token issuance failed: {0}")]
    Issuance(String),
    #[error("participation token rejected")]
    Unauthorized,
    #[error("network error: {0}")]
    Network(String),
}
