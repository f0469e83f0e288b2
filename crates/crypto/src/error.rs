use thiserror::Error;
use veilnet_core::VeilnetError;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("crypto primitive failed: {0}")]
    Primitive(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

impl From<CryptoError> for VeilnetError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Primitive(msg) => VeilnetError::Crypto(msg),
            CryptoError::InvalidInput(msg) => VeilnetError::InvalidInput(msg),
        }
    }
}
