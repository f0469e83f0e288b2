use thiserror::Error;

/// Tagged error taxonomy for the core. Recovery is strictly local: no
/// variant is allowed to propagate past the owning path, hop, or database
/// entry; callers translate at the host boundary.
#[derive(Error, Debug)]
pub enum VeilnetError {
    #[error("crypto operation failed: {0}")]
    Crypto(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("bad signature")]
    BadSignature,

    #[error("contact expired")]
    Expired,

    #[error("wrong network id: {0}")]
    WrongNetId(String),

    #[error("bogon address: {0}")]
    BogonAddress(String),

    #[error("replay detected")]
    ReplayDetected,

    #[error("queue full")]
    QueueFull,

    #[error("decrypt failure")]
    DecryptFailure,

    #[error("timeout")]
    Timeout,

    #[error("no router available for hop selection")]
    NoRouter,

    #[error("io error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, VeilnetError>;

impl From<std::io::Error> for VeilnetError {
    fn from(e: std::io::Error) -> Self {
        VeilnetError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_bad_signature() {
        assert_eq!(VeilnetError::BadSignature.to_string(), "bad signature");
    }

    #[test]
    fn test_error_display_wrong_net_id() {
        let err = VeilnetError::WrongNetId("gamma".to_string());
        assert_eq!(err.to_string(), "wrong network id: gamma");
    }

    #[test]
    fn test_error_display_queue_full() {
        assert_eq!(VeilnetError::QueueFull.to_string(), "queue full");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: VeilnetError = io.into();
        assert!(matches!(err, VeilnetError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_result_type() {
        let ok: Result<u8> = Ok(3);
        assert!(ok.is_ok());
        let err: Result<u8> = Err(VeilnetError::Timeout);
        assert!(err.is_err());
    }
}
