pub type Result<T> = std::result::Result<T, DmalinkError>;

#[derive(Debug, thiserror::Error)]
pub enum DmalinkError {
    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("accelerator device in broken state: {0}")]
    Accelerator(String),

    #[error("memory registration failed: {0}")]
    Registration(String),

    #[error("transport device error: {0}")]
    Device(String),

    #[error("descriptor exchange failed: {0}")]
    Exchange(String),

    #[error("queue pair transition to {state} rejected (rc={rc})")]
    QpTransition { state: &'static str, rc: i32 },

    #[error("completion queue poll failed")]
    Poll,

    #[error("work completion failed: {status}")]
    CompletionStatus { status: String },

    #[error("completion poll timed out after {attempts} attempts")]
    PollTimeout { attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DmalinkError {
    /// Create an `Allocation` error with just a message.
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    /// Create an `Accelerator` error with just a message.
    pub fn accelerator(msg: impl Into<String>) -> Self {
        Self::Accelerator(msg.into())
    }

    /// Create a `Registration` error with just a message.
    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create an `Exchange` error with just a message.
    pub fn exchange(msg: impl Into<String>) -> Self {
        Self::Exchange(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qp_transition_display() {
        let e = DmalinkError::QpTransition {
            state: "READY_TO_RECEIVE",
            rc: 22,
        };
        assert_eq!(
            e.to_string(),
            "queue pair transition to READY_TO_RECEIVE rejected (rc=22)"
        );
    }

    #[test]
    fn test_poll_timeout_display() {
        let e = DmalinkError::PollTimeout { attempts: 1_000_000 };
        assert_eq!(
            e.to_string(),
            "completion poll timed out after 1000000 attempts"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port busy");
        let err: DmalinkError = io_err.into();
        assert!(err.to_string().contains("port busy"));
    }

    #[test]
    fn test_all_variants_display() {
        // Ensure all variants produce non-empty display strings
        let errors: Vec<DmalinkError> = vec![
            DmalinkError::allocation("every strategy exhausted"),
            DmalinkError::accelerator("cannot query device info"),
            DmalinkError::registration("no registrable memory"),
            DmalinkError::device("ibv_open_device failed"),
            DmalinkError::exchange("short read"),
            DmalinkError::QpTransition {
                state: "INIT",
                rc: -1,
            },
            DmalinkError::Poll,
            DmalinkError::CompletionStatus {
                status: "IBV_WC_RETRY_EXC_ERR".into(),
            },
            DmalinkError::PollTimeout { attempts: 10 },
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
