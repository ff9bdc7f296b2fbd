/* Error taxonomy shared by every transport operation. */
/*                                                                 */
/* Using explicit kinds instead of opaque strings lets callers     */
/* take structured recovery actions: the attention poll keeps      */
/* looping on `TimedOut`, close swallows `PermissionDenied` when   */
/* the device already detached for replug, and the PS/2 ack        */
/* handshake distinguishes a silent device from a broken pipe.     */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RmiError {
    /* Sanity failure: oversized request, zero-sized or underflowing
     * response, malformed frame. */
    #[error("internal error: {0}")]
    Internal(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    /* Ack retries exhausted, or an operation the bound transport or
     * firmware revision cannot express. */
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    /* An expected sysfs node was not present. */
    #[error("invalid file: {0}")]
    InvalidFile(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O failure on {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },
}

impl RmiError {
    /* Recover the kind from an error that has been wrapped in any
     * number of context layers. */
    pub fn kind_of(err: &anyhow::Error) -> Option<&RmiError> {
        err.downcast_ref::<RmiError>()
    }

    pub fn is_timed_out(err: &anyhow::Error) -> bool {
        matches!(Self::kind_of(err), Some(RmiError::TimedOut(_)))
    }

    pub fn is_permission_denied(err: &anyhow::Error) -> bool {
        matches!(Self::kind_of(err), Some(RmiError::PermissionDenied(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context_chain() {
        let err: anyhow::Error = RmiError::TimedOut("no data".to_string()).into();
        let err = Err::<(), _>(err)
            .context("failed to read ack")
            .context("failed to write byte")
            .unwrap_err();
        assert!(RmiError::is_timed_out(&err));
        assert!(!RmiError::is_permission_denied(&err));
    }

    #[test]
    fn permission_denied_detected() {
        let err: anyhow::Error =
            RmiError::PermissionDenied("device detached".to_string()).into();
        assert!(RmiError::is_permission_denied(&err));
        assert!(!RmiError::is_timed_out(&err));
    }

    #[test]
    fn foreign_errors_have_no_kind() {
        let err = anyhow::anyhow!("some other failure");
        assert!(RmiError::kind_of(&err).is_none());
    }
}
