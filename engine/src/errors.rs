//! Translation of `ureq` and socket failures into the core taxonomy.

use std::io;

use hothttp_core::{Error, TimeoutKind};

pub(crate) fn from_ureq(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Timeout(ureq::Timeout::Connect | ureq::Timeout::Resolve) => {
            Error::Timeout(TimeoutKind::Connect)
        }
        ureq::Error::Timeout(_) => Error::Timeout(TimeoutKind::Read),
        ureq::Error::HostNotFound => Error::Resolution("host not found".into()),
        ureq::Error::ConnectionFailed => Error::ConnectionRefused("connection failed".into()),
        ureq::Error::BadUri(uri) => Error::MalformedUrl(uri),
        ureq::Error::InvalidProxyUrl => Error::MalformedUrl("invalid proxy url".into()),
        ureq::Error::TooManyRedirects => Error::Transport("too many redirects".into()),
        // Raised for a 307 or 308 that would need the body again; ureq keeps
        // no status, so report the more common one.
        ureq::Error::RedirectFailed => Error::RetryImpossible { status: 307 },
        ureq::Error::Tls(reason) => Error::Security(reason.to_string()),
        ureq::Error::Io(err) => from_io(err),
        other => Error::Transport(other.to_string()),
    }
}

pub(crate) fn from_io(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut => Error::Timeout(TimeoutKind::Read),
        io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(err.to_string()),
        io::ErrorKind::OutOfMemory => Error::ResourceExhausted,
        _ => {
            let message = err.to_string();
            // Body readers wrap ureq's own errors in io::Error.
            match err.into_inner().map(|inner| inner.downcast::<ureq::Error>()) {
                Some(Ok(inner)) => from_ureq(*inner),
                _ => Error::Transport(message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_split_by_phase() {
        assert!(matches!(
            from_ureq(ureq::Error::Timeout(ureq::Timeout::Connect)),
            Error::Timeout(TimeoutKind::Connect)
        ));
        assert!(matches!(
            from_ureq(ureq::Error::Timeout(ureq::Timeout::RecvBody)),
            Error::Timeout(TimeoutKind::Read)
        ));
    }

    #[test]
    fn resolution_and_refusal_are_distinct() {
        assert!(matches!(from_ureq(ureq::Error::HostNotFound), Error::Resolution(_)));
        assert!(matches!(
            from_ureq(ureq::Error::ConnectionFailed),
            Error::ConnectionRefused(_)
        ));
        assert!(matches!(
            from_ureq(ureq::Error::TooManyRedirects),
            Error::Transport(_)
        ));
    }

    #[test]
    fn refused_body_redirect_needs_a_manual_retry() {
        assert!(matches!(
            from_ureq(ureq::Error::RedirectFailed),
            Error::RetryImpossible { status: 307 }
        ));
    }

    #[test]
    fn wrapped_ureq_errors_are_unwrapped() {
        let io_err = io::Error::new(io::ErrorKind::Other, ureq::Error::HostNotFound);
        assert!(matches!(from_io(io_err), Error::Resolution(_)));
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(from_io(io_err), Error::Timeout(TimeoutKind::Read)));
    }
}
