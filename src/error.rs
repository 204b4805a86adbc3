use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

/// HTTP status code type, re-exported for use with error inspection.
pub use reqwest::StatusCode;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Non-authentication socket failure, recovered by backoff until the ceiling is reached
    Transport,
    /// Access token was rejected and could not be refreshed
    AuthExpired,
    /// Inbound frame was not a valid envelope
    MalformedFrame,
    /// A registered consumer failed while handling a frame
    Handler,
    /// A frame was sent while the socket was not open
    SendWhileClosed,
    /// Error related to invalid configuration or arguments
    Validation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn auth_expired<S: Into<String>>(message: S) -> Self {
        AuthExpired {
            reason: message.into(),
        }
        .into()
    }

    pub fn status<S: Into<String>>(status_code: StatusCode, path: String, message: S) -> Self {
        Status {
            status_code,
            path,
            message: message.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Non-successful response from the token refresh endpoint.
#[non_exhaustive]
#[derive(Debug)]
pub struct Status {
    pub status_code: StatusCode,
    pub path: String,
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error({}) calling {} with {}",
            self.status_code, self.path, self.message
        )
    }
}

impl StdError for Status {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

#[non_exhaustive]
#[derive(Debug)]
pub struct AuthExpired {
    pub reason: String,
}

impl fmt::Display for AuthExpired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication expired: {}", self.reason)
    }
}

impl StdError for AuthExpired {}

/// A consumer handler returned an error or panicked.
#[non_exhaustive]
#[derive(Debug)]
pub struct HandlerFailure {
    pub handler: String,
    pub message: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler `{}` failed: {}", self.handler, self.message)
    }
}

impl StdError for HandlerFailure {}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<AuthExpired> for Error {
    fn from(err: AuthExpired) -> Self {
        Error::with_source(Kind::AuthExpired, err)
    }
}

impl From<Status> for Error {
    fn from(err: Status) -> Self {
        let kind = if err.status_code == StatusCode::UNAUTHORIZED
            || err.status_code == StatusCode::FORBIDDEN
        {
            Kind::AuthExpired
        } else {
            Kind::Internal
        };
        Error::with_source(kind, err)
    }
}

impl From<HandlerFailure> for Error {
    fn from(err: HandlerFailure) -> Self {
        Error::with_source(Kind::Handler, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_status_maps_to_auth_expired() {
        let error: Error = Status {
            status_code: StatusCode::UNAUTHORIZED,
            path: "/auth/refresh/".to_owned(),
            message: "token not valid".to_owned(),
        }
        .into();

        assert_eq!(error.kind(), Kind::AuthExpired);
        assert!(error.to_string().contains("/auth/refresh/"));
    }

    #[test]
    fn server_error_status_maps_to_internal() {
        let error = Error::status(
            StatusCode::INTERNAL_SERVER_ERROR,
            "/auth/refresh/".to_owned(),
            "boom",
        );

        assert_eq!(error.kind(), Kind::Internal);
        assert!(error.downcast_ref::<Status>().is_some());
    }

    #[test]
    fn handler_failure_display_names_handler() {
        let error: Error = HandlerFailure {
            handler: "chat".to_owned(),
            message: "bad payload".to_owned(),
        }
        .into();

        assert_eq!(error.kind(), Kind::Handler);
        assert_eq!(
            error.to_string(),
            "Handler: handler `chat` failed: bad payload"
        );
    }
}
