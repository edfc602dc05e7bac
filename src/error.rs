use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

/// HTTP method type, re-exported for use with error inspection.
pub use reqwest::Method;
/// HTTP status code type, re-exported for use with error inspection.
pub use reqwest::StatusCode;
use reqwest::header;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// No credential was available, or the server rejected it during the handshake.
    /// Fatal, never retried.
    Authentication,
    /// Unexpected closure or connect failure. Retried by the reconnection scheduler and only
    /// surfaced once the attempts are exhausted.
    Network,
    /// The server refused one channel subscription. Scoped to that channel.
    SubscriptionRejected,
    /// Malformed or unroutable push envelope
    Protocol,
    /// Error related to non-successful HTTP call
    Status,
    /// Error related to invalid state within orderdesk-sync
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

    /// Whether this error should be shown to the user as an actionable failure.
    ///
    /// Everything other than authentication failures and exhausted reconnection is
    /// self-healing.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        match self.kind {
            Kind::Authentication => true,
            Kind::Network => self.downcast_ref::<RetriesExhausted>().is_some(),
            _ => false,
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Authentication {
            reason: message.into(),
        }
        .into()
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Protocol {
            reason: message.into(),
        }
        .into()
    }

    pub fn status<S: Into<String>>(
        status_code: StatusCode,
        method: Method,
        path: String,
        message: S,
    ) -> Self {
        Status {
            status_code,
            method,
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

#[non_exhaustive]
#[derive(Debug)]
pub struct Status {
    pub status_code: StatusCode,
    pub method: Method,
    pub path: String,
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error({}) making {} call to {} with {}",
            self.status_code, self.method, self.path, self.message
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
pub struct Authentication {
    pub reason: String,
}

impl fmt::Display for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication failed: {}", self.reason)
    }
}

impl StdError for Authentication {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Protocol {
    pub reason: String,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol error: {}", self.reason)
    }
}

impl StdError for Protocol {}

/// The reconnection scheduler gave up after `attempts` consecutive failures.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct RetriesExhausted {
    pub attempts: u32,
}

impl fmt::Display for RetriesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "push connection lost, gave up after {} reconnection attempts",
            self.attempts
        )
    }
}

impl StdError for RetriesExhausted {}

/// A channel subscription was refused by the server.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SubscriptionRejected {
    pub channel: String,
    pub reason: String,
}

impl fmt::Display for SubscriptionRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subscription to channel {} rejected: {}",
            self.channel, self.reason
        )
    }
}

impl StdError for SubscriptionRejected {}

impl From<Authentication> for Error {
    fn from(err: Authentication) -> Self {
        Error::with_source(Kind::Authentication, err)
    }
}

impl From<Protocol> for Error {
    fn from(err: Protocol) -> Self {
        Error::with_source(Kind::Protocol, err)
    }
}

impl From<RetriesExhausted> for Error {
    fn from(err: RetriesExhausted) -> Self {
        Error::with_source(Kind::Network, err)
    }
}

impl From<SubscriptionRejected> for Error {
    fn from(err: SubscriptionRejected) -> Self {
        Error::with_source(Kind::SubscriptionRejected, err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::with_source(Kind::Network, e)
    }
}

impl From<header::InvalidHeaderValue> for Error {
    fn from(e: header::InvalidHeaderValue) -> Self {
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

impl From<Status> for Error {
    fn from(err: Status) -> Self {
        Error::with_source(Kind::Status, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exhausted_is_actionable_network_error() {
        let error: Error = RetriesExhausted { attempts: 10 }.into();

        assert_eq!(error.kind(), Kind::Network);
        assert!(error.is_actionable());
        assert!(error.to_string().contains("10 reconnection attempts"));
    }

    #[test]
    fn plain_network_error_is_self_healing() {
        let error = Error::with_source(Kind::Network, Protocol {
            reason: "socket reset".to_owned(),
        });

        assert!(!error.is_actionable());
    }

    #[test]
    fn rejection_is_scoped_and_not_actionable() {
        let error: Error = SubscriptionRejected {
            channel: "orders".to_owned(),
            reason: "forbidden".to_owned(),
        }
        .into();

        assert_eq!(error.kind(), Kind::SubscriptionRejected);
        assert!(!error.is_actionable());
        assert_eq!(
            error.downcast_ref::<SubscriptionRejected>().unwrap().channel,
            "orders"
        );
    }

    #[test]
    fn authentication_display_should_succeed() {
        let error = Error::authentication("no credential available");

        assert_eq!(error.kind(), Kind::Authentication);
        assert!(error.is_actionable());
        assert_eq!(
            error.to_string(),
            "Authentication: authentication failed: no credential available"
        );
    }
}
