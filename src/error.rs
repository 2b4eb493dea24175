#![forbid(unsafe_code)]

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
pub type VtnError = Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("registration rejected for VEN `{ven_name}`: {reason}")]
    RegistrationRejected { ven_name: String, reason: String },
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("delivery failure: {0}")]
    DeliveryFailure(#[from] DeliveryError),
    #[error("unknown VEN `{ven_id}`")]
    UnknownVen { ven_id: String },
    #[error("unknown event task `{task_id}`")]
    UnknownTask { task_id: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("duration parse error: {0}")]
    Duration(#[from] humantime::DurationError),
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Failure reading or writing the VEN backup snapshot.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("backup store `{store}` unavailable: {reason}")]
    Unavailable { store: &'static str, reason: String },
    #[error("backup snapshot under `{key}` is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode backup snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// The protocol collaborator could not hand an event to a VEN.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("VEN `{ven_id}` has no transport address")]
    NoTransport { ven_id: String },
    #[error("VEN `{ven_id}` rejected event: {reason}")]
    Rejected { ven_id: String, reason: String },
    #[error("transport error delivering to `{ven_id}`: {reason}")]
    Transport { ven_id: String, reason: String },
}

impl Error {
    pub fn new<E>(error: E) -> Self
    where
        Error: From<E>,
    {
        error.into()
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: Into<String>,
    {
        Self::Message(message.into())
    }

    pub fn with_context<M>(context: M, source: Error) -> Self
    where
        M: Into<String>,
    {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn rejected(ven_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RegistrationRejected {
            ven_name: ven_name.into(),
            reason: reason.into(),
        }
    }

    /// Walks context wrappers down to the originating error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self.root(), Error::Persistence(_))
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self.root(), Error::RegistrationRejected { .. })
    }
}

pub trait Context<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    Error: From<E>,
{
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.map_err(|err| Error::with_context(context.into(), err.into()))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| Error::with_context(f().into(), err.into()))
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Message(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Message(value.to_string())
    }
}

#[macro_export]
macro_rules! err {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        $crate::error::Error::msg(format!($fmt $(, $arg)*))
    }};
    ($err:expr) => {{
        $crate::error::Error::new($err)
    }};
}

#[macro_export]
macro_rules! bail_err {
    ($($arg:tt)*) => {{
        return Err($crate::err!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_persistence_root() {
        let inner = Error::from(PersistenceError::Unavailable {
            store: "memory",
            reason: "offline".to_string(),
        });
        let wrapped = Error::with_context("registering VEN", inner);

        assert!(wrapped.is_persistence());
        assert!(!wrapped.is_rejection());
        assert_eq!(wrapped.to_string(), "registering VEN");
    }

    #[test]
    fn rejection_message_names_ven() {
        let error = Error::rejected("HOUSE_404", "not preregistered");
        assert!(error.is_rejection());
        assert!(error.to_string().contains("HOUSE_404"));
    }
}
