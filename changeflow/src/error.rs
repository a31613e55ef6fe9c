//! Error types and result definitions for changeflow operations.
//!
//! [`ChangeflowError`] carries a classified [`ErrorKind`], a static description, optional dynamic
//! detail and source, plus the callsite and a backtrace captured when the error was built. Errors
//! from several jobs or workers can be aggregated into one value.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Result type for changeflow operations.
pub type ChangeflowResult<T> = Result<T, ChangeflowError>;

/// Payload of a single [`ChangeflowError`].
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the engine.
///
/// Build it through the [`crate::changeflow_error!`] and [`crate::bail!`] macros or one of the
/// `From` conversions.
#[derive(Debug, Clone)]
pub struct ChangeflowError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Several errors collected together, e.g. from every job that failed during shutdown.
    Many {
        errors: Vec<ChangeflowError>,
        location: &'static Location<'static>,
    },
}

/// Classification of failures.
///
/// The first four kinds are the ones surfaced by the core components; the rest support them.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Reading or writing the table store failed. No partial state is left behind.
    StorageError,
    /// A cursor moved under a consumer between reading a batch and advancing past it.
    ConcurrentCursorConflict,
    /// The target transaction of a merge failed and was rolled back as a whole.
    TransactionAbort,
    /// Invalid setup such as a bad schedule expression or an unknown consumer.
    ConfigurationError,

    /// A change batch mixes entries of several source tables and cannot be merged.
    InvalidData,
    /// An operation was requested in a lifecycle state that does not allow it.
    InvalidState,
    /// A merge cycle exceeded its configured timeout.
    JobTimeout,
    /// A job task panicked.
    JobWorkerPanic,

    IoError,
    SerializationError,
    DeserializationError,

    Unknown,

    /// Raised by fail points injected in tests.
    #[cfg(feature = "failpoints")]
    FailPointInjected,
}

impl ErrorKind {
    /// Returns `true` for failures the scheduler simply retries on the next tick.
    ///
    /// Everything else is reported to the operator as fatal for the affected cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::ConcurrentCursorConflict
            | ErrorKind::TransactionAbort
            | ErrorKind::JobTimeout => true,
            #[cfg(feature = "failpoints")]
            ErrorKind::FailPointInjected => true,
            _ => false,
        }
    }
}

impl ChangeflowError {
    /// Returns the [`ErrorKind`] of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description, or `None` for aggregated errors.
    pub fn description(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.description.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the dynamic detail, or the first one found among aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns `true` when the scheduler should retry the cycle on its next tick.
    ///
    /// Aggregated errors are retryable only if all of their members are.
    pub fn is_retryable(&self) -> bool {
        self.kinds().iter().all(ErrorKind::is_retryable)
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error, exposed through [`error::Error::source`].
    ///
    /// Has no effect on aggregated errors, which forward their first member as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        ChangeflowError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for ChangeflowError {
    fn eq(&self, other: &ChangeflowError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ChangeflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                write!(
                    f,
                    "[{:?}] {} @ {}:{}",
                    payload.kind,
                    payload.description,
                    payload.location.file(),
                    payload.location.line(),
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail:")?;
                    for line in detail.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for ChangeflowError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Creates a [`ChangeflowError`] from a kind and static description.
impl From<(ErrorKind, &'static str)> for ChangeflowError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> ChangeflowError {
        ChangeflowError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`ChangeflowError`] from a kind, static description and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for ChangeflowError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> ChangeflowError {
        ChangeflowError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates several errors; a single error is returned unwrapped.
impl<E> From<Vec<E>> for ChangeflowError
where
    E: Into<ChangeflowError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> ChangeflowError {
        let location = Location::caller();
        let mut errors: Vec<ChangeflowError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        ChangeflowError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for ChangeflowError {
    #[track_caller]
    fn from(err: std::io::Error) -> ChangeflowError {
        let detail = err.to_string();
        ChangeflowError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for ChangeflowError {
    #[track_caller]
    fn from(err: serde_json::Error) -> ChangeflowError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        ChangeflowError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<changeflow_config::shared::ValidationError> for ChangeflowError {
    #[track_caller]
    fn from(err: changeflow_config::shared::ValidationError) -> ChangeflowError {
        let detail = err.to_string();
        ChangeflowError::from_components(
            ErrorKind::ConfigurationError,
            Cow::Borrowed("Invalid configuration"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
