use thiserror::Error;

/// Errors returned by the `validate` methods of configuration types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field holds a value outside of its accepted range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// Two jobs share the same name.
    #[error("job `{0}` is defined more than once")]
    DuplicateJobName(String),
    /// Two jobs drive the same consumer, which would make them race on one cursor.
    #[error("consumer `{consumer}` is used by both `{first}` and `{second}`")]
    SharedConsumer {
        consumer: String,
        first: String,
        second: String,
    },
}
