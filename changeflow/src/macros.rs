//! Macros for building [`crate::error::ChangeflowError`] values.

/// Creates a [`crate::error::ChangeflowError`] from a kind, a static description and optional
/// detail and source.
///
/// Use `detail = <expr>` to move an owned [`String`] in, or pass any [`ToString`] value as the
/// third argument.
#[macro_export]
macro_rules! changeflow_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::ChangeflowError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::ChangeflowError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        $crate::error::ChangeflowError::from(($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::ChangeflowError::from(($kind, $desc, $detail.to_string()))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        $crate::error::ChangeflowError::from(($kind, $desc, $detail.to_string()))
            .with_source($source)
    };
}

/// Returns early with a [`crate::error::ChangeflowError`].
///
/// Accepts the same arguments as [`changeflow_error!`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return ::core::result::Result::Err($crate::changeflow_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::changeflow_error!($kind, $desc, source: $source))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        return ::core::result::Result::Err($crate::changeflow_error!($kind, $desc, detail = $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return ::core::result::Result::Err($crate::changeflow_error!($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        return ::core::result::Result::Err($crate::changeflow_error!(
            $kind,
            $desc,
            $detail,
            source: $source
        ))
    };
}
