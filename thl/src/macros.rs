//! Shorthands for building [`crate::error::ThlError`] values.

/// Creates a [`crate::error::ThlError`] from a kind, a static description and, optionally, a
/// detail value and a `source:` error.
///
/// ```ignore
/// thl_error!(ErrorKind::InvalidState, "Pipeline already started");
/// thl_error!(ErrorKind::ConsistencyViolation, "Seqno moved backwards", format!("task {task_id}"));
/// thl_error!(ErrorKind::StoreIoError, "Append failed", source: err);
/// ```
#[macro_export]
macro_rules! thl_error {
    ($kind:expr, $desc:expr $(,)?) => {
        $crate::error::ThlError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr $(,)?) => {
        $crate::error::ThlError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr $(,)?) => {
        $crate::error::ThlError::from(($kind, $desc, ::std::string::ToString::to_string(&$detail)))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr $(,)?) => {
        $crate::error::ThlError::from(($kind, $desc, ::std::string::ToString::to_string(&$detail)))
            .with_source($source)
    };
}

/// Returns early with a [`crate::error::ThlError`] built by [`thl_error!`].
#[macro_export]
macro_rules! bail {
    ($($args:tt)+) => {
        return ::core::result::Result::Err($crate::thl_error!($($args)+))
    };
}
