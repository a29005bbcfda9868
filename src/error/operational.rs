//! Operational error context propagation with `anyhow`.
//!
//! This module provides extension traits and utilities for enhancing
//! error context and centralized error reporting.

use std::{error::Error as StdError, fmt::Display};

use {
    anyhow::{Context, Error, Result as AnyhowResult},
    tracing::{error, warn},
};

use crate::error::domain::{RemoteError, RemoteErrorKind};

/// Extension trait for enhanced error context.
///
/// This trait provides methods to add contextual information to errors,
/// making debugging and user feedback more informative.
pub trait ResultExt<T, E> {
    /// Adds context to an error with a static string.
    fn add_context(self, context: &'static str) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static;

    /// Adds context to an error with a formatted string.
    fn add_contextf(self, format: impl Display) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn add_context(self, context: &'static str) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static,
    {
        self.context(context)
    }

    fn add_contextf(self, format: impl Display) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static,
    {
        self.context(format.to_string())
    }
}

/// Centralized error reporting and logging.
///
/// Background work (the sync worker, store writes) has no caller to return
/// errors to, so it reports them here instead.
pub struct ErrorReporter;

impl ErrorReporter {
    /// Reports a recoverable failure, such as a remote write that will be retried.
    pub fn warn(error: &Error, context: &str) {
        warn!(context = context, error = %error, "Sync warning");
    }

    /// Reports a failure the worker cannot recover from on its own.
    pub fn error(error: &Error, context: &str) {
        error!(context = context, error = %error, "Sync error");
    }

    /// Converts an error to a message suitable for a status line.
    ///
    /// Remote failures are mapped to short, actionable text; everything else
    /// falls back to the top-level error message.
    pub fn to_user_message(error: &Error) -> String {
        match error.downcast_ref::<RemoteError>().map(|r| r.kind) {
            Some(RemoteErrorKind::Network) => "You appear to be offline".to_string(),
            Some(RemoteErrorKind::Unavailable) => "The server is busy, retrying later".to_string(),
            Some(RemoteErrorKind::Constraint) => "The server rejected this change".to_string(),
            Some(RemoteErrorKind::Unauthorized) => "Please sign in again".to_string(),
            None => error.to_string(),
        }
    }
}
