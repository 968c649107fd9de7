//! Typed success/error outcomes
//!
//! An [`Outcome`] is the settled value of an asynchronous operation: either a
//! success carrying a value, or a [`Failure`] carrying an error kind and an
//! optional payload. Domain errors travel as data here and are never raised.
//!
//! The cancellation kind is reserved. User code builds failures through
//! [`err`] and [`err_with`], which can only produce [`ErrorKind::Domain`];
//! [`ErrorKind::Cancelled`] is synthesized when a [`CancellationToken`]
//! wins the race against the source.
//!
//! [`CancellationToken`]: crate::cancellation::CancellationToken

use std::fmt;

/// The discriminator of a failed outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind<K> {
    /// The operation was cancelled before its source settled
    Cancelled,
    /// A caller-defined error kind
    Domain(K),
}

impl<K> ErrorKind<K> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ErrorKind::Cancelled)
    }

    /// The caller-defined kind, if this is not a cancellation
    pub fn domain(&self) -> Option<&K> {
        match self {
            ErrorKind::Cancelled => None,
            ErrorKind::Domain(kind) => Some(kind),
        }
    }
}

impl<K: fmt::Display> fmt::Display for ErrorKind<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Cancelled => f.write_str("CANCELLED"),
            ErrorKind::Domain(kind) => kind.fmt(f),
        }
    }
}

/// The error half of an [`Outcome`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure<K, P = ()> {
    pub kind: ErrorKind<K>,
    pub payload: Option<P>,
}

impl<K, P> Failure<K, P> {
    /// The failure synthesized on cancellation. It never carries a payload.
    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            payload: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind.is_cancelled()
    }
}

/// The settled result of an asynchronous operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, K, P = ()> {
    Ok(T),
    Err(Failure<K, P>),
}

/// Build a successful outcome
pub fn ok<T, K, P>(value: T) -> Outcome<T, K, P> {
    Outcome::Ok(value)
}

/// Build a failed outcome with a caller-defined kind and no payload
pub fn err<T, K, P>(kind: K) -> Outcome<T, K, P> {
    Outcome::Err(Failure {
        kind: ErrorKind::Domain(kind),
        payload: None,
    })
}

/// Build a failed outcome with a caller-defined kind and a payload
pub fn err_with<T, K, P>(kind: K, payload: P) -> Outcome<T, K, P> {
    Outcome::Err(Failure {
        kind: ErrorKind::Domain(kind),
        payload: Some(payload),
    })
}

impl<T, K, P> Outcome<T, K, P> {
    /// The outcome reported in place of the source's when cancellation wins
    pub fn cancelled() -> Self {
        Outcome::Err(Failure::cancelled())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Err(failure) if failure.is_cancelled())
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Ok(value) => Some(value),
            Outcome::Err(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure<K, P>> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Err(failure) => Some(failure),
        }
    }

    /// Transform the success value, leaving failures untouched
    pub fn map<U, F>(self, f: F) -> Outcome<U, K, P>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Outcome::Ok(value) => Outcome::Ok(f(value)),
            Outcome::Err(failure) => Outcome::Err(failure),
        }
    }

    pub fn into_result(self) -> Result<T, Failure<K, P>> {
        match self {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(failure) => Err(failure),
        }
    }
}

impl<T, K, P> From<Result<T, K>> for Outcome<T, K, P> {
    fn from(result: Result<T, K>) -> Self {
        match result {
            Ok(value) => ok(value),
            Err(kind) => err(kind),
        }
    }
}
