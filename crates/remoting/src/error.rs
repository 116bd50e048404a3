//! # Error Definitions
//!
//! The taxonomy shared by every layer of the channel.
//!
//! - `Protocol` is fatal: the channel is torn down and every pending call faults.
//! - `Serialization` is local to one call; the channel stays usable.
//! - `Remote` carries a `Fault` captured on the peer and re-raised at the call site.
//! - `Connectivity` is never raised to event publishers; the failing entry is purged.
//! - `Cancelled` is cooperative and only produced at explicit check points.

use std::any::Any;

use crate::transport;

#[derive(Debug, Clone)]
pub enum Error {
    /// Malformed header, out-of-sync stream or unresolvable object id.
    Protocol(String),
    /// A value could not be classified, or a manual payload did not match its declared length.
    Serialization(String),
    /// The remote target raised a fault.
    Remote(Fault),
    /// The channel is broken or closed.
    Connectivity(String),
    /// Cancellation was requested on the observed token.
    Cancelled,
    /// Several independent failures, reported together.
    Aggregate(Vec<Error>),
    /// The task queue has been permanently disabled.
    Disabled,
    /// No reply arrived within the configured call timeout.
    Timeout,
    /// Unusable call target: an empty id, type or method name, or an event
    /// target that lost its registered type.
    InvalidTarget(String),
    /// A queued job or handler panicked.
    Panicked(String),
}

impl Error {
    /// Returns true for failures caused by a broken channel or an object the
    /// owner no longer has.
    ///
    /// These are the failures the event subsystem absorbs by purging the
    /// subscriber. A bad call target is a caller bug and is not one of them.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Connectivity(_) => true,
            Self::Remote(fault) => fault.kind == FaultKind::InstanceNotFound,
            _ => false,
        }
    }

    /// Returns true if this failure invalidates the whole channel.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Connectivity(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Self::Remote(fault) => write!(f, "Remote failure: {}", fault),
            Self::Connectivity(msg) => write!(f, "Connectivity error: {}", msg),
            Self::Cancelled => write!(f, "Cancellation requested"),
            Self::Aggregate(errors) => {
                write!(f, "{} failures:", errors.len())?;
                for e in errors {
                    write!(f, " [{}]", e)?;
                }
                Ok(())
            }
            Self::Disabled => write!(f, "Queue is disabled"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::InvalidTarget(msg) => write!(f, "Invalid call target: {}", msg),
            Self::Panicked(msg) => write!(f, "Panicked: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<wirepack::Error> for Error {
    fn from(e: wirepack::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Connectivity(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classes of failure reported in a fault reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The target method itself failed.
    Raised,
    /// The target object id is not registered on the owning side.
    InstanceNotFound,
    /// The target type has no such method.
    MethodNotFound,
    /// Arguments or the result could not be marshaled.
    Serialization,
    /// The call frame referenced something the owner cannot resolve.
    Protocol,
}

impl FaultKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Raised => "Raised",
            Self::InstanceNotFound => "NoInstance",
            Self::MethodNotFound => "NoMethod",
            Self::Serialization => "Serialization",
            Self::Protocol => "Protocol",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "Raised" => Ok(Self::Raised),
            "NoInstance" => Ok(Self::InstanceNotFound),
            "NoMethod" => Ok(Self::MethodNotFound),
            "Serialization" => Ok(Self::Serialization),
            "Protocol" => Ok(Self::Protocol),
            _ => Err(Error::Protocol(format!("unknown fault kind '{}'", tag))),
        }
    }
}

/// A failure captured on the owning side and marshaled back to the caller.
///
/// `type_name` is the Rust type of the original error where one was available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub type_name: String,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, type_name: type_name.into(), message: message.into() }
    }

    /// A failure raised by the invoked method.
    pub fn raised(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Raised, "fault", message)
    }

    fn from_crate_error(e: &Error) -> Self {
        let kind = match e {
            Error::Serialization(_) => FaultKind::Serialization,
            Error::Protocol(_) => FaultKind::Protocol,
            Error::Remote(inner) => return inner.clone(),
            _ => FaultKind::Raised,
        };
        Self::new(kind, std::any::type_name::<Error>(), e.to_string())
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.kind.as_tag(), self.type_name, self.message)
    }
}

/// Any error raised inside a handler becomes a `Raised` fault tagged with its type,
/// except the crate's own errors, which keep their classification.
impl<E: std::error::Error + Send + Sync + 'static> From<E> for Fault {
    fn from(e: E) -> Self {
        if let Some(own) = (&e as &dyn Any).downcast_ref::<Error>() {
            return Self::from_crate_error(own);
        }
        Self::new(FaultKind::Raised, std::any::type_name::<E>(), e.to_string())
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Self::Remote(fault)
    }
}
