//! Error types for the edge-orchestrator.
//!
//! A single taxonomy, [`OrchestratorError`], covers the three families of
//! failure the orchestrator can surface:
//!
//! - configuration errors, raised by compilation and `set_options` before
//!   anything is applied
//! - lifecycle errors, raised at the point of use of a disposed orchestrator
//!   or a stale binding handle
//! - per-request errors, which the front door converts into HTTP responses

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Top-level orchestrator errors.
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    /// Worker definitions did not have the expected shape.
    #[error("{0}")]
    Validation(ValidationError),

    /// Two workers share the same name.
    #[error("Multiple workers defined with the same `name`: \"{name}\"")]
    DuplicateName {
        /// The duplicated worker name.
        name: String,
    },

    /// The worker list was empty.
    #[error("No workers defined. At least one worker is required")]
    NoWorkers,

    /// A worker declared both an outbound service and a fetch mock.
    #[error(
        "Only one of `outbound_service` or `fetch_mock` may be specified per worker (\"{worker}\" specifies both)"
    )]
    MultipleOutbounds {
        /// The worker with conflicting outbound settings.
        worker: String,
    },

    /// A wrapped binding refers to a worker that cannot implement it.
    #[error(
        "Cannot use \"{target}\" for wrapped binding \"{binding}\" in worker \"{worker}\" because {reason}.\n{}",
        .reason.hint(.target)
    )]
    InvalidWrapped {
        /// Name of the wrapped binding.
        binding: String,
        /// Worker declaring the binding.
        worker: String,
        /// Worker named by the binding's `script_name`.
        target: String,
        /// Which invariant was violated.
        reason: WrappedReason,
    },

    /// The wrapped-binding graph contains a cycle.
    #[error("Generated wrapped-binding graph contains a cycle: {}", .cycle.join(" -> "))]
    Cyclic {
        /// Worker names along the cycle; the first name is repeated at the end.
        cycle: Vec<String>,
    },

    /// The orchestrator has been disposed.
    #[error("Orchestrator has been disposed")]
    Disposed,

    /// A worker, binding, or socket could not be found.
    #[error("{kind} \"{name}\" not found in {scope}")]
    NotFound {
        /// What was being looked up (`worker`, `binding`, `direct socket`, ...).
        kind: String,
        /// The requested name.
        name: String,
        /// Where the lookup happened.
        scope: String,
    },

    /// A binding exists but is not bound to the requested kind of resource.
    #[error("Binding \"{binding}\" in worker \"{worker}\" is not bound as a {expected}")]
    Unbound {
        /// The binding name.
        binding: String,
        /// The worker declaring it.
        worker: String,
        /// The kind that was requested.
        expected: String,
    },

    /// A binding handle was used after its engine process was replaced.
    #[error(
        "Attempted to use poisoned stub \"{name}\". Stubs obtained before a restart or dispose cannot be used afterwards"
    )]
    PoisonedStub {
        /// Name of the handle (`worker.binding` or `worker`).
        name: String,
    },

    /// The engine process could not be started or never became ready.
    #[error("Engine startup failed: {cause}")]
    StartupFailure {
        /// Human-readable description of the failure.
        cause: String,
        /// The underlying OS error, when one exists.
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// The client refused every encoding the server can produce.
    #[error("Unsupported Media Type: no acceptable encoding in \"{accept_encoding}\"")]
    UnsupportedEncoding {
        /// The `Accept-Encoding` request header value.
        accept_encoding: String,
    },

    /// The proxy shared secret header was missing, unexpected, or wrong.
    #[error("Disallowed header in request: {header}={value}")]
    ProxySecretMismatch {
        /// Header name.
        header: String,
        /// Header value as received.
        value: String,
    },

    /// Binding RPC or engine transport failure.
    #[error("Engine request failed: {reason}")]
    Transport {
        /// Description of the failure.
        reason: String,
    },
}

/// The wrapped-binding invariant that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrappedReason {
    /// The target is the entrypoint worker.
    IsEntrypoint,
    /// The target is a service-worker script rather than modules.
    NotModules,
    /// The target is also referenced by a service or Durable Object binding.
    ReferencedByService,
    /// The target declares its own compatibility settings or outbound service.
    OwnSettings,
    /// No worker with that name exists.
    UnknownTarget,
}

impl WrappedReason {
    /// Remediation hint shown under the error message.
    pub fn hint(self, target: &str) -> String {
        match self {
            Self::IsEntrypoint => {
                format!("Ensure \"{target}\" isn't the first entry in the `workers` array.")
            }
            Self::NotModules => {
                format!("Ensure \"{target}\" sets `script` to `modules` format.")
            }
            Self::ReferencedByService => format!(
                "Ensure \"{target}\" isn't bound to by a service or Durable Object binding."
            ),
            Self::OwnSettings => format!(
                "Ensure \"{target}\" doesn't set `compatibility_date`, `compatibility_flags`, or `outbound_service`."
            ),
            Self::UnknownTarget => format!("Ensure a worker named \"{target}\" is defined."),
        }
    }
}

impl fmt::Display for WrappedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::IsEntrypoint => "it's the entrypoint",
            Self::NotModules => "it's a service worker script",
            Self::ReferencedByService => "it's bound to by a service or Durable Object binding",
            Self::OwnSettings => {
                "it declares its own compatibility settings or outbound service, which are inherited"
            }
            Self::UnknownTarget => "no such worker is defined",
        };
        f.write_str(text)
    }
}

/// A single mismatch between expected and received input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Location of the offending value, e.g. `workers[1].bindings[0].name`.
    pub path: String,
    /// Description of the expected shape.
    pub expected: String,
    /// Rendering of what was received.
    pub received: String,
}

/// Collected validation issues, rendered as a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    /// All issues found, in input order.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    /// Record an issue.
    pub fn push(
        &mut self,
        path: impl Into<String>,
        expected: impl Into<String>,
        received: impl Into<String>,
    ) {
        self.issues.push(ValidationIssue {
            path: path.into(),
            expected: expected.into(),
            received: received.into(),
        });
    }

    /// Returns `true` if no issues were recorded.
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Convert into a `Result`, failing if any issue was recorded.
    pub fn into_result(self) -> Result<(), OrchestratorError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Unexpected worker definitions passed:")?;
        for issue in &self.issues {
            writeln!(f, "  at {}:", issue.path)?;
            writeln!(f, "  - expected {}", issue.expected)?;
            writeln!(f, "  + received {}", issue.received)?;
        }
        Ok(())
    }
}

impl OrchestratorError {
    /// Create a new `NotFound` error.
    pub fn not_found(
        kind: impl Into<String>,
        name: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
            scope: scope.into(),
        }
    }

    /// Create a new `StartupFailure` without an OS error.
    pub fn startup(cause: impl Into<String>) -> Self {
        Self::StartupFailure {
            cause: cause.into(),
            source: None,
        }
    }

    /// Create a new `StartupFailure` wrapping an OS error.
    pub fn startup_io(cause: impl Into<String>, source: io::Error) -> Self {
        Self::StartupFailure {
            cause: format!("{}: {source}", cause.into()),
            source: Some(Arc::new(source)),
        }
    }

    /// Create a new `Transport` error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors raised while compiling worker definitions.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::DuplicateName { .. }
                | Self::NoWorkers
                | Self::MultipleOutbounds { .. }
                | Self::InvalidWrapped { .. }
                | Self::Cyclic { .. }
        )
    }

    /// Returns `true` for errors raised at the point of use of a resource.
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self,
            Self::Disposed | Self::PoisonedStub { .. } | Self::NotFound { .. } | Self::Unbound { .. }
        )
    }

    /// HTTP status used when this error is rendered as a response.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ProxySecretMismatch { .. } => 400,
            Self::UnsupportedEncoding { .. } => 415,
            Self::NotFound { .. } => 404,
            Self::Transport { .. } => 502,
            Self::Disposed | Self::StartupFailure { .. } => 503,
            _ => 500,
        }
    }

    /// The preserved OS error kind, if this is a startup failure caused by one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::StartupFailure {
                source: Some(source),
                ..
            } => Some(source.kind()),
            _ => None,
        }
    }
}

impl From<ValidationError> for OrchestratorError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}
