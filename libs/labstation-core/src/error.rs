//! Error taxonomy for the runtime: six categories, each its own `thiserror`
//! enum. `anyhow::Result` is reserved for the composition root.

use thiserror::Error;

/// Malformed configuration. Fails fast at startup, never silent.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{path}: module name '{name}' is already defined under '{other_kind}'")]
    DuplicateModuleName {
        path: String,
        name: String,
        other_kind: String,
    },

    #[error("{path}: invalid module name '{name}' (must match [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidModuleName { path: String, name: String },

    #[error("{path}: missing required field '{field}'")]
    MissingField { path: String, field: String },

    #[error("{path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("{path}: remote module descriptors must not declare '{field}'")]
    RemoteForbidsField { path: String, field: String },

    #[error("config I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config is not valid YAML: {0}")]
    Yaml(String),
}

/// Cannot load the implementation referred to by `module.Class`. The
/// module degrades to a "broken" row in the manager snapshot rather than
/// crashing the application.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("module '{name}': implementation reference '{implementation_ref}' did not resolve to a registered module class")]
    ClassNotFound {
        name: String,
        implementation_ref: String,
    },
}

/// Missing required option, failed checker, non-YAML-able status, or an
/// unresolvable required connector. Aborts activation, the module stays
/// `deactivated`.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("module '{module}': required option '{option}' is missing and has no default")]
    MissingOption { module: String, option: String },

    #[error("module '{module}': option '{option}' failed its checker")]
    CheckerFailed { module: String, option: String },

    #[error("module '{module}': option '{option}' constructor failed: {reason}")]
    ConstructorFailed {
        module: String,
        option: String,
        reason: String,
    },

    #[error("module '{module}': status variable '{status}' could not be represented for persistence: {reason}")]
    StatusNotRepresentable {
        module: String,
        status: String,
        reason: String,
    },

    #[error("module '{module}': required connector '{connector}' has no entry in 'connect'")]
    UnresolvedConnector { module: String, connector: String },

    #[error("module '{module}': connector '{connector}' targets unknown module '{target}'")]
    UnknownConnectorTarget {
        module: String,
        connector: String,
        target: String,
    },

    #[error(
        "module '{module}': connector '{connector}' requires interface '{interface}', but target '{target}' does not declare it"
    )]
    InterfaceMismatch {
        module: String,
        connector: String,
        interface: String,
        target: String,
    },

    #[error("module '{module}': use of unbound optional connector '{connector}'")]
    UnboundConnector { module: String, connector: String },

    #[error("module '{module}': option '{option}' was written after construction")]
    OptionAlreadyFrozen { module: String, option: String },

    #[error("dependency graph for module '{module}' is cyclic: {cycle}")]
    CyclicDependency { module: String, cycle: String },

    #[error("module '{module}': self-lock operation failed: {source}")]
    SelfLockFailed {
        module: String,
        #[source]
        source: InvariantError,
    },
}

/// Exception inside `on_activate`/`on_deactivate`.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("module '{module}': on_activate failed: {source}")]
    ActivateFailed {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}': on_deactivate failed: {source}")]
    DeactivateFailed {
        module: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Remote disconnect mid-call, or a request the server refuses.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote module '{module}' is not remotable (allow_remote=false)")]
    NotRemotable { module: String },

    #[error("remote peer {peer} disconnected mid-call")]
    Disconnected { peer: String },

    #[error("remote call timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("remote handle {0} is unknown or already released")]
    UnknownHandle(u64),

    #[error("remote error from server: {class}: {message}")]
    Remote { class: String, message: String },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire codec error: {0}")]
    Codec(String),
}

/// Cross-thread dispatch failure: a worker timed out,
/// was already stopping, or has gone away entirely.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch to worker '{worker}' timed out after {timeout:?}")]
    TimedOut {
        worker: String,
        timeout: std::time::Duration,
    },

    #[error("worker '{worker}' is stopping; job was not run")]
    Cancelled { worker: String },

    #[error("worker '{worker}' is unknown or has already been released")]
    WorkerGone { worker: String },
}

/// State-machine misuse or lifetime misuse. Never silently swallowed.
#[derive(Debug, Error)]
pub enum InvariantError {
    #[error("module '{module}': external code may not set FSM state '{attempted}' directly")]
    ExternalStateWrite { module: String, attempted: String },

    #[error("module '{module}': invalid FSM transition from {from} to {to}")]
    InvalidTransition {
        module: String,
        from: String,
        to: String,
    },

    #[error("module '{module}' was accessed after reaching 'deactivated'")]
    UseAfterDeactivation { module: String },

    #[error("module '{0}' is unknown to the manager")]
    UnknownModule(String),
}

/// Umbrella error returned by fallible public operations that can fail for
/// more than one reason (e.g. `activate`, which may hit resolution,
/// descriptor, hook, or invariant errors along the way).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Invariant(#[from] InvariantError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
