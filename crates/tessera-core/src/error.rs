use std::fmt;

/// Which half of the registry bijection a `Register`/`UpdateExternalId` call
/// collided on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryConflictKind {
    DuplicateExternalId,
    DuplicateSubject,
}

impl fmt::Display for RegistryConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryConflictKind::DuplicateExternalId => write!(f, "duplicate external id"),
            RegistryConflictKind::DuplicateSubject => write!(f, "duplicate subject"),
        }
    }
}

/// Band 1 (programmer errors) and band 3 (registry conflicts as surfaced to
/// the caller, never retried) collapse into one flat error enum, matching
/// the style of hand-written wire errors elsewhere in this workspace: one
/// variant per failure mode, `Display` via a `match`, no derive macro.
#[derive(Debug)]
pub enum CoreError {
    /// A write was attempted on a derived (read-only, computed) property.
    InvalidOperation(String),
    /// `Register`/`IncrementRef`/`DecrementRef`/`UpdateExternalId` violated
    /// the registry's bijection invariant.
    RegistryConflict {
        kind: RegistryConflictKind,
        detail: String,
    },
    /// Building an interceptor chain found a `runs-before`/`runs-after`
    /// cycle; no chain was constructed.
    InterceptorCycle { members: Vec<String> },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidOperation(detail) => write!(f, "invalid operation: {detail}"),
            CoreError::RegistryConflict { kind, detail } => {
                write!(f, "registry conflict ({kind}): {detail}")
            }
            CoreError::InterceptorCycle { members } => {
                write!(f, "interceptor ordering cycle: {{{}}}", members.join(", "))
            }
        }
    }
}

impl std::error::Error for CoreError {}

/// Band 2 (transient transport errors) and cancellation (§7, handled
/// specifically and never treated as transient).
#[derive(Debug)]
pub enum ConnectorError {
    TransportFailed(String),
    WriteFailed { failed_count: usize, cause: String },
    Cancelled,
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorError::TransportFailed(cause) => write!(f, "transport failed: {cause}"),
            ConnectorError::WriteFailed {
                failed_count,
                cause,
            } => write!(f, "write failed ({failed_count} changes): {cause}"),
            ConnectorError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for ConnectorError {}

impl ConnectorError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConnectorError::Cancelled)
    }
}
