//! Ambient source/timestamp scopes (§4.I): `WithSource` and
//! `WithChangedTimestamp` let a connector tag every write it performs
//! within a scope without threading an extra parameter through every call.
//!
//! Mirrors the teacher's causal-stack pattern: a `tokio::task_local!` stack
//! for async call chains, with a `thread_local!` fallback for code that
//! runs outside any task-local scope (e.g. a connector's blocking-thread
//! transport callback).

use std::cell::RefCell;
use tessera_core::{Source, Timestamp};

tokio::task_local! {
    static SOURCE_STACK: RefCell<Vec<Source>>;
}
thread_local! {
    static SOURCE_STACK_FALLBACK: RefCell<Vec<Source>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    static TIMESTAMP_STACK: RefCell<Vec<Timestamp>>;
}
thread_local! {
    static TIMESTAMP_STACK_FALLBACK: RefCell<Vec<Timestamp>> = const { RefCell::new(Vec::new()) };
}

fn with_source_stack<R>(f: impl FnOnce(&RefCell<Vec<Source>>) -> R) -> R {
    if SOURCE_STACK.try_with(|_| ()).is_ok() {
        SOURCE_STACK.with(f)
    } else {
        SOURCE_STACK_FALLBACK.with(f)
    }
}

fn with_timestamp_stack<R>(f: impl FnOnce(&RefCell<Vec<Timestamp>>) -> R) -> R {
    if TIMESTAMP_STACK.try_with(|_| ()).is_ok() {
        TIMESTAMP_STACK.with(f)
    } else {
        TIMESTAMP_STACK_FALLBACK.with(f)
    }
}

/// The source a write should be attributed to if nothing more specific
/// applies, or `Source::Local` if no scope is active.
pub fn current_source() -> Source {
    with_source_stack(|stack| stack.borrow().last().cloned()).unwrap_or(Source::Local)
}

/// The changed-timestamp a write should carry if no scope is active,
/// `Timestamp::Unset`.
pub fn current_changed_timestamp() -> Timestamp {
    with_timestamp_stack(|stack| stack.borrow().last().cloned()).unwrap_or(Timestamp::Unset)
}

/// RAII guard pushing `source` for the scope's lifetime; every write made
/// while held (directly, or by code it calls) is attributed to `source`
/// unless a nested guard overrides it.
#[must_use = "dropping this immediately ends the scope"]
pub struct WithSource {
    _private: (),
}

impl WithSource {
    pub fn new(source: Source) -> Self {
        with_source_stack(|stack| stack.borrow_mut().push(source));
        Self { _private: () }
    }
}

impl Drop for WithSource {
    fn drop(&mut self) {
        with_source_stack(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// RAII guard pushing an explicit `changed_timestamp` for the scope's
/// lifetime, e.g. when replaying a historical batch from a connector.
#[must_use = "dropping this immediately ends the scope"]
pub struct WithChangedTimestamp {
    _private: (),
}

impl WithChangedTimestamp {
    pub fn new(timestamp: Timestamp) -> Self {
        with_timestamp_stack(|stack| stack.borrow_mut().push(timestamp));
        Self { _private: () }
    }
}

impl Drop for WithChangedTimestamp {
    fn drop(&mut self) {
        with_timestamp_stack(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ConnectorId;

    #[test]
    fn no_scope_defaults_to_local_and_unset() {
        assert_eq!(current_source(), Source::Local);
        assert_eq!(current_changed_timestamp(), Timestamp::Unset);
    }

    #[test]
    fn scope_sets_and_restores_source() {
        let connector = ConnectorId::new();
        {
            let _guard = WithSource::new(Source::Connector(connector.clone()));
            assert_eq!(current_source(), Source::Connector(connector));
        }
        assert_eq!(current_source(), Source::Local);
    }

    #[test]
    fn nested_scopes_restore_the_outer_value_on_drop() {
        let a = ConnectorId::new();
        let b = ConnectorId::new();
        let _outer = WithSource::new(Source::Connector(a.clone()));
        {
            let _inner = WithSource::new(Source::Connector(b));
            assert_ne!(current_source(), Source::Connector(a.clone()));
        }
        assert_eq!(current_source(), Source::Connector(a));
    }

    #[tokio::test]
    async fn scope_is_visible_across_an_await_point() {
        let connector = ConnectorId::new();
        let _guard = WithSource::new(Source::Connector(connector.clone()));
        tokio::task::yield_now().await;
        assert_eq!(current_source(), Source::Connector(connector));
    }
}
