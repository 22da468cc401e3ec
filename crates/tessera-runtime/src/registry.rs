//! Subject-connector registry (§4.F): atomic external-id <-> subject
//! mapping with reference counting, single-lock discipline.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{CoreError, ExternalId, RegistryConflictKind, SubjectId};
use tracing::warn;

#[derive(Clone)]
struct Entry<D> {
    external_id: ExternalId,
    subject: SubjectId,
    ref_count: u32,
    data: D,
}

struct Inner<D> {
    by_external_id: HashMap<ExternalId, SubjectId>,
    by_subject: HashMap<SubjectId, Entry<D>>,
    /// Client-role-only: external ids deleted locally within the TTL
    /// window, so an echoed remote delete doesn't race a fresh
    /// registration (§4.I).
    recently_deleted: HashMap<ExternalId, Instant>,
    /// Barrier for a replace (delete k; add k) on the same parent-property
    /// key: an add on a key must await the pending delete on that same key
    /// before probing the remote tree (§4.I).
    pending_deletes: HashMap<PendingDeleteKey, Arc<tokio::sync::Notify>>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PendingDeleteKey {
    pub parent_property: String,
    pub key: String,
}

impl PendingDeleteKey {
    pub fn new(parent_property: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            parent_property: parent_property.into(),
            key: key.into(),
        }
    }
}

/// Result of a successful `decrement_ref` that reached zero.
pub struct Removed<D> {
    pub external_id: ExternalId,
    pub data: D,
}

/// An owned ref-count increment. Dropping it decrements, mirroring the
/// Drop-based handle lifetime pattern used for structural edges elsewhere
/// in this workspace (§4.F, §8 "ref-count correctness").
pub struct RegistryLease<D: Clone + Send + 'static> {
    registry: Arc<SubjectConnectorRegistry<D>>,
    subject: SubjectId,
}

impl<D: Clone + Send + 'static> Drop for RegistryLease<D> {
    /// Safety net only: a lease dropped without calling `release()` still
    /// decrements the ref count, but whoever dropped it had no chance to act
    /// on a removal reaching zero. Callers that care about the removal
    /// (structural-removal notification, connector cleanup) must call
    /// `release()` explicitly instead of letting the lease fall out of scope.
    fn drop(&mut self) {
        if let Some(removed) = self.registry.decrement_ref(&self.subject) {
            warn!(
                subject = %self.subject,
                external_id = %removed.external_id,
                "registry lease dropped without release(); removal side effects were skipped"
            );
        }
    }
}

impl<D: Clone + Send + 'static> RegistryLease<D> {
    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }

    /// Decrements the ref count and returns the removal, if the count
    /// reached zero. Consumes the lease so `Drop` cannot double-decrement:
    /// the decrement happens here, and the value is forgotten afterward so
    /// `Drop::drop` never runs for it.
    pub fn release(self) -> Option<Removed<D>> {
        let registry = self.registry.clone();
        let subject = self.subject.clone();
        std::mem::forget(self);
        registry.decrement_ref(&subject)
    }
}

/// Two hash maps protected by one per-registry lock, per §5's lock-ordering
/// policy: this lock is innermost, and no callback invoked while holding it
/// may re-enter the registry or block.
pub struct SubjectConnectorRegistry<D> {
    inner: Mutex<Inner<D>>,
    recently_deleted_ttl: Duration,
}

impl<D: Clone + Send + 'static> SubjectConnectorRegistry<D> {
    pub fn new(recently_deleted_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                by_external_id: HashMap::new(),
                by_subject: HashMap::new(),
                recently_deleted: HashMap::new(),
                pending_deletes: HashMap::new(),
            }),
            recently_deleted_ttl,
        })
    }

    pub fn register(
        self: &Arc<Self>,
        external_id: ExternalId,
        subject: SubjectId,
        data: D,
    ) -> Result<RegistryLease<D>, CoreError> {
        {
            let mut inner = self.inner.lock();
            if inner.by_external_id.contains_key(&external_id) {
                return Err(CoreError::RegistryConflict {
                    kind: RegistryConflictKind::DuplicateExternalId,
                    detail: external_id.to_string(),
                });
            }
            if inner.by_subject.contains_key(&subject) {
                return Err(CoreError::RegistryConflict {
                    kind: RegistryConflictKind::DuplicateSubject,
                    detail: subject.to_string(),
                });
            }
            inner
                .by_external_id
                .insert(external_id.clone(), subject.clone());
            inner.by_subject.insert(
                subject.clone(),
                Entry {
                    external_id,
                    subject: subject.clone(),
                    ref_count: 1,
                    data,
                },
            );
        }
        Ok(RegistryLease {
            registry: self.clone(),
            subject,
        })
    }

    pub fn increment_ref(self: &Arc<Self>, subject: &SubjectId) -> Option<RegistryLease<D>> {
        let mut inner = self.inner.lock();
        let entry = inner.by_subject.get_mut(subject)?;
        entry.ref_count += 1;
        Some(RegistryLease {
            registry: self.clone(),
            subject: subject.clone(),
        })
    }

    /// Returns `Some(removed)` if the ref count reached zero and the entry
    /// was removed, `None` if the subject was not present or the count is
    /// still positive. Side effects (emitting structural changes for the
    /// removal) must happen after this call returns, using the local
    /// `Removed` copy -- never while the lock is held.
    fn decrement_ref(&self, subject: &SubjectId) -> Option<Removed<D>> {
        let mut inner = self.inner.lock();
        let remove = match inner.by_subject.get_mut(subject) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.ref_count == 0
            }
            None => return None,
        };
        if !remove {
            return None;
        }
        let entry = inner.by_subject.remove(subject)?;
        inner.by_external_id.remove(&entry.external_id);
        inner
            .recently_deleted
            .insert(entry.external_id.clone(), Instant::now());
        Some(Removed {
            external_id: entry.external_id,
            data: entry.data,
        })
    }

    pub fn update_external_id(
        &self,
        subject: &SubjectId,
        new_external_id: ExternalId,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock();
        if let Some(holder) = inner.by_external_id.get(&new_external_id) {
            if holder != subject {
                return Err(CoreError::RegistryConflict {
                    kind: RegistryConflictKind::DuplicateExternalId,
                    detail: new_external_id.to_string(),
                });
            }
        }
        let old_external_id = {
            let entry = inner
                .by_subject
                .get_mut(subject)
                .expect("update_external_id called for a subject not present in the registry");
            let old = entry.external_id.clone();
            entry.external_id = new_external_id.clone();
            old
        };
        inner.by_external_id.remove(&old_external_id);
        inner
            .by_external_id
            .insert(new_external_id, subject.clone());
        Ok(())
    }

    pub fn try_get(&self, external_id: &ExternalId) -> Option<SubjectId> {
        self.inner.lock().by_external_id.get(external_id).cloned()
    }

    pub fn try_get_external_id(&self, subject: &SubjectId) -> Option<ExternalId> {
        self.inner
            .lock()
            .by_subject
            .get(subject)
            .map(|e| e.external_id.clone())
    }

    pub fn try_get_data(&self, subject: &SubjectId) -> Option<D> {
        self.inner
            .lock()
            .by_subject
            .get(subject)
            .map(|e| e.data.clone())
    }

    /// Invokes `mutator` under the lock. `mutator` must not block on other
    /// locks (§4.F).
    pub fn modify_data(&self, subject: &SubjectId, mutator: impl FnOnce(&mut D)) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_subject.get_mut(subject) {
            Some(entry) => {
                mutator(&mut entry.data);
                true
            }
            None => false,
        }
    }

    /// Whether `external_id` was deleted locally within the TTL window
    /// (client role only). Additions consult this to skip registration
    /// when the subject was just removed locally.
    pub fn was_recently_deleted(&self, external_id: &ExternalId) -> bool {
        let mut inner = self.inner.lock();
        self.prune_recently_deleted(&mut inner);
        inner.recently_deleted.contains_key(external_id)
    }

    fn prune_recently_deleted(&self, inner: &mut Inner<D>) {
        let ttl = self.recently_deleted_ttl;
        let now = Instant::now();
        inner
            .recently_deleted
            .retain(|_, deleted_at| now.duration_since(*deleted_at) < ttl);
    }

    /// Begins the pending-delete barrier for `key`: any `await_pending_delete`
    /// call on the same key blocks until `complete_pending_delete` is
    /// called.
    pub fn begin_pending_delete(&self, key: PendingDeleteKey) {
        let mut inner = self.inner.lock();
        inner
            .pending_deletes
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Notify::new()));
    }

    pub fn complete_pending_delete(&self, key: &PendingDeleteKey) {
        let notify = self.inner.lock().pending_deletes.remove(key);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    /// An add on `key` must call this before probing the remote tree, so it
    /// never observes the stale pre-delete node (§4.I, §8 "pending-delete
    /// barrier").
    pub async fn await_pending_delete(&self, key: &PendingDeleteKey) {
        let notify = {
            let inner = self.inner.lock();
            inner.pending_deletes.get(key).cloned()
        };
        if let Some(notify) = notify {
            notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_subject.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SubjectConnectorRegistry<()>> {
        SubjectConnectorRegistry::new(Duration::from_millis(50))
    }

    #[test]
    fn register_then_lookup_is_a_bijection() {
        let reg = registry();
        let subject = SubjectId::new();
        let ext = ExternalId::new("ns=1;s=node1");
        let lease = reg.register(ext.clone(), subject.clone(), ()).unwrap();
        assert_eq!(reg.try_get(&ext), Some(subject.clone()));
        assert_eq!(reg.try_get_external_id(&subject), Some(ext));
        drop(lease);
        assert!(reg.is_empty());
    }

    #[test]
    fn duplicate_external_id_is_rejected() {
        let reg = registry();
        let s1 = SubjectId::new();
        let s2 = SubjectId::new();
        let ext = ExternalId::new("dup");
        let _lease = reg.register(ext.clone(), s1, ()).unwrap();
        let err = reg.register(ext, s2, ()).unwrap_err();
        assert!(matches!(
            err,
            CoreError::RegistryConflict {
                kind: RegistryConflictKind::DuplicateExternalId,
                ..
            }
        ));
    }

    #[test]
    fn duplicate_subject_with_different_external_id_is_rejected() {
        let reg = registry();
        let subject = SubjectId::new();
        let _lease = reg
            .register(ExternalId::new("a"), subject.clone(), ())
            .unwrap();
        let err = reg
            .register(ExternalId::new("b"), subject, ())
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::RegistryConflict {
                kind: RegistryConflictKind::DuplicateSubject,
                ..
            }
        ));
    }

    #[test]
    fn ref_count_correctness_n_increments_m_decrements() {
        let reg = registry();
        let subject = SubjectId::new();
        let lease0 = reg.register(ExternalId::new("a"), subject.clone(), ()).unwrap();
        let lease1 = reg.increment_ref(&subject).unwrap();
        let lease2 = reg.increment_ref(&subject).unwrap();
        // N=3, drop M=2 -> still present.
        drop(lease1);
        drop(lease2);
        assert!(reg.try_get_external_id(&subject).is_some());
        // drop the last -> removed.
        drop(lease0);
        assert!(reg.try_get_external_id(&subject).is_none());
    }

    #[test]
    fn update_external_id_is_atomic() {
        let reg = registry();
        let subject = SubjectId::new();
        let old = ExternalId::new("old");
        let new = ExternalId::new("new");
        let _lease = reg.register(old.clone(), subject.clone(), ()).unwrap();
        reg.update_external_id(&subject, new.clone()).unwrap();
        assert_eq!(reg.try_get(&old), None);
        assert_eq!(reg.try_get(&new), Some(subject));
    }

    #[test]
    fn recently_deleted_window_reports_true_until_ttl_elapses() {
        let reg = SubjectConnectorRegistry::<()>::new(Duration::from_millis(20));
        let subject = SubjectId::new();
        let ext = ExternalId::new("a");
        let lease = reg.register(ext.clone(), subject, ()).unwrap();
        drop(lease);
        assert!(reg.was_recently_deleted(&ext));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!reg.was_recently_deleted(&ext));
    }

    #[test]
    fn release_returns_the_removal_when_the_count_reaches_zero() {
        let reg = registry();
        let subject = SubjectId::new();
        let ext = ExternalId::new("a");
        let lease = reg.register(ext.clone(), subject.clone(), ()).unwrap();
        let removed = lease.release().unwrap();
        assert_eq!(removed.external_id, ext);
        assert!(reg.is_empty());
    }

    #[test]
    fn release_returns_none_while_other_leases_remain() {
        let reg = registry();
        let subject = SubjectId::new();
        let lease0 = reg.register(ExternalId::new("a"), subject.clone(), ()).unwrap();
        let lease1 = reg.increment_ref(&subject).unwrap();
        assert!(lease1.release().is_none());
        assert!(reg.try_get_external_id(&subject).is_some());
        drop(lease0);
    }

    #[tokio::test]
    async fn pending_delete_barrier_releases_on_completion() {
        let reg = registry();
        let key = PendingDeleteKey::new("children", "a");
        reg.begin_pending_delete(key.clone());
        let reg2 = reg.clone();
        let key2 = key.clone();
        let waiter = tokio::spawn(async move {
            reg2.await_pending_delete(&key2).await;
        });
        tokio::task::yield_now().await;
        reg.complete_pending_delete(&key);
        waiter.await.unwrap();
    }
}
