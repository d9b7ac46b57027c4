//! Versioned object collections with watch notifications.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::meta::{Object, ObjectKey};

/// How often a read-compute-write loop retries before giving up.
///
/// Conflicts re-read the latest version, so repeated conflicts mean another
/// writer is racing every attempt; past this many the caller should requeue
/// rather than spin.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// Store operation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectKey },

    /// The submitted `resource_version` did not match the stored one.
    #[error("{kind} {key} version conflict: submitted {submitted}, stored {stored}")]
    Conflict {
        kind: &'static str,
        key: ObjectKey,
        submitted: u64,
        stored: u64,
    },
}

impl StoreError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// One change notification from a watch.
///
/// Events are wake-ups, not a journal: a consumer that needs the complete
/// picture lists first and treats each event as "go look again".
#[derive(Debug, Clone)]
pub enum ResourceEvent<T> {
    /// The object was created or written. Carries the committed state.
    Changed(T),
    /// The object was removed from the store.
    Deleted(ObjectKey),
}

struct Inner<T> {
    objects: BTreeMap<ObjectKey, T>,
    watchers: Vec<UnboundedSender<ResourceEvent<T>>>,
}

/// A typed collection of one resource kind.
///
/// Cheap to clone; all clones share the same objects and watchers.
pub struct Collection<T: Object> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Object> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Object> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Object> Collection<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: BTreeMap::new(),
                watchers: Vec::new(),
            })),
        }
    }

    /// Stores a new object, assigning its UID and first version.
    pub async fn create(&self, mut obj: T) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = obj.key();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: T::KIND, key });
        }

        let meta = obj.meta_mut();
        meta.uid = Some(Ulid::new());
        meta.resource_version = 1;
        meta.created_at = Some(Utc::now());
        meta.deletion_timestamp = None;

        inner.objects.insert(key, obj.clone());
        notify(&mut inner, ResourceEvent::Changed(obj.clone()));
        Ok(obj)
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<T, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: T::KIND,
                key: key.clone(),
            })
    }

    /// All objects, ordered by key.
    pub async fn list(&self) -> Vec<T> {
        let inner = self.inner.lock().await;
        inner.objects.values().cloned().collect()
    }

    /// Compare-and-swap write of spec and finalizers.
    ///
    /// The stored status is preserved regardless of what the submitted
    /// object carries. Removing the last finalizer from a deleting object
    /// completes its deletion.
    pub async fn update(&self, mut obj: T) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = obj.key();
        let stored = match inner.objects.get(&key) {
            Some(stored) => stored.clone(),
            None => {
                return Err(StoreError::NotFound { kind: T::KIND, key });
            }
        };

        check_version(&obj, &stored)?;
        obj.restore_status(&stored);

        let stored_meta = stored.meta();
        let meta = obj.meta_mut();
        meta.uid = stored_meta.uid;
        meta.created_at = stored_meta.created_at;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;
        meta.resource_version = stored_meta.resource_version + 1;

        if obj.meta().is_deleting() && obj.meta().finalizers.is_empty() {
            inner.objects.remove(&key);
            notify(&mut inner, ResourceEvent::Deleted(key));
        } else {
            inner.objects.insert(key, obj.clone());
            notify(&mut inner, ResourceEvent::Changed(obj.clone()));
        }
        Ok(obj)
    }

    /// Compare-and-swap write of status only.
    ///
    /// The stored spec, finalizers, and deletion state are preserved; a
    /// status writer cannot release or take finalizers.
    pub async fn update_status(&self, mut obj: T) -> Result<T, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = obj.key();
        let stored = match inner.objects.get(&key) {
            Some(stored) => stored.clone(),
            None => {
                return Err(StoreError::NotFound { kind: T::KIND, key });
            }
        };

        check_version(&obj, &stored)?;
        obj.restore_spec(&stored);

        let stored_meta = stored.meta();
        let meta = obj.meta_mut();
        meta.uid = stored_meta.uid;
        meta.created_at = stored_meta.created_at;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;
        meta.finalizers = stored_meta.finalizers.clone();
        meta.resource_version = stored_meta.resource_version + 1;

        inner.objects.insert(key, obj.clone());
        notify(&mut inner, ResourceEvent::Changed(obj.clone()));
        Ok(obj)
    }

    /// Requests deletion.
    ///
    /// Objects without finalizers are removed immediately. Otherwise the
    /// deletion timestamp is set and the object stays visible until every
    /// finalizer is removed. Repeating the request is a no-op.
    pub async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let stored = match inner.objects.get(key) {
            Some(stored) => stored.clone(),
            None => {
                return Err(StoreError::NotFound {
                    kind: T::KIND,
                    key: key.clone(),
                });
            }
        };

        if stored.meta().finalizers.is_empty() {
            inner.objects.remove(key);
            notify(&mut inner, ResourceEvent::Deleted(key.clone()));
            return Ok(());
        }

        if stored.meta().is_deleting() {
            return Ok(());
        }

        let mut obj = stored;
        let meta = obj.meta_mut();
        meta.deletion_timestamp = Some(Utc::now());
        meta.resource_version += 1;
        inner.objects.insert(key.clone(), obj.clone());
        notify(&mut inner, ResourceEvent::Changed(obj));
        Ok(())
    }

    /// Subscribes to change notifications for this collection.
    ///
    /// Only writes committed after the call are delivered.
    pub async fn watch(&self) -> UnboundedReceiver<ResourceEvent<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.watchers.push(tx);
        rx
    }
}

fn check_version<T: Object>(obj: &T, stored: &T) -> Result<(), StoreError> {
    let submitted = obj.meta().resource_version;
    let current = stored.meta().resource_version;
    if submitted != current {
        return Err(StoreError::Conflict {
            kind: T::KIND,
            key: obj.key(),
            submitted,
            stored: current,
        });
    }
    Ok(())
}

fn notify<T: Object>(inner: &mut Inner<T>, event: ResourceEvent<T>) {
    inner.watchers.retain(|tx| tx.send(event.clone()).is_ok());
}

/// Read-compute-write loop over [`Collection::update`].
///
/// On `Conflict` the object is re-read and `f` recomputed against the fresh
/// copy, so no concurrent write is ever overwritten blind.
pub async fn modify<T, F>(collection: &Collection<T>, key: &ObjectKey, mut f: F) -> Result<T, StoreError>
where
    T: Object,
    F: FnMut(&mut T),
{
    let mut last = None;
    for _ in 0..MAX_CAS_ATTEMPTS {
        let mut obj = collection.get(key).await?;
        f(&mut obj);
        match collection.update(obj).await {
            Ok(written) => return Ok(written),
            Err(err) if err.is_conflict() => last = Some(err),
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or(StoreError::NotFound {
        kind: T::KIND,
        key: key.clone(),
    }))
}

/// Read-compute-write loop over [`Collection::update_status`].
pub async fn modify_status<T, F>(
    collection: &Collection<T>,
    key: &ObjectKey,
    mut f: F,
) -> Result<T, StoreError>
where
    T: Object,
    F: FnMut(&mut T),
{
    let mut last = None;
    for _ in 0..MAX_CAS_ATTEMPTS {
        let mut obj = collection.get(key).await?;
        f(&mut obj);
        match collection.update_status(obj).await {
            Ok(written) => return Ok(written),
            Err(err) if err.is_conflict() => last = Some(err),
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or(StoreError::NotFound {
        kind: T::KIND,
        key: key.clone(),
    }))
}
