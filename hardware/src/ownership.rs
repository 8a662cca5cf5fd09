//! Exclusive ownership of an output task.
//!
//! A [`TaskOwner`] holds the one hardware task in the process. An engine takes
//! a [`TaskLease`] when it is built and the task goes back to the owner when
//! the lease is dropped. While a lease is out, every other lease attempt
//! fails, so two engines can never drive the task at once.
//!
//! ```
//! use hardware::ownership::{OwnershipError, TaskOwner};
//!
//! let owner = TaskOwner::new(vec![0.0_f64; 4]);
//! let lease = owner.lease("live").unwrap();
//! assert!(matches!(owner.lease("sequence"), Err(OwnershipError::AlreadyLeased { .. })));
//! drop(lease);
//! assert!(owner.lease("sequence").is_ok());
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

/// Errors from taking a lease.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("Output task is already leased by {holder}")]
    AlreadyLeased { holder: String },
}

struct Slot<T> {
    task: Option<T>,
    holder: Option<String>,
    leases_granted: u64,
}

/// Process-wide owner of one output task.
pub struct TaskOwner<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Clone for TaskOwner<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> TaskOwner<T> {
    /// Take ownership of `task`.
    pub fn new(task: T) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                task: Some(task),
                holder: None,
                leases_granted: 0,
            })),
        }
    }

    /// Lease the task to `holder`.
    pub fn lease(&self, holder: &str) -> Result<TaskLease<T>, OwnershipError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.task.take() {
            Some(task) => {
                slot.holder = Some(holder.to_string());
                slot.leases_granted += 1;
                debug!("Output task leased to {holder}");
                Ok(TaskLease {
                    task: Some(task),
                    holder: holder.to_string(),
                    slot: self.slot.clone(),
                })
            }
            None => Err(OwnershipError::AlreadyLeased {
                holder: slot.holder.clone().unwrap_or_default(),
            }),
        }
    }

    /// Current lease holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .holder
            .clone()
    }

    pub fn is_leased(&self) -> bool {
        self.holder().is_some()
    }

    /// Total number of leases granted so far.
    pub fn leases_granted(&self) -> u64 {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leases_granted
    }

    /// Run `f` against the task while nobody holds a lease.
    ///
    /// Returns None if the task is currently leased.
    pub fn with_idle<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.task.as_mut().map(f)
    }
}

/// Exclusive access to the task, returned to its owner on drop.
pub struct TaskLease<T> {
    task: Option<T>,
    holder: String,
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> TaskLease<T> {
    /// Name this lease was taken under.
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl<T> Deref for TaskLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.task.as_ref().expect("task is held until the lease drops")
    }
}

impl<T> DerefMut for TaskLease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.task.as_mut().expect("task is held until the lease drops")
    }
}

impl<T> Drop for TaskLease<T> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.task = self.task.take();
        slot.holder = None;
        debug!("Output task returned by {}", self.holder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_lease_is_exclusive() {
        let owner = TaskOwner::new(5_u32);
        let mut lease = owner.lease("live").unwrap();
        *lease += 1;

        assert_eq!(owner.holder().as_deref(), Some("live"));
        assert_eq!(
            owner.lease("sequence").err(),
            Some(OwnershipError::AlreadyLeased {
                holder: "live".to_string()
            })
        );

        drop(lease);
        assert!(!owner.is_leased());

        let lease = owner.lease("sequence").unwrap();
        assert_eq!(*lease, 6);
        assert_eq!(lease.holder(), "sequence");
        assert_eq!(owner.leases_granted(), 2);
    }

    #[test]
    fn test_lease_returns_from_other_thread() {
        let owner = TaskOwner::new(String::from("task"));
        let lease = owner.lease("worker").unwrap();

        thread::spawn(move || {
            assert_eq!(lease.as_str(), "task");
        })
        .join()
        .unwrap();

        assert!(!owner.is_leased());
        assert_eq!(owner.with_idle(|t| t.len()), Some(4));
    }

    #[test]
    fn test_with_idle_refuses_while_leased() {
        let owner = TaskOwner::new(1_u8);
        let _lease = owner.lease("live").unwrap();
        assert_eq!(owner.with_idle(|t| *t), None);
    }

    #[test]
    fn test_concurrent_leases_never_overlap() {
        let owner = TaskOwner::new(0_u64);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let owner = owner.clone();
                thread::spawn(move || {
                    let mut granted = 0;
                    for _ in 0..200 {
                        if let Ok(mut lease) = owner.lease(&format!("worker-{i}")) {
                            *lease += 1;
                            granted += 1;
                        }
                    }
                    granted
                })
            })
            .collect();

        let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(owner.with_idle(|t| *t), Some(granted));
        assert_eq!(owner.leases_granted(), granted);
    }
}
