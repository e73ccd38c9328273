//! Poison-tolerant lock acquisition. Poisoned guards are recovered and logged.

use std::sync::{LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(
    result: LockResult<G>,
    target: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(
            op,
            target_module = target,
            lock_kind,
            result = "poisoned_recovered",
            "Recovered from poisoned lock; entry state may predate the panic"
        );
        poisoned.into_inner()
    })
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), target, op, "rwlock.read")
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), target, op, "rwlock.write")
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    recover(lock.lock(), target, op, "mutex.lock")
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn poisoned_rwlock_is_recovered() {
        let lock = RwLock::new(1);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("first write");
            panic!("poison the lock");
        }));
        assert!(lock.is_poisoned());

        *rw_write(&lock, "test", "write") = 2;
        assert_eq!(*rw_read(&lock, "test", "read"), 2);
    }

    #[test]
    fn poisoned_mutex_is_recovered() {
        let lock = Mutex::new(Vec::<u8>::new());
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("first lock");
            panic!("poison the mutex");
        }));

        mutex_lock(&lock, "test", "push").push(1);
        assert_eq!(mutex_lock(&lock, "test", "len").len(), 1);
    }
}
