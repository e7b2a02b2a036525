use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) trait MutexExt<T> {
    // TODO: Decide whether a poisoned lock should be recovered with `into_inner` instead of
    // crashing.  For now, we just crash.
    fn must_lock(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn must_lock(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap()
    }
}

pub(crate) trait RwLockExt<T> {
    fn must_read(&self) -> RwLockReadGuard<'_, T>;

    fn must_write(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn must_read(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap()
    }

    fn must_write(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap()
    }
}
