//! Named lock guarding the shared segment.
//!
//! A POSIX named semaphore with initial value 1. `sem_open` with `O_CREAT`
//! either creates it unlocked or attaches to the instance another process
//! already created, so writers and readers agree on one lock by name alone.

use std::ffi::CString;
use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::time::Duration;

use crate::capture::Shutdown;
use crate::error::{RelayError, RelayResult};
use crate::store::object_cstring;

/// Requested mode; `sem_open` applies the umask, so `open` widens it again.
const LOCK_MODE: libc::c_uint = 0o666;
const UNLOCKED: libc::c_uint = 1;
/// How long one `sem_timedwait` may block before shutdown is rechecked.
const WAIT_SLICE: Duration = Duration::from_millis(50);
/// Where glibc keeps named semaphores.
const SEM_DIR: &str = "/dev/shm";

pub struct NamedLock {
    name: String,
    c_name: CString,
    sem: Option<NonNull<libc::sem_t>>,
}

// SAFETY: a named semaphore handle may be used from any thread; the kernel
// object carries all the synchronization.
unsafe impl Send for NamedLock {}

impl NamedLock {
    /// Create the lock unlocked, or attach to the existing instance.
    pub fn open(name: &str) -> RelayResult<Self> {
        let c_name = object_cstring(name)?;
        // SAFETY: c_name is NUL-terminated; the variadic mode and value
        // arguments are passed as c_uint as sem_open(3) expects.
        let sem =
            unsafe { libc::sem_open(c_name.as_ptr(), libc::O_CREAT, LOCK_MODE, UNLOCKED) };
        if sem == libc::SEM_FAILED {
            return Err(RelayError::resource(name, io::Error::last_os_error()));
        }
        let sem = NonNull::new(sem).ok_or_else(|| {
            RelayError::resource(name, io::Error::other("sem_open returned null"))
        })?;
        widen_permissions(name);
        log::debug!("opened named lock {}", name);
        Ok(Self {
            name: name.to_string(),
            c_name,
            sem: Some(sem),
        })
    }

    /// Block until the lock is held. Interrupted waits are retried.
    ///
    /// This waits forever on a lock that is never released; the publisher
    /// uses [`acquire_until`](Self::acquire_until) instead.
    pub fn acquire(&self) -> RelayResult<LockGuard<'_>> {
        let sem = self.handle()?;
        loop {
            // SAFETY: sem is a live handle from sem_open.
            if unsafe { libc::sem_wait(sem.as_ptr()) } == 0 {
                return Ok(LockGuard {
                    lock: self,
                    held: true,
                });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(lock_error(&self.name, err));
            }
        }
    }

    /// Block until the lock is held or `shutdown` is requested.
    ///
    /// The wait is sliced so a reader that died holding the lock cannot keep
    /// the process from shutting down. Returns `Ok(None)` once shutdown is
    /// requested; the lock is not taken in that case.
    pub fn acquire_until(&self, shutdown: &Shutdown) -> RelayResult<Option<LockGuard<'_>>> {
        let sem = self.handle()?;
        loop {
            if shutdown.is_requested() {
                return Ok(None);
            }
            let deadline = deadline_after(WAIT_SLICE).map_err(RelayError::Io)?;
            // SAFETY: sem is a live handle from sem_open and deadline outlives the call.
            if unsafe { libc::sem_timedwait(sem.as_ptr(), &deadline) } == 0 {
                return Ok(Some(LockGuard {
                    lock: self,
                    held: true,
                }));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) | Some(libc::EINTR) => continue,
                _ => return Err(lock_error(&self.name, err)),
            }
        }
    }

    /// Take the lock only if nobody holds it right now.
    pub fn try_acquire(&self) -> RelayResult<Option<LockGuard<'_>>> {
        let sem = self.handle()?;
        loop {
            // SAFETY: sem is a live handle from sem_open.
            if unsafe { libc::sem_trywait(sem.as_ptr()) } == 0 {
                return Ok(Some(LockGuard {
                    lock: self,
                    held: true,
                }));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(None),
                Some(libc::EINTR) => continue,
                _ => return Err(lock_error(&self.name, err)),
            }
        }
    }

    fn release(&self) -> RelayResult<()> {
        let sem = self.handle()?;
        // SAFETY: sem is a live handle from sem_open.
        if unsafe { libc::sem_post(sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(lock_error(&self.name, io::Error::last_os_error()))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.sem.is_some()
    }

    /// Close this process's handle. Safe to call more than once.
    pub fn close(&mut self) {
        let Some(sem) = self.sem.take() else {
            return;
        };
        // SAFETY: sem came from sem_open and is closed exactly once here.
        if unsafe { libc::sem_close(sem.as_ptr()) } != 0 {
            log::warn!(
                "closing named lock {} failed: {}",
                self.name,
                io::Error::last_os_error()
            );
        } else {
            log::info!("named lock {} closed", self.name);
        }
    }

    /// Remove the lock name. Holders of open handles are unaffected.
    /// Returns `Ok(false)` when no lock with that name existed.
    pub fn unlink(name: &str) -> RelayResult<bool> {
        let c_name = object_cstring(name)?;
        Self::unlink_cstr(name, &c_name)
    }

    pub(crate) fn unlink_self(&self) -> RelayResult<bool> {
        Self::unlink_cstr(&self.name, &self.c_name)
    }

    fn unlink_cstr(name: &str, c_name: &CString) -> RelayResult<bool> {
        // SAFETY: c_name is NUL-terminated for the duration of the call.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            Ok(false)
        } else {
            Err(RelayError::resource(name, err))
        }
    }

    fn handle(&self) -> RelayResult<NonNull<libc::sem_t>> {
        self.sem.ok_or_else(|| RelayError::Closed(self.name.clone()))
    }
}

/// EINVAL means the handle itself is no longer a semaphore; that never heals.
fn lock_error(name: &str, err: io::Error) -> RelayError {
    if err.raw_os_error() == Some(libc::EINVAL) {
        RelayError::LockInvalid {
            name: name.to_string(),
            source: err,
        }
    } else {
        RelayError::Io(err)
    }
}

/// Absolute CLOCK_REALTIME deadline `slice` from now, as `sem_timedwait` wants.
fn deadline_after(slice: Duration) -> io::Result<libc::timespec> {
    // SAFETY: timespec is plain old data; all-zero is a valid value.
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: now is a valid, writable timespec.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let nanos = now.tv_nsec as i64 + i64::from(slice.subsec_nanos());
    now.tv_sec += (slice.as_secs() as i64 + nanos / 1_000_000_000) as libc::time_t;
    now.tv_nsec = (nanos % 1_000_000_000) as _;
    Ok(now)
}

/// Give readers of other users write access despite the umask. Only the
/// owner can do this; for anyone else the existing mode stands.
fn widen_permissions(name: &str) {
    let path = PathBuf::from(SEM_DIR).join(format!("sem.{}", name.trim_start_matches('/')));
    if let Err(e) = std::fs::set_permissions(&path, Permissions::from_mode(LOCK_MODE)) {
        log::debug!("left mode of {} unchanged: {}", path.display(), e);
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        self.close();
    }
}

/// Held lock. Dropping it releases the lock on every exit path.
pub struct LockGuard<'a> {
    lock: &'a NamedLock,
    held: bool,
}

impl LockGuard<'_> {
    /// Release now and report a failing `sem_post`.
    pub fn release(mut self) -> RelayResult<()> {
        self.held = false;
        self.lock.release()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if let Err(e) = self.lock.release() {
            log::error!("releasing named lock {} failed: {}", self.lock.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_object_name;

    #[test]
    fn lock_starts_unlocked_and_is_exclusive() -> anyhow::Result<()> {
        let name = unique_object_name("gate_exclusive");
        let lock = NamedLock::open(&name)?;

        let guard = lock.acquire()?;
        assert!(lock.try_acquire()?.is_none());
        guard.release()?;

        let again = lock.try_acquire()?;
        assert!(again.is_some());
        drop(again);

        NamedLock::unlink(&name)?;
        Ok(())
    }

    #[test]
    fn second_opener_attaches_to_same_lock() -> anyhow::Result<()> {
        let name = unique_object_name("gate_attach");
        let first = NamedLock::open(&name)?;
        let second = NamedLock::open(&name)?;

        let guard = first.acquire()?;
        assert!(second.try_acquire()?.is_none());
        drop(guard);
        assert!(second.try_acquire()?.is_some());

        NamedLock::unlink(&name)?;
        Ok(())
    }

    #[test]
    fn lock_is_writable_by_other_users() -> anyhow::Result<()> {
        let name = unique_object_name("gate_mode");
        let lock = NamedLock::open(&name)?;

        let path = format!("/dev/shm/sem.{}", name.trim_start_matches('/'));
        let mode = std::fs::metadata(path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        drop(lock);
        NamedLock::unlink(&name)?;
        Ok(())
    }

    #[test]
    fn acquire_until_takes_a_free_lock() -> anyhow::Result<()> {
        let name = unique_object_name("gate_until_free");
        let lock = NamedLock::open(&name)?;
        let shutdown = Shutdown::new();

        let guard = lock.acquire_until(&shutdown)?;
        assert!(guard.is_some());
        assert!(lock.try_acquire()?.is_none());
        drop(guard);

        NamedLock::unlink(&name)?;
        Ok(())
    }

    #[test]
    fn acquire_until_gives_up_when_shutdown_is_requested() -> anyhow::Result<()> {
        let name = unique_object_name("gate_until_stuck");
        let lock = NamedLock::open(&name)?;
        let stuck_reader = NamedLock::open(&name)?;
        let held = stuck_reader.acquire()?;

        let shutdown = Shutdown::new();
        let flag = shutdown.clone();
        let started = std::time::Instant::now();
        let waiter = std::thread::spawn(move || {
            let taken = lock.acquire_until(&flag).map(|guard| guard.is_some());
            (taken, lock)
        });
        std::thread::sleep(Duration::from_millis(200));
        shutdown.request();
        let (taken, lock) = waiter.join().expect("waiter thread");

        assert!(!taken?);
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(held);
        assert!(lock.try_acquire()?.is_some());

        NamedLock::unlink(&name)?;
        Ok(())
    }

    #[test]
    fn invalid_handle_errors_are_fatal() {
        let einval = io::Error::from_raw_os_error(libc::EINVAL);
        let err = lock_error("/live_alert_mutex", einval);
        assert!(matches!(err, RelayError::LockInvalid { .. }));
        assert!(err.is_fatal());

        let eagain = io::Error::from_raw_os_error(libc::EAGAIN);
        let err = lock_error("/live_alert_mutex", eagain);
        assert!(matches!(err, RelayError::Io(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn deadline_is_normalized() -> anyhow::Result<()> {
        let deadline = deadline_after(Duration::from_millis(999))?;
        assert!((0..1_000_000_000).contains(&(deadline.tv_nsec as i64)));
        Ok(())
    }

    #[test]
    fn closed_lock_cannot_be_acquired() -> anyhow::Result<()> {
        let name = unique_object_name("gate_closed");
        let mut lock = NamedLock::open(&name)?;
        lock.close();
        lock.close();

        assert!(matches!(lock.acquire(), Err(RelayError::Closed(_))));
        assert!(matches!(
            lock.acquire_until(&Shutdown::new()),
            Err(RelayError::Closed(_))
        ));
        assert!(NamedLock::unlink(&name)?);
        assert!(!NamedLock::unlink(&name)?);
        Ok(())
    }
}
