//! Cross-process renewal coordination.
//!
//! Many independent worker processes may notice the same expiring
//! certificate at once. Renewal is serialized with a marker file created
//! next to the certificate using exclusive-create semantics, which works
//! across unrelated processes on the same filesystem. The lock holder
//! re-checks freshness before renewing so that every process except the
//! first one finds a fresh certificate and skips the authority call.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::SystemTime;

use tracing::{debug, trace, warn};
use vaultsign_common::SessionId;
use vaultsign_config::{ContentionPolicy, LockConfig};

use crate::error::LifecycleError;
use crate::policy::Decision;

/// Exclusive ownership of a lock marker.
///
/// The marker carries a token unique to this guard. On drop it is removed
/// only if it still holds that token, so a marker that was reclaimed as
/// abandoned and re-created by another process is left alone.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim_end() == self.token => {}
            Ok(_) => {
                warn!(
                    path = %self.path.display(),
                    "Renewal lock was reclaimed by another process, leaving it in place"
                );
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read renewal lock");
                return;
            }
        }
        match fs::remove_file(&self.path) {
            Ok(()) => trace!(path = %self.path.display(), "Released renewal lock"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove renewal lock"
            ),
        }
    }
}

/// Result of trying to take the lock
#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(LockGuard),
    /// Another process held the lock for every attempt
    Contended { attempts: u32 },
    /// The marker could not be created for a reason other than contention
    Unavailable { error: io::Error },
}

/// Outcome of a coordinated renewal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coordinated<T> {
    /// The renewal action ran
    Performed { value: T, exclusive: bool },
    /// The post-lock re-check found the certificate fresh
    AlreadyFresh { decision: Decision, exclusive: bool },
}

impl<T> Coordinated<T> {
    pub fn exclusive(&self) -> bool {
        match self {
            Self::Performed { exclusive, .. } | Self::AlreadyFresh { exclusive, .. } => *exclusive,
        }
    }
}

/// Serializes renewals of the same certificate across processes
#[derive(Debug, Clone)]
pub struct RenewalCoordinator {
    config: LockConfig,
}

impl RenewalCoordinator {
    pub fn new(config: LockConfig) -> Self {
        Self { config }
    }

    /// Try to create the marker at `lock_path`, polling while it is held
    pub fn acquire(&self, lock_path: &Path) -> LockAcquisition {
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = create_private_dir(parent) {
                return LockAcquisition::Unavailable { error: e };
            }
        }

        let token = format!("{} {}", std::process::id(), SessionId::new());
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            let mut created = create_marker(lock_path, &token);
            if matches!(&created, Err(e) if e.kind() == io::ErrorKind::AlreadyExists)
                && self.remove_if_stale(lock_path, &token)
            {
                created = create_marker(lock_path, &token);
            }

            match created {
                Ok(()) => {
                    debug!(path = %lock_path.display(), attempt, "Acquired renewal lock");
                    return LockAcquisition::Acquired(LockGuard {
                        path: lock_path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    trace!(
                        path = %lock_path.display(),
                        attempt,
                        max_attempts = attempts,
                        "Renewal lock held by another process"
                    );
                    if attempt < attempts {
                        thread::sleep(self.config.retry_delay());
                    }
                }
                Err(e) => return LockAcquisition::Unavailable { error: e },
            }
        }

        LockAcquisition::Contended { attempts }
    }

    /// Run `renew` under the lock for `lock_path`.
    ///
    /// Once the lock is held (or abandoned under the fail-open policy),
    /// `recheck` decides again whether renewal is still needed; if not,
    /// `renew` is never called. The lock is released when this returns,
    /// including on error.
    pub fn run_exclusive<T, R, F>(
        &self,
        lock_path: &Path,
        recheck: R,
        renew: F,
    ) -> Result<Coordinated<T>, LifecycleError>
    where
        R: FnOnce() -> Decision,
        F: FnOnce() -> Result<T, LifecycleError>,
    {
        let guard = match self.acquire(lock_path) {
            LockAcquisition::Acquired(guard) => Some(guard),
            LockAcquisition::Contended { attempts } => {
                if self.config.on_contention == ContentionPolicy::Fail {
                    return Err(LifecycleError::LockContended {
                        path: lock_path.to_path_buf(),
                        attempts,
                    });
                }
                warn!(
                    path = %lock_path.display(),
                    attempts,
                    "Could not acquire renewal lock, renewing without it"
                );
                None
            }
            LockAcquisition::Unavailable { error } => {
                if self.config.on_contention == ContentionPolicy::Fail {
                    return Err(LifecycleError::LockContended {
                        path: lock_path.to_path_buf(),
                        attempts: 0,
                    });
                }
                warn!(
                    path = %lock_path.display(),
                    error = %error,
                    "Renewal lock unavailable, renewing without it"
                );
                None
            }
        };
        let exclusive = guard.is_some();

        let decision = recheck();
        if !decision.needs_renewal() {
            debug!(
                path = %lock_path.display(),
                reason = %decision.reason,
                "Certificate was renewed by another process"
            );
            return Ok(Coordinated::AlreadyFresh {
                decision,
                exclusive,
            });
        }

        let value = renew()?;
        drop(guard);
        Ok(Coordinated::Performed { value, exclusive })
    }

    fn remove_if_stale(&self, lock_path: &Path, token: &str) -> bool {
        let Some(stale_after) = self.config.stale_after() else {
            return false;
        };
        let Ok(observed) = fs::read_to_string(lock_path) else {
            return false;
        };
        let age = fs::metadata(lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        match age {
            Some(age) if age >= stale_after => {
                warn!(
                    path = %lock_path.display(),
                    age_secs = age.as_secs(),
                    holder = observed.trim_end(),
                    "Reclaiming abandoned renewal lock"
                );
                reclaim(lock_path, &observed, token)
            }
            _ => false,
        }
    }
}

/// Move the marker at `lock_path` out of the way if it still holds
/// `observed`.
///
/// The rename makes exactly one of several concurrent reclaimers the
/// winner. A marker that changed since it was judged stale belongs to a
/// live holder and is put back.
fn reclaim(lock_path: &Path, observed: &str, token: &str) -> bool {
    let mut tombstone = lock_path.as_os_str().to_owned();
    tombstone.push(format!(".stale.{}", token.replace(' ', "-")));
    let tombstone = PathBuf::from(tombstone);

    if fs::rename(lock_path, &tombstone).is_err() {
        return false;
    }
    let moved = fs::read_to_string(&tombstone).unwrap_or_default();
    if moved == observed {
        let _ = fs::remove_file(&tombstone);
        return true;
    }

    // hard_link never replaces an existing marker.
    if let Err(e) = fs::hard_link(&tombstone, lock_path) {
        warn!(
            path = %lock_path.display(),
            error = %e,
            "Failed to restore renewal lock taken over during reclaim"
        );
    }
    let _ = fs::remove_file(&tombstone);
    false
}

fn create_marker(path: &Path, token: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = writeln!(file, "{token}").and_then(|()| file.sync_all()) {
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Reason;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn coordinator(max_attempts: u32, on_contention: ContentionPolicy) -> RenewalCoordinator {
        RenewalCoordinator::new(LockConfig {
            max_attempts,
            retry_delay_ms: 10,
            on_contention,
            stale_after_secs: 0,
        })
    }

    #[test]
    fn test_guard_removes_marker() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");
        let coordinator = coordinator(3, ContentionPolicy::Proceed);

        match coordinator.acquire(&lock) {
            LockAcquisition::Acquired(guard) => {
                assert!(lock.exists());
                assert_eq!(guard.path(), lock);
            }
            other => panic!("unexpected acquisition: {other:?}"),
        }
        assert!(!lock.exists());
    }

    #[test]
    fn test_contended_after_attempts() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");
        fs::write(&lock, "other").unwrap();

        let started = Instant::now();
        let acquisition = coordinator(3, ContentionPolicy::Proceed).acquire(&lock);
        assert!(matches!(acquisition, LockAcquisition::Contended { attempts: 3 }));
        assert!(started.elapsed() >= Duration::from_millis(20));
        // Somebody else's marker is left alone.
        assert!(lock.exists());
    }

    #[test]
    fn test_fail_open_runs_without_lock() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");
        fs::write(&lock, "other").unwrap();

        let result = coordinator(2, ContentionPolicy::Proceed)
            .run_exclusive(&lock, || Decision::renew(Reason::Absent), || Ok(7))
            .unwrap();
        assert_eq!(
            result,
            Coordinated::Performed {
                value: 7,
                exclusive: false
            }
        );
        assert!(lock.exists());
    }

    #[test]
    fn test_fail_closed_aborts() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");
        fs::write(&lock, "other").unwrap();

        let err = coordinator(2, ContentionPolicy::Fail)
            .run_exclusive(
                &lock,
                || Decision::renew(Reason::Absent),
                || -> Result<(), LifecycleError> { panic!("must not renew") },
            )
            .unwrap_err();
        assert!(matches!(err, LifecycleError::LockContended { attempts: 2, .. }));
    }

    #[test]
    fn test_recheck_fresh_skips_renewal() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");

        let result = coordinator(2, ContentionPolicy::Proceed)
            .run_exclusive(
                &lock,
                || Decision::skip(Reason::Fresh),
                || -> Result<(), LifecycleError> { panic!("must not renew") },
            )
            .unwrap();
        assert!(matches!(result, Coordinated::AlreadyFresh { exclusive: true, .. }));
        assert!(!lock.exists());
    }

    #[test]
    fn test_lock_released_on_error() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");

        let err = coordinator(2, ContentionPolicy::Proceed)
            .run_exclusive(
                &lock,
                || Decision::renew(Reason::ExpiringSoon),
                || -> Result<(), LifecycleError> {
                    Err(LifecycleError::Configuration("boom".to_string()))
                },
            )
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Configuration(_)));
        assert!(!lock.exists());
    }

    #[test]
    fn test_stale_marker_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");
        fs::write(&lock, "12345").unwrap();
        backdate(&lock, Duration::from_secs(600));

        let coordinator = RenewalCoordinator::new(LockConfig {
            max_attempts: 1,
            retry_delay_ms: 10,
            on_contention: ContentionPolicy::Fail,
            stale_after_secs: 300,
        });
        assert!(matches!(coordinator.acquire(&lock), LockAcquisition::Acquired(_)));
    }

    fn backdate(path: &Path, by: Duration) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[test]
    fn test_reclaimed_marker_survives_previous_holder() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");
        let coordinator = RenewalCoordinator::new(LockConfig {
            max_attempts: 1,
            retry_delay_ms: 10,
            on_contention: ContentionPolicy::Fail,
            stale_after_secs: 1,
        });

        let LockAcquisition::Acquired(slow) = coordinator.acquire(&lock) else {
            panic!("first holder should acquire");
        };
        backdate(&lock, Duration::from_secs(10));

        let LockAcquisition::Acquired(current) = coordinator.acquire(&lock) else {
            panic!("abandoned marker should be reclaimed");
        };
        assert_ne!(slow.token(), current.token());

        // The slow holder finishing must not release the new holder's lock.
        drop(slow);
        assert!(lock.exists());
        assert!(matches!(
            coordinator.acquire(&lock),
            LockAcquisition::Contended { attempts: 1 }
        ));

        drop(current);
        assert!(!lock.exists());
    }

    #[test]
    fn test_marker_holds_guard_token() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");
        let LockAcquisition::Acquired(guard) =
            coordinator(1, ContentionPolicy::Fail).acquire(&lock)
        else {
            panic!("lock should be free");
        };
        let contents = fs::read_to_string(&lock).unwrap();
        assert_eq!(contents.trim_end(), guard.token());
        assert!(guard
            .token()
            .starts_with(&std::process::id().to_string()));
    }

    #[test]
    fn test_reclaim_restores_replaced_marker() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");
        fs::write(&lock, "live-holder\n").unwrap();

        // Judged stale while it held another token, replaced since.
        assert!(!reclaim(&lock, "dead-holder\n", "1 reclaimer"));
        assert_eq!(fs::read_to_string(&lock).unwrap(), "live-holder\n");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_reclaim_leaves_no_tombstone() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("cert.pub.lock");
        fs::write(&lock, "dead-holder\n").unwrap();

        assert!(reclaim(&lock, "dead-holder\n", "1 reclaimer"));
        assert!(!lock.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        // A second reclaimer of the same marker loses.
        assert!(!reclaim(&lock, "dead-holder\n", "2 reclaimer"));
    }

    #[test]
    fn test_missing_parent_is_created() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("nested").join("cert.pub.lock");
        assert!(matches!(
            coordinator(1, ContentionPolicy::Fail).acquire(&lock),
            LockAcquisition::Acquired(_)
        ));
        assert!(lock.parent().unwrap().is_dir());
    }
}
