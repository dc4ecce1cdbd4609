//! Loop mounting of backing stores.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use strata_common::{CommandRunner, RetryPolicy, StrataError, StrataResult};

/// Mounts filesystem images through loop devices.
pub trait LoopMounter: Send + Sync {
    /// Mount the ext4 image `file` on `dest`.
    fn mount_file(&self, file: &Path, dest: &Path) -> StrataResult<()>;

    /// Unmount `path` and detach its loop device. Succeeds if `path` is no
    /// longer a mount point afterwards.
    fn unmount(&self, path: &Path) -> StrataResult<()>;
}

/// Loop mounts using `mount(8)` and `umount(8)`.
pub struct LoopMount {
    runner: Arc<dyn CommandRunner>,
    retry: RetryPolicy,
}

impl LoopMount {
    /// Create a mounter retrying unmounts every 200ms for up to a minute.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_retry(
            runner,
            RetryPolicy::within(Duration::from_secs(60), Duration::from_millis(200)),
        )
    }

    /// Create a mounter with a custom unmount retry policy.
    pub fn with_retry(runner: Arc<dyn CommandRunner>, retry: RetryPolicy) -> Self {
        Self { runner, retry }
    }
}

impl LoopMounter for LoopMount {
    fn mount_file(&self, file: &Path, dest: &Path) -> StrataResult<()> {
        let file = file.display().to_string();
        let target = dest.display().to_string();
        self.runner
            .run(
                "mount",
                &["-n", "-t", "ext4", "-o", "loop,noatime", &file, &target],
            )
            .map_err(|e| StrataError::Mount {
                path: target.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    fn unmount(&self, path: &Path) -> StrataResult<()> {
        let target = path.display().to_string();
        self.retry
            .run(|attempt| match self.runner.run("umount", &["-d", &target]) {
                Ok(_) => Ok(()),
                // umount fails for paths that were never mounted; that is the
                // state the caller asked for.
                Err(_) if self.runner.run("mountpoint", &[&target]).is_err() => Ok(()),
                Err(e) => {
                    tracing::debug!(path = %target, attempt, error = %e, "Loop unmount failed");
                    Err(e)
                }
            })
            .map_err(|e| StrataError::Mount {
                path: target.clone(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Scripted {
        calls: Mutex<Vec<String>>,
        failing: Vec<&'static str>,
    }

    impl Scripted {
        fn failing(programs: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failing: programs.to_vec(),
            })
        }
    }

    impl CommandRunner for Scripted {
        fn run(&self, program: &str, args: &[&str]) -> StrataResult<String> {
            self.calls.lock().push(format!("{program} {}", args.join(" ")));
            if self.failing.contains(&program) {
                return Err(StrataError::Command {
                    program: program.to_string(),
                    message: "exit status: 1".to_string(),
                });
            }
            Ok(String::new())
        }
    }

    #[test]
    fn mounts_with_loop_options() {
        let runner = Scripted::failing(&[]);
        let mounter = LoopMount::new(runner.clone());

        mounter
            .mount_file(Path::new("/bs/layer"), Path::new("/diff/layer"))
            .unwrap();

        assert_eq!(
            runner.calls.lock().as_slice(),
            ["mount -n -t ext4 -o loop,noatime /bs/layer /diff/layer"]
        );
    }

    #[test]
    fn unmount_of_non_mountpoint_succeeds_without_retrying() {
        let runner = Scripted::failing(&["umount", "mountpoint"]);
        let mounter = LoopMount::new(runner.clone());

        let started = std::time::Instant::now();
        mounter.unmount(Path::new("/diff/never-mounted")).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let calls = runner.calls.lock();
        assert_eq!(
            calls.as_slice(),
            ["umount -d /diff/never-mounted", "mountpoint /diff/never-mounted"]
        );
    }

    #[test]
    fn busy_mountpoint_is_retried_until_exhausted() {
        let runner = Scripted::failing(&["umount"]);
        let mounter = LoopMount::with_retry(runner.clone(), RetryPolicy::immediate(3));

        assert!(mounter.unmount(Path::new("/diff/layer")).is_err());
        let calls = runner.calls.lock();
        assert_eq!(calls.iter().filter(|c| c.starts_with("umount")).count(), 3);
        assert_eq!(calls.iter().filter(|c| c.starts_with("mountpoint")).count(), 3);
    }

    #[test]
    fn unmount_of_busy_mountpoint_fails() {
        let runner = Scripted::failing(&["umount"]);
        let mounter = LoopMount::with_retry(runner, RetryPolicy::immediate(2));

        assert!(matches!(
            mounter.unmount(Path::new("/diff/layer")),
            Err(StrataError::Mount { .. })
        ));
    }
}
