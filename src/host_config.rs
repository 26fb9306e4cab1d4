//! Host configuration backup.
//!
//! Besides the module trees, each distinct remote account gets two small
//! transfers into `current/{user}-{host}/`:
//!
//! | Target            | Remote source                          | Local subpath |
//! |-------------------|----------------------------------------|---------------|
//! | system config     | `/etc/motd`, `/etc/hosts`              | `hosts/`      |
//! | user dotfiles     | `/{home}/{user}/.[^.]*` minus caches   | `{user}/`     |
//!
//! `{home}` is `home` on Linux hosts and `Users` on anything else.

use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::command::{build, Invocation, SyncOptions};
use crate::error::TransferError;
use crate::layout::BackupLayout;
use crate::module_set::{HostDescriptor, HostKey};
use crate::runner::SyncRunner;

/// Files pulled from `/etc`, everything else there is excluded.
const ETC_FILES: [&str; 2] = ["motd", "hosts"];

/// Dotfile entries never worth copying.
const DOTFILE_EXCLUDES: [&str; 2] = [".Trash", ".cache"];

/// Collapse module hosts into one descriptor per `(user, host)`.
///
/// The first descriptor seen for a pair wins; only its `os` matters here.
pub fn distinct_hosts<'a, I>(hosts: I) -> BTreeMap<HostKey, HostDescriptor>
where
    I: IntoIterator<Item = &'a HostDescriptor>,
{
    let mut distinct = BTreeMap::new();
    for host in hosts {
        distinct.entry(host.key()).or_insert_with(|| host.clone());
    }
    distinct
}

/// The two invocations for `host`, in execution order.
pub fn host_invocations(
    host: &HostDescriptor,
    layout: &BackupLayout,
    program: &str,
    options: SyncOptions,
) -> [Invocation; 2] {
    let host_dir = layout.host_dir(host);

    let etc = build(
        program,
        host.remote("/etc/"),
        host_dir.join("hosts"),
        layout.host_etc_log(host),
        options,
    )
    .with_args(
        ETC_FILES
            .iter()
            .map(|file| format!("--include={file}"))
            .chain(std::iter::once("--exclude=*".to_string())),
    );

    let dotfiles = build(
        program,
        host.remote(&format!("/{}/{}/.[^.]*", host.os.home_root(), host.user)),
        host_dir.join(&host.user),
        layout.host_dotfiles_log(host),
        options,
    )
    .with_args(DOTFILE_EXCLUDES.iter().map(|entry| format!("--exclude={entry}")));

    [etc, dotfiles]
}

/// Back up the configuration of one host.
///
/// Both transfers are always attempted. The first failure is returned; any
/// later one is only logged.
pub fn backup_host<R: SyncRunner + ?Sized>(
    runner: &R,
    host: &HostDescriptor,
    layout: &BackupLayout,
    program: &str,
    options: SyncOptions,
) -> Result<(), TransferError> {
    info!("Backing up host configuration of {}", host.login());

    let mut first_error: Option<TransferError> = None;
    for invocation in host_invocations(host, layout, program, options) {
        if let Err(e) = std::fs::create_dir_all(&invocation.destination) {
            let err = TransferError::launch_failed(format!(
                "cannot create {}: {e}",
                invocation.destination.display()
            ));
            warn!("Host {}: {}", host.login(), err);
            first_error.get_or_insert(err);
            continue;
        }

        if let Err(err) = runner.execute(&invocation) {
            warn!(
                "Host {} transfer failed: {} [{}]",
                host.login(),
                err,
                invocation
            );
            first_error.get_or_insert(err);
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HostOs;
    use std::cell::RefCell;

    fn host(user: &str, name: &str, os: HostOs) -> HostDescriptor {
        HostDescriptor {
            user: user.into(),
            host: name.into(),
            os,
            source_path: "/data".into(),
        }
    }

    /// Records every invocation; fails those whose source contains `fail_on`
    struct Recorder {
        calls: RefCell<Vec<Invocation>>,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn new(fail_on: Option<&'static str>) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail_on,
            }
        }
    }

    impl SyncRunner for Recorder {
        fn execute(&self, invocation: &Invocation) -> Result<(), TransferError> {
            self.calls.borrow_mut().push(invocation.clone());
            match self.fail_on {
                Some(pattern) if invocation.source.contains(pattern) => {
                    Err(TransferError::exited(Some(255), format!("ssh: {pattern} unreachable")))
                }
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_distinct_hosts_dedup() {
        let hosts = [
            host("alice", "hostA", HostOs::Linux),
            host("alice", "hostA", HostOs::Linux),
            host("alice", "hostA", HostOs::Linux),
            host("alice", "hostB", HostOs::Other),
        ];
        let distinct = distinct_hosts(&hosts);
        assert_eq!(distinct.len(), 2);
        let keys: Vec<String> = distinct.keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["alice@hostA", "alice@hostB"]);
    }

    #[test]
    fn test_distinct_hosts_different_users_same_host() {
        let hosts = [
            host("alice", "nas", HostOs::Linux),
            host("bob", "nas", HostOs::Linux),
        ];
        assert_eq!(distinct_hosts(&hosts).len(), 2);
    }

    #[test]
    fn test_host_invocations_linux() {
        let layout = BackupLayout::new("/backup");
        let [etc, dotfiles] = host_invocations(
            &host("alice", "nas", HostOs::Linux),
            &layout,
            "rsync",
            SyncOptions::default(),
        );

        assert_eq!(etc.source, "alice@nas:/etc/");
        assert_eq!(
            etc.destination,
            std::path::PathBuf::from("/backup/current/alice-nas/hosts")
        );
        assert_eq!(
            etc.extra_args,
            vec!["--include=motd", "--include=hosts", "--exclude=*"]
        );
        assert!(etc.log_path.ends_with("rsync-output-conf-hosts-alice.txt"));

        assert_eq!(dotfiles.source, "alice@nas:/home/alice/.[^.]*");
        assert_eq!(
            dotfiles.destination,
            std::path::PathBuf::from("/backup/current/alice-nas/alice")
        );
        assert_eq!(dotfiles.extra_args, vec!["--exclude=.Trash", "--exclude=.cache"]);
        assert!(dotfiles.log_path.ends_with("rsync-output-conf-alice.txt"));
    }

    #[test]
    fn test_host_invocations_other_os_uses_users_root() {
        let layout = BackupLayout::new("/backup");
        let [_, dotfiles] = host_invocations(
            &host("bob", "mac", HostOs::Other),
            &layout,
            "rsync",
            SyncOptions::default(),
        );
        assert_eq!(dotfiles.source, "bob@mac:/Users/bob/.[^.]*");
    }

    #[test]
    fn test_backup_host_success_creates_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(tmp.path());
        let runner = Recorder::new(None);
        let target = host("alice", "nas", HostOs::Linux);

        backup_host(&runner, &target, &layout, "rsync", SyncOptions::default()).unwrap();

        assert_eq!(runner.calls.borrow().len(), 2);
        assert!(layout.host_dir(&target).join("hosts").is_dir());
        assert!(layout.host_dir(&target).join("alice").is_dir());
    }

    #[test]
    fn test_backup_host_attempts_second_after_first_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(tmp.path());
        let runner = Recorder::new(Some("/etc/"));

        let err = backup_host(
            &runner,
            &host("alice", "nas", HostOs::Linux),
            &layout,
            "rsync",
            SyncOptions::default(),
        )
        .unwrap_err();

        assert_eq!(runner.calls.borrow().len(), 2);
        assert_eq!(err.exit_code, 255);
        assert!(err.captured_output.contains("/etc/"));
    }

    #[test]
    fn test_backup_host_returns_first_of_two_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(tmp.path());
        let runner = Recorder::new(Some("alice@nas"));

        let err = backup_host(
            &runner,
            &host("alice", "nas", HostOs::Linux),
            &layout,
            "rsync",
            SyncOptions::default(),
        )
        .unwrap_err();
        assert_eq!(runner.calls.borrow().len(), 2);
        assert!(err.captured_output.contains("alice@nas"));
    }
}
