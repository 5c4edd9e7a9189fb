//! Remote command execution against a running guest.
//!
//! The guest is reached through the host address:port forwarded to its ssh
//! port. Authentication skips host-key verification since every boot of a
//! snapshot disk presents the same throwaway key.

use std::path::Path;

use async_trait::async_trait;
use rand::Rng;

use crate::errors::RemoteError;

mod ssh;

pub use ssh::{OpenSshClient, ssh_command};

/// User the module/executable helpers log in as.
pub const ROOT_USER: &str = "root";

/// Command execution and file transfer into a guest.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` and return its combined stdout/stderr.
    async fn run_command(&self, user: &str, command: &str) -> Result<String, RemoteError>;

    /// Start `command` detached from the remote shell and return immediately.
    async fn run_command_detached(&self, user: &str, command: &str) -> Result<(), RemoteError>;

    /// Upload `local` to `remote` on the guest.
    async fn copy_file(&self, user: &str, local: &Path, remote: &str) -> Result<(), RemoteError>;

    /// Upload a kernel module to a fresh `/tmp` path and load it as root.
    async fn copy_and_insmod(&self, local_ko: &Path) -> Result<String, RemoteError> {
        let remote = format!("/tmp/module_{}.ko", random_suffix());
        self.copy_file(ROOT_USER, local_ko, &remote).await?;
        self.run_command(ROOT_USER, &format!("insmod {}", remote))
            .await
    }

    /// Upload an executable to a fresh `/tmp` path and run it.
    async fn copy_and_run(&self, user: &str, local: &Path) -> Result<String, RemoteError> {
        let remote = format!("/tmp/executable_{}", random_suffix());
        self.copy_file(user, local, &remote).await?;
        self.run_command(user, &format!("chmod +x {0} && {0}", remote))
            .await
    }
}

fn random_suffix() -> u64 {
    rand::rng().random()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    /// Records calls instead of talking to a guest.
    #[derive(Default)]
    struct Recorder {
        copies: Mutex<Vec<(String, PathBuf, String)>>,
        commands: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RemoteExecutor for Recorder {
        async fn run_command(&self, user: &str, command: &str) -> Result<String, RemoteError> {
            self.commands
                .lock()
                .push((user.to_string(), command.to_string()));
            Ok("ok".to_string())
        }

        async fn run_command_detached(&self, user: &str, command: &str) -> Result<(), RemoteError> {
            self.run_command(user, command).await.map(|_| ())
        }

        async fn copy_file(&self, user: &str, local: &Path, remote: &str) -> Result<(), RemoteError> {
            self.copies
                .lock()
                .push((user.to_string(), local.to_path_buf(), remote.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_copy_and_insmod() {
        let recorder = Recorder::default();
        let output = recorder
            .copy_and_insmod(Path::new("/build/test.ko"))
            .await
            .unwrap();
        assert_eq!(output, "ok");

        let copies = recorder.copies.lock();
        let (user, local, remote) = &copies[0];
        assert_eq!(user, "root");
        assert_eq!(local, Path::new("/build/test.ko"));
        assert!(remote.starts_with("/tmp/module_") && remote.ends_with(".ko"));

        let commands = recorder.commands.lock();
        assert_eq!(commands[0], ("root".to_string(), format!("insmod {}", remote)));
    }

    #[tokio::test]
    async fn test_copy_and_run() {
        let recorder = Recorder::default();
        recorder
            .copy_and_run("user", Path::new("/build/exploit"))
            .await
            .unwrap();

        let remote = recorder.copies.lock()[0].2.clone();
        assert!(remote.starts_with("/tmp/executable_"));
        let commands = recorder.commands.lock();
        assert_eq!(commands[0].0, "user");
        assert_eq!(commands[0].1, format!("chmod +x {0} && {0}", remote));
    }

    #[tokio::test]
    async fn test_copy_failure_skips_command() {
        struct FailingCopy;

        #[async_trait]
        impl RemoteExecutor for FailingCopy {
            async fn run_command(&self, _: &str, _: &str) -> Result<String, RemoteError> {
                panic!("must not run after failed copy");
            }
            async fn run_command_detached(&self, _: &str, _: &str) -> Result<(), RemoteError> {
                Ok(())
            }
            async fn copy_file(&self, _: &str, _: &Path, _: &str) -> Result<(), RemoteError> {
                Err(RemoteError::NotRunning)
            }
        }

        let err = FailingCopy
            .copy_and_insmod(Path::new("/build/test.ko"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotRunning));
    }
}
