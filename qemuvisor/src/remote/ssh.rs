//! [`RemoteExecutor`] backed by the host's OpenSSH `ssh`/`scp` binaries.

use std::net::SocketAddrV4;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::RemoteExecutor;
use crate::errors::RemoteError;

const SSH: &str = "ssh";
const SCP: &str = "scp";

/// Options shared by ssh and scp: no host-key checks, no prompts, quiet.
const COMMON_OPTIONS: [&str; 8] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=error",
    "-o",
    "BatchMode=yes",
];

/// Human-friendly connection command for a forwarded port.
pub fn ssh_command(addr: SocketAddrV4) -> String {
    format!(
        "ssh -o StrictHostKeyChecking=no -p {} root@{}",
        addr.port(),
        addr.ip()
    )
}

/// Wrap `command` so it survives the ssh session closing.
fn detached(command: &str) -> String {
    let quoted = command.replace('\'', r"'\''");
    format!(
        "nohup sh -c '{}' > /dev/null 2> /dev/null < /dev/null &",
        quoted
    )
}

/// Shells out to `ssh`/`scp` against a forwarded address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSshClient {
    addr: SocketAddrV4,
}

impl OpenSshClient {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    fn ssh_args(&self, user: &str, command: &str) -> Vec<String> {
        let mut args: Vec<String> = COMMON_OPTIONS.iter().map(|s| s.to_string()).collect();
        args.extend([
            "-p".to_string(),
            self.addr.port().to_string(),
            format!("{}@{}", user, self.addr.ip()),
            command.to_string(),
        ]);
        args
    }

    fn scp_args(&self, user: &str, local: &Path, remote: &str) -> Vec<String> {
        let mut args: Vec<String> = COMMON_OPTIONS.iter().map(|s| s.to_string()).collect();
        args.extend([
            "-P".to_string(),
            self.addr.port().to_string(),
            local.display().to_string(),
            format!("{}@{}:{}", user, self.addr.ip(), remote),
        ]);
        args
    }

    /// Run `program` and return combined stdout/stderr, or a failure carrying it.
    async fn run(&self, program: &'static str, args: Vec<String>) -> Result<String, RemoteError> {
        tracing::debug!(program, addr = %self.addr, "Running remote operation");

        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RemoteError::Spawn { program, source })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            tracing::debug!(program, status = %output.status, "Remote operation failed");
            Err(RemoteError::Failed {
                program,
                status: output.status.to_string(),
                output: combined,
            })
        }
    }
}

#[async_trait]
impl RemoteExecutor for OpenSshClient {
    async fn run_command(&self, user: &str, command: &str) -> Result<String, RemoteError> {
        self.run(SSH, self.ssh_args(user, command)).await
    }

    async fn run_command_detached(&self, user: &str, command: &str) -> Result<(), RemoteError> {
        self.run(SSH, self.ssh_args(user, &detached(command)))
            .await
            .map(|_| ())
    }

    async fn copy_file(&self, user: &str, local: &Path, remote: &str) -> Result<(), RemoteError> {
        self.run(SCP, self.scp_args(user, local, remote))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn client() -> OpenSshClient {
        OpenSshClient::new(SocketAddrV4::new(Ipv4Addr::new(127, 9, 8, 7), 31337))
    }

    #[test]
    fn test_ssh_command_string() {
        assert_eq!(
            ssh_command(client().addr()),
            "ssh -o StrictHostKeyChecking=no -p 31337 root@127.9.8.7"
        );
    }

    #[test]
    fn test_ssh_args() {
        let args = client().ssh_args("root", "uname -a");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));

        let n = args.len();
        assert_eq!(&args[n - 4..], ["-p", "31337", "root@127.9.8.7", "uname -a"]);
    }

    #[test]
    fn test_scp_args_use_uppercase_port_flag() {
        let args = client().scp_args("user", Path::new("/tmp/a.ko"), "/tmp/module_1.ko");
        let n = args.len();
        assert_eq!(
            &args[n - 4..],
            ["-P", "31337", "/tmp/a.ko", "user@127.9.8.7:/tmp/module_1.ko"]
        );
        assert!(!args.contains(&"-p".to_string()));
    }

    #[test]
    fn test_detached_wrapping() {
        assert_eq!(
            detached("./fuzz --forever"),
            "nohup sh -c './fuzz --forever' > /dev/null 2> /dev/null < /dev/null &"
        );
        assert_eq!(
            detached("echo 'hi'"),
            r"nohup sh -c 'echo '\''hi'\''' > /dev/null 2> /dev/null < /dev/null &"
        );
    }

    #[tokio::test]
    async fn test_unreachable_guest_is_an_error() {
        // Port 1 on loopback: nothing listens, ssh fails fast (or is missing).
        let client = OpenSshClient::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        let err = client.run_command("root", "true").await.unwrap_err();
        assert!(matches!(
            err,
            RemoteError::Failed { .. } | RemoteError::Spawn { .. }
        ));
    }
}
