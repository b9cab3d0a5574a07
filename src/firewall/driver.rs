//! Backend-specific invocations of the `nft`/`ipset` command-line tools.
//!
//! One async trait lets the consumer loop in [`super`] stay backend-agnostic;
//! each implementation only needs to know how to turn a batch into a child
//! process invocation.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::BatchItem;

const CHILD_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait FirewallDriver: Send + Sync + 'static {
    async fn apply(&self, set_name: &str, items: &[BatchItem]) -> io::Result<()>;
}

async fn run_with_timeout(mut cmd: Command, stdin_payload: Option<String>) -> io::Result<()> {
    cmd.stdin(if stdin_payload.is_some() { Stdio::piped() } else { Stdio::null() });
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    if let Some(payload) = stdin_payload {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await?;
        }
    }

    let wait = child.wait_with_output();
    match tokio::time::timeout(CHILD_TIMEOUT, wait).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        )),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "firewall command timed out")),
    }
}

/// Drives `nft add element inet fw4 <set> { ip . port timeout Ns, ... }`.
pub struct NftDriver {
    pub table_family: String,
    pub table_name: String,
}

impl Default for NftDriver {
    fn default() -> Self {
        Self {
            table_family: "inet".to_string(),
            table_name: "fw4".to_string(),
        }
    }
}

#[async_trait]
impl FirewallDriver for NftDriver {
    async fn apply(&self, set_name: &str, items: &[BatchItem]) -> io::Result<()> {
        let elements = items
            .iter()
            .map(|i| format!("{} . {} timeout {}s", i.ip, i.port, i.timeout_secs))
            .collect::<Vec<_>>()
            .join(", ");
        let spec = format!("{{ {elements} }}");

        let mut cmd = Command::new("nft");
        cmd.args([
            "add",
            "element",
            &self.table_family,
            &self.table_name,
            set_name,
            &spec,
        ]);
        run_with_timeout(cmd, None).await
    }
}

/// Drives `ipset restore` fed one `add <set> ip,port timeout N -exist` line per item.
pub struct IpsetDriver;

#[async_trait]
impl FirewallDriver for IpsetDriver {
    async fn apply(&self, set_name: &str, items: &[BatchItem]) -> io::Result<()> {
        let mut payload = String::new();
        for item in items {
            payload.push_str(&format!(
                "add {set_name} {},{} timeout {} -exist\n",
                item.ip, item.port, item.timeout_secs
            ));
        }

        let mut cmd = Command::new("ipset");
        cmd.arg("restore");
        run_with_timeout(cmd, Some(payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nft_element_spec_format() {
        let items = vec![
            BatchItem { ip: "10.0.0.1".into(), port: 443, timeout_secs: 600 },
            BatchItem { ip: "10.0.0.2".into(), port: 80, timeout_secs: 86400 },
        ];
        let elements = items
            .iter()
            .map(|i| format!("{} . {} timeout {}s", i.ip, i.port, i.timeout_secs))
            .collect::<Vec<_>>()
            .join(", ");
        assert_eq!(
            elements,
            "10.0.0.1 . 443 timeout 600s, 10.0.0.2 . 80 timeout 86400s"
        );
    }

    #[test]
    fn ipset_restore_payload_format() {
        let items = vec![BatchItem { ip: "10.0.0.1".into(), port: 443, timeout_secs: 600 }];
        let mut payload = String::new();
        for item in &items {
            payload.push_str(&format!(
                "add myset {},{} timeout {} -exist\n",
                item.ip, item.port, item.timeout_secs
            ));
        }
        assert_eq!(payload, "add myset 10.0.0.1,443 timeout 600 -exist\n");
    }
}
