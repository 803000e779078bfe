use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::error::Error;

pub const INGRESS_CHAIN: &str = "TERND-INGRESS";
pub const EGRESS_CHAIN: &str = "TERND-EGRESS";

const IPSET_BIN: &str = "ipset";
const IPTABLES_BIN: &str = "iptables";
const IPTABLES_WAIT_SECONDS: &str = "60";

/// One policy chain as it lands on the host: the chain, its ordered rule
/// specs, and the dispatch jumps pointing at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyChainSpec {
    pub chain: String,
    pub rules: Vec<String>,
    /// (parent chain, 1-based insert position)
    pub jumps: Vec<(String, usize)>,
}

/// The host side of the dataplane. One implementation per platform; tests
/// substitute the recording fake.
#[async_trait]
pub trait HostPlane: Send + Sync {
    /// Feeds a single multi-line program to the set restore primitive.
    async fn restore_sets(&self, program: &str) -> Result<(), Error>;
    /// Creates the chain, fills its rules, wires the dispatch jumps.
    async fn add_policy(&self, spec: &PolicyChainSpec) -> Result<(), Error>;
    /// Unwires the jumps and destroys the chain.
    async fn remove_policy(&self, spec: &PolicyChainSpec) -> Result<(), Error>;
    /// Drops every set and chain this dataplane owns.
    async fn reset(&self) -> Result<(), Error>;
}

/// ipset/iptables-backed plane.
pub struct LinuxHostPlane;

impl LinuxHostPlane {
    pub fn new() -> LinuxHostPlane {
        LinuxHostPlane
    }

    async fn run(bin: &str, args: &[&str], stdin: Option<&str>) -> Result<(), Error> {
        let mut command = Command::new(bin);
        command.args(args);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::null());
        command.stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| Error::TransientHost(format!("{bin}: {e}")))?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .await
                    .map_err(|e| Error::TransientHost(format!("{bin}: {e}")))?;
            }
        } else {
            drop(child.stdin.take());
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::TransientHost(format!("{bin}: {e}")))?;
        if !output.status.success() {
            return Err(Error::TransientHost(format!(
                "{bin} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn run_capture(bin: &str, args: &[&str]) -> Result<String, Error> {
        let output = Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::TransientHost(format!("{bin}: {e}")))?;
        if !output.status.success() {
            return Err(Error::TransientHost(format!(
                "{bin} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn iptables(args: &[&str]) -> Result<(), Error> {
        let mut full = vec!["-w", IPTABLES_WAIT_SECONDS];
        full.extend_from_slice(args);
        Self::run(IPTABLES_BIN, &full, None).await
    }

    async fn ensure_chain(chain: &str) -> Result<(), Error> {
        // -N fails when the chain exists; that is fine.
        let _ = Self::iptables(&["-N", chain]).await;
        Ok(())
    }
}

impl Default for LinuxHostPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostPlane for LinuxHostPlane {
    async fn restore_sets(&self, program: &str) -> Result<(), Error> {
        Self::run(IPSET_BIN, &["-exist", "restore"], Some(program)).await
    }

    async fn add_policy(&self, spec: &PolicyChainSpec) -> Result<(), Error> {
        Self::ensure_chain(&spec.chain).await?;
        Self::iptables(&["-F", &spec.chain]).await?;
        for rule in &spec.rules {
            let mut args = vec!["-A", spec.chain.as_str()];
            args.extend(rule.split_whitespace());
            Self::iptables(&args).await?;
        }
        for (parent, position) in &spec.jumps {
            Self::ensure_chain(parent).await?;
            let position = position.to_string();
            Self::iptables(&["-I", parent, &position, "-j", &spec.chain]).await?;
        }
        Ok(())
    }

    async fn remove_policy(&self, spec: &PolicyChainSpec) -> Result<(), Error> {
        for (parent, _) in &spec.jumps {
            Self::iptables(&["-D", parent, "-j", &spec.chain]).await?;
        }
        Self::iptables(&["-F", &spec.chain]).await?;
        Self::iptables(&["-X", &spec.chain]).await?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), Error> {
        for chain in [INGRESS_CHAIN, EGRESS_CHAIN] {
            Self::ensure_chain(chain).await?;
            Self::iptables(&["-F", chain]).await?;
        }
        let names = Self::run_capture(IPSET_BIN, &["list", "-name"]).await?;
        for name in names
            .lines()
            .filter(|n| n.starts_with(super::ipsets::SET_PREFIX))
        {
            Self::run(IPSET_BIN, &["destroy", name], None).await?;
        }
        Ok(())
    }
}

/// What the fake records about each host call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    RestoreSets(String),
    AddPolicy(PolicyChainSpec),
    RemovePolicy(String),
    Reset,
}

/// Recording fake plane for tests: remembers every call and can inject a
/// number of transient failures.
#[derive(Debug, Default)]
pub struct FakeHostPlane {
    calls: Mutex<Vec<HostCall>>,
    transient_failures: AtomicUsize,
}

impl FakeHostPlane {
    pub fn new() -> FakeHostPlane {
        FakeHostPlane::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: HostCall) -> Result<(), Error> {
        self.calls.lock().unwrap().push(call);
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::TransientHost("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl HostPlane for FakeHostPlane {
    async fn restore_sets(&self, program: &str) -> Result<(), Error> {
        self.record(HostCall::RestoreSets(program.to_string()))
    }

    async fn add_policy(&self, spec: &PolicyChainSpec) -> Result<(), Error> {
        self.record(HostCall::AddPolicy(spec.clone()))
    }

    async fn remove_policy(&self, spec: &PolicyChainSpec) -> Result<(), Error> {
        self.record(HostCall::RemovePolicy(spec.chain.clone()))
    }

    async fn reset(&self) -> Result<(), Error> {
        self.record(HostCall::Reset)
    }
}
