//! Capability fixtures for handler and engine tests.

use std::sync::Arc;

use tempfile::TempDir;

use crate::exec::{CommandOutput, SystemRunner};
use crate::inventory::OsInventory;
use crate::keyring::testing::FakeKeyFetcher;
use crate::packages::testing::FakeRunner;
use crate::packages::{AptManager, PackageManager};

use super::{HostCapabilities, HostPaths};

pub(crate) fn debian_inventory() -> OsInventory {
    OsInventory {
        short_name: "debian".to_string(),
        version: "12".to_string(),
        architecture: "x86_64".to_string(),
        hostname: "host-1".to_string(),
        kernel_release: "6.1.0".to_string(),
        agent_version: "test".to_string(),
    }
}

/// Capabilities over a scripted runner, optionally with a package manager,
/// rooted in a fresh temp dir.
pub(crate) fn test_caps(
    package_manager: Option<Arc<dyn PackageManager>>,
) -> (Arc<HostCapabilities>, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let caps = Arc::new(HostCapabilities {
        runner: Arc::new(FakeRunner::new(Vec::new())),
        package_manager,
        key_fetcher: Arc::new(FakeKeyFetcher::default()),
        inventory: debian_inventory(),
        paths: HostPaths::rooted(dir.path()),
    });
    (caps, dir)
}

/// Capabilities with an apt manager over an empty script (every command
/// succeeds with empty output).
pub(crate) fn apt_caps() -> (Arc<HostCapabilities>, TempDir) {
    apt_caps_with_script(Vec::new())
}

/// Capabilities with an apt manager over the given scripted outputs.
pub(crate) fn apt_caps_with_script(
    script: Vec<CommandOutput>,
) -> (Arc<HostCapabilities>, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let runner = Arc::new(FakeRunner::new(script));
    let caps = Arc::new(HostCapabilities {
        runner: runner.clone(),
        package_manager: Some(Arc::new(AptManager::new(runner))),
        key_fetcher: Arc::new(FakeKeyFetcher::default()),
        inventory: debian_inventory(),
        paths: HostPaths::rooted(dir.path()),
    });
    (caps, dir)
}

/// Capabilities whose runner actually executes subprocesses; used by exec
/// resource tests.
pub(crate) fn test_caps_with_system_runner() -> (Arc<HostCapabilities>, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let caps = Arc::new(HostCapabilities {
        runner: Arc::new(SystemRunner::default()),
        package_manager: None,
        key_fetcher: Arc::new(FakeKeyFetcher::default()),
        inventory: debian_inventory(),
        paths: HostPaths::rooted(dir.path()),
    });
    (caps, dir)
}

/// Apt capabilities whose key fetcher serves the given canned bodies.
pub(crate) fn apt_caps_with_keys(
    keys: std::collections::HashMap<String, Vec<u8>>,
) -> (Arc<HostCapabilities>, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let runner = Arc::new(FakeRunner::new(Vec::new()));
    let caps = Arc::new(HostCapabilities {
        runner: runner.clone(),
        package_manager: Some(Arc::new(AptManager::new(runner))),
        key_fetcher: Arc::new(FakeKeyFetcher { keys }),
        inventory: debian_inventory(),
        paths: HostPaths::rooted(dir.path()),
    });
    (caps, dir)
}
