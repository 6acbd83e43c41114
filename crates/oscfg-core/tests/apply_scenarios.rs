//! End-to-end reconciler scenarios over a rooted filesystem and scripted
//! package-manager commands.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;

use oscfg_core::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};
use oscfg_core::fs_safe::checksum;
use oscfg_core::inventory::OsInventory;
use oscfg_core::keyring::{KeyFetcher, KeyringError};
use oscfg_core::packages::{AptManager, DesiredState, YumManager};
use oscfg_core::policy::{
    AptArchiveType, AptRepositorySpec, ComplianceState, PackageResourceSpec, PolicyAssignment,
    PolicyMode, RepositorySpec, Resource, ResourceGroup, ResourceSpec, YumRepositorySpec,
};
use oscfg_core::reconcile::{HostCapabilities, HostPaths, Reconciler};

struct ScriptedRunner {
    responses: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new(responses: Vec<CommandOutput>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            code: Some(0),
        }
    }

    fn fail(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            code: Some(code),
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.calls.lock().unwrap().push(spec.display());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedRunner::ok("")))
    }
}

struct LocalKeys {
    keys: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl KeyFetcher for LocalKeys {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, KeyringError> {
        self.keys.get(url).cloned().ok_or(KeyringError::NotAKey)
    }
}

fn debian_inventory() -> OsInventory {
    OsInventory {
        short_name: "debian".to_string(),
        version: "12".to_string(),
        architecture: "x86_64".to_string(),
        hostname: "host-1".to_string(),
        kernel_release: "6.1.0".to_string(),
        agent_version: "test".to_string(),
    }
}

fn enforcement(resources: Vec<Resource>) -> PolicyAssignment {
    PolicyAssignment {
        id: "a1".to_string(),
        revision: "1".to_string(),
        mode: PolicyMode::Enforcement,
        groups: vec![ResourceGroup {
            filters: vec![],
            resources,
        }],
    }
}

/// Apt repo with a GPG key: exact file bytes, key re-serialization, second
/// apply is a no-op.
#[tokio::test]
async fn apt_repo_add_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new(vec![]);

    let packets = vec![0x99u8, 0x01, 0x0d, 0x04, 0x5e];
    let armored = format!(
        "-----BEGIN PGP PUBLIC KEY BLOCK-----\n\n{}\n-----END PGP PUBLIC KEY BLOCK-----\n",
        base64::engine::general_purpose::STANDARD.encode(&packets)
    );

    let caps = Arc::new(HostCapabilities {
        runner: runner.clone(),
        package_manager: Some(Arc::new(AptManager::new(runner.clone()))),
        key_fetcher: Arc::new(LocalKeys {
            keys: HashMap::from([(
                "http://example/key.gpg".to_string(),
                armored.into_bytes(),
            )]),
        }),
        inventory: debian_inventory(),
        paths: HostPaths::rooted(dir.path()),
    });

    let assignment = enforcement(vec![Resource {
        id: "add-repo".to_string(),
        spec: ResourceSpec::Repository(RepositorySpec::Apt(AptRepositorySpec {
            archive_type: AptArchiveType::Deb,
            uri: "http://example/deb".to_string(),
            distribution: "stable".to_string(),
            components: vec!["main".to_string()],
            gpg_key: Some("http://example/key.gpg".to_string()),
        })),
    }]);

    let reconciler = Reconciler::new(caps);
    let results = reconciler.apply(std::slice::from_ref(&assignment)).await;
    assert_eq!(results[0].resources[0].state, ComplianceState::Compliant);

    // Exact rendered bytes at the checksum-prefixed path.
    let expected = "# Repo file managed by Google OSConfig agent\ndeb http://example/deb stable main\n";
    let prefix = &checksum(expected.as_bytes())[..10];
    let repo_path = dir
        .path()
        .join("etc/apt/sources.list.d")
        .join(format!("osconfig_added_{prefix}.list"));
    assert_eq!(std::fs::read_to_string(&repo_path).unwrap(), expected);

    // Trust-store file carries the canonical binary keyring.
    let gpg_path = dir
        .path()
        .join("etc/apt/trusted.gpg.d")
        .join(format!("osconfig_added_{}.gpg", checksum(&packets)));
    assert_eq!(std::fs::read(&gpg_path).unwrap(), packets);

    // Second apply: compliant on check, nothing enforced, bytes unchanged.
    let results = reconciler.apply(&[assignment]).await;
    let resource = &results[0].resources[0];
    assert_eq!(resource.state, ComplianceState::Compliant);
    assert_eq!(resource.steps.len(), 2);
    assert_eq!(std::fs::read_to_string(&repo_path).unwrap(), expected);
}

/// Yum repo with two keys and no display name: exact INI rendering.
#[tokio::test]
async fn yum_repo_two_gpg_keys() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new(vec![]);

    let caps = Arc::new(HostCapabilities {
        runner: runner.clone(),
        package_manager: Some(Arc::new(YumManager::new(runner.clone()))),
        key_fetcher: Arc::new(LocalKeys {
            keys: HashMap::new(),
        }),
        inventory: OsInventory {
            short_name: "rhel".to_string(),
            version: "9".to_string(),
            ..debian_inventory()
        },
        paths: HostPaths::rooted(dir.path()),
    });

    let assignment = enforcement(vec![Resource {
        id: "yum-repo".to_string(),
        spec: ResourceSpec::Repository(RepositorySpec::Yum(YumRepositorySpec {
            id: "X".to_string(),
            display_name: None,
            base_url: "U".to_string(),
            gpg_keys: vec!["A".to_string(), "B".to_string()],
        })),
    }]);

    let results = Reconciler::new(caps).apply(&[assignment]).await;
    assert_eq!(results[0].resources[0].state, ComplianceState::Compliant);

    let repos = dir.path().join("etc/yum.repos.d");
    let entry = std::fs::read_dir(repos).unwrap().next().unwrap().unwrap();
    assert_eq!(
        std::fs::read_to_string(entry.path()).unwrap(),
        "# Repo file managed by Google OSConfig agent\n[X]\nname=X\nbaseurl=U\nenabled=1\ngpgcheck=1\ngpgkey=A\n       B\n"
    );
}

/// Broken dpkg self-heal: install fails asking for `dpkg --configure -a`,
/// the repair runs once, the retried install succeeds, and the resource
/// reports compliant.
#[tokio::test]
async fn package_install_with_broken_dpkg() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new(vec![
        // check: not installed
        ScriptedRunner::fail(1, "dpkg-query: no packages found matching foo"),
        // enforce: install fails with the broken-dpkg marker
        ScriptedRunner::fail(
            100,
            "E: dpkg was interrupted, you must manually run 'dpkg --configure -a' to correct the problem.",
        ),
        // repair
        ScriptedRunner::ok(""),
        // retried install
        ScriptedRunner::ok(""),
        // post-enforce check: installed
        ScriptedRunner::ok("installed\n"),
    ]);

    let caps = Arc::new(HostCapabilities {
        runner: runner.clone(),
        package_manager: Some(Arc::new(AptManager::new(runner.clone()))),
        key_fetcher: Arc::new(LocalKeys {
            keys: HashMap::new(),
        }),
        inventory: debian_inventory(),
        paths: HostPaths::rooted(dir.path()),
    });

    let assignment = enforcement(vec![Resource {
        id: "install-foo".to_string(),
        spec: ResourceSpec::Package(PackageResourceSpec {
            name: "foo".to_string(),
            desired_state: DesiredState::Installed,
        }),
    }]);

    let results = Reconciler::new(caps).apply(&[assignment]).await;
    assert_eq!(results[0].resources[0].state, ComplianceState::Compliant);

    let calls = runner.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            "/usr/bin/dpkg-query -W -f ${db:Status-Status} foo",
            "/usr/bin/apt-get install -y foo",
            "/usr/bin/dpkg --configure -a",
            "/usr/bin/apt-get install -y foo",
            "/usr/bin/dpkg-query -W -f ${db:Status-Status} foo",
        ]
    );
}

/// A validation-mode assignment reports drift without touching the host.
#[tokio::test]
async fn validation_mode_reports_only() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new(vec![ScriptedRunner::fail(1, "not installed")]);

    let caps = Arc::new(HostCapabilities {
        runner: runner.clone(),
        package_manager: Some(Arc::new(AptManager::new(runner.clone()))),
        key_fetcher: Arc::new(LocalKeys {
            keys: HashMap::new(),
        }),
        inventory: debian_inventory(),
        paths: HostPaths::rooted(dir.path()),
    });

    let mut assignment = enforcement(vec![Resource {
        id: "install-foo".to_string(),
        spec: ResourceSpec::Package(PackageResourceSpec {
            name: "foo".to_string(),
            desired_state: DesiredState::Installed,
        }),
    }]);
    assignment.mode = PolicyMode::Validation;

    let results = Reconciler::new(caps).apply(&[assignment]).await;
    assert_eq!(
        results[0].resources[0].state,
        ComplianceState::NonCompliant
    );
    // Only the status query ran; no apt-get mutation.
    assert_eq!(runner.calls.lock().unwrap().len(), 1);
}
