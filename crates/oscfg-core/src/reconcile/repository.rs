//! Repository resource handler.
//!
//! Renders the canonical text form for the spec's package-manager family,
//! derives the managed file path from the first 10 hex characters of the
//! rendered contents' SHA-256, and reconciles the file (plus, for apt, the
//! trust-store key) by checksum comparison.

use std::path::PathBuf;
use std::sync::Arc;

use crate::fs_safe::{atomic_write, checksum, contents_match, file_checksum};
use crate::keyring;
use crate::packages::PackageFamily;
use crate::policy::{
    AptRepositorySpec, GoogetRepositorySpec, RepositorySpec, Resource, ResourceSpec,
    YumRepositorySpec, ZypperRepositorySpec,
};

use super::{require_family, HostCapabilities, ResourceError, ResourceHandler};

/// First line of every managed repo file.
const MANAGED_BY_HEADER: &str = "# Repo file managed by Google OSConfig agent\n";

/// Length of the checksum prefix embedded in managed file names.
const PATH_PREFIX_LEN: usize = 10;

struct ManagedGpgKey {
    path: PathBuf,
    checksum: String,
    contents: Vec<u8>,
}

/// Per-apply workspace, built by validate and consumed by check/enforce.
struct ManagedRepository {
    repo_path: PathBuf,
    repo_checksum: String,
    repo_contents: Vec<u8>,
    gpg: Option<ManagedGpgKey>,
}

/// [`ResourceHandler`] for repository resources.
pub struct RepositoryHandler {
    resource_id: String,
    spec: Option<RepositorySpec>,
    caps: Arc<HostCapabilities>,
    managed: Option<ManagedRepository>,
}

impl RepositoryHandler {
    /// Registry constructor.
    #[must_use]
    pub fn boxed(resource: &Resource, caps: &Arc<HostCapabilities>) -> Box<dyn ResourceHandler> {
        let spec = match &resource.spec {
            ResourceSpec::Repository(spec) => Some(spec.clone()),
            _ => None,
        };
        Box::new(Self {
            resource_id: resource.id.clone(),
            spec,
            caps: Arc::clone(caps),
            managed: None,
        })
    }

    fn managed(&self) -> Result<&ManagedRepository, ResourceError> {
        self.managed.as_ref().ok_or_else(|| {
            ResourceError::Validation("repository resource not validated".to_string())
        })
    }
}

#[async_trait::async_trait]
impl ResourceHandler for RepositoryHandler {
    async fn validate(&mut self) -> Result<(), ResourceError> {
        let spec = self.spec.clone().ok_or_else(|| {
            ResourceError::Validation("resource spec is not a repository".to_string())
        })?;

        let (family, contents) = match &spec {
            RepositorySpec::Apt(apt) => (PackageFamily::Apt, apt_repo_contents(apt)),
            RepositorySpec::Yum(yum) => (PackageFamily::Yum, yum_repo_contents(yum)),
            RepositorySpec::Zypper(zypper) => {
                (PackageFamily::Zypper, zypper_repo_contents(zypper))
            }
            RepositorySpec::Googet(goo) => (PackageFamily::Googet, googet_repo_contents(goo)),
        };
        require_family(&self.caps, family)?;

        let repo_checksum = checksum(&contents);
        let repo_path = self
            .caps
            .paths
            .repo_file(family, &repo_checksum[..PATH_PREFIX_LEN]);

        let gpg = match &spec {
            RepositorySpec::Apt(AptRepositorySpec {
                gpg_key: Some(url), ..
            }) => {
                let raw = self.caps.key_fetcher.fetch(url).await.map_err(|e| {
                    ResourceError::Validation(format!("error fetching apt gpg key {url:?}: {e}"))
                })?;
                let contents = keyring::canonicalize(&raw)?;
                let key_checksum = checksum(&contents);
                Some(ManagedGpgKey {
                    path: self.caps.paths.apt_gpg_file(&key_checksum),
                    checksum: key_checksum,
                    contents,
                })
            }
            _ => None,
        };

        self.managed = Some(ManagedRepository {
            repo_path,
            repo_checksum,
            repo_contents: contents,
            gpg,
        });
        Ok(())
    }

    async fn check(&mut self) -> Result<bool, ResourceError> {
        let managed = self.managed()?;

        if let Some(gpg) = &managed.gpg {
            if !contents_match(&gpg.path, &gpg.checksum)? {
                return Ok(false);
            }
        }

        Ok(contents_match(&managed.repo_path, &managed.repo_checksum)?)
    }

    async fn enforce(&mut self) -> Result<(), ResourceError> {
        let managed = self.managed()?;
        tracing::info!(
            resource = %self.resource_id,
            path = %managed.repo_path.display(),
            "enforcing repo"
        );

        // The path embeds a 10-hex prefix of the contents' digest. A file
        // already there whose own digest shares the prefix but differs in
        // full belongs to a different managed spec; overwriting it would
        // silently break that one, so surface the collision instead.
        if managed.repo_path.exists() {
            let existing = file_checksum(&managed.repo_path)?;
            if existing != managed.repo_checksum
                && existing[..PATH_PREFIX_LEN] == managed.repo_checksum[..PATH_PREFIX_LEN]
            {
                return Err(ResourceError::PathCollision {
                    path: managed.repo_path.clone(),
                });
            }
        }

        if let Some(gpg) = &managed.gpg {
            if let Some(parent) = gpg.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::fs_safe::FsError::io(format!("create {}", parent.display()), e)
                })?;
            }
            std::fs::write(&gpg.path, &gpg.contents).map_err(|e| {
                crate::fs_safe::FsError::io(format!("write {}", gpg.path.display()), e)
            })?;
        }

        atomic_write(&managed.repo_path, &managed.repo_contents)?;
        Ok(())
    }
}

fn apt_repo_contents(repo: &AptRepositorySpec) -> Vec<u8> {
    // deb http://repo1-url/ repo main
    let mut line = format!(
        "{} {} {}",
        repo.archive_type.keyword(),
        repo.uri,
        repo.distribution
    );
    for component in &repo.components {
        line.push(' ');
        line.push_str(component);
    }
    format!("{MANAGED_BY_HEADER}{line}\n").into_bytes()
}

fn googet_repo_contents(repo: &GoogetRepositorySpec) -> Vec<u8> {
    format!(
        "{MANAGED_BY_HEADER}- name: {}\n  url: {}\n",
        repo.name, repo.url
    )
    .into_bytes()
}

fn yum_repo_contents(repo: &YumRepositorySpec) -> Vec<u8> {
    ini_repo_contents(
        &repo.id,
        repo.display_name.as_deref(),
        &repo.base_url,
        &repo.gpg_keys,
        true,
    )
}

fn zypper_repo_contents(repo: &ZypperRepositorySpec) -> Vec<u8> {
    ini_repo_contents(
        &repo.id,
        repo.display_name.as_deref(),
        &repo.base_url,
        &repo.gpg_keys,
        false,
    )
}

fn ini_repo_contents(
    id: &str,
    display_name: Option<&str>,
    base_url: &str,
    gpg_keys: &[String],
    gpgcheck: bool,
) -> Vec<u8> {
    let mut buf = String::from(MANAGED_BY_HEADER);
    buf.push_str(&format!("[{id}]\n"));
    buf.push_str(&format!("name={}\n", display_name.unwrap_or(id)));
    buf.push_str(&format!("baseurl={base_url}\n"));
    buf.push_str("enabled=1\n");
    if gpgcheck {
        buf.push_str("gpgcheck=1\n");
    }
    if let Some((first, rest)) = gpg_keys.split_first() {
        buf.push_str(&format!("gpgkey={first}\n"));
        for key in rest {
            // Continuation lines align under the value column.
            buf.push_str(&format!("       {key}\n"));
        }
    }
    buf.into_bytes()
}

#[cfg(test)]
mod tests {
    use base64::Engine;

    use super::super::testing::{apt_caps, test_caps};
    use super::*;
    use crate::policy::AptArchiveType;

    fn apt_resource(gpg_key: Option<&str>) -> Resource {
        Resource {
            id: "repo-1".to_string(),
            spec: ResourceSpec::Repository(RepositorySpec::Apt(AptRepositorySpec {
                archive_type: AptArchiveType::Deb,
                uri: "http://example/deb".to_string(),
                distribution: "stable".to_string(),
                components: vec!["main".to_string()],
                gpg_key: gpg_key.map(ToString::to_string),
            })),
        }
    }

    #[test]
    fn test_apt_rendering() {
        let spec = AptRepositorySpec {
            archive_type: AptArchiveType::Deb,
            uri: "http://example/deb".to_string(),
            distribution: "stable".to_string(),
            components: vec!["main".to_string()],
            gpg_key: None,
        };
        assert_eq!(
            String::from_utf8(apt_repo_contents(&spec)).unwrap(),
            "# Repo file managed by Google OSConfig agent\ndeb http://example/deb stable main\n"
        );
    }

    #[test]
    fn test_apt_deb_src_rendering() {
        let spec = AptRepositorySpec {
            archive_type: AptArchiveType::DebSrc,
            uri: "http://example/deb".to_string(),
            distribution: "stable".to_string(),
            components: vec![],
            gpg_key: None,
        };
        assert_eq!(
            String::from_utf8(apt_repo_contents(&spec)).unwrap(),
            "# Repo file managed by Google OSConfig agent\ndeb-src http://example/deb stable\n"
        );
    }

    #[test]
    fn test_yum_rendering_two_keys_no_display_name() {
        let spec = YumRepositorySpec {
            id: "X".to_string(),
            display_name: None,
            base_url: "U".to_string(),
            gpg_keys: vec!["A".to_string(), "B".to_string()],
        };
        assert_eq!(
            String::from_utf8(yum_repo_contents(&spec)).unwrap(),
            "# Repo file managed by Google OSConfig agent\n[X]\nname=X\nbaseurl=U\nenabled=1\ngpgcheck=1\ngpgkey=A\n       B\n"
        );
    }

    #[test]
    fn test_zypper_rendering_no_gpgcheck() {
        let spec = ZypperRepositorySpec {
            id: "suse".to_string(),
            display_name: Some("SUSE Repo".to_string()),
            base_url: "https://repo".to_string(),
            gpg_keys: vec![],
        };
        let text = String::from_utf8(zypper_repo_contents(&spec)).unwrap();
        assert!(text.contains("name=SUSE Repo\n"));
        assert!(!text.contains("gpgcheck"));
        assert!(!text.contains("gpgkey"));
    }

    #[test]
    fn test_googet_rendering() {
        let spec = GoogetRepositorySpec {
            name: "repo1-name".to_string(),
            url: "https://repo1-url".to_string(),
        };
        assert_eq!(
            String::from_utf8(googet_repo_contents(&spec)).unwrap(),
            "# Repo file managed by Google OSConfig agent\n- name: repo1-name\n  url: https://repo1-url\n"
        );
    }

    #[tokio::test]
    async fn test_validate_requires_matching_manager() {
        // Host without any package manager.
        let (caps, _dir) = test_caps(None);
        let resource = apt_resource(None);
        let mut handler = RepositoryHandler::boxed(&resource, &caps);
        assert!(handler.validate().await.is_err());
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_and_stable() {
        let (caps, dir) = apt_caps();
        let resource = apt_resource(None);
        let mut handler = RepositoryHandler::boxed(&resource, &caps);

        handler.validate().await.unwrap();
        assert!(!handler.check().await.unwrap());
        handler.enforce().await.unwrap();
        assert!(handler.check().await.unwrap());

        // The managed file landed under the apt sources dir with the
        // 10-hex checksum prefix embedded in its name.
        let sources = dir.path().join("etc/apt/sources.list.d");
        let entries: Vec<_> = std::fs::read_dir(&sources).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        let name = name.to_string_lossy().into_owned();
        assert!(name.starts_with("osconfig_added_"));
        assert!(name.ends_with(".list"));

        let contents = std::fs::read(entries[0].as_ref().unwrap().path()).unwrap();
        let expected_prefix = &checksum(&contents)[..PATH_PREFIX_LEN];
        assert!(name.contains(expected_prefix));

        // A second enforce leaves identical bytes at the identical path.
        let mut second = RepositoryHandler::boxed(&resource, &caps);
        second.validate().await.unwrap();
        assert!(second.check().await.unwrap());
        second.enforce().await.unwrap();
        assert_eq!(
            std::fs::read(entries[0].as_ref().unwrap().path()).unwrap(),
            contents
        );
    }

    #[tokio::test]
    async fn test_apt_gpg_key_fetched_and_written() {
        let packets = vec![0x99u8, 0x01, 0x0d, 0x04];
        let b64 = base64::engine::general_purpose::STANDARD.encode(&packets);
        let armored = format!(
            "-----BEGIN PGP PUBLIC KEY BLOCK-----\n\n{b64}\n-----END PGP PUBLIC KEY BLOCK-----\n"
        );
        let keys = std::collections::HashMap::from([(
            "http://example/key.gpg".to_string(),
            armored.into_bytes(),
        )]);
        let (caps, dir) = super::super::testing::apt_caps_with_keys(keys);

        let resource = apt_resource(Some("http://example/key.gpg"));
        let mut handler = RepositoryHandler::boxed(&resource, &caps);
        handler.validate().await.unwrap();
        assert!(!handler.check().await.unwrap());
        handler.enforce().await.unwrap();
        assert!(handler.check().await.unwrap());

        // Key file carries the re-serialized (binary) form, at a path named
        // by the canonical bytes' digest.
        let expected = dir
            .path()
            .join("etc/apt/trusted.gpg.d")
            .join(format!("osconfig_added_{}.gpg", checksum(&packets)));
        assert_eq!(std::fs::read(expected).unwrap(), packets);
    }

    #[tokio::test]
    async fn test_drifted_file_is_overwritten_not_a_collision() {
        let (caps, dir) = apt_caps();
        let resource = apt_resource(None);
        let mut handler = RepositoryHandler::boxed(&resource, &caps);
        handler.validate().await.unwrap();
        handler.enforce().await.unwrap();

        let path = {
            let sources = dir.path().join("etc/apt/sources.list.d");
            std::fs::read_dir(sources)
                .unwrap()
                .next()
                .unwrap()
                .unwrap()
                .path()
        };
        // Rewrite the file in place: its digest no longer matches its name,
        // which is plain drift. Enforce overwrites instead of erroring (a
        // collision requires the foreign contents' digest to share the
        // name's 10-hex prefix).
        std::fs::write(&path, b"drifted\n").unwrap();
        let mut second = RepositoryHandler::boxed(&resource, &caps);
        second.validate().await.unwrap();
        assert!(!second.check().await.unwrap());
        second.enforce().await.unwrap();
        assert!(second.check().await.unwrap());
    }
}
