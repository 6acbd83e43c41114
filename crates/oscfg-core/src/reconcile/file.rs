//! File resource handler.
//!
//! Desired state is literal contents at a path, or the path's absence.
//! Check compares the SHA-256 computed at validate against the file on
//! disk; enforce writes atomically or removes.

use std::path::PathBuf;
use std::sync::Arc;

use crate::fs_safe::{atomic_write, checksum, contents_match, exists, FsError};
use crate::policy::{FileResourceSpec, FileState, Resource, ResourceSpec};

use super::{HostCapabilities, ResourceError, ResourceHandler};

struct ManagedFile {
    path: PathBuf,
    state: FileState,
    checksum: String,
    contents: Vec<u8>,
}

/// [`ResourceHandler`] for file resources.
pub struct FileResourceHandler {
    spec: Option<FileResourceSpec>,
    caps: Arc<HostCapabilities>,
    managed: Option<ManagedFile>,
}

impl FileResourceHandler {
    /// Registry constructor.
    #[must_use]
    pub fn boxed(resource: &Resource, caps: &Arc<HostCapabilities>) -> Box<dyn ResourceHandler> {
        let spec = match &resource.spec {
            ResourceSpec::File(spec) => Some(spec.clone()),
            _ => None,
        };
        Box::new(Self {
            spec,
            caps: Arc::clone(caps),
            managed: None,
        })
    }

    fn managed(&self) -> Result<&ManagedFile, ResourceError> {
        self.managed
            .as_ref()
            .ok_or_else(|| ResourceError::Validation("file resource not validated".to_string()))
    }
}

#[async_trait::async_trait]
impl ResourceHandler for FileResourceHandler {
    async fn validate(&mut self) -> Result<(), ResourceError> {
        let spec = self
            .spec
            .clone()
            .ok_or_else(|| ResourceError::Validation("resource spec is not a file".to_string()))?;
        if spec.path.is_empty() {
            return Err(ResourceError::Validation(
                "file path must not be empty".to_string(),
            ));
        }

        let contents = spec.content.into_bytes();
        self.managed = Some(ManagedFile {
            path: self.caps.paths.file_resource(&spec.path),
            state: spec.state,
            checksum: checksum(&contents),
            contents,
        });
        Ok(())
    }

    async fn check(&mut self) -> Result<bool, ResourceError> {
        let managed = self.managed()?;
        match managed.state {
            FileState::Present => Ok(contents_match(&managed.path, &managed.checksum)?),
            FileState::Absent => Ok(!exists(&managed.path)),
        }
    }

    async fn enforce(&mut self) -> Result<(), ResourceError> {
        let managed = self.managed()?;
        match managed.state {
            FileState::Present => atomic_write(&managed.path, &managed.contents)?,
            FileState::Absent => match std::fs::remove_file(&managed.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(
                        FsError::io(format!("remove {}", managed.path.display()), e).into()
                    )
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::test_caps;
    use super::*;

    fn file_resource(path: &str, state: FileState, content: &str) -> Resource {
        Resource {
            id: format!("file-{path}"),
            spec: ResourceSpec::File(FileResourceSpec {
                path: path.to_string(),
                state,
                content: content.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_present_lifecycle() {
        let (caps, dir) = test_caps(None);
        let resource = file_resource("/etc/motd", FileState::Present, "welcome\n");
        let mut handler = FileResourceHandler::boxed(&resource, &caps);

        handler.validate().await.unwrap();
        assert!(!handler.check().await.unwrap());
        handler.enforce().await.unwrap();
        assert!(handler.check().await.unwrap());
        assert_eq!(
            std::fs::read(dir.path().join("etc/motd")).unwrap(),
            b"welcome\n"
        );

        // Idempotent.
        handler.enforce().await.unwrap();
        assert!(handler.check().await.unwrap());
    }

    #[tokio::test]
    async fn test_absent_lifecycle() {
        let (caps, dir) = test_caps(None);
        let target = dir.path().join("etc/stale.conf");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"old").unwrap();

        let resource = file_resource("/etc/stale.conf", FileState::Absent, "");
        let mut handler = FileResourceHandler::boxed(&resource, &caps);
        handler.validate().await.unwrap();
        assert!(!handler.check().await.unwrap());
        handler.enforce().await.unwrap();
        assert!(handler.check().await.unwrap());
        assert!(!target.exists());

        // Removing an already-absent file is a no-op.
        handler.enforce().await.unwrap();
        assert!(handler.check().await.unwrap());
    }

    #[tokio::test]
    async fn test_drift_detected() {
        let (caps, dir) = test_caps(None);
        let resource = file_resource("/etc/motd", FileState::Present, "wanted\n");
        let mut handler = FileResourceHandler::boxed(&resource, &caps);
        handler.validate().await.unwrap();
        handler.enforce().await.unwrap();

        std::fs::write(dir.path().join("etc/motd"), b"tampered\n").unwrap();
        assert!(!handler.check().await.unwrap());
    }
}
