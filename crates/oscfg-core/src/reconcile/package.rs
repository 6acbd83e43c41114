//! Package resource handler.

use std::sync::Arc;

use crate::packages::{DesiredState, PackageManager};
use crate::policy::{PackageResourceSpec, Resource, ResourceCompliance, ResourceSpec};

use super::{HostCapabilities, ResourceError, ResourceHandler};

/// [`ResourceHandler`] for package install/remove resources.
pub struct PackageResourceHandler {
    spec: Option<PackageResourceSpec>,
    caps: Arc<HostCapabilities>,
    manager: Option<Arc<dyn PackageManager>>,
}

impl PackageResourceHandler {
    /// Registry constructor.
    #[must_use]
    pub fn boxed(resource: &Resource, caps: &Arc<HostCapabilities>) -> Box<dyn ResourceHandler> {
        let spec = match &resource.spec {
            ResourceSpec::Package(spec) => Some(spec.clone()),
            _ => None,
        };
        Box::new(Self {
            spec,
            caps: Arc::clone(caps),
            manager: None,
        })
    }

    fn spec(&self) -> Result<&PackageResourceSpec, ResourceError> {
        self.spec.as_ref().ok_or_else(|| {
            ResourceError::Validation("resource spec is not a package".to_string())
        })
    }

    fn manager(&self) -> Result<&Arc<dyn PackageManager>, ResourceError> {
        self.manager.as_ref().ok_or_else(|| {
            ResourceError::Validation("package resource not validated".to_string())
        })
    }
}

#[async_trait::async_trait]
impl ResourceHandler for PackageResourceHandler {
    async fn validate(&mut self) -> Result<(), ResourceError> {
        let spec = self.spec()?;
        if spec.name.is_empty() {
            return Err(ResourceError::Validation(
                "package name must not be empty".to_string(),
            ));
        }
        let manager = self.caps.package_manager.as_ref().ok_or_else(|| {
            ResourceError::Validation(
                "cannot manage packages because no package manager exists on the system"
                    .to_string(),
            )
        })?;
        self.manager = Some(Arc::clone(manager));
        Ok(())
    }

    async fn check(&mut self) -> Result<bool, ResourceError> {
        let spec = self.spec()?.clone();
        let installed = self.manager()?.is_installed(&spec.name).await?;
        Ok(match spec.desired_state {
            DesiredState::Installed => installed,
            DesiredState::Removed => !installed,
        })
    }

    async fn enforce(&mut self) -> Result<(), ResourceError> {
        let spec = self.spec()?.clone();
        let manager = Arc::clone(self.manager()?);
        let names = vec![spec.name.clone()];
        match spec.desired_state {
            DesiredState::Installed => manager.install(&names).await?,
            DesiredState::Removed => manager.remove(&names).await?,
        }
        Ok(())
    }

    fn populate_output(&self, compliance: &mut ResourceCompliance) {
        if let Some(spec) = &self.spec {
            compliance.output = Some(format!("{}:{:?}", spec.name, spec.desired_state));
        }
    }
}
