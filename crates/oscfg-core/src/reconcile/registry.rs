//! Resource-kind dispatch table.
//!
//! Maps a resource's kind tag to the handler implementation. The table is
//! data, not a match: downstream builds can register additional kinds
//! without touching the engine, and an unregistered kind surfaces as an
//! `UnsupportedKind` validation error instead of a compile-time dead end.

use std::sync::Arc;

use crate::policy::{Resource, ResourceKind};

use super::{
    ExecResourceHandler, FileResourceHandler, HostCapabilities, PackageResourceHandler,
    RepositoryHandler, ResourceHandler,
};

/// Constructor for one kind's handler.
pub type HandlerCtor =
    fn(&Resource, &Arc<HostCapabilities>) -> Box<dyn ResourceHandler>;

/// The dispatch table.
pub struct ResourceRegistry {
    entries: Vec<(ResourceKind, HandlerCtor)>,
}

impl ResourceRegistry {
    /// Empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Table with the built-in kinds registered.
    #[must_use]
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        registry.register(ResourceKind::Repository, RepositoryHandler::boxed);
        registry.register(ResourceKind::Package, PackageResourceHandler::boxed);
        registry.register(ResourceKind::File, FileResourceHandler::boxed);
        registry.register(ResourceKind::Exec, ExecResourceHandler::boxed);
        registry
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register(&mut self, kind: ResourceKind, ctor: HandlerCtor) {
        self.entries.retain(|(k, _)| *k != kind);
        self.entries.push((kind, ctor));
    }

    /// Build the handler for `resource`, or `None` for an unregistered kind.
    #[must_use]
    pub fn dispatch(
        &self,
        resource: &Resource,
        caps: &Arc<HostCapabilities>,
    ) -> Option<Box<dyn ResourceHandler>> {
        let kind = resource.spec.kind();
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, ctor)| ctor(resource, caps))
    }

    /// Registered kinds, in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.entries.iter().map(|(k, _)| *k)
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::with_builtin_kinds()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::test_caps;
    use super::*;
    use crate::policy::{PackageResourceSpec, ResourceSpec};

    #[test]
    fn test_builtin_kinds_registered() {
        let registry = ResourceRegistry::with_builtin_kinds();
        let kinds: Vec<_> = registry.kinds().collect();
        assert!(kinds.contains(&ResourceKind::Package));
        assert!(kinds.contains(&ResourceKind::Repository));
        assert!(kinds.contains(&ResourceKind::File));
        assert!(kinds.contains(&ResourceKind::Exec));
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_none() {
        let mut registry = ResourceRegistry::with_builtin_kinds();
        // Simulate a build that dropped package support.
        registry.entries.retain(|(k, _)| *k != ResourceKind::Package);

        let (caps, _dir) = test_caps(None);
        let resource = Resource {
            id: "r1".to_string(),
            spec: ResourceSpec::Package(PackageResourceSpec {
                name: "vim".to_string(),
                desired_state: crate::packages::DesiredState::Installed,
            }),
        };
        assert!(registry.dispatch(&resource, &caps).is_none());
    }
}
