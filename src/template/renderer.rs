//! Manifest Renderer
//!
//! Renders the etcd manifests from an [`EtcdManifestContext`]. Output is a
//! pure function of the template and the context, so two renders of the same
//! context are byte-identical.

use super::context::EtcdManifestContext;
use super::engine::TemplateEngine;
use super::error::TemplateError;
use super::manifests::{ETCD_CLIENT_SERVICE, ETCD_PEER_SERVICE, ETCD_STATEFULSET};

/// Identifier of an embedded manifest template
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TemplateId {
    /// etcd StatefulSet running the member bootstrap protocol
    EtcdStatefulSet,
    /// ClusterIP Service for etcd clients
    EtcdClientService,
    /// Headless Service giving each member a stable DNS name
    EtcdPeerService,
}

impl TemplateId {
    /// All templates, in apply order
    pub const ALL: [TemplateId; 3] = [
        TemplateId::EtcdPeerService,
        TemplateId::EtcdClientService,
        TemplateId::EtcdStatefulSet,
    ];

    /// Registered template name
    pub fn name(self) -> &'static str {
        match self {
            Self::EtcdStatefulSet => "etcd-statefulset.yaml",
            Self::EtcdClientService => "etcd-client-service.yaml",
            Self::EtcdPeerService => "etcd-peer-service.yaml",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Self::EtcdStatefulSet => ETCD_STATEFULSET,
            Self::EtcdClientService => ETCD_CLIENT_SERVICE,
            Self::EtcdPeerService => ETCD_PEER_SERVICE,
        }
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Renders embedded manifest templates
pub struct ManifestRenderer {
    engine: TemplateEngine,
}

impl ManifestRenderer {
    /// Create a renderer with every embedded template parsed
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::Syntax` if an embedded template does not parse.
    pub fn new() -> Result<Self, TemplateError> {
        let mut engine = TemplateEngine::new();
        for id in TemplateId::ALL {
            engine.add_template(id.name(), id.source())?;
        }
        Ok(Self { engine })
    }

    /// Render a template with the given context
    ///
    /// The context is validated first; an invalid field never reaches the
    /// template.
    pub fn render(
        &self,
        id: TemplateId,
        ctx: &EtcdManifestContext,
    ) -> Result<Vec<u8>, TemplateError> {
        ctx.validate()?;
        let rendered = self.engine.render(id.name(), ctx)?;
        Ok(rendered.into_bytes())
    }
}
