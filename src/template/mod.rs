//! Deterministic manifest rendering for Strata
//!
//! Manifests are minijinja templates embedded in the binary and rendered from
//! a closed, validated context. Strict undefined behaviour turns a reference
//! to an unknown field into an error instead of an empty value.

mod context;
mod engine;
mod error;
mod manifests;
mod renderer;

pub use context::{
    etcd_cert_secret_name, etcd_client_service_name, etcd_label_selector, etcd_labels,
    etcd_name, etcd_selector_labels, EtcdManifestContext, ACCESS_MODES,
};
pub use engine::TemplateEngine;
pub use error::TemplateError;
pub use manifests::{ETCD_PKI_DIR, ETCD_VOLUME_DIR};
pub use renderer::{ManifestRenderer, TemplateId};
