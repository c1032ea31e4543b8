//! Render context for etcd manifests
//!
//! `EtcdManifestContext` is the complete, closed set of values the etcd
//! templates may reference. It is built from a `ControlPlane` and validated
//! before every render. Templates interpolate values without quoting, so
//! every field is checked against the grammar Kubernetes accepts for it.

use std::collections::BTreeMap;

use kube::ResourceExt;
use serde::Serialize;

use super::error::TemplateError;
use crate::crd::ControlPlane;
use crate::{LABEL_APP, LABEL_ETCD, LABEL_MANAGED_BY, LABEL_MANAGED_BY_STRATA};

/// Value of [`LABEL_APP`] on every etcd object
pub const ETCD_APP: &str = "etcd";

/// PersistentVolumeClaim access modes Kubernetes accepts
pub const ACCESS_MODES: [&str; 4] = [
    "ReadWriteOnce",
    "ReadOnlyMany",
    "ReadWriteMany",
    "ReadWriteOncePod",
];

/// Name of the etcd StatefulSet (and its headless peer Service) for a control plane
pub fn etcd_name(control_plane: &str) -> String {
    format!("{}-etcd", control_plane)
}

/// Name of the etcd client Service for a control plane
pub fn etcd_client_service_name(control_plane: &str) -> String {
    format!("{}-etcd-client", control_plane)
}

/// Name of the Secret holding etcd TLS material for a control plane
pub fn etcd_cert_secret_name(control_plane: &str) -> String {
    format!("{}-etcd-cert", control_plane)
}

/// Labels selecting the etcd pods (and their volume claims) of one StatefulSet
pub fn etcd_selector_labels(statefulset_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), ETCD_APP.to_string()),
        (LABEL_ETCD.to_string(), statefulset_name.to_string()),
    ])
}

/// Labels carried by every etcd object Strata renders
pub fn etcd_labels(statefulset_name: &str) -> BTreeMap<String, String> {
    let mut labels = etcd_selector_labels(statefulset_name);
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_STRATA.to_string(),
    );
    labels
}

/// Label selector matching every etcd object of a control plane
pub fn etcd_label_selector(control_plane: &str) -> String {
    etcd_selector_labels(&etcd_name(control_plane))
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Values available to the etcd templates
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct EtcdManifestContext {
    /// StatefulSet name; also the headless peer Service name
    pub statefulset_name: String,
    /// Target namespace
    pub namespace: String,
    /// Labels on every rendered object
    pub labels: BTreeMap<String, String>,
    /// Pod selector; a subset of `labels`
    pub selector_labels: BTreeMap<String, String>,
    /// etcd container image
    pub image: String,
    /// Image carrying the strata binary, copied into the etcd pod at startup
    pub bootstrap_image: String,
    /// Desired member count
    pub replicas: i32,
    /// ClusterIP Service for client traffic
    pub client_service_name: String,
    /// Secret with `ca.crt`, `server.crt` and `server.key`
    pub certs_secret_name: String,
    /// Client port
    pub client_port: u16,
    /// Peer port
    pub peer_port: u16,
    /// Cluster DNS domain
    pub cluster_domain: String,
    /// Volume claim template name
    pub volume_name: String,
    /// Storage class; omitted from the claim when unset
    pub storage_class_name: Option<String>,
    /// Volume access modes
    pub access_modes: Vec<String>,
    /// Requested volume size
    pub storage_size: String,
}

impl EtcdManifestContext {
    /// Build the context for a control plane
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::InvalidField` if the resource has no namespace
    /// or any derived value fails validation.
    pub fn for_control_plane(
        cp: &ControlPlane,
        bootstrap_image: &str,
    ) -> Result<Self, TemplateError> {
        let name = cp.name_any();
        let namespace = cp
            .namespace()
            .ok_or_else(|| TemplateError::invalid_field("namespace", "resource is not namespaced"))?;
        let etcd = &cp.spec.etcd;
        let statefulset_name = etcd_name(&name);

        let ctx = Self {
            labels: etcd_labels(&statefulset_name),
            selector_labels: etcd_selector_labels(&statefulset_name),
            statefulset_name,
            namespace,
            image: etcd.image.clone(),
            bootstrap_image: bootstrap_image.to_string(),
            replicas: etcd.replicas,
            client_service_name: etcd_client_service_name(&name),
            certs_secret_name: etcd_cert_secret_name(&name),
            client_port: etcd.client_port,
            peer_port: etcd.peer_port,
            cluster_domain: cp.spec.cluster_domain.clone(),
            volume_name: etcd.storage.volume_name.clone(),
            storage_class_name: etcd.storage.storage_class_name.clone(),
            access_modes: etcd.storage.access_modes.clone(),
            storage_size: etcd.storage.size.clone(),
        };
        ctx.validate()?;
        Ok(ctx)
    }

    /// Check every field before it reaches a template
    pub fn validate(&self) -> Result<(), TemplateError> {
        dns_label("statefulset_name", &self.statefulset_name)?;
        dns_label("namespace", &self.namespace)?;
        dns_label("client_service_name", &self.client_service_name)?;
        dns_label("volume_name", &self.volume_name)?;
        dns_subdomain("certs_secret_name", &self.certs_secret_name)?;
        dns_subdomain("cluster_domain", &self.cluster_domain)?;
        image_ref("image", &self.image)?;
        image_ref("bootstrap_image", &self.bootstrap_image)?;
        quantity("storage_size", &self.storage_size)?;
        labels("labels", &self.labels)?;
        labels("selector_labels", &self.selector_labels)?;

        if self.selector_labels.is_empty() {
            return Err(TemplateError::invalid_field(
                "selector_labels",
                "at least one selector label is required",
            ));
        }
        if let Some((key, _)) = self
            .selector_labels
            .iter()
            .find(|(key, value)| self.labels.get(*key) != Some(*value))
        {
            return Err(TemplateError::invalid_field(
                "selector_labels",
                format!("'{}' is not carried by labels", key),
            ));
        }
        if self.replicas < 1 {
            return Err(TemplateError::invalid_field(
                "replicas",
                format!("must be at least 1, got {}", self.replicas),
            ));
        }
        if self.client_port == 0 {
            return Err(TemplateError::invalid_field("client_port", "must be non-zero"));
        }
        if self.peer_port == 0 {
            return Err(TemplateError::invalid_field("peer_port", "must be non-zero"));
        }
        if self.client_port == self.peer_port {
            return Err(TemplateError::invalid_field(
                "peer_port",
                "must differ from client_port",
            ));
        }
        if self.access_modes.is_empty() {
            return Err(TemplateError::invalid_field(
                "access_modes",
                "at least one access mode is required",
            ));
        }
        if let Some(mode) = self
            .access_modes
            .iter()
            .find(|mode| !ACCESS_MODES.contains(&mode.as_str()))
        {
            return Err(TemplateError::invalid_field(
                "access_modes",
                format!("'{}' is not one of {}", mode, ACCESS_MODES.join(", ")),
            ));
        }
        if let Some(class) = &self.storage_class_name {
            dns_subdomain("storage_class_name", class)?;
        }
        Ok(())
    }
}

fn non_empty(field: &'static str, value: &str) -> Result<(), TemplateError> {
    if value.trim().is_empty() {
        return Err(TemplateError::invalid_field(field, "must not be empty"));
    }
    Ok(())
}

fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

/// RFC 1123 label: lowercase alphanumerics and '-', at most 63 characters
fn dns_label(field: &'static str, value: &str) -> Result<(), TemplateError> {
    non_empty(field, value)?;
    if !is_dns_label(value) {
        return Err(TemplateError::invalid_field(
            field,
            format!("'{}' is not a valid DNS label", value),
        ));
    }
    Ok(())
}

/// RFC 1123 subdomain: dot-separated labels, at most 253 characters
fn dns_subdomain(field: &'static str, value: &str) -> Result<(), TemplateError> {
    non_empty(field, value)?;
    if value.len() > 253 || !value.split('.').all(is_dns_label) {
        return Err(TemplateError::invalid_field(
            field,
            format!("'{}' is not a valid DNS subdomain", value),
        ));
    }
    Ok(())
}

fn image_ref(field: &'static str, value: &str) -> Result<(), TemplateError> {
    non_empty(field, value)?;
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'))
        && value.starts_with(|c: char| c.is_ascii_alphanumeric());
    if !valid {
        return Err(TemplateError::invalid_field(
            field,
            format!("'{}' is not a valid image reference", value),
        ));
    }
    Ok(())
}

/// Non-negative Kubernetes quantity, e.g. `1Gi`, `500M`, `1.5e9`
fn quantity(field: &'static str, value: &str) -> Result<(), TemplateError> {
    non_empty(field, value)?;
    if !is_quantity(value) {
        return Err(TemplateError::invalid_field(
            field,
            format!("'{}' is not a valid quantity", value),
        ));
    }
    Ok(())
}

fn is_quantity(value: &str) -> bool {
    let value = value.strip_prefix('+').unwrap_or(value);
    let number_len = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(number_len);

    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();
    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    let number_ok = match fraction {
        None => !whole.is_empty() && digits(whole),
        Some(fraction) => {
            (!whole.is_empty() || !fraction.is_empty()) && digits(whole) && digits(fraction)
        }
    };
    if !number_ok {
        return false;
    }

    match suffix {
        "" | "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" | "n" | "u" | "m" | "k" | "M" | "G"
        | "T" | "P" | "E" => true,
        _ => match suffix.strip_prefix(&['e', 'E'][..]) {
            Some(exponent) => {
                let exponent = exponent.strip_prefix(&['+', '-'][..]).unwrap_or(exponent);
                !exponent.is_empty() && digits(exponent)
            }
            None => false,
        },
    }
}

/// Label keys are `[prefix/]name`; values are at most 63 characters of
/// alphanumerics, '-', '_' and '.', starting and ending alphanumeric
fn labels(field: &'static str, map: &BTreeMap<String, String>) -> Result<(), TemplateError> {
    for (key, value) in map {
        let name = match key.split_once('/') {
            Some((prefix, name)) => {
                if prefix.len() > 253 || !prefix.split('.').all(is_dns_label) {
                    return Err(TemplateError::invalid_field(
                        field,
                        format!("label key '{}' has an invalid prefix", key),
                    ));
                }
                name
            }
            None => key.as_str(),
        };
        if name.is_empty() || !is_label_value(name) {
            return Err(TemplateError::invalid_field(
                field,
                format!("label key '{}' is invalid", key),
            ));
        }
        if value.is_empty() || !is_label_value(value) {
            return Err(TemplateError::invalid_field(
                field,
                format!("label value '{}' for '{}' is invalid", value, key),
            ));
        }
    }
    Ok(())
}

fn is_label_value(value: &str) -> bool {
    value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric())
}
