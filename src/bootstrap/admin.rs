//! etcd membership administration
//!
//! [`HttpMembershipAdmin`] talks to the JSON gateway every etcd v3 server
//! exposes next to its gRPC API (`POST /v3/cluster/member/...`). Member ids
//! are uint64 and travel as decimal strings.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Identity};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use super::BootstrapError;

/// One entry of the cluster membership list
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct MemberInfo {
    /// Member id
    #[serde(rename = "ID", default, deserialize_with = "de_u64")]
    pub id: u64,
    /// Member name; empty until the member has started
    #[serde(default)]
    pub name: String,
    /// Advertised peer URLs
    #[serde(rename = "peerURLs", default)]
    pub peer_urls: Vec<String>,
    /// Advertised client URLs; empty until the member has started
    #[serde(rename = "clientURLs", default)]
    pub client_urls: Vec<String>,
}

impl MemberInfo {
    /// Returns true once the member has started and published its name
    pub fn is_started(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Result of adding a member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddedMember {
    /// Name the new member will start with
    pub name: String,
    /// The member as registered
    pub member: MemberInfo,
    /// Full membership after the add, including the new member
    pub members: Vec<MemberInfo>,
}

impl AddedMember {
    /// `--initial-cluster` value the new member must start with
    ///
    /// The new member has no name in the membership list yet, so the name it
    /// was added under is substituted for it.
    pub fn initial_cluster(&self) -> String {
        self.members
            .iter()
            .flat_map(|m| {
                let member_name = if m.id == self.member.id {
                    self.name.as_str()
                } else {
                    m.name.as_str()
                };
                m.peer_urls
                    .iter()
                    .map(move |url| format!("{}={}", member_name, url))
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Membership operations against a running etcd cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipAdmin: Send + Sync {
    /// List current members
    async fn list(&self) -> Result<Vec<MemberInfo>, BootstrapError>;

    /// Register a new member by its peer URLs
    ///
    /// etcd learns the name only when the member starts; `name` is carried
    /// into the result for the initial cluster.
    async fn add(
        &self,
        name: &str,
        peer_urls: Vec<String>,
    ) -> Result<AddedMember, BootstrapError>;

    /// Remove a member by id
    async fn remove(&self, id: u64) -> Result<(), BootstrapError>;
}

/// TLS material for talking to etcd
pub struct ClientTls {
    /// CA bundle PEM
    pub ca_pem: Vec<u8>,
    /// Client certificate PEM
    pub cert_pem: Vec<u8>,
    /// Client key PEM
    pub key_pem: Vec<u8>,
}

impl ClientTls {
    /// Read `ca.crt`, `server.crt` and `server.key` from a PKI directory
    pub async fn from_dir(dir: &Path) -> Result<Self, BootstrapError> {
        Ok(Self {
            ca_pem: read_pem(dir, "ca.crt").await?,
            cert_pem: read_pem(dir, "server.crt").await?,
            key_pem: read_pem(dir, "server.key").await?,
        })
    }
}

async fn read_pem(dir: &Path, file: &str) -> Result<Vec<u8>, BootstrapError> {
    let path = dir.join(file);
    tokio::fs::read(&path)
        .await
        .map_err(|e| BootstrapError::Config(format!("failed to read {}: {}", path.display(), e)))
}

/// Membership admin over the etcd JSON gateway
///
/// Requests go to each endpoint in turn until one answers. A 4xx answer is
/// final; transport errors and 5xx answers move on to the next endpoint.
pub struct HttpMembershipAdmin {
    http: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpMembershipAdmin {
    /// Create an admin client with mutual TLS
    pub fn new(endpoints: Vec<String>, tls: &ClientTls) -> Result<Self, BootstrapError> {
        let ca = Certificate::from_pem(&tls.ca_pem)
            .map_err(|e| BootstrapError::Config(format!("invalid CA certificate: {}", e)))?;

        let mut identity_pem = tls.cert_pem.clone();
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(&tls.key_pem);
        let identity = Identity::from_pem(&identity_pem)
            .map_err(|e| BootstrapError::Config(format!("invalid client identity: {}", e)))?;

        let http = reqwest::Client::builder()
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BootstrapError::Config(format!("failed to build HTTP client: {}", e)))?;

        Self::with_client(endpoints, http)
    }

    /// Create an admin client from a prebuilt HTTP client
    pub fn with_client(
        endpoints: Vec<String>,
        http: reqwest::Client,
    ) -> Result<Self, BootstrapError> {
        if endpoints.is_empty() {
            return Err(BootstrapError::Config(
                "at least one etcd endpoint is required".to_string(),
            ));
        }
        Ok(Self { http, endpoints })
    }

    async fn call<B, R>(&self, path: &str, body: &B) -> Result<R, BootstrapError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let mut last_error = String::new();

        for endpoint in &self.endpoints {
            let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
            let response = match self.http.post(&url).json(body).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(%url, error = %e, "etcd endpoint unreachable");
                    last_error = format!("{}: {}", url, e);
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                let text = response.text().await.unwrap_or_default();
                warn!(%url, %status, "etcd endpoint failed");
                last_error = format!("{}: {} {}", url, status, text);
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(BootstrapError::Admin(format!("{}: {} {}", url, status, text)));
            }

            debug!(%url, "etcd admin call succeeded");
            return response
                .json()
                .await
                .map_err(|e| BootstrapError::Admin(format!("invalid response from {}: {}", url, e)));
        }

        Err(BootstrapError::Admin(format!(
            "no etcd endpoint answered, last error: {}",
            last_error
        )))
    }
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
struct AddRequest {
    #[serde(rename = "peerURLs")]
    peer_urls: Vec<String>,
}

#[derive(Serialize)]
struct RemoveRequest {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    members: Vec<MemberInfo>,
}

#[derive(Deserialize)]
struct AddResponse {
    member: MemberInfo,
    #[serde(default)]
    members: Vec<MemberInfo>,
}

#[derive(Deserialize)]
struct RemoveResponse {}

#[async_trait]
impl MembershipAdmin for HttpMembershipAdmin {
    async fn list(&self) -> Result<Vec<MemberInfo>, BootstrapError> {
        let response: ListResponse = self.call("/v3/cluster/member/list", &Empty {}).await?;
        Ok(response.members)
    }

    async fn add(
        &self,
        name: &str,
        peer_urls: Vec<String>,
    ) -> Result<AddedMember, BootstrapError> {
        debug!(%name, ?peer_urls, "registering member");
        let response: AddResponse = self
            .call("/v3/cluster/member/add", &AddRequest { peer_urls })
            .await?;
        debug!(%name, member_id = response.member.id, "member registered");
        Ok(AddedMember {
            name: name.to_string(),
            member: response.member,
            members: response.members,
        })
    }

    async fn remove(&self, id: u64) -> Result<(), BootstrapError> {
        let _: RemoveResponse = self
            .call(
                "/v3/cluster/member/remove",
                &RemoveRequest { id: id.to_string() },
            )
            .await?;
        Ok(())
    }
}

/// Accept a uint64 encoded either as a JSON string or a number
fn de_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Text(String),
        Number(u64),
    }

    match Wire::deserialize(deserializer)? {
        Wire::Text(s) => s.parse().map_err(serde::de::Error::custom),
        Wire::Number(n) => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64, name: &str, peer: &str) -> MemberInfo {
        MemberInfo {
            id,
            name: name.to_string(),
            peer_urls: vec![peer.to_string()],
            client_urls: vec![],
        }
    }

    #[test]
    fn test_list_response_decodes_string_ids() {
        let body = r#"{
            "header": {"cluster_id": "14841639068965178418", "revision": "12"},
            "members": [
                {"ID": "10276657743932975437", "name": "demo-etcd-0",
                 "peerURLs": ["https://demo-etcd-0.demo-etcd:2380"],
                 "clientURLs": ["https://demo-etcd-0.demo-etcd:2379"]},
                {"ID": "4711", "peerURLs": ["https://demo-etcd-3.demo-etcd:2380"]}
            ]
        }"#;
        let parsed: ListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.members.len(), 2);
        assert_eq!(parsed.members[0].id, 10276657743932975437);
        assert!(parsed.members[0].is_started());
        assert_eq!(parsed.members[1].id, 4711);
        assert!(!parsed.members[1].is_started());
    }

    #[test]
    fn test_numeric_ids_are_accepted() {
        let parsed: MemberInfo = serde_json::from_str(r#"{"ID": 42, "name": "x"}"#).unwrap();
        assert_eq!(parsed.id, 42);
    }

    #[test]
    fn test_remove_request_encodes_id_as_string() {
        let body = serde_json::to_value(RemoveRequest { id: 7u64.to_string() }).unwrap();
        assert_eq!(body, serde_json::json!({"ID": "7"}));
    }

    /// Story: the new member takes its own name in the initial cluster
    #[test]
    fn story_added_member_initial_cluster_names_the_newcomer() {
        let added = AddedMember {
            name: "m3".to_string(),
            member: member(4, "", "https://m3:2380"),
            members: vec![
                member(1, "m0", "https://m0:2380"),
                member(2, "m1", "https://m1:2380"),
                member(3, "m2", "https://m2:2380"),
                member(4, "", "https://m3:2380"),
            ],
        };
        assert_eq!(
            added.initial_cluster(),
            "m0=https://m0:2380,m1=https://m1:2380,m2=https://m2:2380,m3=https://m3:2380"
        );
    }

    #[test]
    fn test_admin_requires_an_endpoint() {
        assert!(matches!(
            HttpMembershipAdmin::with_client(vec![], reqwest::Client::new()),
            Err(BootstrapError::Config(_))
        ));
    }

    /// Story: an unreachable endpoint is skipped and the error names it
    #[tokio::test]
    async fn story_unreachable_endpoints_report_the_last_failure() {
        let admin = HttpMembershipAdmin::with_client(
            vec!["http://127.0.0.1:1".to_string()],
            reqwest::Client::new(),
        )
        .unwrap();
        let err = admin.list().await.unwrap_err();
        assert!(matches!(err, BootstrapError::Admin(ref msg) if msg.contains("127.0.0.1:1")));
    }
}
