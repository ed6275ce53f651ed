//! ---
//! cpilot_section: "03-control-plane"
//! cpilot_subsection: "module"
//! cpilot_type: "source"
//! cpilot_scope: "code"
//! cpilot_description: "REST client for the control plane running on the control resource."
//! cpilot_version: "v0.1.0-alpha"
//! cpilot_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use cpilot_common::{LifecycleError, Result};

use crate::{ApiKeyRecord, ControlPlane, SpinStatus, TerminateAck};

/// The terminate route blocks while teardown runs; anything past this is
/// treated as "started, keep polling".
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(60);

fn transport(err: reqwest::Error) -> LifecycleError {
    LifecycleError::transport(err.to_string())
}

/// Status discriminator of a response envelope. Most routes answer with a
/// `status` field; the cluster save/start routes use `response` instead.
fn envelope_status(value: &Value) -> Option<&str> {
    value["status"]
        .as_str()
        .or_else(|| value["response"].as_str())
}

fn envelope_message(value: &Value) -> String {
    value["message"]
        .as_str()
        .unwrap_or("no message in response")
        .to_owned()
}

fn expect_success(operation: &str, value: &Value) -> Result<()> {
    match envelope_status(value) {
        Some("success") => Ok(()),
        Some(status) => Err(LifecycleError::provider(
            status,
            format!("{operation}: {}", envelope_message(value)),
        )),
        None => Err(LifecycleError::transport(format!(
            "{operation}: response carried no status field"
        ))),
    }
}

fn parse_spin(value: &Value) -> SpinStatus {
    let spun_up = match &value["clusterSpunUp"] {
        Value::Bool(b) => *b,
        Value::String(s) => s == "true",
        _ => false,
    };
    let error = match value["clusterError"].as_str() {
        None | Some("none") => None,
        Some(other) => Some(other.to_owned()),
    };
    SpinStatus { spun_up, error }
}

/// Control plane client over HTTPS with a cookie-backed session.
pub struct HttpControlPlane {
    client: reqwest::Client,
    endpoint: RwLock<Option<String>>,
    session: AtomicBool,
    user_name: String,
    password: String,
}

impl HttpControlPlane {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            endpoint: RwLock::new(None),
            session: AtomicBool::new(false),
            user_name: user_name.into(),
            password: password.into(),
        })
    }

    /// Construct a client already bound to a known endpoint, as used by the
    /// recovery path where the DNS name comes from the manifest.
    pub fn with_endpoint(
        user_name: impl Into<String>,
        password: impl Into<String>,
        dns: &str,
    ) -> Result<Self> {
        let plane = Self::new(user_name, password)?;
        plane.set_endpoint(dns);
        Ok(plane)
    }

    fn base(&self) -> Result<String> {
        self.endpoint
            .read()
            .clone()
            .ok_or_else(|| LifecycleError::validation("control endpoint has not been discovered"))
    }

    async fn post_text(&self, route: &str, payload: &Value) -> Result<String> {
        let url = format!("https://{}/srv/{}", self.base()?, route);
        debug!(%url, "control plane request");
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(transport)?;
        response.text().await.map_err(transport)
    }

    async fn post(&self, route: &str, payload: &Value) -> Result<Value> {
        let text = self.post_text(route, payload).await?;
        serde_json::from_str(&text).map_err(|err| {
            LifecycleError::transport(format!("{route} returned a non-JSON response: {err}"))
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    fn set_endpoint(&self, dns: &str) {
        *self.endpoint.write() = Some(dns.to_owned());
    }

    fn endpoint(&self) -> Option<String> {
        self.endpoint.read().clone()
    }

    fn has_session(&self) -> bool {
        self.session.load(Ordering::SeqCst)
    }

    async fn login(&self) -> Result<()> {
        let payload = json!({
            "userName": self.user_name,
            "password": self.password,
        });
        let text = self.post_text("login", &payload).await?;

        // Authentication failures come back with a 200 and a message.
        if text.contains("Incorrect User / Password Combination")
            || text.contains("too many failed login attempts")
            || text.contains("Please Login")
        {
            return Err(LifecycleError::validation(
                "control plane rejected the credentials",
            ));
        }

        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            if let Some(status) = envelope_status(&value) {
                if status != "success" {
                    return Err(LifecycleError::provider(status, envelope_message(&value)));
                }
            }
        }

        self.session.store(true, Ordering::SeqCst);
        info!(user = %self.user_name, "control plane session established");
        Ok(())
    }

    async fn control_domain(&self, ip: &str) -> Result<String> {
        // The instance answers this one route before its DNS name exists.
        let url = format!("http://{ip}/srv/getCurrentDomain");
        let response = self.client.get(&url).send().await.map_err(transport)?;
        let value: Value = response.json().await.map_err(transport)?;
        expect_success("getCurrentDomain", &value)?;
        value["payload"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| LifecycleError::transport("getCurrentDomain returned no domain"))
    }

    async fn storage_ready(&self) -> Result<()> {
        let url = format!("https://{}/srv/getGeneratedTableNames", self.base()?);
        let response = self.client.get(&url).send().await.map_err(transport)?;
        let value: Value = response.json().await.map_err(transport)?;
        expect_success("getGeneratedTableNames", &value)
    }

    async fn set_db_throughput(&self, read: &str, write: &str) -> Result<()> {
        let value = self
            .post("setNewDBThroughput", &json!({"read": read, "write": write}))
            .await?;
        match expect_success("setNewDBThroughput", &value) {
            Ok(()) => Ok(()),
            // Requesting the already-provisioned capacity is not a failure.
            Err(_) if envelope_message(&value).contains("will not change") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn save_cluster(&self, name: &str, descriptor: &Value) -> Result<()> {
        let value = self
            .post(
                "saveCluster",
                &json!({"clusterObj": descriptor, "clusterName": name}),
            )
            .await?;
        expect_success("saveCluster", &value)
    }

    async fn start_cluster(&self, descriptor: &Value) -> Result<()> {
        let value = self
            .post("startCluster", &json!({"clusterObj": descriptor}))
            .await?;
        expect_success("startCluster", &value)
    }

    async fn spinning_cluster(&self, name: &str) -> Result<SpinStatus> {
        let value = self
            .post("getSpinningCluster", &json!({"clusterName": name}))
            .await?;
        Ok(parse_spin(&value))
    }

    async fn cluster_by_name(&self, name: &str) -> Result<Option<Value>> {
        let text = self
            .post_text("getClusterByName", &json!({"clusterName": name}))
            .await?;
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            // Once the record is removed the route answers with an empty body.
            Err(_) => return Ok(None),
        };
        if let Some("error") = envelope_status(&value) {
            return Err(LifecycleError::provider("error", envelope_message(&value)));
        }
        match &value {
            Value::Null => Ok(None),
            Value::Object(map) if map.is_empty() => Ok(None),
            _ => Ok(Some(value)),
        }
    }

    async fn terminate_cluster(&self, descriptor: &Value) -> Result<TerminateAck> {
        let mut descriptor = descriptor.clone();
        descriptor["action"] = Value::String("terminate".to_owned());
        let url = format!("https://{}/srv/clusterAction", self.base()?);

        let response = self
            .client
            .post(&url)
            .json(&json!({"clusterObj": descriptor}))
            .timeout(TERMINATE_TIMEOUT)
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                warn!("terminate request timed out, assuming teardown started");
                return Ok(TerminateAck::Started);
            }
            Err(err) => return Err(transport(err)),
        };

        let text = response.text().await.map_err(transport)?;
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => {
                expect_success("terminate", &value)?;
                Ok(TerminateAck::Completed)
            }
            Err(_) => Ok(TerminateAck::Started),
        }
    }

    async fn cluster_part(&self, name: &str, group: &str, kind: &str) -> Result<Value> {
        self.post(
            "getSpinningClusterPart",
            &json!({"clusterName": name, "groupName": group, "type": kind}),
        )
        .await
    }

    async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>> {
        let value = self.post("listAppKeys", &json!({})).await?;
        let keys = value["payload"].as_array().cloned().unwrap_or_default();
        Ok(keys
            .iter()
            .filter_map(|entry| {
                Some(ApiKeyRecord {
                    user_name: entry["userName"].as_str()?.to_owned(),
                    key: entry["key"].as_str()?.to_owned(),
                })
            })
            .collect())
    }

    async fn generate_api_key(&self) -> Result<String> {
        let value = self
            .post("saveAndGenUserAppKey", &json!({"userName": ""}))
            .await?;
        expect_success("saveAndGenUserAppKey", &value)?;
        value["message"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| LifecycleError::transport("saveAndGenUserAppKey returned no key"))
    }

    async fn scheduler_request(
        &self,
        endpoint: &str,
        route: &str,
        payload: &Value,
    ) -> Result<Value> {
        let url = format!("https://{endpoint}/srv/{route}");
        debug!(%url, "scheduler request");
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(transport)?;
        response.json().await.map_err(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_status_accepts_string_and_bool_flags() {
        let value = json!({"clusterSpunUp": "true", "clusterError": "none"});
        assert_eq!(
            parse_spin(&value),
            SpinStatus {
                spun_up: true,
                error: None
            }
        );

        let value = json!({"clusterSpunUp": false, "clusterError": "subnet quota exhausted"});
        let status = parse_spin(&value);
        assert!(!status.spun_up);
        assert_eq!(status.error.as_deref(), Some("subnet quota exhausted"));
    }

    #[test]
    fn envelope_status_checks_both_field_names() {
        assert_eq!(
            envelope_status(&json!({"status": "success"})),
            Some("success")
        );
        assert_eq!(
            envelope_status(&json!({"response": "success"})),
            Some("success")
        );
        assert_eq!(envelope_status(&json!({"payload": 1})), None);
    }

    #[test]
    fn non_success_envelope_maps_to_provider_error() {
        let value = json!({"status": "error", "message": "cluster exists"});
        let err = expect_success("saveCluster", &value).unwrap_err();
        match err {
            LifecycleError::Provider { status, reason } => {
                assert_eq!(status, "error");
                assert!(reason.contains("cluster exists"));
            }
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[test]
    fn unbound_endpoint_is_reported_as_validation() {
        let plane = HttpControlPlane::new("user", "pw").unwrap();
        assert!(plane.base().is_err());
        plane.set_endpoint("ctl.example.net");
        assert_eq!(plane.base().unwrap(), "ctl.example.net");
    }
}
