//! Proxmox VE REST backend.
//!
//! Talks to `https://<host>:8006/api2/json` with a ticket obtained from
//! `/access/ticket`. Every response body is wrapped as `{"data": ...}`.
//!
//! # TLS
//!
//! Lab clusters usually run with self-signed certificates, so certificate
//! verification can be turned off with [`RestOptions::verify_tls`].

use crate::backend::{CreateVm, Provider};
use crate::error::{Error, Result};
use crate::tags::TagSet;
use crate::types::{GuestInterface, PciDevice, StorageVolume, VmConfig, VmHandle, VmStatus};
use ipnet::Ipv4Net;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use ureq::Body;
use ureq::http::Response;

const API_PORT: u16 = 8006;
const USER_AGENT: &str = "lbprox";

/// Connection settings for [`RestProvider`].
#[derive(Debug, Clone)]
pub struct RestOptions {
    /// User name without realm; `@pam` is appended
    pub username: String,
    /// Password
    pub password: String,
    /// Verify the server certificate
    pub verify_tls: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl RestOptions {
    /// Options with TLS verification off and a 30 second timeout.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            verify_tls: false,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct Ticket {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Deserialize)]
struct StatusCurrent {
    status: String,
}

#[derive(Deserialize)]
struct VmResource {
    vmid: u32,
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    tags: String,
}

impl VmResource {
    fn into_handle(self, node: &str) -> VmHandle {
        VmHandle {
            vmid: self.vmid,
            node: self.node.unwrap_or_else(|| node.to_string()),
            name: self.name,
            status: VmStatus::parse(&self.status),
            tags: TagSet::decode(&self.tags),
        }
    }
}

#[derive(Deserialize)]
struct AgentResult {
    #[serde(default)]
    result: Vec<AgentInterface>,
}

#[derive(Deserialize)]
struct AgentInterface {
    name: String,
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<AgentAddress>,
}

#[derive(Deserialize)]
struct AgentAddress {
    #[serde(rename = "ip-address-type")]
    address_type: String,
    #[serde(rename = "ip-address")]
    address: String,
}

impl From<AgentInterface> for GuestInterface {
    fn from(iface: AgentInterface) -> Self {
        let ipv4_addresses = iface
            .ip_addresses
            .iter()
            .filter(|a| a.address_type == "ipv4")
            .filter_map(|a| a.address.parse::<Ipv4Addr>().ok())
            .collect();
        GuestInterface {
            name: iface.name,
            ipv4_addresses,
        }
    }
}

#[derive(Deserialize)]
struct NetworkInterface {
    #[serde(default)]
    cidr: Option<String>,
}

/// Blocking REST client for one cluster node.
pub struct RestProvider {
    agent: ureq::Agent,
    base_url: String,
    host: String,
    ticket: String,
    csrf_token: String,
}

impl RestProvider {
    /// Log in to `host` and return a ready client.
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` if the credentials are rejected, or
    /// `Error::Transient` if the host does not answer.
    pub fn connect(host: &str, options: &RestOptions) -> Result<Self> {
        let tls = ureq::tls::TlsConfig::builder()
            .disable_verification(!options.verify_tls)
            .build();
        let config = ureq::Agent::config_builder()
            .tls_config(tls)
            .http_status_as_error(false)
            .timeout_global(Some(options.timeout))
            .build();
        let agent = ureq::Agent::new_with_config(config);
        let base_url = format!("https://{host}:{API_PORT}/api2/json");

        let username = format!("{}@pam", options.username);
        let response = agent
            .post(format!("{base_url}/access/ticket"))
            .header("User-Agent", USER_AGENT)
            .send_form([
                ("username", username.as_str()),
                ("password", options.password.as_str()),
            ])?;
        let ticket: Ticket = read_data(response).map_err(|e| match e {
            Error::Provider { message, .. } => Error::Auth { message },
            other => other,
        })?;

        log::debug!("logged in to {host} as {username}");
        Ok(Self {
            agent,
            base_url,
            host: host.to_string(),
            ticket: ticket.ticket,
            csrf_token: ticket.csrf_token,
        })
    }

    /// Host this client is connected to.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn cookie(&self) -> String {
        format!("PVEAuthCookie={}", self.ticket)
    }

    fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let mut request = self
            .agent
            .get(self.url(path))
            .header("User-Agent", USER_AGENT)
            .header("Cookie", self.cookie());
        for (key, value) in query {
            request = request.query(*key, *value);
        }
        read_data(request.call()?)
    }

    fn post<T: DeserializeOwned>(&self, path: &str, form: &[(String, String)]) -> Result<T> {
        let response = self
            .agent
            .post(self.url(path))
            .header("User-Agent", USER_AGENT)
            .header("Cookie", self.cookie())
            .header("CSRFPreventionToken", &self.csrf_token)
            .send_form(form.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        read_data(response)
    }

    fn put(&self, path: &str, form: &[(String, String)]) -> Result<()> {
        let response = self
            .agent
            .put(self.url(path))
            .header("User-Agent", USER_AGENT)
            .header("Cookie", self.cookie())
            .header("CSRFPreventionToken", &self.csrf_token)
            .send_form(form.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        read_data::<serde_json::Value>(response).map(drop)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .agent
            .delete(self.url(path))
            .header("User-Agent", USER_AGENT)
            .header("Cookie", self.cookie())
            .header("CSRFPreventionToken", &self.csrf_token)
            .call()?;
        read_data::<serde_json::Value>(response).map(drop)
    }
}

/// Unwrap `{"data": ...}`, or classify the error body.
fn read_data<T: DeserializeOwned>(mut response: Response<Body>) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        let envelope: Envelope<T> = response.body_mut().read_json()?;
        return Ok(envelope.data);
    }

    let text = response.body_mut().read_to_string().unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(ErrorBody {
            message: Some(message),
            ..
        }) => message,
        Ok(ErrorBody {
            errors: Some(errors),
            ..
        }) => errors
            .iter()
            .map(|(param, reason)| format!("{param}: {reason}"))
            .collect::<Vec<_>>()
            .join(", "),
        _ if !text.trim().is_empty() => text,
        _ => status.canonical_reason().unwrap_or("request failed").to_string(),
    };
    Err(Error::from_provider_message(Some(status.as_u16()), &message))
}

/// Config values come back as strings, numbers or booleans.
fn config_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Bool(b) => u8::from(b).to_string(),
        other => other.to_string(),
    }
}

impl Provider for RestProvider {
    fn next_vmid(&self) -> Result<u32> {
        let raw: serde_json::Value = self.get("/cluster/nextid", &[])?;
        config_value(raw)
            .parse()
            .map_err(|_| Error::Other("cluster returned a non-numeric vmid".to_string()))
    }

    fn create_vm(&self, node: &str, request: &CreateVm) -> Result<()> {
        let mut form = vec![
            ("vmid".to_string(), request.vmid.to_string()),
            ("name".to_string(), request.name.clone()),
        ];
        form.extend(request.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        let task: String = self.post(&format!("/nodes/{node}/qemu"), &form)?;
        log::debug!("create task for {}: {task}", request.vmid);
        Ok(())
    }

    fn update_config(&self, node: &str, vmid: u32, values: &[(String, String)]) -> Result<()> {
        self.put(&format!("/nodes/{node}/qemu/{vmid}/config"), values)
    }

    fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig> {
        let raw: BTreeMap<String, serde_json::Value> =
            self.get(&format!("/nodes/{node}/qemu/{vmid}/config"), &[])?;
        Ok(VmConfig(
            raw.into_iter().map(|(k, v)| (k, config_value(v))).collect(),
        ))
    }

    fn start_vm(&self, node: &str, vmid: u32) -> Result<()> {
        let _task: Option<String> =
            self.post(&format!("/nodes/{node}/qemu/{vmid}/status/start"), &[])?;
        Ok(())
    }

    fn stop_vm(&self, node: &str, vmid: u32, timeout: Duration) -> Result<()> {
        let form = [("timeout".to_string(), timeout.as_secs().to_string())];
        let _task: Option<String> =
            self.post(&format!("/nodes/{node}/qemu/{vmid}/status/stop"), &form)?;
        Ok(())
    }

    fn delete_vm(&self, node: &str, vmid: u32) -> Result<()> {
        self.delete(&format!("/nodes/{node}/qemu/{vmid}"))
    }

    fn vm_status(&self, node: &str, vmid: u32) -> Result<VmStatus> {
        let current: StatusCurrent =
            self.get(&format!("/nodes/{node}/qemu/{vmid}/status/current"), &[])?;
        Ok(VmStatus::parse(&current.status))
    }

    fn guest_interfaces(&self, node: &str, vmid: u32) -> Result<Vec<GuestInterface>> {
        let agent: AgentResult = self.get(
            &format!("/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces"),
            &[],
        )?;
        Ok(agent.result.into_iter().map(Into::into).collect())
    }

    fn node_vms(&self, node: &str) -> Result<Vec<VmHandle>> {
        let vms: Vec<VmResource> = self.get(&format!("/nodes/{node}/qemu"), &[])?;
        Ok(vms.into_iter().map(|vm| vm.into_handle(node)).collect())
    }

    fn cluster_vms(&self) -> Result<Vec<VmHandle>> {
        let vms: Vec<VmResource> = self.get("/cluster/resources", &[("type", "vm")])?;
        Ok(vms.into_iter().map(|vm| vm.into_handle("")).collect())
    }

    fn pci_devices(&self, node: &str, class_blacklist: &str) -> Result<Vec<PciDevice>> {
        self.get(
            &format!("/nodes/{node}/hardware/pci"),
            &[("pci-class-blacklist", class_blacklist)],
        )
    }

    fn bridge_cidr(&self, node: &str, bridge: &str) -> Result<Option<Ipv4Net>> {
        let iface: NetworkInterface = self.get(&format!("/nodes/{node}/network/{bridge}"), &[])?;
        Ok(iface.cidr.and_then(|cidr| cidr.parse::<Ipv4Net>().ok()))
    }

    fn storage_content(&self, node: &str, storage: &str, vmid: u32) -> Result<Vec<StorageVolume>> {
        let vmid = vmid.to_string();
        self.get(
            &format!("/nodes/{node}/storage/{storage}/content"),
            &[("content", "images"), ("vmid", vmid.as_str())],
        )
    }

    fn create_disk(
        &self,
        node: &str,
        storage: &str,
        vmid: u32,
        filename: &str,
        size_kib: u64,
    ) -> Result<String> {
        let form = [
            ("vmid".to_string(), vmid.to_string()),
            ("filename".to_string(), filename.to_string()),
            ("size".to_string(), format!("{size_kib}K")),
            ("format".to_string(), "raw".to_string()),
        ];
        self.post(&format!("/nodes/{node}/storage/{storage}/content"), &form)
    }

    fn delete_volume(&self, node: &str, storage: &str, volid: &str) -> Result<()> {
        self.delete(&format!(
            "/nodes/{node}/storage/{storage}/content/{}",
            urlencoding::encode(volid)
        ))
    }
}
