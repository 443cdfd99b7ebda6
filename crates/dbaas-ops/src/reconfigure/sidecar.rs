//! Calls to the config sidecar running next to the database containers.

use std::net::IpAddr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::cli::EngineOptions;

#[derive(Debug, Snafu)]
pub enum SidecarError {
    #[snafu(display("failed to build the sidecar HTTP client"))]
    BuildClient { source: reqwest::Error },

    #[snafu(display("failed to call the sidecar at {address}"))]
    Request {
        source: reqwest::Error,
        address: String,
    },

    #[snafu(display("sidecar at {address} failed to stop containers: {message}"))]
    Rejected { address: String, message: String },

    #[snafu(display("pod {pod} has no IP address yet"))]
    MissingPodIp { pod: String },

    #[snafu(display("container {container} of pod {pod} has no container ID yet"))]
    MissingContainerId { pod: String, container: String },
}

#[async_trait]
pub trait SidecarClient: Send + Sync {
    /// Stops the given containers so that they are restarted with the new config.
    async fn stop_container(
        &self,
        address: &str,
        container_ids: &[String],
    ) -> Result<(), SidecarError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopContainerRequest<'a> {
    #[serde(rename = "containerIDs")]
    container_ids: &'a [String],
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StopContainerResponse {
    #[serde(default)]
    err_message: String,
}

/// A [`SidecarClient`] talking JSON over HTTP.
pub struct HttpSidecarClient {
    client: reqwest::Client,
}

impl HttpSidecarClient {
    /// Every call gives up after the configured sidecar timeout.
    pub fn new(options: &EngineOptions) -> Result<Self, SidecarError> {
        let client = reqwest::Client::builder()
            .timeout(options.sidecar_timeout)
            .build()
            .context(BuildClientSnafu)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SidecarClient for HttpSidecarClient {
    async fn stop_container(
        &self,
        address: &str,
        container_ids: &[String],
    ) -> Result<(), SidecarError> {
        let response: StopContainerResponse = self
            .client
            .post(format!("http://{address}/v1/stop-container"))
            .json(&StopContainerRequest { container_ids })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(RequestSnafu { address })?
            .json()
            .await
            .context(RequestSnafu { address })?;

        ensure!(
            response.err_message.is_empty(),
            RejectedSnafu {
                address,
                message: response.err_message,
            }
        );
        Ok(())
    }
}

/// Returns the `ip:port` address of the sidecar in `pod`.
pub fn sidecar_address(pod: &Pod, port: u16) -> Result<String, SidecarError> {
    let ip = pod
        .status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
        .context(MissingPodIpSnafu {
            pod: pod.name_any(),
        })?;

    Ok(match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{ip}]:{port}"),
        _ => format!("{ip}:{port}"),
    })
}

/// Resolves the IDs of the named containers from the pod's container statuses.
pub fn container_ids(pod: &Pod, container_names: &[String]) -> Result<Vec<String>, SidecarError> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref());

    container_names
        .iter()
        .map(|name| {
            statuses
                .and_then(|statuses| statuses.iter().find(|status| &status.name == name))
                .and_then(|status| status.container_id.clone())
                .filter(|id| !id.is_empty())
                .context(MissingContainerIdSnafu {
                    pod: pod.name_any(),
                    container: name,
                })
        })
        .collect()
}
