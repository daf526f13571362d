//! Orchestrator client over HTTP/JSON.

use std::time::Duration;

use async_trait::async_trait;
use orca_agent::Orchestrator;
use orca_bootstrap::BootstrapApi;
use orca_protocol::{
    AppliedConfiguration, BootstrapConfiguration, BootstrapLogChunk, Command, Ping, RemoteError,
    RemoteResult,
};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const PINGS_PATH: &str = "command_polling/pings";
const NEXT_COMMAND_PATH: &str = "command_polling/command";
const COMMANDS_PATH: &str = "command_polling/commands";
const CONFIGURATION_PATH: &str = "blueprint/configuration";
const BOOTSTRAP_LOGS_PATH: &str = "blueprint/bootstrap_logs";
const APPLIED_CONFIGURATION_PATH: &str = "blueprint/applied_configuration";

#[derive(Clone, Debug)]
pub struct HttpOrchestrator {
    client: Client,
    base_url: String,
}

impl HttpOrchestrator {
    pub fn new(base_url: &str, timeout: Duration) -> RemoteResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("orca/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| RemoteError::Transport(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.endpoint(path);
        debug!(%method, %url, "orchestrator request");
        self.client.request(method, url)
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<Vec<u8>> {
        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<T> {
        let body = self.send(request).await?;
        serde_json::from_slice(&body).map_err(|err| RemoteError::Decode(err.to_string()))
    }

    async fn submit<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
    ) -> RemoteResult<()> {
        self.send(self.request(method, path).json(payload)).await?;
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn ping(&self) -> RemoteResult<Ping> {
        self.fetch(self.request(Method::POST, PINGS_PATH).json(&serde_json::json!({})))
            .await
    }

    async fn fetch_next_command(&self) -> RemoteResult<Command> {
        self.fetch(self.request(Method::GET, NEXT_COMMAND_PATH)).await
    }

    async fn report_command_result(&self, command: &Command) -> RemoteResult<()> {
        let path = format!("{COMMANDS_PATH}/{}", command.id);
        self.submit(Method::PUT, &path, command).await
    }
}

#[async_trait]
impl BootstrapApi for HttpOrchestrator {
    async fn fetch_bootstrap_configuration(&self) -> RemoteResult<BootstrapConfiguration> {
        self.fetch(self.request(Method::GET, CONFIGURATION_PATH)).await
    }

    async fn report_bootstrap_log_chunk(&self, chunk: &BootstrapLogChunk) -> RemoteResult<()> {
        self.submit(Method::POST, BOOTSTRAP_LOGS_PATH, chunk).await
    }

    async fn report_applied_configuration(
        &self,
        applied: &AppliedConfiguration,
    ) -> RemoteResult<()> {
        self.submit(Method::PUT, APPLIED_CONFIGURATION_PATH, applied)
            .await
    }
}
