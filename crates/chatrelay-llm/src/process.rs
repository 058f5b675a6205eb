//! Local process runtime
//!
//! Loads an artifact by spawning an inference server for it and talking to
//! that server's OpenAI-compatible API. Unloading kills the child process.

use crate::openai::post_chat;
use crate::provider::{LlmError, LlmResult, LoadedModel, LocalRuntime};
use crate::types::{GenerateRequest, Generation, GenerationParams};
use chatrelay_core::LocalRuntimeConfig;
use reqwest::Client;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ProcessRuntime {
    config: LocalRuntimeConfig,
    client: Client,
    next_port: AtomicU16,
}

impl ProcessRuntime {
    pub fn new(config: LocalRuntimeConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            next_port: AtomicU16::new(0),
        }
    }

    fn allocate_port(&self) -> u16 {
        let range = self.config.port_range.max(1);
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % range;
        self.config.base_port.saturating_add(offset)
    }

    /// Expand `{artifact}`, `{host}` and `{port}` in the configured arguments.
    pub fn render_args(&self, artifact: &Path, port: u16) -> Vec<String> {
        let artifact = artifact.to_string_lossy();
        let port = port.to_string();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{artifact}", &artifact)
                    .replace("{host}", &self.config.host)
                    .replace("{port}", &port)
            })
            .collect()
    }

    /// Poll the health endpoint until it answers, the child exits, or the
    /// startup timeout elapses. A server that accepts connections but never
    /// replies still fails once the timeout is reached.
    async fn wait_healthy(&self, child: &mut Child, port: u16) -> LlmResult<()> {
        let startup = Duration::from_secs(self.config.startup_timeout_secs);
        match tokio::time::timeout(startup, self.poll_health(child, port)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::LoadFailed(format!(
                "inference server not healthy after {}s",
                self.config.startup_timeout_secs
            ))),
        }
    }

    async fn poll_health(&self, child: &mut Child, port: u16) -> LlmResult<()> {
        let url = format!(
            "http://{}:{}{}",
            self.config.host, port, self.config.health_path
        );

        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| LlmError::LoadFailed(e.to_string()))?
            {
                return Err(LlmError::LoadFailed(format!(
                    "inference server exited during startup: {}",
                    status
                )));
            }

            match self
                .client
                .get(&url)
                .timeout(HEALTH_REQUEST_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => debug!("Health check {} -> {}", url, resp.status()),
                Err(e) => debug!("Health check {} failed: {}", url, e),
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

#[async_trait::async_trait]
impl LocalRuntime for ProcessRuntime {
    async fn load(
        &self,
        artifact: &Path,
        _params: &GenerationParams,
    ) -> LlmResult<Arc<dyn LoadedModel>> {
        if !artifact.exists() {
            return Err(LlmError::LoadFailed(format!(
                "artifact not found: {}",
                artifact.display()
            )));
        }

        let port = self.allocate_port();
        let args = self.render_args(artifact, port);
        info!(
            "Spawning {} for {} on port {}",
            self.config.command,
            artifact.display(),
            port
        );

        let mut child = Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::LoadFailed(format!("{}: {}", self.config.command, e)))?;

        if let Err(e) = self.wait_healthy(&mut child, port).await {
            let _ = child.kill().await;
            return Err(e);
        }

        let model = artifact
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".to_string());

        Ok(Arc::new(ProcessModel {
            client: self.client.clone(),
            base_url: format!("http://{}:{}/v1", self.config.host, port),
            model,
            child: Mutex::new(Some(child)),
        }))
    }
}

/// A model served by a spawned child process.
pub struct ProcessModel {
    client: Client,
    base_url: String,
    model: String,
    child: Mutex<Option<Child>>,
}

impl ProcessModel {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl LoadedModel for ProcessModel {
    async fn generate(&self, request: GenerateRequest) -> LlmResult<Generation> {
        post_chat(&self.client, &self.base_url, None, &self.model, request).await
    }

    async fn unload(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            match child.kill().await {
                Ok(()) => info!("Stopped inference server for {}", self.model),
                Err(e) => warn!("Failed to stop inference server for {}: {}", self.model, e),
            }
        }
    }
}
