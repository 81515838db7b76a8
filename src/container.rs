//! Container backends
//!
//! An environment can be built in one of two interchangeable ways: as a bare
//! package environment on the host (`Process`) or as a container image
//! (`Image`). The backend is selected once at startup from the configuration
//! and the rest of the hub never inspects which one is active.

use crate::config::{PayloadConfig, ToolsConfig};
use crate::environment::{Environment, EnvironmentDefinition};
use crate::error::HubError;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Closed set of container backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Bare package environment activated in a subshell
    #[default]
    Process,
    /// Container image built and run via an external image tool
    Image,
}

/// Builds environments and synthesizes payload-server launch commands.
///
/// All methods dispatch on [`BackendKind`]; the two backends share an
/// identical contract so the hub can use them uniformly.
#[derive(Debug, Clone)]
pub struct Container {
    kind: BackendKind,
    tools: ToolsConfig,
    payload: PayloadConfig,
}

impl Container {
    pub fn new(kind: BackendKind, tools: ToolsConfig, payload: PayloadConfig) -> Self {
        Self {
            kind,
            tools,
            payload,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Reconstruct a registry entry for an environment already on disk.
    ///
    /// The image backend recovers the environment's id from the final line of
    /// the build recipe it wrote at build time; the process backend has no
    /// on-disk marker and derives a fresh id from the directory.
    pub async fn from_existing(&self, path: &Path) -> Result<Environment, HubError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                HubError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("environment path has no directory name: {}", path.display()),
                ))
            })?;

        let id = match self.kind {
            BackendKind::Process => Uuid::new_v4().to_string(),
            BackendKind::Image => {
                let recipe = tokio::fs::read_to_string(path.join("Dockerfile")).await?;
                recover_id(&recipe).ok_or_else(|| {
                    HubError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("no id marker in build recipe at {}", path.display()),
                    ))
                })?
            }
        };

        debug!(name, id, backend = ?self.kind, "Recovered environment from disk");
        Ok(Environment::idle(name, id, path.to_path_buf()))
    }

    /// Build the environment described by `definition` at `path`.
    ///
    /// Propagates the external tool's failure (non-zero exit) as
    /// [`HubError::BuildFailure`]; the caller owns any registry cleanup.
    pub async fn build_environment(
        &self,
        id: &str,
        path: &Path,
        definition: &EnvironmentDefinition,
    ) -> Result<(), HubError> {
        match self.kind {
            BackendKind::Process => self.build_process_environment(path, definition).await,
            BackendKind::Image => self.build_image(id, path, definition).await,
        }
    }

    /// Construct the command line that launches this environment's payload
    /// server bound to `port`, with the environment's id embedded in the
    /// base path so multiple environments can share one public host.
    pub fn server_command(&self, env: &Environment, port: u16) -> String {
        match self.kind {
            BackendKind::Process => {
                let pm = &self.tools.package_manager;
                let launch = format!(
                    "{} --port {} --base-path {}/{}/",
                    self.payload.command, port, self.payload.base_path, env.id
                );
                format!(
                    "bash -c 'eval \"$({pm} shell hook --shell bash)\"; {pm} activate \"{path}\"; {launch}'",
                    pm = pm,
                    path = env.path.display(),
                    launch = launch,
                )
            }
            BackendKind::Image => {
                let internal = self.payload.internal_port;
                format!(
                    "{} run -p {}:{} {} {} --host 0.0.0.0 --port {} --base-path {}/{}/",
                    self.tools.image_builder,
                    port,
                    internal,
                    env.id,
                    self.payload.command,
                    internal,
                    self.payload.base_path,
                    env.id,
                )
            }
        }
    }

    /// Process backend: write the manifest to a throwaway file and ask the
    /// package manager to materialize it at `path`.
    async fn build_process_environment(
        &self,
        path: &Path,
        definition: &EnvironmentDefinition,
    ) -> Result<(), HubError> {
        let manifest = serde_yaml::to_string(definition)?;

        let mut manifest_file = NamedTempFile::with_suffix(".yaml")?;
        manifest_file.write_all(manifest.as_bytes())?;
        manifest_file.flush()?;

        let cmd = format!(
            "{} create -f {} -p \"{}\" --yes",
            self.tools.package_manager,
            manifest_file.path().display(),
            path.display(),
        );
        info!(path = %path.display(), "Building package environment");
        run_command(&cmd).await
        // manifest_file dropped here, after the build tool has read it
    }

    /// Image backend: write the build context (dependency file plus recipe
    /// carrying the id) into `path` and build an image tagged with the id.
    async fn build_image(
        &self,
        id: &str,
        path: &Path,
        definition: &EnvironmentDefinition,
    ) -> Result<(), HubError> {
        // Inside the image the environment is always the base one
        let mut definition = definition.clone();
        definition.name = "base".to_string();
        let manifest = serde_yaml::to_string(&definition)?;

        tokio::fs::create_dir_all(path).await?;
        tokio::fs::write(path.join("environment.yaml"), manifest).await?;
        tokio::fs::write(
            path.join("Dockerfile"),
            render_build_recipe(id, self.payload.internal_port),
        )
        .await?;

        let cmd = format!("{} build --tag {} \"{}\"", self.tools.image_builder, id, path.display());
        info!(id, path = %path.display(), "Building environment image");
        run_command(&cmd).await
    }
}

/// Run an external command, inheriting stdio, and map non-zero exit to
/// [`HubError::BuildFailure`]
async fn run_command(cmd: &str) -> Result<(), HubError> {
    let parts = shell_words::split(cmd).map_err(|e| {
        HubError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unparseable command '{}': {}", cmd, e),
        ))
    })?;
    let (program, args) = parts.split_first().ok_or_else(|| {
        HubError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command",
        ))
    })?;

    let status = Command::new(program).args(args).status().await?;
    if status.success() {
        Ok(())
    } else {
        Err(HubError::BuildFailure { status })
    }
}

/// Build recipe for the image backend. The trailing comment line encodes the
/// environment's id so [`Container::from_existing`] can recover it.
fn render_build_recipe(id: &str, internal_port: u16) -> String {
    format!(
        "FROM mambaorg/micromamba:2.4.0\n\
         \n\
         COPY --chown=$MAMBA_USER:$MAMBA_USER environment.yaml /tmp/env.yaml\n\
         RUN micromamba install -y -n base -f /tmp/env.yaml && micromamba clean --all --yes\n\
         ARG MAMBA_DOCKERFILE_ACTIVATE=1\n\
         EXPOSE {internal_port}\n\
         # {id}\n"
    )
}

/// Extract the id from the final comment line of a build recipe
fn recover_id(recipe: &str) -> Option<String> {
    recipe
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.strip_prefix("# "))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}
