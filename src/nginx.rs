//! Reverse-proxy configuration generation and proxy process control
//!
//! The configuration file is always rendered in full from the current set of
//! routes and written atomically; there is no incremental patching. Routes
//! are keyed by environment id, never by name.

use std::io::Write;
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};

/// One proxied environment: its routing id and the port its payload server
/// currently listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBlock {
    pub id: String,
    pub port: u16,
}

/// Render the complete proxy configuration.
///
/// The header declares the proxy's listen port and the hub's administrative
/// route; the body holds one block per route mapping
/// `<base_path>/<id>` to the environment's port, plus an upgrade-aware
/// block for the websocket sub-path.
pub fn render_config(
    proxy_port: u16,
    hub_port: u16,
    base_path: &str,
    routes: &[RouteBlock],
) -> String {
    let mut conf = String::new();

    conf.push_str(
        "map $http_upgrade $connection_upgrade {\n\
         \x20   default upgrade;\n\
         \x20   ''      close;\n\
         }\n\n",
    );

    conf.push_str(&format!(
        "server {{\n\
         \x20   listen       {proxy_port};\n\
         \x20   server_name  localhost;\n\
         \n\
         \x20   # hub at {hub_port}\n\
         \n\
         \x20   location = / {{\n\
         \x20       rewrite / /hub break;\n\
         \x20       proxy_pass http://127.0.0.1:{hub_port};\n\
         \x20   }}\n\
         \n\
         \x20   location /hub {{\n\
         \x20       proxy_pass http://127.0.0.1:{hub_port};\n\
         \x20   }}\n"
    ));

    for route in routes {
        conf.push_str(&render_route(base_path, route));
    }

    conf.push_str("}\n");
    conf
}

fn render_route(base_path: &str, route: &RouteBlock) -> String {
    let id = &route.id;
    let port = route.port;
    format!(
        "\n\
         \x20   # environment {id} at {port}\n\
         \n\
         \x20   location {base_path}/{id} {{\n\
         \x20       rewrite ^{base_path}/{id}/(.*)$ /$1 break;\n\
         \x20       proxy_pass http://127.0.0.1:{port};\n\
         \x20       proxy_set_header X-Environment-ID {id};\n\
         \x20   }}\n\
         \x20   location ~ ^{base_path}/{id}/ws/(.*)$ {{\n\
         \x20       proxy_http_version 1.1;\n\
         \x20       proxy_set_header Upgrade $http_upgrade;\n\
         \x20       proxy_set_header Connection $connection_upgrade;\n\
         \x20       rewrite ^{base_path}/{id}/ws/(.*)$ /ws/$1 break;\n\
         \x20       proxy_pass http://127.0.0.1:{port};\n\
         \x20   }}\n"
    )
}

/// Write `contents` to `path` atomically: a temp file in the same directory
/// is persisted over the destination, so readers never observe a torn file.
pub async fn write_atomic(path: &Path, contents: String) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        // A bare file name has an empty parent; the temp file then lives in
        // the current directory, same filesystem as the destination
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent)?;
                parent.to_path_buf()
            }
            _ => std::path::PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(e))?
}

/// Starts, reloads, and stops the reverse-proxy process.
///
/// Every operation is best-effort: a missing or failing proxy binary is
/// logged and swallowed, the hub keeps serving with the previously written
/// configuration.
#[derive(Debug, Clone)]
pub struct ProxyControl {
    command: String,
}

impl ProxyControl {
    pub fn new(command: String) -> Self {
        Self { command }
    }

    /// Launch the proxy as a detached child process
    pub fn start(&self) {
        info!(command = %self.command, "Starting reverse proxy");
        match Command::new(&self.command).spawn() {
            Ok(_child) => {}
            Err(e) => warn!(command = %self.command, error = %e, "Failed to start reverse proxy"),
        }
    }

    /// Ask a running proxy to re-read its configuration
    pub async fn reload(&self) {
        self.signal("reload").await;
    }

    /// Ask a running proxy to shut down
    pub async fn stop(&self) {
        self.signal("stop").await;
    }

    async fn signal(&self, action: &str) {
        let result = Command::new(&self.command)
            .arg("-s")
            .arg(action)
            .status()
            .await;
        match result {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!(command = %self.command, action, %status, "Proxy signal command failed")
            }
            Err(e) => warn!(command = %self.command, action, error = %e, "Failed to signal proxy"),
        }
    }
}
