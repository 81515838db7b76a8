//! End-to-end lifecycle tests for the hub
//!
//! External tools are stubbed: the package manager is a shell script that
//! materializes the environment directory, the proxy binary is `true`, and
//! the payload server is the `payload-stub` binary shipped with this crate.

use envhub::config::Config;
use envhub::environment::EnvState;
use envhub::hub::Hub;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stand-in for the package manager. `create` makes the target directory;
/// `shell hook` and `activate` are silent successes so the generated
/// subshell launch command works unchanged.
fn write_stub_package_manager(dir: &Path) -> String {
    let path = dir.join("stub-pm.sh");
    let script = "#!/bin/sh\n\
                  case \"$1\" in\n\
                  create)\n\
                  \x20 shift\n\
                  \x20 while [ -n \"$1\" ] && [ \"$1\" != \"-p\" ]; do shift; done\n\
                  \x20 mkdir -p \"$2\"\n\
                  \x20 ;;\n\
                  esac\n\
                  exit 0\n";
    std::fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.to_string_lossy().into_owned()
}

/// Payload wrapper that runs the stub server and, once the server process
/// has exited, records whether the environment directory was still present.
/// An `order.log` entry of `server-stopped-first` therefore proves the
/// directory outlived the server.
#[cfg(unix)]
fn write_recording_payload(dir: &Path, env_dir: &Path) -> String {
    let path = dir.join("recording-payload.sh");
    let log = dir.join("order.log");
    let script = format!(
        "#!/bin/sh\n\
         trap 'kill -INT $child 2>/dev/null' INT\n\
         \"{stub}\" \"$@\" &\n\
         child=$!\n\
         while kill -0 $child 2>/dev/null; do wait $child; done\n\
         if [ -d \"{env_dir}\" ]; then echo server-stopped-first >> \"{log}\"; fi\n\
         echo server-exited >> \"{log}\"\n\
         exit 0\n",
        stub = env!("CARGO_BIN_EXE_payload-stub"),
        env_dir = env_dir.display(),
        log = log.display(),
    );
    std::fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.to_string_lossy().into_owned()
}

fn test_hub_with_payload(dir: &Path, payload_command: String) -> Arc<Hub> {
    let mut config = Config::default();
    config.server.environments_dir = dir.join("environments");
    config.server.proxy_conf_path = dir.join("proxy.conf");
    config.tools.package_manager = write_stub_package_manager(dir);
    config.tools.proxy = "true".to_string();
    config.payload.command = payload_command;
    config.payload.startup_timeout_secs = 10;
    config.payload.probe_interval_ms = 50;
    Hub::new(config)
}

fn test_hub(dir: &Path) -> Arc<Hub> {
    test_hub_with_payload(dir, env!("CARGO_BIN_EXE_payload-stub").to_string())
}

async fn create_and_build(hub: &Arc<Hub>, name: &str) {
    hub.create_environment(&format!("name: {name}\ndependencies: [numpy]\n"))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = hub.environment_status(name).expect("environment registered");
        if status.create_secs.is_none() {
            return;
        }
        assert!(Instant::now() < deadline, "build of '{name}' never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn proxy_conf(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("proxy.conf")).unwrap()
}

#[tokio::test]
async fn start_then_stop_leaves_environment_idle() {
    let dir = tempfile::tempdir().unwrap();
    let hub = test_hub(dir.path());
    hub.start().await.unwrap();

    create_and_build(&hub, "science").await;

    hub.start_server("science").await.unwrap();
    let status = hub.environment_status("science").unwrap();
    assert_eq!(status.state, EnvState::Running);
    let port = status.port.expect("running server has a port");
    assert!(proxy_conf(dir.path()).contains(&status.id));
    assert!(proxy_conf(dir.path()).contains(&format!("proxy_pass http://127.0.0.1:{port};")));

    // Starting an already-running server is a no-op
    hub.start_server("science").await.unwrap();
    assert_eq!(hub.environment_status("science").unwrap().port, Some(port));

    hub.stop_server("science").await.unwrap();
    let status = hub.environment_status("science").unwrap();
    assert_eq!(status.state, EnvState::Idle);
    assert_eq!(status.port, None);
    assert_eq!(status.pid, None);
    assert!(!proxy_conf(dir.path()).contains(&status.id));
}

#[tokio::test]
async fn proxy_config_has_one_route_per_running_server() {
    let dir = tempfile::tempdir().unwrap();
    let hub = test_hub(dir.path());
    hub.start().await.unwrap();

    create_and_build(&hub, "one").await;
    create_and_build(&hub, "two").await;

    hub.start_server("one").await.unwrap();
    hub.start_server("two").await.unwrap();

    let conf = proxy_conf(dir.path());
    assert_eq!(conf.matches("# environment").count(), 2);

    hub.stop_server("one").await.unwrap();
    let conf = proxy_conf(dir.path());
    assert_eq!(conf.matches("# environment").count(), 1);
    let two_id = hub.environment_status("two").unwrap().id;
    assert!(conf.contains(&two_id));

    hub.stop_server("two").await.unwrap();
    assert_eq!(proxy_conf(dir.path()).matches("# environment").count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn delete_running_environment_stops_it_first() {
    let dir = tempfile::tempdir().unwrap();
    let env_dir = dir.path().join("environments/science");
    let payload = write_recording_payload(dir.path(), &env_dir);
    let hub = test_hub_with_payload(dir.path(), payload);
    hub.start().await.unwrap();

    create_and_build(&hub, "science").await;
    hub.start_server("science").await.unwrap();
    let id = hub.environment_status("science").unwrap().id;

    hub.delete_environment("science").await.unwrap();

    assert!(hub.environment_status("science").is_none());
    assert!(!env_dir.exists());
    assert!(!proxy_conf(dir.path()).contains(&id));

    // The wrapper saw the directory still in place when the server exited,
    // so the stop completed before removal began
    let order = std::fs::read_to_string(dir.path().join("order.log")).unwrap();
    assert!(order.contains("server-exited"));
    assert!(order.contains("server-stopped-first"));
}

#[cfg(unix)]
#[tokio::test]
async fn global_stop_survives_an_already_dead_server() {
    let dir = tempfile::tempdir().unwrap();
    let hub = test_hub(dir.path());
    hub.start().await.unwrap();

    create_and_build(&hub, "one").await;
    create_and_build(&hub, "two").await;
    hub.start_server("one").await.unwrap();
    hub.start_server("two").await.unwrap();

    // Kill one server out from under the hub
    let pid = hub
        .environment_status("one")
        .unwrap()
        .pid
        .expect("running server has a pid");
    let killed = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Shutdown must still stop the healthy one
    hub.stop().await;

    for name in ["one", "two"] {
        let status = hub.environment_status(name).unwrap();
        assert_eq!(status.state, EnvState::Idle, "{name} still running");
        assert_eq!(status.port, None);
    }
    assert_eq!(proxy_conf(dir.path()).matches("# environment").count(), 0);
}

#[tokio::test]
async fn boot_recovery_registers_idle_environments() {
    let dir = tempfile::tempdir().unwrap();
    let env_root = dir.path().join("environments");
    for name in ["alpha", "beta", "gamma"] {
        std::fs::create_dir_all(env_root.join(name)).unwrap();
    }

    let hub = test_hub(dir.path());
    hub.start().await.unwrap();

    let statuses = hub.list_environments();
    assert_eq!(statuses.len(), 3);
    for status in &statuses {
        assert_eq!(status.state, EnvState::Idle);
        assert_eq!(status.port, None);
        assert_eq!(status.pid, None);
    }
    // Routeless initial config was still written
    assert_eq!(proxy_conf(dir.path()).matches("# environment").count(), 0);
}
