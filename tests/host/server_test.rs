/*!
 * Host Startup and Status Server Tests
 */

use pluginbox::host::config::{PluginConfig, StorageConfig};
use pluginbox::host::{start_plugins, HostConfig, Providers, StatusServer};
use pluginbox::plugin::{LauncherSettings, PluginManager};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UnixListener};
use tokio::sync::watch;

#[tokio::test]
#[serial]
async fn test_startup_resolves_providers_and_reports_status() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("storage");
    fs::create_dir(&root).unwrap();
    fs::write(root.join("plugin"), b"#!/bin/sh\n").unwrap();

    // Stand-in launcher signals that it runs; the test plays the plugin's socket
    let launcher = dir.path().join("launcher");
    fs::write(&launcher, "#!/bin/sh\ntouch started\nexec sleep 30\n").unwrap();
    fs::set_permissions(&launcher, fs::Permissions::from_mode(0o755)).unwrap();

    let config = HostConfig {
        listen: "127.0.0.1:0".to_string(),
        plugins: vec![PluginConfig {
            name: "storage".to_string(),
            root: root.clone(),
            network: false,
            addresses: None,
        }],
        storage: Some(StorageConfig {
            provider: "storage".to_string(),
        }),
        ready_timeout_ms: 5000,
        ..Default::default()
    };
    config.validate().unwrap();

    let manager = PluginManager::new(LauncherSettings {
        program: launcher,
        entry: "launcher".to_string(),
        unshare: false,
        shutdown_grace: Duration::from_millis(500),
        ..Default::default()
    });

    let plugin_root = root.clone();
    let plugin = tokio::spawn(async move {
        while !plugin_root.join("started").exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        UnixListener::bind(plugin_root.join("grpc.sock")).unwrap()
    });

    start_plugins(&config, &manager).await.unwrap();
    let _listener = plugin.await.unwrap();

    let providers = Providers::resolve(&config, &manager).unwrap();
    let storage = providers.storage.clone().unwrap();
    assert_eq!(storage.plugin, "storage");
    assert_eq!(storage.socket, root.join("grpc.sock"));
    assert!(storage.connect(&manager).await.is_ok());

    let server = StatusServer::bind(config.listen_addr().unwrap(), manager.clone(), providers)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let serving = tokio::spawn(server.serve(rx));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut body = String::new();
    stream.read_to_string(&mut body).await.unwrap();
    let report: serde_json::Value = serde_json::from_str(body.trim_end()).unwrap();

    assert_eq!(report["plugins"][0]["name"], "storage");
    assert_eq!(report["plugins"][0]["state"]["state"], "running");
    assert_eq!(report["providers"]["storage"]["plugin"], "storage");

    tx.send(true).unwrap();
    serving.await.unwrap().unwrap();

    manager.close().await;
    assert_eq!(
        manager.snapshot()[0].state,
        pluginbox::plugin::PluginState::Stopped
    );
}
