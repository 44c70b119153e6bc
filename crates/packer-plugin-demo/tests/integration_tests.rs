//! Drives the built plugin binary the way the core does: describe it,
//! launch components as separate processes and run a build across them.

use packer_core::{
    Build, Builder, CancellationToken, ClientConfig, CoreBuild, CorePostProcessor, CoreProvisioner,
    FileCache, PluginClient, PluginError, RecordingUi, SetDescription,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const PLUGIN: &str = env!("CARGO_BIN_EXE_packer-plugin-demo");

fn client(kind: &str, name: &str) -> PluginClient {
    PluginClient::new(
        ClientConfig::new(PLUGIN)
            .with_args(["start", kind, name])
            .with_start_timeout(Duration::from_secs(30)),
    )
}

#[tokio::test]
async fn test_describe() {
    let output = tokio::process::Command::new(PLUGIN)
        .arg("describe")
        .output()
        .await
        .unwrap();
    assert!(output.status.success());

    let description: SetDescription = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(description.builders, vec!["echo", "file", "null"]);
    assert_eq!(description.provisioners, vec!["shell-local"]);
    assert_eq!(description.post_processors, vec!["checksum"]);
    assert!(description.datasources.is_empty());
    assert_eq!(description.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_start_refuses_without_magic_cookie() {
    let output = tokio::process::Command::new(PLUGIN)
        .args(["start", "builder", "echo"])
        .env_remove("PACKER_PLUGIN_MAGIC_COOKIE")
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[tokio::test]
async fn test_unknown_component_fails_before_handshake() {
    let client = client("builder", "amazon-ebs");
    match client.start().await {
        Err(PluginError::ExitedBeforeHandshake { .. }) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(client.exited());
}

#[tokio::test]
async fn test_echo_builder_over_process() {
    let client = client("builder", "echo");
    let plugin = client.connect().await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let build = CoreBuild::new("hello", "echo", Arc::new(plugin.builder()))
        .with_cache(Arc::new(FileCache::new(dir.path()).unwrap()));
    build.prepare().await.unwrap();

    let ui = Arc::new(RecordingUi::new());
    let artifacts = build.run(ui.clone(), CancellationToken::new()).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].id().await.unwrap(), "abc123");
    assert!(ui.said().contains(&"hello".to_string()));

    client.kill().await;
    assert!(client.exited());
    assert!(matches!(
        plugin.builder().prepare(vec![]).await,
        Err(PluginError::PeerExited)
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_file_build_across_three_processes() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("motd");
    let marker = dir.path().join("provisioned");
    let sums = dir.path().join("{{.BuildName}}.sum");

    let builder = client("builder", "file");
    let provisioner = client("provisioner", "shell-local");
    let post_processor = client("post-processor", "checksum");

    let build = CoreBuild::new(
        "web",
        "file",
        Arc::new(builder.connect().await.unwrap().builder()),
    )
    .with_builder_config(vec![json!({ "content": "hello", "target": target })])
    .with_provisioner(
        CoreProvisioner::new(
            "shell-local",
            Arc::new(provisioner.connect().await.unwrap().provisioner()),
        )
        .with_config(vec![json!({
            "inline": [format!("echo $PACKER_BUILD_NAME > {}", marker.display())],
        })]),
    )
    .with_post_processors(vec![CorePostProcessor::new(
        "checksum",
        Arc::new(post_processor.connect().await.unwrap().post_processor()),
    )
    .with_config(vec![json!({ "output": sums })])])
    .with_cache(Arc::new(FileCache::new(dir.path().join("cache")).unwrap()));

    build.prepare().await.unwrap();
    let ui = Arc::new(RecordingUi::new());
    let artifacts = build.run(ui.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");
    assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "web");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("web.sum")).unwrap(),
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824\tmotd\n"
    );
    // The checksum post-processor keeps its input.
    assert_eq!(artifacts.len(), 2);
    assert_eq!(artifacts[1].builder_id().await.unwrap(), "packer.post-processor.checksum");

    for client in [builder, provisioner, post_processor] {
        client.kill().await;
        assert!(client.exited());
    }
}
