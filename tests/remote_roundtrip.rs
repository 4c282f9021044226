//! Drives the remote backend against an in-process host service backed by a
//! fake `docker` executable, so the whole pull-replication path (auth,
//! offset sync, eviction adoption, exit propagation) is exercised without a
//! docker daemon.
#![cfg(unix)]

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use docker_commander::{
    line_marker, server, Credentials, DockerHost, LocalDockerHost, OutputConfig,
    RemoteDockerHost, RunConfig,
};
use tokio::{net::TcpListener, time::sleep};

const FAKE_DOCKER: &str = r#"#!/bin/sh
case "$1" in
    ps)
        shift
        # a name filter always finds one running container
        if [ $# -gt 0 ]; then echo "fakecontainer0123"; fi
        exit 0
        ;;
    emit)
        shift
        for line in "$@"; do echo "$line"; done
        exit 0
        ;;
    fail)
        echo "boom" >&2
        exit 3
        ;;
    run)
        shift
        while [ $# -gt 0 ]; do
            if [ "$1" = "--cidfile" ]; then
                printf 'fakecontainer0123' > "$2"
                shift 2
            else
                shift
            fi
        done
        echo "container up"
        exit 0
        ;;
    exec)
        shift
        shift
        cmd="$1"
        shift
        if [ "$cmd" = "echo" ]; then echo "$@"; fi
        exit 0
        ;;
    stop)
        exit 0
        ;;
    *)
        exit 1
        ;;
esac
"#;

fn write_fake_docker(tag: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let dir = std::env::temp_dir().join(format!(
        "docker_commander_fake_{}_{tag}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("docker");
    std::fs::write(&path, FAKE_DOCKER).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Fake-docker local host served over an ephemeral port, plus a remote host
/// pointed at it
async fn start_stack(tag: &str) -> (Arc<LocalDockerHost>, RemoteDockerHost) {
    let fake = write_fake_docker(tag);
    let host = Arc::new(LocalDockerHost::with_binary_path(&fake));
    assert!(host.initialize().await.unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&host);
    tokio::spawn(async move {
        let _ = server::serve(serving, Credentials::basic("user", "pass"), listener).await;
    });

    let remote =
        RemoteDockerHost::new(format!("http://{addr}/"), Credentials::basic("user", "pass"))
            .unwrap();
    (host, remote)
}

/// The pullers drain asynchronously, so observations poll with a deadline
async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn command_output_and_exit_are_mirrored() {
    let (_host, remote) = start_stack("command").await;
    assert!(remote.initialize().await.unwrap());
    assert!(remote.check_daemon().await.unwrap());

    let process = remote
        .command(
            "emit",
            vec!["hi".to_owned(), "there".to_owned()],
            OutputConfig::new(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(process.wait_exit().await, 0);
    eventually(|| async { process.stdout().logical_len() == 2 }).await;
    assert_eq!(process.stdout().lines().unwrap(), ["hi", "there"]);
    assert!(process.stderr().is_empty());
    assert!(!process.is_running());
}

#[tokio::test]
async fn stderr_and_exit_codes_propagate() {
    let (_host, remote) = start_stack("stderr").await;
    let process = remote
        .command("fail", vec![], OutputConfig::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(process.wait_exit().await, 3);
    assert_eq!(process.wait_exit_expecting(0).await, None);
    eventually(|| async { process.stderr().logical_len() == 1 }).await;
    assert_eq!(process.stderr().lines().unwrap(), ["boom"]);
}

#[tokio::test]
async fn mirror_adopts_origin_eviction() {
    let (host, remote) = start_stack("eviction").await;
    let emitted: Vec<String> = (0..12).map(|i| format!("line-{i}")).collect();
    let process = remote
        .command("emit", emitted.clone(), OutputConfig::new().limit(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(process.wait_exit().await, 0);
    eventually(|| async { process.stdout().logical_len() == 12 }).await;

    // both sides agree on the (entries_removed, entries) decomposition
    let origin = host
        .get_process_by_instance_id(process.instance_id())
        .unwrap();
    assert_eq!(origin.stdout().entries_removed(), 7);
    assert_eq!(process.stdout().entries_removed(), 7);
    assert_eq!(process.stdout().lines(), origin.stdout().lines());
    assert_eq!(process.stdout().lines().unwrap(), &emitted[7..]);
}

#[tokio::test]
async fn run_returns_a_runner_wired_to_the_origin() {
    let (_host, remote) = start_stack("run").await;
    let runner = remote
        .run(
            RunConfig::new("fakeimage")
                .version("1")
                .output(OutputConfig::new().stdout_ready(line_marker("container up"))),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(runner.name().starts_with("docker_commander-"));
    assert_eq!(runner.id(), "fakecontainer0123");
    assert_eq!(runner.image(), "fakeimage");
    // readiness came from the mirrored marker line or from exit, either way
    // the stream must contain it by the time the process settles
    assert_eq!(runner.wait_exit().await, 0);
    eventually(|| async { runner.stdout().logical_len() == 1 }).await;
    assert_eq!(runner.stdout().lines().unwrap(), ["container up"]);
    assert!(runner.stop(None).await.unwrap());
}

#[tokio::test]
async fn exec_requires_and_uses_the_named_container() {
    let (_host, remote) = start_stack("exec").await;
    let process = remote
        .exec("c", "echo", vec!["hi".to_owned()], OutputConfig::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(process.wait_exit_expecting(0).await, Some(0));
    eventually(|| async { process.stdout().logical_len() == 1 }).await;
    assert_eq!(process.stdout().lines().unwrap(), ["hi"]);
    assert_eq!(process.container_name(), Some("c"));
}

#[tokio::test]
async fn id_lookup_goes_through_the_wire() {
    let (_host, remote) = start_stack("id").await;
    let id = remote.get_container_id_by_name("anything").await.unwrap();
    assert_eq!(id.as_deref(), Some("fakecontainer0123"));
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let fake = write_fake_docker("badauth");
    let host = Arc::new(LocalDockerHost::with_binary_path(&fake));
    assert!(host.initialize().await.unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server::serve(host, Credentials::basic("user", "pass"), listener).await;
    });
    let remote = RemoteDockerHost::new(
        format!("http://{addr}/"),
        Credentials::basic("user", "wrong"),
    )
    .unwrap();
    assert!(remote.initialize().await.is_err());
}

#[tokio::test]
async fn startup_failure_is_a_null_result() {
    let (_host, remote) = start_stack("nullrun").await;
    // the fake binary rejects unknown verbs, so `create` cannot succeed
    let created = remote
        .create_container(docker_commander::CreateConfig::new("fakeimage"))
        .await
        .unwrap();
    assert!(created.is_none());
}
