//! End-to-end scenarios against a live docker daemon. Ignored by default;
//! run with `cargo test -- --ignored` on a machine where `docker` works.

use std::time::Duration;

use docker_commander::{
    line_marker, DockerHost, LocalDockerHost, OutputConfig, RunConfig,
};
use tokio::time::timeout;

const BOOT_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::test]
#[ignore = "requires a running docker daemon"]
async fn postgres_boots_and_answers_exec() {
    let host = LocalDockerHost::new();
    assert!(host.initialize().await.unwrap());
    assert!(host.check_daemon().await.unwrap());

    // postgres logs the marker on stderr under docker, but watch both streams
    let output = OutputConfig::new()
        .stdout_ready(line_marker("ready to accept connections"))
        .stderr_ready(line_marker("ready to accept connections"));
    let runner = timeout(
        BOOT_TIMEOUT,
        host.run(
            RunConfig::new("postgres")
                .version("latest")
                .env("POSTGRES_PASSWORD", "p")
                .output(output),
        ),
    )
    .await
    .expect("the readiness marker never appeared")
    .unwrap()
    .expect("the container did not start");
    assert!(runner.is_running());
    assert_eq!(runner.exit_code(), None);

    // exec and capture
    let echo = host
        .exec(runner.name(), "echo", vec!["hi".to_owned()], OutputConfig::new())
        .await
        .unwrap()
        .expect("exec refused");
    assert_eq!(echo.wait_exit().await, 0);
    assert_eq!(echo.stdout().lines().unwrap(), ["hi"]);

    assert!(runner.stop(None).await.unwrap());
    runner.wait_exit().await;
    assert!(!runner.is_running());
    host.close().await.unwrap();
}
