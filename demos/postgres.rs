//! Boots a postgres container, waits until it reports readiness, runs a
//! query through `docker exec`, and stops it. Run from the repo root with
//! `cargo run --example postgres` on a machine where `docker` works.

use clap::Parser;
use docker_commander::{
    line_marker, stacked_errors::{bail, Result, StackableErr}, DockerHost, LocalDockerHost,
    OutputConfig, RunConfig,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about)]
struct Args {
    #[arg(long, default_value_t = String::from("16"))]
    version: String,
    #[arg(long, default_value_t = String::from("root"))]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let host = LocalDockerHost::new();
    if !host.initialize().await.stack()? {
        bail!("no docker binary on this machine")
    }
    if !host.check_daemon().await.stack()? {
        bail!("the docker daemon is not answering")
    }

    // postgres logs the marker on stderr under docker, but watch both streams
    let output = OutputConfig::new()
        .stdout_ready(line_marker("ready to accept connections"))
        .stderr_ready(line_marker("ready to accept connections"));
    let runner = host
        .run(
            RunConfig::new("postgres")
                .version(&args.version)
                .env("POSTGRES_PASSWORD", &args.password)
                .output(output),
        )
        .await
        .stack()?
        .stack_err("postgres did not start")?;
    info!(
        "postgres is up as \"{}\" (id {}), instance {}",
        runner.name(),
        runner.id(),
        runner.instance_id()
    );

    let psql = host
        .exec(
            runner.name(),
            "psql",
            vec![
                "-U".to_owned(),
                "postgres".to_owned(),
                "--command=\\l".to_owned(),
            ],
            OutputConfig::new(),
        )
        .await
        .stack()?
        .stack_err("exec into postgres refused")?;
    let code = psql.wait_exit().await;
    for line in psql.stdout().lines().unwrap_or_default() {
        info!("psql | {line}");
    }
    info!("psql exited with {code}");

    runner.stop(None).await.stack()?;
    runner.wait_exit().await;
    info!("postgres exited with {:?}", runner.exit_code());
    host.close().await.stack()?;
    Ok(())
}
