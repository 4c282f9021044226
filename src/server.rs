//! An HTTP facade serving a [LocalDockerHost] to [RemoteDockerHost] peers:
//! the RPC surface is GET-with-query-parameters and JSON replies. `/auth`
//! exchanges configured credentials for a per-server session token; every
//! other endpoint requires it in `X-Access-Token`.
//!
//! Readiness predicates cannot cross the wire, so processes started through
//! the facade use the started-is-ready criterion on the server side; callers
//! evaluate their predicates against the mirrored streams.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use stacked_errors::{Result, StackableErr};
use tracing::warn;
use uuid::Uuid;

use crate::{
    wire::{
        decode_str_vec, entries_from_offset, parse_pairs, split_csv, CommandReply, ExecReply,
        PullReply, RunReply,
    },
    CreateConfig, CreatedContainer, Credentials, DockerHost, LocalDockerHost, OutputConfig,
    OutputHandle, RunConfig,
};

#[derive(Clone)]
pub struct HostServerState {
    host: Arc<LocalDockerHost>,
    credentials: Arc<Credentials>,
    token: Arc<String>,
}

/// Builds the RPC router over `host`. Peers authenticate against
/// `credentials`.
pub fn host_service_router(host: Arc<LocalDockerHost>, credentials: Credentials) -> Router {
    let state = HostServerState {
        host,
        credentials: Arc::new(credentials),
        token: Arc::new(Uuid::new_v4().to_string()),
    };
    let protected = Router::new()
        .route("/initialize", get(initialize))
        .route("/check_daemon", get(check_daemon))
        .route("/close", get(close))
        .route("/id_by_name", get(id_by_name))
        .route("/create", get(create))
        .route("/run", get(run))
        .route("/exec", get(exec))
        .route("/command", get(command))
        .route("/stdout", get(stdout))
        .route("/stderr", get(stderr))
        .route("/wait_ready", get(wait_ready))
        .route("/wait_exit", get(wait_exit))
        .route("/stop", get(stop))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_token,
        ));
    Router::new()
        .route("/auth", get(auth))
        .merge(protected)
        .with_state(state)
}

/// Serves the router until the listener fails
pub async fn serve(
    host: Arc<LocalDockerHost>,
    credentials: Credentials,
    listener: tokio::net::TcpListener,
) -> Result<()> {
    let router = host_service_router(host, credentials);
    axum::serve(listener, router)
        .await
        .stack_err("the host service stopped serving")
}

/// Internal failure carrying the stacked error into a 500 reply
struct RpcFailure(stacked_errors::Error);

impl From<stacked_errors::Error> for RpcFailure {
    fn from(e: stacked_errors::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for RpcFailure {
    fn into_response(self) -> Response {
        warn!("a host service handler failed: {:?}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}", self.0)).into_response()
    }
}

type RpcResult<T> = std::result::Result<Json<T>, RpcFailure>;

fn parse_bool(s: Option<&str>, default: bool) -> bool {
    match s {
        Some("true") => true,
        Some("false") => false,
        _ => default,
    }
}

fn credentials_match(expected: &Credentials, authorization: &str) -> bool {
    match expected {
        Credentials::Bearer(token) => authorization
            .strip_prefix("Bearer ")
            .map(|presented| presented == token)
            .unwrap_or(false),
        Credentials::Basic { username, password } => authorization
            .strip_prefix("Basic ")
            .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(|pair| pair == format!("{username}:{password}"))
            .unwrap_or(false),
    }
}

async fn auth(
    State(state): State<HostServerState>,
    headers: HeaderMap,
) -> std::result::Result<Json<String>, StatusCode> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if credentials_match(&state.credentials, authorization) {
        Ok(Json((*state.token).clone()))
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn require_token(
    State(state): State<HostServerState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get("X-Access-Token")
        .and_then(|v| v.to_str().ok());
    if presented == Some(state.token.as_str()) {
        next.run(request).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn initialize(State(state): State<HostServerState>) -> RpcResult<bool> {
    Ok(Json(state.host.initialize().await?))
}

async fn check_daemon(State(state): State<HostServerState>) -> RpcResult<bool> {
    Ok(Json(state.host.check_daemon().await?))
}

async fn close(State(state): State<HostServerState>) -> RpcResult<bool> {
    state.host.close().await?;
    Ok(Json(true))
}

#[derive(Debug, Deserialize)]
struct NameQuery {
    name: String,
}

async fn id_by_name(
    State(state): State<HostServerState>,
    Query(query): Query<NameQuery>,
) -> RpcResult<Option<String>> {
    Ok(Json(
        state.host.get_container_id_by_name(&query.name).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    image: String,
    version: Option<String>,
    name: Option<String>,
    #[serde(default)]
    ports: String,
    network: Option<String>,
    hostname: Option<String>,
    #[serde(default)]
    environment: String,
    #[serde(default)]
    volumes: String,
    #[serde(rename = "cleanContainer")]
    clean_container: Option<String>,
}

impl CreateQuery {
    fn into_config(self) -> CreateConfig {
        let mut config = CreateConfig::new(&self.image);
        config.version = self.version;
        config.name = self.name;
        config.ports = split_csv(&self.ports);
        config.network = self.network;
        config.hostname = self.hostname;
        config.environment = parse_pairs(&self.environment);
        config.volumes = parse_pairs(&self.volumes);
        config.clean_container = parse_bool(self.clean_container.as_deref(), false);
        config
    }
}

async fn create(
    State(state): State<HostServerState>,
    Query(query): Query<CreateQuery>,
) -> RpcResult<Option<CreatedContainer>> {
    Ok(Json(
        state.host.create_container(query.into_config()).await?,
    ))
}

fn output_config(as_lines: Option<&str>, limit: Option<&str>) -> OutputConfig {
    let mut output = OutputConfig::new().as_lines(parse_bool(as_lines, true));
    if let Some(limit) = limit.and_then(|s| s.parse::<usize>().ok()) {
        output = output.limit(limit);
    }
    output
}

#[derive(Debug, Deserialize)]
struct RunQuery {
    image: String,
    version: Option<String>,
    name: Option<String>,
    #[serde(default)]
    ports: String,
    network: Option<String>,
    hostname: Option<String>,
    #[serde(default)]
    environment: String,
    #[serde(default)]
    volumes: String,
    #[serde(rename = "cleanContainer")]
    clean_container: Option<String>,
    #[serde(rename = "imageArgs", default)]
    image_args: String,
    #[serde(rename = "outputAsLines")]
    output_as_lines: Option<String>,
    #[serde(rename = "outputLimit")]
    output_limit: Option<String>,
}

async fn run(
    State(state): State<HostServerState>,
    Query(query): Query<RunQuery>,
) -> RpcResult<Option<RunReply>> {
    let create = CreateQuery {
        image: query.image,
        version: query.version,
        name: query.name,
        ports: query.ports,
        network: query.network,
        hostname: query.hostname,
        environment: query.environment,
        volumes: query.volumes,
        clean_container: Some(
            query
                .clean_container
                .unwrap_or_else(|| "true".to_owned()),
        ),
    };
    let config = RunConfig {
        create: create.into_config(),
        image_args: decode_str_vec(&query.image_args)?,
        output: output_config(
            query.output_as_lines.as_deref(),
            query.output_limit.as_deref(),
        ),
    };
    let runner = state.host.run(config).await?;
    Ok(Json(runner.map(|runner| RunReply {
        instance_id: runner.instance_id(),
        container_name: runner.name().to_owned(),
        id: runner.id().to_owned(),
    })))
}

#[derive(Debug, Deserialize)]
struct ExecQuery {
    cmd: String,
    #[serde(default)]
    args: String,
    name: String,
    #[serde(rename = "outputAsLines")]
    output_as_lines: Option<String>,
    #[serde(rename = "outputLimit")]
    output_limit: Option<String>,
}

async fn exec(
    State(state): State<HostServerState>,
    Query(query): Query<ExecQuery>,
) -> RpcResult<Option<ExecReply>> {
    let output = output_config(
        query.output_as_lines.as_deref(),
        query.output_limit.as_deref(),
    );
    let process = state
        .host
        .exec(&query.name, &query.cmd, decode_str_vec(&query.args)?, output)
        .await?;
    Ok(Json(process.map(|process| ExecReply {
        instance_id: process.instance_id(),
        container_name: query.name,
    })))
}

#[derive(Debug, Deserialize)]
struct CommandQuery {
    cmd: String,
    #[serde(default)]
    args: String,
    #[serde(rename = "outputAsLines")]
    output_as_lines: Option<String>,
    #[serde(rename = "outputLimit")]
    output_limit: Option<String>,
}

async fn command(
    State(state): State<HostServerState>,
    Query(query): Query<CommandQuery>,
) -> RpcResult<Option<CommandReply>> {
    let output = output_config(
        query.output_as_lines.as_deref(),
        query.output_limit.as_deref(),
    );
    let process = state
        .host
        .command(&query.cmd, decode_str_vec(&query.args)?, output)
        .await?;
    Ok(Json(process.map(|process| CommandReply {
        instance_id: process.instance_id(),
    })))
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    #[serde(rename = "instanceID")]
    instance_id: u64,
    #[serde(rename = "realOffset")]
    real_offset: u64,
}

fn pull(state: &HostServerState, query: PullQuery, want_stdout: bool) -> RpcResult<PullReply> {
    let process = state
        .host
        .get_process_by_instance_id(query.instance_id)
        .stack_err_with(|| format!("no process with instance id {}", query.instance_id))?;
    let running = process.is_running();
    let handle = if want_stdout {
        process.stdout()
    } else {
        process.stderr()
    };
    let reply = match handle {
        OutputHandle::Lines(stream) => {
            let (removed, entries) = stream.snapshot();
            PullReply {
                running,
                length: removed + entries.len() as u64,
                removed,
                entries: entries_from_offset(removed, &entries, query.real_offset)
                    .into_iter()
                    .map(Value::from)
                    .collect(),
            }
        }
        OutputHandle::Bytes(stream) => {
            let (removed, entries) = stream.snapshot();
            PullReply {
                running,
                length: removed + entries.len() as u64,
                removed,
                entries: entries_from_offset(removed, &entries, query.real_offset)
                    .into_iter()
                    .map(Value::from)
                    .collect(),
            }
        }
    };
    Ok(Json(reply))
}

async fn stdout(
    State(state): State<HostServerState>,
    Query(query): Query<PullQuery>,
) -> RpcResult<PullReply> {
    pull(&state, query, true)
}

async fn stderr(
    State(state): State<HostServerState>,
    Query(query): Query<PullQuery>,
) -> RpcResult<PullReply> {
    pull(&state, query, false)
}

#[derive(Debug, Deserialize)]
struct InstanceQuery {
    #[serde(rename = "instanceID")]
    instance_id: u64,
}

async fn wait_ready(
    State(state): State<HostServerState>,
    Query(query): Query<InstanceQuery>,
) -> RpcResult<bool> {
    let process = state
        .host
        .get_process_by_instance_id(query.instance_id)
        .stack_err_with(|| format!("no process with instance id {}", query.instance_id))?;
    process.wait_ready().await;
    Ok(Json(true))
}

async fn wait_exit(
    State(state): State<HostServerState>,
    Query(query): Query<InstanceQuery>,
) -> RpcResult<i32> {
    let process = state
        .host
        .get_process_by_instance_id(query.instance_id)
        .stack_err_with(|| format!("no process with instance id {}", query.instance_id))?;
    Ok(Json(process.wait_exit().await))
}

#[derive(Debug, Deserialize)]
struct StopQuery {
    name: String,
    timeout: Option<String>,
}

async fn stop(
    State(state): State<HostServerState>,
    Query(query): Query<StopQuery>,
) -> RpcResult<bool> {
    let timeout = query
        .timeout
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);
    Ok(Json(state.host.stop_by_name(&query.name, timeout).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_and_basic_credentials_match() {
        let bearer = Credentials::bearer("secret");
        assert!(credentials_match(&bearer, "Bearer secret"));
        assert!(!credentials_match(&bearer, "Bearer wrong"));
        assert!(!credentials_match(&bearer, "secret"));

        let basic = Credentials::basic("user", "pass");
        // "user:pass"
        assert!(credentials_match(&basic, "Basic dXNlcjpwYXNz"));
        assert!(!credentials_match(&basic, "Basic dXNlcjpvdGhlcg=="));
        assert!(!credentials_match(&basic, ""));
    }

    #[test]
    fn booleans_are_wire_strings() {
        assert!(parse_bool(Some("true"), false));
        assert!(!parse_bool(Some("false"), true));
        assert!(parse_bool(None, true));
        assert!(!parse_bool(Some("yes"), false));
    }
}
