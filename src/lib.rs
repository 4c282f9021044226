//! Supervision of docker containers and the processes inside them, through
//! one uniform host abstraction backed either by the local `docker` binary or
//! by a remote peer serving a host over HTTP.
//!
//! See the `postgres` crate example for the typical flow: start a container
//! with a readiness marker, wait for it, exec into it, observe output and
//! exit codes.

mod host;
mod local_host;
mod misc;
mod network;
mod output_stream;
mod parsing;
mod process;
mod remote_host;
/// The HTTP facade that serves a [LocalDockerHost] to [RemoteDockerHost]
/// peers
pub mod server;
pub(crate) mod wire;

pub use host::*;
pub use local_host::LocalDockerHost;
pub use misc::*;
pub use network::{HostEntry, NetworkRegistry};
pub use output_stream::*;
pub use parsing::*;
pub use process::*;
pub use remote_host::RemoteDockerHost;
/// This reexport helps with dealing with dependency wrangling
pub use stacked_errors;

pub(crate) use host::default_container_name;
pub(crate) use process::{next_instance_id, ContainerStop};
