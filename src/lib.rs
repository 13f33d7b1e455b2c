//! # Podbridge - a container API translation engine
//!
//! Podbridge speaks the Docker Engine API on one side and realizes the
//! requested containers as Kubernetes resources on the other. Point a
//! Docker client (or a testcontainers library) at it and every created
//! container becomes a pod; declared ports become locally forwarded
//! endpoints, network aliases become services, bind mounts become config
//! map entries or post-start copies.
//!
//! ## Quick Start
//!
//! ```bash
//! podbridge serve --namespace test
//! DOCKER_HOST=tcp://127.0.0.1:2475 mvn test
//! ```
//!
//! ## Layout
//!
//! - [`server`]: the HTTP facade translating wire requests
//! - [`backend`]: lifecycle, mounts, ports, networks, exec
//! - [`kube`]: the orchestrator seam and its cluster client
//! - [`model`]: containers, networks, exec sessions, the registry

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod backend;
pub mod config;
pub mod error;
pub mod kube;
pub mod model;
pub mod server;

pub use backend::Backend;
pub use config::Config;
pub use error::{Error, Result};

/// Version of the podbridge crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
