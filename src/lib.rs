//! Envhub - a single-host orchestrator for sandboxed package environments
//!
//! This library provides a stateful orchestration engine that:
//! - Builds isolated environments from declarative YAML manifests, either as
//!   bare package environments or as container images
//! - Starts and stops one payload server per environment on dynamically
//!   allocated TCP ports
//! - Keeps a reverse-proxy configuration file consistent with the live set
//!   of running servers, regenerating it in full on every change
//! - Recovers previously built environments from disk at boot

pub mod config;
pub mod container;
pub mod environment;
pub mod error;
pub mod hub;
pub mod nginx;
pub mod ports;
