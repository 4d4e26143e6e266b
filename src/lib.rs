//! Scalegate - A TCP reverse proxy in front of an elastic pool of local backends
//!
//! This library provides:
//! - A pool controller that spawns identical backend processes on consecutive ports
//! - TCP readiness probing before a node receives traffic
//! - Request-rate driven autoscaling with a fixed floor
//! - Round-robin (or alternative) selection over the active set
//! - Graceful draining of retired nodes and hard shutdown of the whole pool
//! - A small authenticated admin API for inspection and shutdown

pub mod admin;
pub mod balancer;
pub mod config;
pub mod controller;
pub mod error;
pub mod node;
pub mod probe;
pub mod proxy;
pub mod scaling;
