//! Bastion Engine Library
//!
//! The plugin security core: manifest validation, signature verification,
//! review, permission mediation, resource accounting and failure isolation.
//! It is used by the `bastion` binary, by hosts embedding the core, and by
//! integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// Poison-tolerant lock helpers
mod sync;

/// Message bus for lifecycle and security notifications
pub mod message_bus;

/// Manifest validation module
pub mod validator;

/// Trusted signer store and signature verification
pub mod signer;

/// Permission gateway and audit log
pub mod gateway;

/// Resource monitoring module
pub mod monitor;

/// Per-plugin circuit breaker
pub mod circuit_breaker;

/// Security event store
pub mod events;

/// Security review engine
pub mod review;

/// Plugin sandbox lifecycle
pub mod sandbox;

/// Security orchestrator facade
pub mod orchestrator;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
