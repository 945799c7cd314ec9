//! # Jiji Client
//!
//! Shared types for the jiji deployment tool:
//! the deploy configuration schema, resolved server / service
//! specs handed to the deployment engine, deployment results,
//! and the service discovery record model.

pub mod deserializers;
pub mod entities;
