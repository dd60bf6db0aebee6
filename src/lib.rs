// src/lib.rs

pub mod agent;
pub mod download;
pub mod error;
pub mod model;
pub mod provider;
pub mod repo;

// Generated stubs for the privileged channel. The daemon serves these
// services; the provider client consumes them as typed capability handles.
pub mod pb {
    tonic::include_proto!("rootmod.provider.v1");
}
