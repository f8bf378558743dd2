//! Docker Registry API v2 client.
//!
//! Layered as challenge/token exchange ([`authenticator`]), transport with
//! TLS fallback and manual redirects ([`caller`]), per-operation request
//! shapes ([`endpoint`]) and a repository-scoped facade ([`client`]).

mod authenticator;
mod caller;
mod client;
mod endpoint;
mod error;

pub use authenticator::{
    AccessScope, Authorization, Credential, RegistryAuthenticator, TOKEN_USERNAME,
};
pub use client::RegistryClient;
