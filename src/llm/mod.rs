//! Provider adapter: per-provider strategy records plus the shared pooled
//! HTTP client and fallback-chain caller.

pub mod client;
pub mod provider;

pub use client::{
    call_provider, call_provider_streaming, call_with_fallback, shared_http_client, ChatResponse,
    ProviderConfig, StreamCallback,
};
pub use provider::{Provider, Role, Turn};
