//! Protocol trait definitions for the ANDNA networking seam.
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`AndnaRpc`] | transports ([`InProcessNetwork`](crate::network::InProcessNetwork)) | send a request to a peer and await its reply |
//! | [`RequestHandler`] | [`AndnaNode`](crate::AndnaNode) | answer a request received from a peer |
//!
//! Protocol logic depends only on these traits, so the same node code runs
//! over an in-process registry in tests and over a real transport elsewhere.

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::{AndnaRequest, AndnaResponse};
use crate::topology::PeerAddress;

/// Outbound request-response messaging. The transport knows the local
/// address and reports it to the receiver.
#[async_trait]
pub trait AndnaRpc: Send + Sync + 'static {
    async fn call(&self, to: PeerAddress, request: AndnaRequest) -> Result<AndnaResponse>;
}

/// Inbound dispatch. Protocol rejections are carried inside the response,
/// never as errors.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, from: PeerAddress, request: AndnaRequest) -> AndnaResponse;
}
