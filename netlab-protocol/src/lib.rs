//! netlab-protocol: Broker wire contract for the netlab daemon
//!
//! This crate defines the JSON request/reply bodies exchanged over the
//! broker, the queue naming scheme, and the frame codec used by the
//! local broker bridge.

pub mod codec;
pub mod messages;
pub mod routing;
pub mod types;

pub use codec::{CodecError, EnvelopeCodec};
pub use messages::{
    CreateWorkspaceRequest, DestroyRequest, Envelope, NodeReply, NodeRequest, ProtocolError,
    ReplyStatus, StatusReply, StopRequest, WorkspaceUpdate,
};
pub use routing::WorkspaceOp;
pub use types::{NetworkAttachment, NodeRef, NodeSpec, WorkspaceId};
