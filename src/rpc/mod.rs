//! 带双向认证的RPC
//!
//! 包格式见`packet`，握手见`auth`，payload编码见`codec`。

pub mod auth;
pub mod channel;
pub mod client;
pub mod codec;
pub mod packet;
pub mod server;

pub use channel::{Registry, RemoteChannel, Reply, Role, RpcChannel};
pub use client::{Client, Status};
pub use codec::{Args, CallPayload, Codec, ExceptionPayload, JsonCodec, Kwargs};
pub use server::Server;
