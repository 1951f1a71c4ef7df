pub mod connection;

pub use connection::{Connection, RpcId, RpcRequest};

pub const LOG_TARGET: &str = "abusemesh::net";

use abusemesh_util_error::BoxedError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum RpcError {
    #[snafu(display("connection error"))]
    Connection { source: BoxedError },
    #[snafu(display("write error"))]
    Write { source: BoxedError },
    #[snafu(display("read error"))]
    Read { source: BoxedError },
    #[snafu(display("response of {len} bytes exceeds limit of {limit} bytes"))]
    ResponseTooLarge { len: u32, limit: u32 },
    #[snafu(display("unknown rpc id {id}"))]
    UnknownRpcId { id: u16 },
    #[snafu(display("request encoding failed"))]
    RequestEncoding { source: bincode::error::EncodeError },
    #[snafu(display("response decoding failed"))]
    ResponseDecoding { source: bincode::error::DecodeError },
    /// Other side responded with rpc failure
    #[snafu(display("remote returned failure code {return_code}"))]
    Failed { return_code: u8 },
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;
