//! Length-prefixed, bincode-encoded RPC framing over any bidirectional byte
//! stream. The concrete transport (TCP, optionally TLS-wrapped) is generic
//! here, treated as an external collaborator.
//!
//! Frame layout: `[2 bytes RpcId, big-endian][4 bytes body len, big-endian][body]`.
//! The header is raw bytes, not bincode-encoded, so its width never depends
//! on the derive's variant-index encoding.

use std::sync::Arc;

use convi::CastInto as _;
use snafu::ResultExt as _;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::Mutex;

use crate::{
    ReadSnafu, RequestEncodingSnafu, ResponseDecodingSnafu, ResponseTooLargeSnafu, RpcResult,
    WriteSnafu,
};

const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

/// Max request size.
///
/// Requests are smaller than responses because they are initiated by an
/// unauthenticated remote side.
const MAX_REQUEST_SIZE: u32 = 16 * 1024;

const MAX_RESPONSE_SIZE: u32 = 32 * 1024 * 1024;

#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RpcId {
    Ping = 0,
    GetNode = 1,
    NegotiateNeighborship = 2,
    GetNodeTable = 3,
    GetReportTable = 4,
    GetNeighborTable = 5,
    GetReportConfirmationTable = 6,
    GetDelistRequestTable = 7,
    GetDelistAcceptanceTable = 8,
    GetHistoricTableEvents = 9,
    TableEventStream = 10,
    OfferSignature = 11,
    AdminGetNode = 100,
    AdminGetClients = 101,
    AdminGetServers = 102,
}

impl RpcId {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Ping,
            1 => Self::GetNode,
            2 => Self::NegotiateNeighborship,
            3 => Self::GetNodeTable,
            4 => Self::GetReportTable,
            5 => Self::GetNeighborTable,
            6 => Self::GetReportConfirmationTable,
            7 => Self::GetDelistRequestTable,
            8 => Self::GetDelistAcceptanceTable,
            9 => Self::GetHistoricTableEvents,
            10 => Self::TableEventStream,
            11 => Self::OfferSignature,
            100 => Self::AdminGetNode,
            101 => Self::AdminGetClients,
            102 => Self::AdminGetServers,
            _ => return None,
        })
    }
}

pub trait RpcRequest: bincode::Encode {
    const RPC_ID: RpcId;
    type Response: bincode::Decode<()>;
}

fn write_framed_request<R>(v: &R) -> RpcResult<Vec<u8>>
where
    R: RpcRequest,
{
    let body = bincode::encode_to_vec(v, BINCODE_CONFIG).context(RequestEncodingSnafu)?;
    let body_len: u32 = body.len().cast_into();
    debug_assert!(body_len <= MAX_REQUEST_SIZE);

    let mut framed = Vec::with_capacity(6 + body.len());
    framed.extend_from_slice(&(R::RPC_ID as u16).to_be_bytes());
    framed.extend_from_slice(&body_len.to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// A single peer connection. RPCs are serialized one at a time over the
/// underlying stream (plain TCP offers no independent multiplexed streams),
/// guarded by an internal lock.
pub struct Connection<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    pub async fn rpc<R: RpcRequest>(&self, rpc: &R) -> RpcResult<R::Response> {
        let framed = write_framed_request(rpc)?;

        let mut stream = self.inner.lock().await;
        let resp = read_response::<_, R::Response>(&mut *stream, &framed).await?;
        Ok(resp)
    }
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Like [`Self::rpc`], but keeps the connection's internal lock held
    /// past the initial response so the caller can keep pulling further
    /// out-of-band frames off the same stream (`TableEventStream`: one
    /// request/response handshake followed by zero or more `TableEvent`
    /// frames). No other RPC can use this connection until the returned
    /// [`StreamGuard`] is dropped.
    pub async fn rpc_streaming<R: RpcRequest>(
        &self,
        rpc: &R,
    ) -> RpcResult<(R::Response, StreamGuard<T>)> {
        let framed = write_framed_request(rpc)?;
        let mut guard = self.inner.clone().lock_owned().await;
        let resp = read_response::<_, R::Response>(&mut *guard, &framed).await?;
        Ok((resp, StreamGuard { guard }))
    }
}

async fn read_response<T, Resp>(stream: &mut T, framed: &[u8]) -> RpcResult<Resp>
where
    T: AsyncRead + AsyncWrite + Unpin,
    Resp: bincode::Decode<()>,
{
    stream.write_all(framed).await.boxed().context(WriteSnafu)?;

    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(len_bytes.as_mut_slice())
        .await
        .boxed()
        .context(ReadSnafu)?;

    let len = u32::from_be_bytes(len_bytes);
    if MAX_RESPONSE_SIZE < len {
        return ResponseTooLargeSnafu {
            len,
            limit: MAX_RESPONSE_SIZE,
        }
        .fail();
    }

    let mut resp_bytes = vec![0u8; len.cast_into()];
    stream
        .read_exact(&mut resp_bytes)
        .await
        .boxed()
        .context(ReadSnafu)?;

    Ok(bincode::decode_from_slice(&resp_bytes, BINCODE_CONFIG)
        .context(ResponseDecodingSnafu)?
        .0)
}

/// Holds a connection's write/read lock for the duration of an open
/// out-of-band frame stream (see [`Connection::rpc_streaming`]).
pub struct StreamGuard<T> {
    guard: tokio::sync::OwnedMutexGuard<T>,
}

impl<T> StreamGuard<T>
where
    T: AsyncRead + Unpin,
{
    /// Reads one length-prefixed bincode frame (same wire shape as an RPC
    /// response body, minus the `RpcId` header).
    pub async fn recv_frame<M: bincode::Decode<()>>(&mut self) -> RpcResult<M> {
        let mut len_bytes = [0u8; 4];
        self.guard
            .read_exact(&mut len_bytes)
            .await
            .boxed()
            .context(ReadSnafu)?;
        let len = u32::from_be_bytes(len_bytes);
        if MAX_RESPONSE_SIZE < len {
            return ResponseTooLargeSnafu {
                len,
                limit: MAX_RESPONSE_SIZE,
            }
            .fail();
        }

        let mut body = vec![0u8; len.cast_into()];
        self.guard
            .read_exact(&mut body)
            .await
            .boxed()
            .context(ReadSnafu)?;

        Ok(bincode::decode_from_slice(&body, BINCODE_CONFIG)
            .context(ResponseDecodingSnafu)?
            .0)
    }
}

/// Reads one framed request off an accepted connection (server side):
/// `(RpcId, body_bytes)`. The caller dispatches on `RpcId` and decodes the
/// body into the concrete request type.
pub async fn read_framed_request<T>(stream: &mut T) -> RpcResult<(RpcId, Vec<u8>)>
where
    T: AsyncRead + Unpin,
{
    let mut id_bytes = [0u8; 2];
    stream
        .read_exact(&mut id_bytes)
        .await
        .boxed()
        .context(ReadSnafu)?;
    let rpc_id = RpcId::from_u16(u16::from_be_bytes(id_bytes))
        .ok_or(crate::RpcError::UnknownRpcId { id: u16::from_be_bytes(id_bytes) })?;

    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .await
        .boxed()
        .context(ReadSnafu)?;
    let len = u32::from_be_bytes(len_bytes);
    if MAX_REQUEST_SIZE < len {
        return ResponseTooLargeSnafu {
            len,
            limit: MAX_REQUEST_SIZE,
        }
        .fail();
    }

    let mut body = vec![0u8; len.cast_into()];
    stream.read_exact(&mut body).await.boxed().context(ReadSnafu)?;

    Ok((rpc_id, body))
}

pub fn decode_request_body<Req: bincode::Decode<()>>(body: &[u8]) -> RpcResult<Req> {
    Ok(bincode::decode_from_slice(body, BINCODE_CONFIG)
        .context(ResponseDecodingSnafu)?
        .0)
}

/// Writes a framed response (server side): 4-byte BE length prefix then the
/// bincode-encoded body.
pub async fn write_framed_response<T, V>(stream: &mut T, v: &V) -> RpcResult<()>
where
    T: AsyncWrite + Unpin,
    V: bincode::Encode,
{
    let body = bincode::encode_to_vec(v, BINCODE_CONFIG).context(RequestEncodingSnafu)?;
    let len: u32 = body.len().cast_into();

    stream
        .write_all(&len.to_be_bytes())
        .await
        .boxed()
        .context(WriteSnafu)?;
    stream.write_all(&body).await.boxed().context(WriteSnafu)?;

    Ok(())
}

trait BoxedErrExt<T> {
    fn boxed(self) -> Result<T, abusemesh_util_error::BoxedError>;
}

impl<T, E> BoxedErrExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn boxed(self) -> Result<T, abusemesh_util_error::BoxedError> {
        self.map_err(|e| Box::new(e) as abusemesh_util_error::BoxedError)
    }
}

#[cfg(test)]
mod tests {
    use bincode::{Decode, Encode};
    use tokio::io::duplex;

    use super::*;

    #[derive(Encode, Decode)]
    struct PingRequest(u64);
    #[derive(Encode, Decode)]
    struct PingResponse(u64);

    impl RpcRequest for PingRequest {
        const RPC_ID: RpcId = RpcId::Ping;
        type Response = PingResponse;
    }

    #[tokio::test]
    async fn frames_and_unframes_a_round_trip() {
        let (client_stream, mut server_stream) = duplex(4096);
        let client = Connection::new(client_stream);

        let server = tokio::spawn(async move {
            let (rpc_id, body) = read_framed_request(&mut server_stream).await.unwrap();
            assert_eq!(rpc_id, RpcId::Ping);
            let req: PingRequest = decode_request_body(&body).unwrap();
            write_framed_response(&mut server_stream, &PingResponse(req.0 + 1))
                .await
                .unwrap();
        });

        let resp = client.rpc(&PingRequest(41)).await.unwrap();
        assert_eq!(resp.0, 42);
        server.await.unwrap();
    }
}
