//! Concrete request/response types for every peer-to-peer and admin RPC
//! call, wired to [`abusemesh_net::RpcId`]/[`abusemesh_net::RpcRequest`].

use abusemesh_core::{
    DelistAcceptance, DelistRequest, Event, Neighbor, Node, NodeId, Report, ReportConfirmation,
    SessionId, Signature,
};
use abusemesh_net::{RpcId, RpcRequest};
use bincode::{Decode, Encode};
use serde::Serialize;

#[derive(Encode, Decode, Debug, Clone, Default)]
pub struct PingRequest;

#[derive(Encode, Decode, Debug, Clone, Default)]
pub struct PingResponse;

impl RpcRequest for PingRequest {
    const RPC_ID: RpcId = RpcId::Ping;
    type Response = PingResponse;
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct GetNodeRequest;

#[derive(Encode, Decode, Debug, Clone)]
pub struct GetNodeResponse {
    pub node: Node,
}

impl RpcRequest for GetNodeRequest {
    const RPC_ID: RpcId = RpcId::GetNode;
    type Response = GetNodeResponse;
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct NegotiateNeighborshipRequest {
    pub requesting_node: NodeId,
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct NegotiateNeighborshipResponse {
    pub session_id: SessionId,
}

impl RpcRequest for NegotiateNeighborshipRequest {
    const RPC_ID: RpcId = RpcId::NegotiateNeighborship;
    type Response = NegotiateNeighborshipResponse;
}

macro_rules! define_table_snapshot_rpc {
    ($req:ident, $resp:ident, $rpc_id:ident, $row:ty) => {
        #[derive(Encode, Decode, Debug, Clone, Default)]
        pub struct $req;

        #[derive(Encode, Decode, Debug, Clone)]
        pub struct $resp {
            pub rows: Vec<$row>,
        }

        impl RpcRequest for $req {
            const RPC_ID: RpcId = RpcId::$rpc_id;
            type Response = $resp;
        }
    };
}

define_table_snapshot_rpc!(GetNodeTableRequest, GetNodeTableResponse, GetNodeTable, Node);
define_table_snapshot_rpc!(
    GetReportTableRequest,
    GetReportTableResponse,
    GetReportTable,
    Report
);
define_table_snapshot_rpc!(
    GetNeighborTableRequest,
    GetNeighborTableResponse,
    GetNeighborTable,
    Neighbor
);
define_table_snapshot_rpc!(
    GetReportConfirmationTableRequest,
    GetReportConfirmationTableResponse,
    GetReportConfirmationTable,
    ReportConfirmation
);
define_table_snapshot_rpc!(
    GetDelistRequestTableRequest,
    GetDelistRequestTableResponse,
    GetDelistRequestTable,
    DelistRequest
);
define_table_snapshot_rpc!(
    GetDelistAcceptanceTableRequest,
    GetDelistAcceptanceTableResponse,
    GetDelistAcceptanceTable,
    DelistAcceptance
);

#[derive(Encode, Decode, Debug, Clone, Default)]
pub struct GetHistoricTableEventsRequest;

#[derive(Encode, Decode, Debug, Clone)]
pub struct GetHistoricTableEventsResponse {
    pub events: Vec<Event>,
}

impl RpcRequest for GetHistoricTableEventsRequest {
    const RPC_ID: RpcId = RpcId::GetHistoricTableEvents;
    type Response = GetHistoricTableEventsResponse;
}

/// Opens a server-push, resumable event stream scoped to `session_id`,
/// starting at `offset` (a per-session delivery count). The framed RPC
/// layer is request/response, not a native server stream, so a
/// `TableEventStream` call is followed by zero or more out-of-band
/// `TableEvent` frames the caller reads directly off the connection;
/// `TableEventStreamResponse` just acknowledges the stream was opened.
///
/// `node_id` identifies the calling client independent of
/// `NegotiateNeighborship` having been called on *this* connection: a
/// reconnect after an `Interrupted` transport error preserves `session_id`
/// (spec requires not renegotiating) but always dials a fresh connection,
/// so the server needs some way to resolve the existing `ServerSession`
/// without a prior `NegotiateNeighborship` on that connection.
#[derive(Encode, Decode, Debug, Clone)]
pub struct TableEventStreamRequest {
    pub node_id: NodeId,
    pub session_id: SessionId,
    pub offset: u64,
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct TableEventStreamResponse {
    pub session_id: SessionId,
}

impl RpcRequest for TableEventStreamRequest {
    const RPC_ID: RpcId = RpcId::TableEventStream;
    type Response = TableEventStreamResponse;
}

/// One event pushed over an opened `TableEventStream`.
#[derive(Encode, Decode, Debug, Clone)]
pub struct TableEvent {
    pub event: Event,
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct OfferSignatureRequest {
    pub subject_node: NodeId,
    pub offering_node: NodeId,
    pub signature: Signature,
}

#[derive(Encode, Decode, Debug, Clone)]
pub struct OfferSignatureResponse {
    pub accepted: bool,
}

impl RpcRequest for OfferSignatureRequest {
    const RPC_ID: RpcId = RpcId::OfferSignature;
    type Response = OfferSignatureResponse;
}

pub mod admin {
    use super::*;

    #[derive(Encode, Decode, Debug, Clone)]
    pub struct GetNodeRequest {
        pub node: NodeId,
    }

    #[derive(Encode, Decode, Serialize, Debug, Clone)]
    pub struct GetNodeResponse {
        pub node: Option<Node>,
    }

    impl RpcRequest for GetNodeRequest {
        const RPC_ID: RpcId = RpcId::AdminGetNode;
        type Response = GetNodeResponse;
    }

    /// Connected clients: the serving-side's `ServerSession`s, by remote
    /// node id.
    #[derive(Encode, Decode, Debug, Clone, Default)]
    pub struct GetClientsRequest;

    #[derive(Encode, Decode, Serialize, Debug, Clone)]
    pub struct ClientSummary {
        pub node: NodeId,
        pub state: String,
        pub event_counter: u64,
    }

    #[derive(Encode, Decode, Serialize, Debug, Clone)]
    pub struct GetClientsResponse {
        pub clients: Vec<ClientSummary>,
    }

    impl RpcRequest for GetClientsRequest {
        const RPC_ID: RpcId = RpcId::AdminGetClients;
        type Response = GetClientsResponse;
    }

    /// Upstream servers: the consuming-side's `ClientSession`s, by remote
    /// node id.
    #[derive(Encode, Decode, Debug, Clone, Default)]
    pub struct GetServersRequest;

    #[derive(Encode, Decode, Serialize, Debug, Clone)]
    pub struct ServerSummary {
        pub node: NodeId,
        pub state: String,
        pub event_counter: u64,
        pub admin_down: bool,
    }

    #[derive(Encode, Decode, Serialize, Debug, Clone)]
    pub struct GetServersResponse {
        pub servers: Vec<ServerSummary>,
    }

    impl RpcRequest for GetServersRequest {
        const RPC_ID: RpcId = RpcId::AdminGetServers;
        type Response = GetServersResponse;
    }
}
