//! The authoritative in-memory-over-redb projection: six sub-tables keyed
//! by their natural id, mutated only by folding accepted events.
//!
//! The TableSet attaches to an [`crate::EventStream`] as an
//! [`crate::event_stream::EventObserver`], but the observer callback only
//! enqueues an `UpdateTable` request rather than touching redb directly —
//! processing happens on the TableSet's own worker task, avoiding a
//! circular ownership between the two workers. The request/reply shape is
//! a single serializing worker reached through `tokio::sync::mpsc` plus
//! `oneshot` reply channels.

use std::sync::Arc;

use abusemesh_core::{
    DelistAcceptance, DelistRequest, Event, EventPayload, Neighbor, Node, NodeId, Report,
    ReportConfirmation, ReportId, UpdateKind,
};
use abusemesh_util_error::AsFmtCompact as _;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::event_stream::EventObserver;
use crate::{tables, Database, DbResult};

const LOG_TARGET: &str = "abusemesh::db::table_set";

/// Forwards `rows` over `out` one at a time, stopping early either if the
/// receiver is gone or `cancel` fires mid-stream — mirroring the Go
/// reference's per-row `req.Context.Err()` check in `GetAllNodesRequest`.
async fn send_rows<V>(out: mpsc::Sender<V>, cancel: &CancellationToken, rows: Vec<V>) {
    for row in rows {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = out.send(row) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
}

/// One request variant per supported operation. `UpdateTable` is also
/// what the EventStream observer callback enqueues.
pub enum TableRequest {
    GetNode(NodeId, oneshot::Sender<Option<Node>>),
    /// `cancel` mirrors the Go reference's `GetAllNodesRequest.Context`:
    /// checked between rows so a caller that no longer wants the stream
    /// can stop it without closing its receiver.
    GetAllNodes(mpsc::Sender<Node>, CancellationToken),
    GetReport(ReportId, oneshot::Sender<Option<Report>>),
    GetAllReports(mpsc::Sender<Report>, CancellationToken),
    GetNeighbor(NodeId, NodeId, oneshot::Sender<Option<Neighbor>>),
    GetAllNeighbors(mpsc::Sender<Neighbor>, CancellationToken),
    GetReportConfirmation(
        ReportId,
        NodeId,
        oneshot::Sender<Option<ReportConfirmation>>,
    ),
    GetAllReportConfirmations(mpsc::Sender<ReportConfirmation>, CancellationToken),
    GetDelistRequest(ReportId, NodeId, oneshot::Sender<Option<DelistRequest>>),
    GetAllDelistRequests(mpsc::Sender<DelistRequest>, CancellationToken),
    GetDelistAcceptance(ReportId, NodeId, oneshot::Sender<Option<DelistAcceptance>>),
    GetAllDelistAcceptances(mpsc::Sender<DelistAcceptance>, CancellationToken),
    /// A point-in-time clone of the node table, for
    /// [`crate::validator::NodeSnapshot`] refresh.
    GetNodeSnapshot(oneshot::Sender<std::collections::HashMap<NodeId, Node>>),
    /// The set of known report ids, for
    /// [`crate::validator::ReportSnapshot`] refresh.
    GetReportIdSnapshot(oneshot::Sender<std::collections::HashSet<ReportId>>),
    UpdateTable(Event),
}

/// A cloneable send-only handle onto the TableSet's request channel.
#[derive(Clone)]
pub struct TableSetHandle {
    tx: mpsc::Sender<TableRequest>,
}

impl TableSetHandle {
    pub async fn get_node(&self, id: NodeId) -> Option<Node> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(TableRequest::GetNode(id, reply_tx)).await.is_err() {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    pub async fn get_report(&self, id: ReportId) -> Option<Report> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(TableRequest::GetReport(id, reply_tx)).await.is_err() {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    pub async fn get_neighbor(&self, a: NodeId, b: NodeId) -> Option<Neighbor> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(TableRequest::GetNeighbor(a, b, reply_tx)).await.is_err() {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    pub async fn get_node_snapshot(&self) -> std::collections::HashMap<NodeId, Node> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(TableRequest::GetNodeSnapshot(reply_tx)).await.is_err() {
            return Default::default();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn get_report_id_snapshot(&self) -> std::collections::HashSet<ReportId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(TableRequest::GetReportIdSnapshot(reply_tx)).await.is_err() {
            return Default::default();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn get_all_nodes(&self, cancel: CancellationToken) -> Vec<Node> {
        self.collect_all(cancel, TableRequest::GetAllNodes).await
    }

    pub async fn get_all_reports(&self, cancel: CancellationToken) -> Vec<Report> {
        self.collect_all(cancel, TableRequest::GetAllReports).await
    }

    pub async fn get_all_neighbors(&self, cancel: CancellationToken) -> Vec<Neighbor> {
        self.collect_all(cancel, TableRequest::GetAllNeighbors).await
    }

    pub async fn get_all_report_confirmations(&self, cancel: CancellationToken) -> Vec<ReportConfirmation> {
        self.collect_all(cancel, TableRequest::GetAllReportConfirmations).await
    }

    pub async fn get_all_delist_requests(&self, cancel: CancellationToken) -> Vec<DelistRequest> {
        self.collect_all(cancel, TableRequest::GetAllDelistRequests).await
    }

    pub async fn get_all_delist_acceptances(&self, cancel: CancellationToken) -> Vec<DelistAcceptance> {
        self.collect_all(cancel, TableRequest::GetAllDelistAcceptances).await
    }

    async fn collect_all<V: Send + 'static>(
        &self,
        cancel: CancellationToken,
        variant: impl FnOnce(mpsc::Sender<V>, CancellationToken) -> TableRequest,
    ) -> Vec<V> {
        let (out_tx, mut out_rx) = mpsc::channel(64);
        if self.tx.send(variant(out_tx, cancel)).await.is_err() {
            return Vec::new();
        }
        let mut rows = Vec::new();
        while let Some(row) = out_rx.recv().await {
            rows.push(row);
        }
        rows
    }

    /// Enqueues `event` for folding. This is what an [`EventObserver`]
    /// attached to the [`crate::EventStream`] calls — it never touches
    /// redb directly.
    pub async fn update(&self, event: Event) {
        let _ = self.tx.send(TableRequest::UpdateTable(event)).await;
    }

    /// The [`EventObserver`] impl handed to [`crate::EventStream::attach`].
    pub fn as_observer(&self) -> Arc<dyn EventObserver> {
        Arc::new(TableSetObserver { tx: self.tx.clone() })
    }
}

struct TableSetObserver {
    tx: mpsc::Sender<TableRequest>,
}

impl EventObserver for TableSetObserver {
    fn event_accepted(&self, event: &Event) {
        let tx = self.tx.clone();
        let event = event.clone();
        // try_send, not a blocking await: the observer contract requires
        // this callback to never block. A full request channel here means
        // the TableSet worker is falling behind; drop and log rather than
        // stall the EventStream worker.
        if let Err(err) = tx.try_send(TableRequest::UpdateTable(event)) {
            warn!(target: LOG_TARGET, err = %err.fmt_compact(), "table set request channel full, dropping update enqueue");
        }
    }
}

/// The TableSet worker. Owns exclusive access to the six projection
/// tables; no external lock is needed because every mutation and read
/// goes through this single task.
pub struct TableSet {
    db: Arc<Database>,
    rx: mpsc::Receiver<TableRequest>,
}

impl TableSet {
    /// `channel_capacity` defaults to 1000. Returns the worker plus a
    /// [`TableSetHandle`] to enqueue requests with.
    pub fn new(db: Arc<Database>, channel_capacity: usize) -> (Self, TableSetHandle) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        (Self { db, rx }, TableSetHandle { tx })
    }

    #[instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return,
                request = self.rx.recv() => {
                    match request {
                        Some(request) => request,
                        None => return,
                    }
                }
            };

            if let Err(err) = self.handle(request).await {
                error!(target: LOG_TARGET, err = %err.fmt_compact(), "table set storage error");
            }
        }
    }

    async fn handle(&self, request: TableRequest) -> DbResult<()> {
        match request {
            TableRequest::GetNode(id, reply) => {
                let node = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::nodes::TABLE)?;
                        Ok(t.get(&id)?.map(|g| g.value()))
                    })
                    .await?;
                let _ = reply.send(node);
            }
            TableRequest::GetAllNodes(out, cancel) => {
                let rows = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::nodes::TABLE)?;
                        let mut rows = Vec::new();
                        for r in t.range(..)? {
                            if cancel.is_cancelled() {
                                break;
                            }
                            rows.push(r?.1.value());
                        }
                        Ok(rows)
                    })
                    .await?;
                send_rows(out, &cancel, rows).await;
            }
            TableRequest::GetReport(id, reply) => {
                let report = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::reports::TABLE)?;
                        Ok(t.get(&id)?.map(|g| g.value()))
                    })
                    .await?;
                let _ = reply.send(report);
            }
            TableRequest::GetAllReports(out, cancel) => {
                let rows = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::reports::TABLE)?;
                        let mut rows = Vec::new();
                        for r in t.range(..)? {
                            if cancel.is_cancelled() {
                                break;
                            }
                            rows.push(r?.1.value());
                        }
                        Ok(rows)
                    })
                    .await?;
                send_rows(out, &cancel, rows).await;
            }
            TableRequest::GetNeighbor(a, b, reply) => {
                let key = tables::neighbor_key(a, b);
                let neighbor = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::neighbors::TABLE)?;
                        Ok(t.get(&key)?.map(|g| g.value()))
                    })
                    .await?;
                let _ = reply.send(neighbor);
            }
            TableRequest::GetAllNeighbors(out, cancel) => {
                let rows = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::neighbors::TABLE)?;
                        let mut rows = Vec::new();
                        for r in t.range(..)? {
                            if cancel.is_cancelled() {
                                break;
                            }
                            rows.push(r?.1.value());
                        }
                        Ok(rows)
                    })
                    .await?;
                send_rows(out, &cancel, rows).await;
            }
            TableRequest::GetReportConfirmation(report, node, reply) => {
                let key = (report, node);
                let row = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::report_confirmations::TABLE)?;
                        Ok(t.get(&key)?.map(|g| g.value()))
                    })
                    .await?;
                let _ = reply.send(row);
            }
            TableRequest::GetAllReportConfirmations(out, cancel) => {
                let rows = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::report_confirmations::TABLE)?;
                        let mut rows = Vec::new();
                        for r in t.range(..)? {
                            if cancel.is_cancelled() {
                                break;
                            }
                            rows.push(r?.1.value());
                        }
                        Ok(rows)
                    })
                    .await?;
                send_rows(out, &cancel, rows).await;
            }
            TableRequest::GetDelistRequest(report, node, reply) => {
                let key = (report, node);
                let row = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::delist_requests::TABLE)?;
                        Ok(t.get(&key)?.map(|g| g.value()))
                    })
                    .await?;
                let _ = reply.send(row);
            }
            TableRequest::GetAllDelistRequests(out, cancel) => {
                let rows = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::delist_requests::TABLE)?;
                        let mut rows = Vec::new();
                        for r in t.range(..)? {
                            if cancel.is_cancelled() {
                                break;
                            }
                            rows.push(r?.1.value());
                        }
                        Ok(rows)
                    })
                    .await?;
                send_rows(out, &cancel, rows).await;
            }
            TableRequest::GetDelistAcceptance(report, node, reply) => {
                let key = (report, node);
                let row = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::delist_acceptances::TABLE)?;
                        Ok(t.get(&key)?.map(|g| g.value()))
                    })
                    .await?;
                let _ = reply.send(row);
            }
            TableRequest::GetAllDelistAcceptances(out, cancel) => {
                let rows = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::delist_acceptances::TABLE)?;
                        let mut rows = Vec::new();
                        for r in t.range(..)? {
                            if cancel.is_cancelled() {
                                break;
                            }
                            rows.push(r?.1.value());
                        }
                        Ok(rows)
                    })
                    .await?;
                send_rows(out, &cancel, rows).await;
            }
            TableRequest::GetNodeSnapshot(reply) => {
                let snapshot = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::nodes::TABLE)?;
                        t.range(..)?
                            .map(|r| {
                                let (k, v) = r?;
                                Ok((k.value(), v.value()))
                            })
                            .collect::<DbResult<std::collections::HashMap<_, _>>>()
                    })
                    .await?;
                let _ = reply.send(snapshot);
            }
            TableRequest::GetReportIdSnapshot(reply) => {
                let ids = self
                    .db
                    .read_with(|tx| {
                        let t = tx.open_table(&tables::reports::TABLE)?;
                        t.range(..)?
                            .map(|r| Ok(r?.0.value()))
                            .collect::<DbResult<std::collections::HashSet<_>>>()
                    })
                    .await?;
                let _ = reply.send(ids);
            }
            TableRequest::UpdateTable(event) => self.apply(event).await?,
        }
        Ok(())
    }

    /// Dispatches one accepted event to the table projection it targets,
    /// with NEW/EDIT/DELETE fold semantics.
    async fn apply(&self, event: Event) -> DbResult<()> {
        self.db
            .write_with(|tx| {
                match (&event.kind, &event.payload) {
                    (UpdateKind::New | UpdateKind::Edit, EventPayload::Node(node)) => {
                        let mut t = tx.open_table(&tables::nodes::TABLE)?;
                        t.insert(&node.id, node)?;
                    }
                    (UpdateKind::Delete, EventPayload::Node(node)) => {
                        let mut t = tx.open_table(&tables::nodes::TABLE)?;
                        t.remove(&node.id)?;
                    }
                    (UpdateKind::New | UpdateKind::Edit, EventPayload::Report(report)) => {
                        let mut t = tx.open_table(&tables::reports::TABLE)?;
                        t.insert(&report.id, report)?;
                    }
                    (UpdateKind::Delete, EventPayload::Report(report)) => {
                        let mut t = tx.open_table(&tables::reports::TABLE)?;
                        t.remove(&report.id)?;
                    }
                    (UpdateKind::New | UpdateKind::Edit, EventPayload::Neighbor(neighbor)) => {
                        let key = tables::neighbor_key(neighbor.node_a, neighbor.node_b);
                        let mut t = tx.open_table(&tables::neighbors::TABLE)?;
                        t.insert(&key, neighbor)?;
                    }
                    (UpdateKind::Delete, EventPayload::Neighbor(neighbor)) => {
                        let key = tables::neighbor_key(neighbor.node_a, neighbor.node_b);
                        let mut t = tx.open_table(&tables::neighbors::TABLE)?;
                        t.remove(&key)?;
                    }
                    (
                        UpdateKind::New | UpdateKind::Edit,
                        EventPayload::ReportConfirmation(confirmation),
                    ) => {
                        let key = (confirmation.report, confirmation.issuing_node);
                        let mut t = tx.open_table(&tables::report_confirmations::TABLE)?;
                        t.insert(&key, confirmation)?;
                    }
                    (UpdateKind::Delete, EventPayload::ReportConfirmation(confirmation)) => {
                        let key = (confirmation.report, confirmation.issuing_node);
                        let mut t = tx.open_table(&tables::report_confirmations::TABLE)?;
                        t.remove(&key)?;
                    }
                    (
                        UpdateKind::New | UpdateKind::Edit,
                        EventPayload::DelistRequest(request),
                    ) => {
                        let key = (request.report, request.issuing_node);
                        let mut t = tx.open_table(&tables::delist_requests::TABLE)?;
                        t.insert(&key, request)?;
                    }
                    (UpdateKind::Delete, EventPayload::DelistRequest(request)) => {
                        let key = (request.report, request.issuing_node);
                        let mut t = tx.open_table(&tables::delist_requests::TABLE)?;
                        t.remove(&key)?;
                    }
                    (
                        UpdateKind::New | UpdateKind::Edit,
                        EventPayload::DelistAcceptance(acceptance),
                    ) => {
                        let key = (acceptance.report, acceptance.issuing_node);
                        let mut t = tx.open_table(&tables::delist_acceptances::TABLE)?;
                        t.insert(&key, acceptance)?;
                    }
                    (UpdateKind::Delete, EventPayload::DelistAcceptance(acceptance)) => {
                        let key = (acceptance.report, acceptance.issuing_node);
                        let mut t = tx.open_table(&tables::delist_acceptances::TABLE)?;
                        t.remove(&key)?;
                    }
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use abusemesh_core::node::{AddrFamily, ContactDetails, PgpEntity};

    use super::*;

    fn sample_node(id: NodeId, addr: &str) -> Node {
        Node::builder()
            .id(id)
            .protocol_version("1".to_string())
            .listen_addr_family(AddrFamily::IPv4)
            .listen_addr(addr.to_string())
            .contact_details(ContactDetails::default())
            .asn(65000)
            .pgp_entity(PgpEntity {
                packets: vec![0; 32],
                primary_key_id: 0,
                fingerprint: [0; 20],
            })
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn folds_new_edit_delete() {
        let db = Arc::new(Database::new_in_memory().await.expect("open"));
        let (worker, handle) = TableSet::new(db, 16);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(worker.run(cancel.clone()));

        let node_id = NodeId::new();

        let new_event = Event::builder()
            .kind(UpdateKind::New)
            .payload(EventPayload::Node(sample_node(node_id, "127.0.0.1:9000")))
            .build();
        handle.update(new_event).await;

        let edit_event = Event::builder()
            .kind(UpdateKind::Edit)
            .payload(EventPayload::Node(sample_node(node_id, "127.0.0.1:9001")))
            .build();
        handle.update(edit_event).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let after_edit = handle.get_node(node_id).await.expect("present");
        assert_eq!(after_edit.listen_addr, "127.0.0.1:9001");

        let delete_event = Event::builder()
            .kind(UpdateKind::Delete)
            .payload(EventPayload::Node(sample_node(node_id, "127.0.0.1:9001")))
            .build();
        handle.update(delete_event).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(handle.get_node(node_id).await.is_none());

        cancel.cancel();
        join.await.expect("worker join");
    }
}
