//! The append-only, deduplicated, observable event log.
//!
//! A single worker task owns the log: a bounded write channel as ingress, a
//! read-write-locked event map, and a mutex-guarded observer list that is
//! never invoked while holding the event map's write lock.

use std::collections::HashMap;
use std::sync::Arc;

use abusemesh_core::Event;
use abusemesh_util_error::AsFmtCompact as _;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::validator::{validate, NodeSnapshot, ReportSnapshot};
use crate::{tables, Database, DbResult};

const LOG_TARGET: &str = "abusemesh::db::event_stream";

/// Registered by [`crate::TableSet`] (and by `abusemesh-session`'s
/// `ServerSession`s) to receive each newly accepted event exactly once.
/// MUST be non-blocking: the EventStream worker invokes every observer
/// while holding the observer-list mutex, so an observer is required to
/// only hand the event off through a channel or enqueue a request.
pub trait EventObserver: Send + Sync {
    fn event_accepted(&self, event: &Event);
}

impl<F: Fn(&Event) + Send + Sync> EventObserver for F {
    fn event_accepted(&self, event: &Event) {
        self(event)
    }
}

struct Observers(Mutex<Vec<(u64, Arc<dyn EventObserver>)>>);

impl Observers {
    fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }
}

/// An append-only, deduplicated, observable log of validated events. The
/// worker loop owned by [`EventStream::run`] is the sole writer to the
/// underlying `events`/`events_order` tables.
pub struct EventStream {
    db: Arc<Database>,
    write_tx: mpsc::Sender<Event>,
    write_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    observers: Observers,
    next_observer_id: std::sync::atomic::AtomicU64,
    node_snapshot: RwLock<NodeSnapshot>,
    report_snapshot: RwLock<ReportSnapshot>,
    verifier: Box<dyn abusemesh_core::SignatureVerifier + Send + Sync>,
}

impl EventStream {
    /// `channel_capacity` is the bounded write channel's capacity, default
    /// 1000.
    pub fn new(
        db: Arc<Database>,
        channel_capacity: usize,
        verifier: impl abusemesh_core::SignatureVerifier + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(channel_capacity);
        Arc::new(Self {
            db,
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            observers: Observers::new(),
            next_observer_id: std::sync::atomic::AtomicU64::new(0),
            node_snapshot: RwLock::new(NodeSnapshot::default()),
            report_snapshot: RwLock::new(ReportSnapshot::default()),
            verifier: Box::new(verifier),
        })
    }

    /// A send-only handle onto the bounded write channel. Senders block
    /// when the channel is full; this is the mesh's primary backpressure
    /// signal.
    pub fn write_channel(&self) -> mpsc::Sender<Event> {
        self.write_tx.clone()
    }

    /// Replaces the node-table snapshot the validator checks issuer
    /// signatures against. Call this periodically from whoever owns the
    /// real `TableSet`.
    pub async fn refresh_node_snapshot(&self, snapshot: NodeSnapshot) {
        *self.node_snapshot.write().await = snapshot;
    }

    /// Replaces the known-report-id snapshot the validator checks
    /// confirmation/delist foreign-key preconditions against. Call this
    /// periodically from whoever owns the real `TableSet`.
    pub async fn refresh_report_snapshot(&self, snapshot: ReportSnapshot) {
        *self.report_snapshot.write().await = snapshot;
    }

    /// Registers `observer`; returns a token usable with [`Self::detach`].
    pub async fn attach(&self, observer: Arc<dyn EventObserver>) -> u64 {
        let id = self
            .next_observer_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.observers.0.lock().await.push((id, observer));
        id
    }

    pub async fn detach(&self, id: u64) {
        self.observers.0.lock().await.retain(|(oid, _)| *oid != id);
    }

    /// A point-in-time snapshot of every accepted event. Ordering is
    /// unspecified; callers needing acceptance order should use
    /// [`Self::attach`] or [`Self::get_events_from`].
    pub async fn get_all_events(&self) -> DbResult<Vec<Event>> {
        self.db
            .read_with(|tx| {
                let table = tx.open_table(&tables::events::TABLE)?;
                let mut out = Vec::new();
                for row in table.range(..)? {
                    let (_, v) = row?;
                    out.push(v.value());
                }
                Ok(out)
            })
            .await
    }

    /// Every event accepted at or after acceptance-order position `offset`,
    /// in acceptance order: skips the first `offset` accepted events, then
    /// streams the remaining ones.
    pub async fn get_events_from(&self, offset: u64) -> DbResult<Vec<Event>> {
        self.db
            .read_with(move |tx| {
                let order_table = tx.open_table(&tables::events_order::TABLE)?;
                let events_table = tx.open_table(&tables::events::TABLE)?;
                let mut out = Vec::new();
                for row in order_table.range(offset..)? {
                    let (_, event_id) = row?;
                    let event_id = event_id.value();
                    if let Some(event) = events_table.get(&event_id)? {
                        out.push(event.value());
                    }
                }
                Ok(out)
            })
            .await
    }

    /// The worker loop. Runs until `cancel` fires or the write channel's
    /// last sender is dropped.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut write_rx = self
            .write_rx
            .lock()
            .await
            .take()
            .expect("run() called more than once");

        loop {
            let candidate = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target: LOG_TARGET, "event stream cancelled");
                    return;
                }
                candidate = write_rx.recv() => {
                    match candidate {
                        Some(event) => event,
                        None => {
                            debug!(target: LOG_TARGET, "write channel closed");
                            return;
                        }
                    }
                }
            };

            if let Err(err) = self.accept(candidate).await {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "event stream storage error");
            }
        }
    }

    async fn accept(&self, event: Event) -> DbResult<()> {
        let snapshot = self.node_snapshot.read().await;
        let reports = self.report_snapshot.read().await;
        if let Err(reason) = validate(&event, &snapshot, &reports, self.verifier.as_ref()) {
            info!(target: LOG_TARGET, event_id = %event.id, %reason, "invalid event discarded");
            return Ok(());
        }
        drop(snapshot);
        drop(reports);

        let inserted = self
            .db
            .write_with(|tx| {
                let mut events_table = tx.open_table(&tables::events::TABLE)?;
                if events_table.get(&event.id)?.is_some() {
                    return Ok(false);
                }
                events_table.insert(&event.id, &event)?;

                let mut counter_table = tx.open_table(&tables::events_order_counter::TABLE)?;
                let next = counter_table.get(&())?.map(|g| g.value()).unwrap_or(0);
                let mut order_table = tx.open_table(&tables::events_order::TABLE)?;
                order_table.insert(&next, &event.id)?;
                counter_table.insert(&(), &(next + 1))?;

                Ok(true)
            })
            .await?;

        if !inserted {
            info!(target: LOG_TARGET, event_id = %event.id, "duplicate event discarded");
            return Ok(());
        }

        for (_, observer) in self.observers.0.lock().await.iter() {
            observer.event_accepted(&event);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use abusemesh_core::node::{AddrFamily, ContactDetails};
    use abusemesh_core::report::SuspectResource;
    use abusemesh_core::signing::{Ed25519Signer, Ed25519Verifier};
    use abusemesh_core::{EventPayload, Node, Report, SigningProvider as _, UpdateKind};
    use rand::rngs::OsRng;

    use super::*;

    async fn new_stream() -> (Arc<EventStream>, Ed25519Signer, Node) {
        let db = Arc::new(Database::new_in_memory().await.expect("open"));
        let stream = EventStream::new(db, 16, Ed25519Verifier);
        let signer = Ed25519Signer::generate(&mut OsRng);
        let node_id = abusemesh_core::NodeId::new();
        let mut node = Node::builder()
            .id(node_id)
            .protocol_version("1".to_string())
            .listen_addr_family(AddrFamily::IPv4)
            .listen_addr("127.0.0.1:9000".to_string())
            .contact_details(ContactDetails::default())
            .asn(65000)
            .pgp_entity(signer.pgp_entity())
            .build();
        node.signature = signer.sign(&node.canonical_bytes());

        let mut snapshot = HashMap::new();
        snapshot.insert(node_id, node.clone());
        stream.refresh_node_snapshot(NodeSnapshot::new(snapshot)).await;

        (stream, signer, node)
    }

    fn report_event(signer: &Ed25519Signer, issuing_node: abusemesh_core::NodeId) -> Event {
        let mut report = Report::builder()
            .id(abusemesh_core::ReportId::new())
            .issuing_node(issuing_node)
            .suspect_resource_type(SuspectResource::IPRange)
            .suspect_identifier("203.0.113.0/24".to_string())
            .abuse_type("spam".to_string())
            .build();
        report.signature = signer.sign(&report.canonical_bytes());
        Event::builder()
            .kind(UpdateKind::New)
            .payload(EventPayload::Report(report))
            .build()
    }

    #[test_log::test(tokio::test)]
    async fn accepts_then_deduplicates() {
        let (stream, signer, node) = new_stream().await;
        let cancel = CancellationToken::new();
        let run_handle = tokio::spawn(stream.clone().run(cancel.clone()));

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        stream
            .attach(Arc::new(move |_: &Event| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let event = report_event(&signer, node.id);
        let tx = stream.write_channel();
        tx.send(event.clone()).await.expect("send");
        tx.send(event.clone()).await.expect("send dup");

        // let the worker drain both sends
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let all = stream.get_all_events().await.expect("events");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, event.id);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        cancel.cancel();
        run_handle.await.expect("worker join");
    }

    #[test_log::test(tokio::test)]
    async fn invalid_event_is_discarded() {
        let (stream, _signer, _node) = new_stream().await;
        let cancel = CancellationToken::new();
        let run_handle = tokio::spawn(stream.clone().run(cancel.clone()));

        let unsigned = report_event(&Ed25519Signer::generate(&mut OsRng), abusemesh_core::NodeId::new());
        stream.write_channel().send(unsigned).await.expect("send");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(stream.get_all_events().await.expect("events").is_empty());

        cancel.cancel();
        run_handle.await.expect("worker join");
    }

    #[test_log::test(tokio::test)]
    async fn cross_observer_ordering() {
        let (stream, signer, node) = new_stream().await;
        let cancel = CancellationToken::new();
        let run_handle = tokio::spawn(stream.clone().run(cancel.clone()));

        let seen_a = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_b = Arc::new(std::sync::Mutex::new(Vec::new()));
        for seen in [seen_a.clone(), seen_b.clone()] {
            stream
                .attach(Arc::new(move |e: &Event| {
                    seen.lock().expect("lock").push(e.id);
                }))
                .await;
        }

        let e1 = report_event(&signer, node.id);
        let e2 = report_event(&signer, node.id);
        let tx = stream.write_channel();
        tx.send(e1.clone()).await.expect("send e1");
        tx.send(e2.clone()).await.expect("send e2");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(*seen_a.lock().expect("lock"), vec![e1.id, e2.id]);
        assert_eq!(*seen_b.lock().expect("lock"), vec![e1.id, e2.id]);

        cancel.cancel();
        run_handle.await.expect("worker join");
    }

    #[test_log::test(tokio::test)]
    async fn replays_events_from_offset() {
        let (stream, signer, node) = new_stream().await;
        let cancel = CancellationToken::new();
        let run_handle = tokio::spawn(stream.clone().run(cancel.clone()));

        let tx = stream.write_channel();
        let events: Vec<Event> = (0..3).map(|_| report_event(&signer, node.id)).collect();
        for event in &events {
            tx.send(event.clone()).await.expect("send");
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let replayed = stream.get_events_from(1).await.expect("replay");
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id, events[1].id);
        assert_eq!(replayed[1].id, events[2].id);

        cancel.cancel();
        run_handle.await.expect("worker join");
    }
}
