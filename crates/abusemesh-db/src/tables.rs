//! redb table definitions backing the [`crate::TableSet`] projections and
//! the [`crate::EventStream`]'s event map.
//!
//! The `def_table!` macro wraps a `redb_bincode::TableDefinition` per
//! logical table so each table gets its own `Key`/`Value`/`Table` type
//! aliases instead of repeating the generic parameters everywhere.

use abusemesh_core::{
    DelistAcceptance, DelistRequest, Event, EventId, Neighbor, Node, NodeId, Report, ReportId,
    ReportConfirmation,
};

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

def_table! {
    /// Tracks database/schema version for migrations.
    db_version: () => u64
}

// ============================================================================
// EVENT LOG (EventStream's event map)
// ============================================================================

def_table! {
    /// The event map: every accepted event, keyed by id. The EventStream
    /// worker is the sole writer; reads proceed concurrently.
    events: EventId => Event
}

def_table! {
    /// Acceptance-order index: monotonic counter -> EventId, assigned by the
    /// EventStream worker in the order it accepts events. Backs
    /// offset-based replay, resolved as per-session delivery count.
    events_order: u64 => EventId
}

def_table! {
    /// Next value to assign in `events_order`.
    events_order_counter: () => u64
}

// ============================================================================
// TABLESET PROJECTIONS
// ============================================================================

def_table! {
    nodes: NodeId => Node
}

def_table! {
    reports: ReportId => Report
}

def_table! {
    /// Key: the pair of node ids, ordered so `(a, b)` and `(b, a)` refer to
    /// the same peering.
    neighbors: (NodeId, NodeId) => Neighbor
}

def_table! {
    /// Key: (report, issuing node) — a report may receive confirmations
    /// from more than one node.
    report_confirmations: (ReportId, NodeId) => ReportConfirmation
}

def_table! {
    delist_requests: (ReportId, NodeId) => DelistRequest
}

def_table! {
    delist_acceptances: (ReportId, NodeId) => DelistAcceptance
}

/// Canonicalizes a [`Neighbor`]'s key so `(a, b)` and `(b, a)` collide.
pub fn neighbor_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b { (a, b) } else { (b, a) }
}
