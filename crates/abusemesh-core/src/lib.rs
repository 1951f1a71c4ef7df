pub mod event;
pub mod ids;
pub mod neighbor;
pub mod node;
pub mod report;
pub mod signing;

pub use event::{Event, EventPayload, UpdateKind};
pub use ids::{EventId, NodeId, ReportId, SessionId};
pub use neighbor::Neighbor;
pub use node::{AddrFamily, ContactDetails, ContactPerson, Node, PgpEntity};
pub use report::{AbuseType, DelistAcceptance, DelistRequest, Report, ReportConfirmation, SuspectResource};
pub use signing::{Signature, SignatureVerifier, SigningProvider};
