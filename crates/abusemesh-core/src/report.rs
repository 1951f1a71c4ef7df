//! Report, and the opinions ([`ReportConfirmation`], [`DelistRequest`],
//! [`DelistAcceptance`]) attached to one.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, ReportId};
use crate::signing::Signature;

#[derive(Encode, Decode, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum SuspectResource {
    IPRange,
    DomainName,
    EmailAddress,
}

/// Kept as a free-form string rather than a closed enum: a mesh of
/// independently operated nodes has no single authority to close this set
/// at compile time.
pub type AbuseType = String;

#[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Report {
    pub id: ReportId,
    pub issuing_node: NodeId,
    pub suspect_resource_type: SuspectResource,
    pub suspect_identifier: String,
    pub abuse_type: AbuseType,
    pub signature: Signature,
}

#[bon::bon]
impl Report {
    #[builder]
    pub fn new(
        id: ReportId,
        issuing_node: NodeId,
        suspect_resource_type: SuspectResource,
        suspect_identifier: String,
        abuse_type: AbuseType,
    ) -> Self {
        Self {
            id,
            issuing_node,
            suspect_resource_type,
            suspect_identifier,
            abuse_type,
            signature: Signature::ZERO,
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut zeroed = self.clone();
        zeroed.signature = Signature::ZERO;
        bincode::encode_to_vec(&zeroed, bincode::config::standard())
            .expect("Report always encodes")
    }
}

macro_rules! define_report_opinion {
    ($(#[$outer:meta])* $name:ident) => {
        $(#[$outer])*
        #[derive(Encode, Decode, Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
        pub struct $name {
            pub issuing_node: NodeId,
            pub report: ReportId,
            pub signature: Signature,
        }

        impl $name {
            pub fn new(issuing_node: NodeId, report: ReportId) -> Self {
                Self {
                    issuing_node,
                    report,
                    signature: Signature::ZERO,
                }
            }

            pub fn canonical_bytes(&self) -> Vec<u8> {
                let mut zeroed = self.clone();
                zeroed.signature = Signature::ZERO;
                bincode::encode_to_vec(&zeroed, bincode::config::standard())
                    .expect(concat!(stringify!($name), " always encodes"))
            }
        }
    };
}

define_report_opinion!(
    /// A node vouching that a [`Report`] is accurate.
    ReportConfirmation
);
define_report_opinion!(
    /// A node requesting that a reported resource be delisted.
    DelistRequest
);
define_report_opinion!(
    /// A node accepting a [`DelistRequest`] for a report it issued.
    DelistAcceptance
);
