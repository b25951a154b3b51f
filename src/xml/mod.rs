//! XML importer/exporter contract: the wire format itself is treated as
//! an external collaborator, with only round-trip equality on canonical
//! fields prescribed; [`XmlCodec`] is that contract,
//! [`identity_xml::QuickXmlCodec`] the concrete implementation.

pub mod identity_xml;

use crate::error::WotResult;
use crate::ids::Id;
use crate::model::identity::{Context, Identity, Nickname};
use crate::model::IntroductionPuzzle;
use chrono::NaiveDate;

pub use identity_xml::QuickXmlCodec;

/// The fields of an identity document that round-trip over the wire
///: nickname, publishesTrustList, contexts, properties, and
/// the advertised trust list. Kept separate from [`Identity`] because the
/// store also tracks fields (fetch state, editions, OwnIdentity config)
/// that never appear on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityDocument {
    pub identity: Id,
    pub nickname: Option<Nickname>,
    pub does_publish_trust_list: bool,
    pub contexts: Vec<Context>,
    pub properties: Vec<(String, String)>,
    pub trust_list: Vec<AdvertisedTrust>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisedTrust {
    pub trustee: Id,
    pub value: i32,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PuzzleDocument {
    pub puzzle_type: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub date_of_insertion: NaiveDate,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntroductionSolutionDocument {
    pub puzzle_id: String,
    pub solver_identity: IdentityDocument,
}

/// Wire codec contract. One concrete, production implementation
/// ([`QuickXmlCodec`]) backs the importer; tests may substitute a fake
/// that skips serialization entirely.
pub trait XmlCodec: Send + Sync {
    fn encode_identity(&self, document: &IdentityDocument) -> WotResult<Vec<u8>>;
    fn decode_identity(&self, bytes: &[u8]) -> WotResult<IdentityDocument>;

    fn encode_puzzle(&self, document: &PuzzleDocument) -> WotResult<Vec<u8>>;
    fn decode_puzzle(&self, bytes: &[u8]) -> WotResult<PuzzleDocument>;

    fn encode_introduction_solution(
        &self,
        document: &IntroductionSolutionDocument,
    ) -> WotResult<Vec<u8>>;
    fn decode_introduction_solution(&self, bytes: &[u8]) -> WotResult<IntroductionSolutionDocument>;
}

impl IdentityDocument {
    pub fn from_identity(identity: &Identity, trust_list: Vec<AdvertisedTrust>) -> Self {
        Self {
            identity: identity.id.clone(),
            nickname: identity.nickname.clone(),
            does_publish_trust_list: identity.does_publish_trust_list,
            contexts: identity.contexts.iter().cloned().collect(),
            properties: identity
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            trust_list,
        }
    }
}

impl PuzzleDocument {
    pub fn from_puzzle(puzzle: &IntroductionPuzzle) -> Self {
        Self {
            puzzle_type: "Captcha".to_string(),
            mime_type: puzzle.mime_type.clone(),
            data: puzzle.data.clone(),
            date_of_insertion: puzzle.date_of_insertion,
            index: puzzle.index,
        }
    }
}
