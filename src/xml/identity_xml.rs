//! `quick-xml`-backed implementation of [`XmlCodec`]. `quick-xml`'s
//! `serialize` feature composes directly with `serde`, which is the
//! ecosystem-standard way to do this (see DESIGN.md).

use super::{
    AdvertisedTrust, IdentityDocument, IntroductionSolutionDocument, PuzzleDocument, XmlCodec,
};
use crate::error::{WotError, WotResult};
use crate::ids::Id;
use crate::model::identity::{Context, Nickname};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "Identity")]
struct WireIdentity {
    id: String,
    nickname: Option<String>,
    #[serde(rename = "doesPublishTrustList")]
    does_publish_trust_list: bool,
    #[serde(default, rename = "Context")]
    contexts: Vec<String>,
    #[serde(default, rename = "Property")]
    properties: Vec<WireProperty>,
    #[serde(default, rename = "Trust")]
    trust_list: Vec<WireTrust>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireProperty {
    name: String,
    #[serde(rename = "$text")]
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTrust {
    trustee: String,
    value: i32,
    #[serde(default)]
    comment: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "IntroductionPuzzle")]
struct WirePuzzle {
    #[serde(rename = "type")]
    puzzle_type: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
    #[serde(rename = "dateOfInsertion")]
    date_of_insertion: String,
    index: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "IntroductionSolution")]
struct WireSolution {
    #[serde(rename = "puzzleId")]
    puzzle_id: String,
    solver: WireIdentity,
}

fn xml_error(context: &str, err: impl std::fmt::Display) -> WotError {
    WotError::CorruptedData(format!("{context}: {err}"))
}

pub struct QuickXmlCodec;

impl QuickXmlCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for QuickXmlCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn to_wire_identity(document: &IdentityDocument) -> WireIdentity {
    WireIdentity {
        id: document.identity.as_str().to_string(),
        nickname: document.nickname.as_ref().map(|n| n.as_str().to_string()),
        does_publish_trust_list: document.does_publish_trust_list,
        contexts: document.contexts.iter().map(|c| c.as_str().to_string()).collect(),
        properties: document
            .properties
            .iter()
            .map(|(name, value)| WireProperty {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
        trust_list: document
            .trust_list
            .iter()
            .map(|t| WireTrust {
                trustee: t.trustee.as_str().to_string(),
                value: t.value,
                comment: t.comment.clone(),
            })
            .collect(),
    }
}

fn from_wire_identity(wire: WireIdentity) -> WotResult<IdentityDocument> {
    let identity = Id::parse(wire.id).map_err(|e| xml_error("identity id", e))?;
    let nickname = wire
        .nickname
        .map(Nickname::parse)
        .transpose()
        .map_err(|e| xml_error("nickname", e))?;
    let contexts = wire
        .contexts
        .into_iter()
        .map(Context::parse)
        .collect::<WotResult<Vec<_>>>()
        .map_err(|e| xml_error("context", e))?;
    let trust_list = wire
        .trust_list
        .into_iter()
        .map(|t| -> WotResult<AdvertisedTrust> {
            Ok(AdvertisedTrust {
                trustee: Id::parse(t.trustee).map_err(|e| xml_error("trustee id", e))?,
                value: t.value,
                comment: t.comment,
            })
        })
        .collect::<WotResult<Vec<_>>>()?;

    Ok(IdentityDocument {
        identity,
        nickname,
        does_publish_trust_list: wire.does_publish_trust_list,
        contexts,
        properties: wire.properties.into_iter().map(|p| (p.name, p.value)).collect(),
        trust_list,
    })
}

impl XmlCodec for QuickXmlCodec {
    fn encode_identity(&self, document: &IdentityDocument) -> WotResult<Vec<u8>> {
        let wire = to_wire_identity(document);
        let xml = quick_xml::se::to_string(&wire).map_err(|e| xml_error("encoding identity", e))?;
        Ok(xml.into_bytes())
    }

    fn decode_identity(&self, bytes: &[u8]) -> WotResult<IdentityDocument> {
        let text = std::str::from_utf8(bytes).map_err(|e| xml_error("decoding identity utf8", e))?;
        let wire: WireIdentity =
            quick_xml::de::from_str(text).map_err(|e| xml_error("parsing identity xml", e))?;
        from_wire_identity(wire)
    }

    fn encode_puzzle(&self, document: &PuzzleDocument) -> WotResult<Vec<u8>> {
        use base64::Engine;
        let wire = WirePuzzle {
            puzzle_type: document.puzzle_type.clone(),
            mime_type: document.mime_type.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(&document.data),
            date_of_insertion: document.date_of_insertion.to_string(),
            index: document.index,
        };
        let xml = quick_xml::se::to_string(&wire).map_err(|e| xml_error("encoding puzzle", e))?;
        Ok(xml.into_bytes())
    }

    fn decode_puzzle(&self, bytes: &[u8]) -> WotResult<PuzzleDocument> {
        use base64::Engine;
        let text = std::str::from_utf8(bytes).map_err(|e| xml_error("decoding puzzle utf8", e))?;
        let wire: WirePuzzle =
            quick_xml::de::from_str(text).map_err(|e| xml_error("parsing puzzle xml", e))?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(wire.data)
            .map_err(|e| xml_error("puzzle data base64", e))?;
        let date_of_insertion = NaiveDate::parse_from_str(&wire.date_of_insertion, "%Y-%m-%d")
            .map_err(|e| xml_error("dateOfInsertion", e))?;
        Ok(PuzzleDocument {
            puzzle_type: wire.puzzle_type,
            mime_type: wire.mime_type,
            data,
            date_of_insertion,
            index: wire.index,
        })
    }

    fn encode_introduction_solution(
        &self,
        document: &IntroductionSolutionDocument,
    ) -> WotResult<Vec<u8>> {
        let wire = WireSolution {
            puzzle_id: document.puzzle_id.clone(),
            solver: to_wire_identity(&document.solver_identity),
        };
        let xml =
            quick_xml::se::to_string(&wire).map_err(|e| xml_error("encoding introduction solution", e))?;
        Ok(xml.into_bytes())
    }

    fn decode_introduction_solution(&self, bytes: &[u8]) -> WotResult<IntroductionSolutionDocument> {
        let text =
            std::str::from_utf8(bytes).map_err(|e| xml_error("decoding introduction solution utf8", e))?;
        let wire: WireSolution =
            quick_xml::de::from_str(text).map_err(|e| xml_error("parsing introduction solution xml", e))?;
        let solver_identity = from_wire_identity(wire.solver)?;
        Ok(IntroductionSolutionDocument {
            puzzle_id: wire.puzzle_id,
            solver_identity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> Id {
        Id::new_unchecked(format!("{}{:02}", "F".repeat(41), n))
    }

    #[test]
    fn identity_round_trips_canonical_fields() {
        let codec = QuickXmlCodec::new();
        let doc = IdentityDocument {
            identity: id(1),
            nickname: Some(Nickname::parse("Alice").unwrap()),
            does_publish_trust_list: true,
            contexts: vec![Context::parse("forum").unwrap()],
            properties: vec![("key".to_string(), "value".to_string())],
            trust_list: vec![AdvertisedTrust {
                trustee: id(2),
                value: 50,
                comment: "hello".to_string(),
            }],
        };
        let encoded = codec.encode_identity(&doc).unwrap();
        let decoded = codec.decode_identity(&encoded).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn puzzle_round_trips_binary_data() {
        let codec = QuickXmlCodec::new();
        let doc = PuzzleDocument {
            puzzle_type: "Captcha".into(),
            mime_type: "image/png".into(),
            data: vec![0, 1, 2, 255, 254],
            date_of_insertion: NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
            index: 3,
        };
        let encoded = codec.encode_puzzle(&doc).unwrap();
        let decoded = codec.decode_puzzle(&encoded).unwrap();
        assert_eq!(decoded, doc);
    }
}
