//! Inter-node wire schema: the packet envelope and the typed bodies of
//! every request the cluster exchanges.

use crate::{
    block::Block,
    config::WIRE_VERSION,
    error::{ErrorKind, ModuleError},
    transaction::{ObjectId, PoolTransaction},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadType {
    #[serde(rename = "REQUEST")]
    Request,
    #[serde(rename = "RESULT_SUCCESS")]
    ResultSuccess,
    #[serde(rename = "RESULT_FAILURE")]
    ResultFailure,
}

/// The exhaustive request set.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Ping,
    AddPool,
    AddBlockCa3,
    GetPoolHeight,
    GetBlockHeight,
    GetBlockDigest,
    GetBlock,
    ExamineBlockDifference,
    ExaminePoolDifference,
    DeclareBlockCreation,
    SignAndResendOrStore,
    ResetTestNode,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PacketPayload {
    #[serde(rename = "type")]
    pub payload_type: PayloadType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestKind>,
    #[serde(rename = "dataAsString")]
    pub data_as_string: String,
}

/// Envelope of every frame on an inter-node channel. `packetId == ""` marks
/// a fire-and-forget request; a response carries the request's id in
/// `prevId`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Packet {
    pub version: u32,
    #[serde(rename = "packetId")]
    pub packet_id: String,
    pub sender: String,
    pub receiver: String,
    #[serde(rename = "prevId")]
    pub prev_id: String,
    pub payload: PacketPayload,
}

impl Packet {
    pub fn request<T: Serialize>(
        sender: &str,
        receiver: &str,
        kind: RequestKind,
        body: &T,
    ) -> Result<Self, ModuleError> {
        Ok(Self {
            version: WIRE_VERSION,
            packet_id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            prev_id: String::new(),
            payload: PacketPayload {
                payload_type: PayloadType::Request,
                request: Some(kind),
                data_as_string: encode_body(body)?,
            },
        })
    }

    /// A request that expects no response.
    pub fn notification<T: Serialize>(
        sender: &str,
        receiver: &str,
        kind: RequestKind,
        body: &T,
    ) -> Result<Self, ModuleError> {
        let mut packet = Self::request(sender, receiver, kind, body)?;
        packet.packet_id = String::new();
        Ok(packet)
    }

    pub fn success_response<T: Serialize>(
        &self,
        responder: &str,
        body: &T,
    ) -> Result<Self, ModuleError> {
        Ok(Self {
            version: WIRE_VERSION,
            packet_id: Uuid::new_v4().to_string(),
            sender: responder.to_string(),
            receiver: self.sender.clone(),
            prev_id: self.packet_id.clone(),
            payload: PacketPayload {
                payload_type: PayloadType::ResultSuccess,
                request: self.payload.request,
                data_as_string: encode_body(body)?,
            },
        })
    }

    pub fn failure_response(&self, responder: &str, err: &ModuleError) -> Self {
        Self {
            version: WIRE_VERSION,
            packet_id: Uuid::new_v4().to_string(),
            sender: responder.to_string(),
            receiver: self.sender.clone(),
            prev_id: self.packet_id.clone(),
            payload: PacketPayload {
                payload_type: PayloadType::ResultFailure,
                request: self.payload.request,
                data_as_string: serde_json::to_string(err).unwrap_or_default(),
            },
        }
    }

    pub fn is_request(&self) -> bool {
        self.payload.payload_type == PayloadType::Request
    }

    pub fn expects_response(&self) -> bool {
        self.is_request() && !self.packet_id.is_empty()
    }

    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, ModuleError> {
        serde_json::from_str(&self.payload.data_as_string).map_err(|e| {
            ModuleError::new(
                ErrorKind::Validation,
                "internode",
                "decode_body",
                "",
                format!("bad {:?} body: {}", self.payload.request, e),
            )
        })
    }

    /// The error a RESULT_FAILURE packet carries.
    pub fn decode_failure(&self) -> ModuleError {
        serde_json::from_str(&self.payload.data_as_string).unwrap_or_else(|_| {
            ModuleError::internal("internode", "decode_failure", "unparseable failure body")
        })
    }
}

fn encode_body<T: Serialize>(body: &T) -> Result<String, ModuleError> {
    serde_json::to_string(body).map_err(|e| {
        ModuleError::internal("internode", "encode_body", e.to_string())
    })
}

// ---------------------------------------------------------------------------
// Request bodies and results
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct EmptyBody {}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AckResult {
    pub ok: bool,
}

impl AckResult {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AddPoolBody {
    pub txs: Vec<PoolTransaction>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AddBlockBody {
    pub block: Block,
    #[serde(rename = "removeFromPool")]
    pub remove_from_pool: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TenantBody {
    pub tenant: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CountResult {
    pub count: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BlockHeightResult {
    /// None when the tenant has no blocks yet.
    pub height: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DigestBody {
    pub tenant: String,
    #[serde(rename = "failIfUnhealthy", default)]
    pub fail_if_unhealthy: bool,
}

/// Coarse chain summary used for repair.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockDigest {
    #[serde(rename = "lastHash")]
    pub last_hash: Option<String>,
    pub height: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GetBlockBody {
    pub oid: ObjectId,
    pub tenant: String,
    #[serde(rename = "returnUndefinedIfFail", default)]
    pub return_undefined_if_fail: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GetBlockResult {
    pub block: Option<Block>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DigestEntry {
    pub height: u64,
    pub hash: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BlockDiffBody {
    pub entries: Vec<DigestEntry>,
    pub tenant: String,
}

/// One height where the responder disagrees with the requester. `oid` and
/// `hash` describe the responder's block, absent when it has none there.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DivergentHeight {
    pub height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BlockDiffResult {
    pub divergent: Vec<DivergentHeight>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PoolDiffBody {
    pub ids: Vec<ObjectId>,
    pub tenant: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PoolDiffResult {
    /// Responder's pool txs absent from the requester's id list.
    pub missing: Vec<PoolTransaction>,
    /// Requester ids the responder has no pool row for.
    pub extra: Vec<ObjectId>,
    /// Requester ids the responder found embedded in a block.
    pub blocked: Vec<ObjectId>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CandidateBody {
    pub candidate: Block,
}

/// Outcome of the cooperative signing steps.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "outcome")]
pub enum Ca3Response {
    /// Declaration accepted; the responder will sign when the ring pass
    /// reaches it.
    Sign,
    /// The responder refused; the miner stashes the candidate and retries.
    Store { reason: String },
    /// Ring pass complete; the fully signed candidate returns to the miner.
    Final { block: Block },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_packet_shape() {
        let packet = Packet::request(
            "node1",
            "node2",
            RequestKind::GetPoolHeight,
            &TenantBody { tenant: "t1".to_string() },
        )
        .unwrap();

        let v = serde_json::to_value(&packet).unwrap();
        assert_eq!(v["version"], json!(WIRE_VERSION));
        assert_eq!(v["payload"]["type"], json!("REQUEST"));
        assert_eq!(v["payload"]["request"], json!("GetPoolHeight"));
        assert!(v["packetId"].as_str().map(|s| !s.is_empty()).unwrap_or(false));
        assert_eq!(v["prevId"], json!(""));
    }

    #[test]
    fn test_notification_has_empty_packet_id() {
        let packet =
            Packet::notification("node1", "node2", RequestKind::Ping, &EmptyBody::default())
                .unwrap();
        assert!(!packet.expects_response());
    }

    #[test]
    fn test_response_correlates_by_prev_id() {
        let request = Packet::request(
            "node1",
            "node2",
            RequestKind::Ping,
            &EmptyBody::default(),
        )
        .unwrap();
        let response = request.success_response("node2", &AckResult::ok()).unwrap();

        assert_eq!(response.prev_id, request.packet_id);
        assert_eq!(response.receiver, "node1");
        let ack: AckResult = response.decode_body().unwrap();
        assert!(ack.ok);
    }

    #[test]
    fn test_failure_roundtrip() {
        let request = Packet::request(
            "node1",
            "node2",
            RequestKind::GetBlock,
            &EmptyBody::default(),
        )
        .unwrap();
        let err = ModuleError::not_found("datastore", "get_block", "no such oid");
        let response = request.failure_response("node2", &err);

        assert_eq!(response.payload.payload_type, PayloadType::ResultFailure);
        let back = response.decode_failure();
        assert_eq!(back.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_ca3_response_tagging() {
        let stored = serde_json::to_value(Ca3Response::Store {
            reason: "height mismatch".to_string(),
        })
        .unwrap();
        assert_eq!(stored["outcome"], json!("Store"));

        let parsed: Ca3Response =
            serde_json::from_value(json!({"outcome": "Sign"})).unwrap();
        assert!(matches!(parsed, Ca3Response::Sign));
    }

    #[test]
    fn test_bad_body_is_a_validation_error() {
        let mut packet = Packet::request(
            "node1",
            "node2",
            RequestKind::GetPoolHeight,
            &EmptyBody::default(),
        )
        .unwrap();
        packet.payload.data_as_string = "{not json".to_string();
        let res: Result<TenantBody, _> = packet.decode_body();
        assert_eq!(res.unwrap_err().kind, ErrorKind::Validation);
    }
}
