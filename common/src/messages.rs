//! Definition of Talos messages

// We don't use these messages in the talos_common crate itself
#![allow(dead_code)]

use num_bigint::BigUint;

// Caryatid core messages
use caryatid_module_clock::messages::ClockTickMessage;

/// Governance vote event message, decoded from a VoteCastWithParams log
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct VoteEventMessage {
    /// Height of the block the vote was cast in
    pub block_height: u64,

    /// Proposal being voted on
    pub proposal_id: BigUint,

    /// Support value (0 = against, 1 = for, 2 = abstain)
    pub support: u8,

    /// Voting weight
    pub weight: BigUint,

    /// Free-text voting reason
    pub reason: String,

    /// Application-defined parameter bytes - expected to carry a
    /// content identifier as UTF-8 text
    pub params: Vec<u8>,
}

/// Request to resolve a content identifier to bytes
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ArtifactQueryMessage {
    /// Content identifier in text form
    pub cid: String,
}

/// Response to an artifact query
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ArtifactQueryResponse {
    /// Fully assembled artifact
    Artifact(ArtifactMessage),

    /// Resolution failed
    Error(String),
}

/// A fully assembled artifact
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ArtifactMessage {
    /// Content identifier the bytes were resolved from
    pub cid: String,

    /// Artifact content
    pub bytes: Vec<u8>,
}

/// Command to deploy an artifact as the supervised process
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeployCommandMessage {
    /// Content identifier the artifact was resolved from, for logging
    pub cid: String,

    /// Executable content
    pub bytes: Vec<u8>,
}

/// Response to a deploy command
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum DeployResponse {
    /// New process started
    Deployed(DeployedMessage),

    /// Deployment failed - any previous process is left untouched
    Error(String),
}

/// Details of a newly started process
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeployedMessage {
    /// OS process id, if available
    pub pid: Option<u32>,

    /// Path the executable was written to
    pub path: String,
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Generic messages, get of jail free cards
    String(String),          // Simple string
    JSON(serde_json::Value), // JSON object

    // Caryatid standard messages
    Clock(ClockTickMessage), // Clock tick

    // Talos messages
    VoteCast(VoteEventMessage),                    // New governance vote observed
    ArtifactQuery(ArtifactQueryMessage),           // Resolve a content identifier
    ArtifactQueryResponse(ArtifactQueryResponse),  // Resolution result
    Deploy(DeployCommandMessage),                  // Deploy an artifact
    DeployResponse(DeployResponse),                // Deployment result
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<ClockTickMessage> for Message {
    fn from(msg: ClockTickMessage) -> Self {
        Message::Clock(msg)
    }
}

impl From<VoteEventMessage> for Message {
    fn from(msg: VoteEventMessage) -> Self {
        Message::VoteCast(msg)
    }
}

impl From<ArtifactQueryMessage> for Message {
    fn from(msg: ArtifactQueryMessage) -> Self {
        Message::ArtifactQuery(msg)
    }
}

impl From<DeployCommandMessage> for Message {
    fn from(msg: DeployCommandMessage) -> Self {
        Message::Deploy(msg)
    }
}
