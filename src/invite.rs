//! Out-of-band invite code: `{groupId, peerId}` shared via copy-paste or QR.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{GroupId, PeerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    #[serde(rename = "groupId")]
    pub group_id: GroupId,
    #[serde(rename = "peerId")]
    pub peer_id: PeerId,
}

#[derive(Debug, Error)]
pub enum InviteError {
    #[error("invalid invite")]
    Malformed,
}

impl Invite {
    pub fn new(group_id: GroupId, peer_id: PeerId) -> Self {
        Invite { group_id, peer_id }
    }

    pub fn encode(&self) -> String {
        // Fields are plain strings with no embedded control characters, so
        // this cannot fail in practice; unwrap mirrors serialising any other
        // already-validated in-memory struct.
        serde_json::to_string(self).expect("Invite always serialises")
    }

    /// Fails synchronously with a user-visible "invalid invite" result; no
    /// state change — a malformed code should never half-create a group.
    pub fn decode(code: &str) -> Result<Self, InviteError> {
        let invite: Invite = serde_json::from_str(code).map_err(|_| InviteError::Malformed)?;
        if invite.group_id.is_empty() || invite.peer_id.is_empty() {
            return Err(InviteError::Malformed);
        }
        Ok(invite)
    }
}
