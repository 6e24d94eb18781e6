//! Narrow contracts for two external collaborators: the auth service
//! (bearer tokens with user/org claims) and the CRDT control document
//! server. Both are out of scope to implement; only the contract this
//! core depends on is modeled, with an in-memory test double each.

use crate::model::{OrgId, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Bearer token claims minted by the (external) auth service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub org_id: OrgId,
    pub tier: String,
}

#[derive(Debug, thiserror::Error)]
#[error("token rejected")]
pub struct TokenRejected;

pub trait TokenValidator: Send + Sync {
    fn validate(&self, bearer_token: &str) -> Result<Claims, TokenRejected>;
}

/// Test double that accepts any token and decodes claims from its literal
/// contents (`user_id:org_id:tier`). Never used outside tests/local runs.
pub struct AlwaysAcceptValidator;

impl TokenValidator for AlwaysAcceptValidator {
    fn validate(&self, bearer_token: &str) -> Result<Claims, TokenRejected> {
        let mut parts = bearer_token.splitn(3, ':');
        let user_id = parts.next().ok_or(TokenRejected)?.to_string();
        let org_id = parts.next().ok_or(TokenRejected)?;
        let tier = parts.next().unwrap_or("free").to_string();
        let org_id = OrgId(uuid::Uuid::parse_str(org_id).map_err(|_| TokenRejected)?);
        Ok(Claims { user_id, org_id, tier })
    }
}

/// Recognized keys of the control document the Agent observes read-only
///, ignoring unknown keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControlDocState {
    pub seed: Option<i64>,
    pub scenario_id: Option<String>,
    pub step_mode: Option<StepMode>,
    pub play: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    Manual,
    Continuous,
}

/// Read-only subscription to the per-session control document.
#[async_trait]
pub trait ControlDocWatcher: Send + Sync {
    /// Latest known state; changes are applied between producer ticks and
    /// never interrupt a step in flight.
    async fn current(&self, session_id: SessionId) -> ControlDocState;
}

/// In-memory double a test or a single-process deployment can write
/// through directly (the real CRDT server is the collaborator of record).
#[derive(Default)]
pub struct InMemoryControlDocStore {
    docs: Mutex<HashMap<SessionId, ControlDocState>>,
}

impl InMemoryControlDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, session_id: SessionId, state: ControlDocState) {
        self.docs.lock().await.insert(session_id, state);
    }
}

#[async_trait]
impl ControlDocWatcher for InMemoryControlDocStore {
    async fn current(&self, session_id: SessionId) -> ControlDocState {
        self.docs.lock().await.get(&session_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_accept_validator_decodes_claims() {
        let org = uuid::Uuid::new_v4();
        let token = format!("alice:{}:pro", org);
        let claims = AlwaysAcceptValidator.validate(&token).unwrap();
        assert_eq!(claims.user_id, "alice");
        assert_eq!(claims.tier, "pro");
    }

    #[tokio::test]
    async fn control_doc_store_roundtrips() {
        let store = InMemoryControlDocStore::new();
        let sid = SessionId::new();
        assert!(store.current(sid).await.scenario_id.is_none());
        store
            .set(
                sid,
                ControlDocState {
                    seed: Some(7),
                    scenario_id: Some("cartpole".into()),
                    step_mode: Some(StepMode::Continuous),
                    play: Some(true),
                },
            )
            .await;
        let state = store.current(sid).await;
        assert_eq!(state.scenario_id.as_deref(), Some("cartpole"));
    }
}
