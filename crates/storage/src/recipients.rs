use anyhow::Result;
use serde::{Deserialize, Serialize};
use shared::domain::{Aci, Pni, ProfileKey, RecipientId, E164};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisteredState {
    #[default]
    Unknown,
    Registered,
    NotRegistered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub id: RecipientId,
    pub aci: Option<Aci>,
    pub pni: Option<Pni>,
    pub e164: Option<E164>,
    pub registered: RegisteredState,
    pub profile_sharing: bool,
    pub profile_key: Option<ProfileKey>,
}

impl RecipientRecord {
    pub fn new(id: RecipientId) -> Self {
        Self {
            id,
            aci: None,
            pni: None,
            e164: None,
            registered: RegisteredState::Unknown,
            profile_sharing: false,
            profile_key: None,
        }
    }
}

pub trait RecipientStore: Send + Sync {
    /// Finds the recipient matching any of the identifiers, binding all three
    /// to it, or creates one. Repeated calls with the same identifiers return
    /// the same id.
    fn get_or_create_self(&self, aci: Aci, pni: Pni, e164: &E164) -> Result<RecipientId>;
    fn recipient(&self, id: RecipientId) -> Result<Option<RecipientRecord>>;
    fn mark_registered(&self, id: RecipientId) -> Result<()>;
    fn set_profile_sharing(&self, id: RecipientId, enabled: bool) -> Result<()>;
    fn set_profile_key(&self, id: RecipientId, key: ProfileKey) -> Result<()>;
}
