use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use shared::domain::{Aci, GroupId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: GroupId,
    pub revision: u32,
    pub members: BTreeSet<Aci>,
}

impl GroupRecord {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            revision: 0,
            members: BTreeSet::new(),
        }
    }
}

pub trait GroupStore: Send + Sync {
    fn group(&self, id: GroupId) -> Result<Option<GroupRecord>>;
    fn upsert_group(&self, record: &GroupRecord) -> Result<()>;
}
