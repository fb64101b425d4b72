use smol_str::SmolStr;
use uuid::Uuid;

use crate::{AHashSet, IndexMap};

pub type Servers = IndexMap<Uuid, Server>;

/// A top-level grouping of channels and members; the tenant boundary.
#[derive(Debug, Clone, Default)]
pub struct Server {
    pub name: SmolStr,
    pub owner_id: Uuid,
    pub invite_code: SmolStr,
    pub channels: Vec<Uuid>,
    pub members: AHashSet<Uuid>,
    pub fetched: bool,
}

impl Server {
    pub fn is_owner(&self, user_id: &Uuid) -> bool {
        self.owner_id == *user_id
    }

    pub fn is_member(&self, user_id: &Uuid) -> bool {
        self.members.contains(user_id)
    }
}
