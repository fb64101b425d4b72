use smol_str::SmolStr;
use uuid::Uuid;

use crate::{message::Profile, AHashMap};

pub type Members = AHashMap<Uuid, Member>;

/// Cached display profile for a user seen in messages or member lists.
#[derive(Debug, Clone, Default)]
pub struct Member {
    pub username: SmolStr,
    pub display_name: Option<SmolStr>,
    pub avatar_url: Option<SmolStr>,
    pub is_ai: bool,
    pub fetched: bool,
}

impl Member {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.username.as_str())
    }

    pub fn profile(&self) -> Profile {
        Profile {
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

impl From<Profile> for Member {
    fn from(profile: Profile) -> Self {
        Self {
            username: profile.username,
            display_name: profile.display_name,
            avatar_url: profile.avatar_url,
            is_ai: false,
            fetched: true,
        }
    }
}
