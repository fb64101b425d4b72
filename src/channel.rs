use smol_str::SmolStr;
use uuid::Uuid;

use crate::{message::MessageWindow, typing::TypingSet, IndexMap};

pub type Channels = IndexMap<Uuid, Channel>;

/// One channel's client-side state: metadata plus the materialized message
/// window and its pagination flags. Windows are owned per channel and never
/// shared; two channels' state cannot interact.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    pub name: SmolStr,
    pub server_id: Uuid,
    pub description: Option<String>,
    pub messages: MessageWindow,
    /// Cleared flag meaning "more history exists"; set once a backward page
    /// comes back short.
    pub reached_top: bool,
    /// In-flight guard: only one backward fetch per channel at a time.
    pub loading_history: bool,
    /// Initial page fetch in flight.
    pub init_fetching: bool,
    pub typing: TypingSet,
}

impl Channel {
    pub fn has_more_history(&self) -> bool {
        !self.reached_top
    }

    /// Reset the materialized window and pagination state, keeping channel
    /// metadata. Used when the channel view unmounts; the window is rebuilt
    /// from a fresh history load on the next entry.
    pub fn reset_window(&mut self) {
        self.messages.clear();
        self.typing.clear();
        self.reached_top = false;
        self.loading_history = false;
        self.init_fetching = false;
    }
}
