use std::time::{Duration, Instant};

use itertools::Itertools;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::AHashMap;

/// How long a typing signal stays alive without a refresh. A peer that
/// disconnects mid-keystroke never sends a stop event, so entries are
/// expired from `Cache::maintain` instead of accumulating forever.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(5);

/// The set of users currently typing in one channel. Ephemeral, never
/// persisted; discarded with the channel view.
#[derive(Debug, Clone, Default)]
pub struct TypingSet {
    typers: AHashMap<Uuid, Typer>,
}

#[derive(Debug, Clone)]
struct Typer {
    username: SmolStr,
    last_signal: Instant,
}

impl TypingSet {
    /// Record a typing-start signal, refreshing the expiry window if the
    /// user was already typing.
    pub fn start(&mut self, user_id: Uuid, username: SmolStr) {
        self.typers.insert(
            user_id,
            Typer {
                username,
                last_signal: Instant::now(),
            },
        );
    }

    pub fn stop(&mut self, user_id: &Uuid) {
        self.typers.remove(user_id);
    }

    /// Drop entries whose last signal is older than `timeout`.
    pub fn expire(&mut self, timeout: Duration) {
        self.typers
            .retain(|_, typer| typer.last_signal.elapsed() < timeout);
    }

    pub fn is_typing(&self, user_id: &Uuid) -> bool {
        self.typers.contains_key(user_id)
    }

    pub fn clear(&mut self) {
        self.typers.clear();
    }

    /// Display names of everyone typing except the given user, in a stable
    /// order.
    pub fn names_excluding(&self, current_user: &Uuid) -> Vec<SmolStr> {
        self.typers
            .iter()
            .filter(|(id, _)| *id != current_user)
            .map(|(_, typer)| typer.username.clone())
            .sorted()
            .collect()
    }

    /// The transient indicator line, or `None` when nobody else is typing.
    pub fn indicator_text(&self, current_user: &Uuid) -> Option<String> {
        let names = self.names_excluding(current_user);
        match names.len() {
            0 => None,
            1 => Some(format!("{} is typing...", names[0])),
            2 => Some(format!("{} and {} are typing...", names[0], names[1])),
            n => Some(format!("{} people are typing...", n)),
        }
    }
}
