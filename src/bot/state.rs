use serde::{Deserialize, Serialize};
use teloxide::dispatching::dialogue::{Dialogue, InMemStorage};

/// Represents the current state of the user dialogue
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum State {
    /// Normal chat
    #[default]
    Start,
    /// The next text message becomes the user's settings
    WaitingForSettings,
}

/// Dialogue handle injected into handlers
pub type BotDialogue = Dialogue<State, InMemStorage<State>>;
