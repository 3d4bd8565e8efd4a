/// Command and message handlers
pub mod handlers;
/// Sending answers with MarkdownV2 fallback
pub mod messaging;
/// User state and dialogue management
pub mod state;
