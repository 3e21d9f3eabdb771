/// Command, message and callback handlers
pub mod handlers;
/// Reply delivery (splitting, formatting, placeholder edits)
pub mod messaging;
/// Telegram calls with retry
pub mod resilient;
/// Texts and keyboards
pub mod views;
