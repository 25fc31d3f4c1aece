//! The console core: prompts, login, pretty-printing and the session
//! controller tying a connection to a front-end.

pub mod hooks;
pub mod login;
pub mod pretty;
pub mod prompt;
pub mod session;

pub use hooks::{Direction, FrontEnd, Level};
pub use prompt::{ChoiceRequest, PromptBroker, PromptKind, PromptRequest};
pub use session::{Lifecycle, Presupplied, SessionController};
