mod terminal;

pub use terminal::{TerminalError, TerminalManager};
