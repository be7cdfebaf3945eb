mod action;
mod event;
mod files;
mod provider;
mod run;
mod terminal;

pub use action::{
    ActionBatch, ActionRecord, ActionSpec, ActionStatus, ActionType, BatchDecision, DecisionMode,
};
pub use event::{EventKind, EventStatus, ExecutionEvent};
pub use files::{CreateFileRequest, DeleteRequest, FileContent, FileItem, RenameRequest};
pub use provider::{
    ChatOptions, ChatOutcome, LlmCall, PromptMessage, ProviderInfo, ResponseFormat, Role,
    TokenSource, TokenUsage,
};
pub use run::{
    AiRequest, AiResponse, ChatMessage, CodeSnippet, FileChange, HistoryConfig, Intent,
    RunSnapshot, RunStatus, WriteResult,
};
pub use terminal::{
    TerminalInputRequest, TerminalOutputResponse, TerminalResizeRequest,
    TerminalSessionCreateRequest, TerminalSessionInfo,
};
