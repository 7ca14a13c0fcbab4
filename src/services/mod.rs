pub mod cache;
pub mod export;
pub mod fallback;
pub mod history;
pub mod rate_limit;
pub mod script;
pub mod setup;
pub mod tts;
pub mod workflow;
