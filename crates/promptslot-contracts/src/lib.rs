pub mod cache;
pub mod config;
pub mod content_key;
pub mod events;
pub mod protocol;
pub mod saved_tags;

pub use cache::{CachedResult, JsonResultCache, MemoryResultCache, ResultCache};
pub use config::EngineConfig;
pub use content_key::{normalize_content, ContentKey};
pub use events::{EventLog, EventPayload};
pub use protocol::{GenerationPayload, GenerationRequest, GenerationResponse, Modification};
pub use saved_tags::{fingerprint_text, SavedTagRecord, SavedTagRegistry};
