//! Tiered agent memory
//!
//! - [`hot`]: in-process ring buffer of the latest turns per agent
//! - [`warm`]: shared cache of summaries, salient memories and relationships
//! - [`card`]: renders memory into a prompt fragment
//! - [`session`]: rolls finished sessions up into summaries
//!
//! The cold tier lives in [`crate::archive`].

pub mod card;
pub mod hot;
pub mod records;
pub mod session;
pub mod warm;

pub use card::{CardBudget, CardInputs, MemoryCard, render_card};
pub use hot::{ExpiredWindow, HotTier, HotTierStats};
pub use records::{
    ArchiveRecord, ConversationTurn, RelationshipSnapshot, SalientMemory, SessionSummary,
};
pub use session::{ExtractiveSummarizer, SessionCloser, Summarizer};
pub use warm::{InMemoryWarmStore, WarmStore, WarmTierManager, WarmTierStats};
