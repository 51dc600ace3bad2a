//! Session closing and summarization
//!
//! When a conversation ends, explicitly or by idling out of the hot tier,
//! its turns are rolled up into a [`SessionSummary`]. The summary goes to the
//! warm tier for the next memory card and to the archiver for the record.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::hot::ExpiredWindow;
use super::records::{ArchiveRecord, ConversationTurn, SessionSummary};
use super::warm::WarmTierManager;
use crate::archive::ColdTierArchiver;
use crate::error::{MnemeError, Result};

static WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z][A-Za-z'-]{2,}").expect("word pattern is valid"));

static DECISION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(agree[ds]?|promise[ds]?|deal|accept(?:s|ed)?|refuse[ds]?|will)\b")
        .expect("decision pattern is valid")
});

const STOPWORDS: &[&str] = &[
    "the", "and", "you", "your", "for", "are", "was", "were", "but", "not", "with", "this",
    "that", "have", "has", "had", "what", "when", "where", "who", "why", "how", "can", "will",
    "would", "could", "should", "from", "there", "their", "them", "they", "then", "than",
    "into", "about", "just", "some", "all", "any", "our", "out", "its", "it's", "i'm", "don't",
    "yes", "well", "here", "more", "very", "been", "being", "did", "does", "let", "get",
    "got", "one", "too", "also", "now", "respond", "responding",
];

const POSITIVE: &[&str] = &[
    "thank", "thanks", "friend", "glad", "welcome", "help", "gift", "love", "kind", "please",
    "great", "good", "wonderful", "happy", "trust", "agree", "deal",
];

const NEGATIVE: &[&str] = &[
    "hate", "liar", "thief", "threat", "kill", "angry", "never", "refuse", "betray", "cheat",
    "leave", "enemy", "fool", "curse", "steal", "attack",
];

/// Rolls a run of turns up into a summary
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `turns`, all of one (agent, counterpart) pair, oldest first
    async fn summarize(&self, turns: &[ConversationTurn]) -> Result<SessionSummary>;
}

/// Summarizer built from the turns' own words.
///
/// Topics are the most frequent content words, the tone tag comes from a
/// small sentiment lexicon, and decisions are sentences carrying a
/// commitment verb.
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    max_topics: usize,
    max_decisions: usize,
    excerpt_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            max_topics: 5,
            max_decisions: 3,
            excerpt_chars: 80,
        }
    }
}

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_topics(mut self, max: usize) -> Self {
        self.max_topics = max;
        self
    }

    pub fn with_max_decisions(mut self, max: usize) -> Self {
        self.max_decisions = max;
        self
    }

    fn topics(&self, turns: &[ConversationTurn]) -> Vec<String> {
        let stop: HashSet<&str> = STOPWORDS.iter().copied().collect();
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        let mut position = 0;
        for turn in turns {
            for word in WORD.find_iter(&turn.input).chain(WORD.find_iter(&turn.output)) {
                let word = word.as_str().to_lowercase();
                if stop.contains(word.as_str()) {
                    continue;
                }
                let entry = counts.entry(word).or_insert((0, position));
                entry.0 += 1;
                position += 1;
            }
        }
        let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
        // Most frequent first, earliest mention breaks ties
        ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then_with(|| a.1.1.cmp(&b.1.1)));
        ranked
            .into_iter()
            .take(self.max_topics)
            .map(|(word, _)| word)
            .collect()
    }

    fn tone(turns: &[ConversationTurn]) -> &'static str {
        let mut score: i64 = 0;
        for turn in turns {
            for word in WORD.find_iter(&turn.input).chain(WORD.find_iter(&turn.output)) {
                let word = word.as_str().to_lowercase();
                if POSITIVE.iter().any(|p| word.starts_with(p)) {
                    score += 1;
                } else if NEGATIVE.iter().any(|n| word.starts_with(n)) {
                    score -= 1;
                }
            }
        }
        match score {
            s if s >= 2 => "warm",
            s if s <= -2 => "hostile",
            _ => "neutral",
        }
    }

    fn decisions(&self, turns: &[ConversationTurn]) -> Vec<String> {
        let mut found = Vec::new();
        for turn in turns {
            for text in [&turn.input, &turn.output] {
                for sentence in text.split(['.', '!', '?']) {
                    let sentence = sentence.trim();
                    if !sentence.is_empty() && DECISION.is_match(sentence) {
                        found.push(self.excerpt(sentence));
                        if found.len() >= self.max_decisions {
                            return found;
                        }
                    }
                }
            }
        }
        found
    }

    fn excerpt(&self, text: &str) -> String {
        if text.chars().count() <= self.excerpt_chars {
            return text.to_string();
        }
        let cut: String = text.chars().take(self.excerpt_chars).collect();
        format!("{}...", cut.trim_end())
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, turns: &[ConversationTurn]) -> Result<SessionSummary> {
        let (Some(first), Some(last)) = (turns.first(), turns.last()) else {
            return Err(MnemeError::InvalidRecord(
                "cannot summarize an empty session".to_string(),
            ));
        };
        if turns
            .iter()
            .any(|t| t.agent_id != first.agent_id || t.counterpart_id != first.counterpart_id)
        {
            return Err(MnemeError::InvalidRecord(format!(
                "session for '{}' mixes counterparts",
                first.agent_id
            )));
        }

        let exchanges = if turns.len() == 1 {
            "1 exchange".to_string()
        } else {
            format!("{} exchanges", turns.len())
        };
        let mut summary = format!(
            "{} with {}, opening with \"{}\"",
            exchanges,
            first.counterpart_id,
            self.excerpt(&first.input)
        );
        if turns.len() > 1 {
            summary.push_str(&format!(" and ending with \"{}\"", self.excerpt(&last.input)));
        }

        Ok(SessionSummary {
            id: Uuid::new_v4(),
            agent_id: first.agent_id.clone(),
            counterpart_id: first.counterpart_id.clone(),
            started_at: first.timestamp,
            ended_at: last.timestamp,
            first_ordinal: first.ordinal,
            last_ordinal: last.ordinal,
            summary,
            tone: Self::tone(turns).to_string(),
            topics: self.topics(turns),
            decisions: self.decisions(turns),
        })
    }
}

/// Turns finished sessions into stored summaries
pub struct SessionCloser {
    summarizer: Arc<dyn Summarizer>,
    warm: Arc<WarmTierManager>,
    archiver: Arc<ColdTierArchiver>,
}

impl std::fmt::Debug for SessionCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCloser").finish_non_exhaustive()
    }
}

impl SessionCloser {
    pub fn new(
        summarizer: Arc<dyn Summarizer>,
        warm: Arc<WarmTierManager>,
        archiver: Arc<ColdTierArchiver>,
    ) -> Self {
        Self {
            summarizer,
            warm,
            archiver,
        }
    }

    /// Summarize one pair's session and store the summary.
    ///
    /// Returns `None` for an empty session. A warm-tier failure is logged and
    /// tolerated; the archive enqueue is not.
    pub async fn close(&self, turns: &[ConversationTurn]) -> Result<Option<SessionSummary>> {
        if turns.is_empty() {
            return Ok(None);
        }
        let summary = self.summarizer.summarize(turns).await?;
        self.archiver
            .enqueue(ArchiveRecord::Summary(summary.clone()))?;
        if let Err(e) = self.warm.put_summary(&summary).await {
            warn!(
                agent_id = %summary.agent_id,
                error = %e,
                "Failed to cache session summary in warm tier"
            );
        }
        debug!(
            agent_id = %summary.agent_id,
            counterpart_id = %summary.counterpart_id,
            turns = turns.len(),
            tone = %summary.tone,
            "Closed session"
        );
        Ok(Some(summary))
    }

    /// Close every session in windows dropped by the hot-tier sweep.
    ///
    /// Windows can hold several counterparts; each gets its own summary.
    /// Returns the summaries stored; failures are logged and skipped.
    pub async fn close_expired(&self, windows: Vec<ExpiredWindow>) -> Vec<SessionSummary> {
        let mut closed = Vec::new();
        for window in windows {
            let mut sessions: BTreeMap<String, Vec<ConversationTurn>> = BTreeMap::new();
            for turn in window.turns {
                sessions
                    .entry(turn.counterpart_id.clone())
                    .or_default()
                    .push(turn);
            }
            for (counterpart_id, turns) in sessions {
                match self.close(&turns).await {
                    Ok(Some(summary)) => closed.push(summary),
                    Ok(None) => {}
                    Err(e) => warn!(
                        agent_id = %window.agent_id,
                        counterpart_id = %counterpart_id,
                        error = %e,
                        "Failed to close expired session"
                    ),
                }
            }
        }
        closed
    }
}
