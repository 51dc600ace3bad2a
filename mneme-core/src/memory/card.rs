//! Memory card rendering
//!
//! A memory card is the compact slice of an agent's memory that rides along
//! with a generation request. Sections are added in priority order and a
//! section that does not fit the remaining budget is cut line by line, so
//! the relationship state survives even a tiny budget while old chatter is
//! the first thing dropped.
//!
//! Priority, highest first:
//!
//! 1. relationship stance
//! 2. active objectives
//! 3. salient memories, by impact
//! 4. latest session summary
//! 5. completed milestones
//! 6. recent turns, newest kept first

use serde::{Deserialize, Serialize};

use super::records::{ConversationTurn, RelationshipSnapshot, SalientMemory, SessionSummary};

/// Limits applied when rendering a card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardBudget {
    /// Hard ceiling on rendered characters
    pub max_chars: usize,
    pub max_salient: usize,
    pub max_recent_turns: usize,
}

impl Default for CardBudget {
    fn default() -> Self {
        Self {
            max_chars: 1200,
            max_salient: 5,
            max_recent_turns: 6,
        }
    }
}

/// Everything the renderer may draw from
#[derive(Debug, Clone, Copy, Default)]
pub struct CardInputs<'a> {
    pub relationship: Option<&'a RelationshipSnapshot>,
    pub salient: &'a [SalientMemory],
    pub summaries: &'a [SessionSummary],
    /// Oldest first
    pub recent: &'a [ConversationTurn],
}

/// Rendered card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCard {
    pub text: String,
    /// Sections that made it in, at least partially
    pub sections: Vec<String>,
    /// Whether anything was cut to fit the budget
    pub truncated: bool,
}

impl MemoryCard {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

impl std::fmt::Display for MemoryCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

struct CardWriter {
    budget: usize,
    used: usize,
    lines: Vec<String>,
    sections: Vec<String>,
    truncated: bool,
}

impl CardWriter {
    fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            lines: Vec::new(),
            sections: Vec::new(),
            truncated: false,
        }
    }

    fn cost(&self, line: &str) -> usize {
        // Every line after the first costs its newline too
        line.chars().count() + usize::from(!self.lines.is_empty())
    }

    fn fits(&self, line: &str) -> bool {
        self.used + self.cost(line) <= self.budget
    }

    fn push(&mut self, line: String) {
        self.used += self.cost(&line);
        self.lines.push(line);
    }

    /// Single-line section, all or nothing
    fn line(&mut self, name: &str, text: String) {
        if self.fits(&text) {
            self.push(text);
            self.sections.push(name.to_string());
        } else {
            self.truncated = true;
        }
    }

    /// Header plus as many items as fit. Left out entirely when there are no
    /// items or not even the first one fits.
    fn list(&mut self, name: &str, header: &str, items: Vec<String>) {
        let Some(first) = items.first() else {
            return;
        };
        let header_cost = self.cost(header);
        let first_cost = first.chars().count() + 1;
        if self.used + header_cost + first_cost > self.budget {
            self.truncated = true;
            return;
        }
        self.push(header.to_string());
        for item in items {
            if self.fits(&item) {
                self.push(item);
            } else {
                self.truncated = true;
                break;
            }
        }
        self.sections.push(name.to_string());
    }

    fn finish(self) -> MemoryCard {
        MemoryCard {
            text: self.lines.join("\n"),
            sections: self.sections,
            truncated: self.truncated,
        }
    }
}

/// Word for a trust value
pub fn stance(trust: f64) -> &'static str {
    match trust {
        t if t >= 0.5 => "trusted",
        t if t >= 0.1 => "friendly",
        t if t > -0.1 => "neutral",
        t if t > -0.5 => "wary",
        _ => "hostile",
    }
}

/// Render a card within `budget`
pub fn render_card(inputs: CardInputs<'_>, budget: &CardBudget) -> MemoryCard {
    let mut card = CardWriter::new(budget.max_chars);

    if let Some(rel) = inputs.relationship {
        card.line(
            "relationship",
            format!(
                "Relationship with {}: {} (trust {:+.2}, affinity {:+.2})",
                rel.counterpart_id,
                stance(rel.trust),
                rel.trust,
                rel.affinity
            ),
        );
        card.list(
            "objectives",
            "Objectives:",
            rel.active_objectives.iter().map(|o| format!("- {}", o)).collect(),
        );
    }

    let mut salient: Vec<&SalientMemory> = inputs.salient.iter().collect();
    salient.sort_by(|a, b| {
        b.impact
            .total_cmp(&a.impact)
            .then_with(|| b.recorded_at.cmp(&a.recorded_at))
    });
    if salient.len() > budget.max_salient {
        card.truncated = true;
    }
    card.list(
        "salient",
        "Remembers:",
        salient
            .iter()
            .take(budget.max_salient)
            .map(|m| format!("- [{}] {}", m.kind, m.description))
            .collect(),
    );

    if let Some(latest) = inputs.summaries.iter().max_by_key(|s| s.ended_at) {
        let mut line = format!("Last session ({}): {}", latest.tone, latest.summary);
        if !latest.decisions.is_empty() {
            line.push_str(&format!(" Decided: {}.", latest.decisions.join("; ")));
        }
        card.line("summary", line);
    }

    if let Some(rel) = inputs.relationship {
        if !rel.completed_milestones.is_empty() {
            card.line(
                "milestones",
                format!("Milestones: {}", rel.completed_milestones.join(", ")),
            );
        }
    }

    let recent = newest(inputs.recent, budget.max_recent_turns);
    if recent.len() < inputs.recent.len() {
        card.truncated = true;
    }
    // Keep the newest turns when the budget runs out, but print them in order
    let remaining = budget.max_chars.saturating_sub(card.used);
    let kept = keep_newest_within(&recent, remaining.saturating_sub("Recent:".len() + 1));
    if kept.len() < recent.len() {
        card.truncated = true;
    }
    card.list(
        "recent",
        "Recent:",
        kept.iter().map(|t| turn_line(t)).collect(),
    );

    card.finish()
}

fn newest(turns: &[ConversationTurn], max: usize) -> Vec<&ConversationTurn> {
    let skip = turns.len().saturating_sub(max);
    turns[skip..].iter().collect()
}

fn keep_newest_within<'a>(turns: &[&'a ConversationTurn], chars: usize) -> Vec<&'a ConversationTurn> {
    let mut kept = Vec::new();
    let mut used = 0;
    for turn in turns.iter().rev() {
        let cost = turn_line(turn).chars().count() + 1;
        if used + cost > chars {
            break;
        }
        used += cost;
        kept.push(*turn);
    }
    kept.reverse();
    kept
}

fn turn_line(turn: &ConversationTurn) -> String {
    format!("#{} them: {} / me: {}", turn.ordinal, turn.input, turn.output)
}
