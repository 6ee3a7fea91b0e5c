//! Text presentation of controller snapshots.
//!
//! Nothing here feeds back into navigation or history; the console only prints what
//! these functions produce.

use std::fmt::Write as _;

use case_catalog::Category;
use chrono::Local;

use crate::history::{HistoryEntry, HistoryStore};
use crate::tasks::controller::{Screen, ViewSnapshot};
use crate::tasks::reveal::{RevealPhase, RevealStage};

/// Styling chosen per card category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryStyle {
    pub icon: &'static str,
    pub heading: &'static str,
    /// ANSI SGR color code used for the accent.
    pub accent: u8,
}

pub fn category_style(category: Category) -> CategoryStyle {
    match category {
        Category::Witness => CategoryStyle {
            icon: "[W]",
            heading: "Witness statement",
            accent: 33,
        },
        Category::Evidence => CategoryStyle {
            icon: "[E]",
            heading: "Evidence",
            accent: 36,
        },
        Category::Location => CategoryStyle {
            icon: "[L]",
            heading: "Location",
            accent: 32,
        },
        Category::Forensics => CategoryStyle {
            icon: "[F]",
            heading: "Forensics",
            accent: 35,
        },
    }
}

/// Optional extra content for the Result screen.
pub trait ResultExtension: Send + Sync {
    fn annotate(&self, entry: &HistoryEntry, history: &HistoryStore) -> Option<String>;
}

/// Cross-references other scanned cards of the same category.
#[derive(Debug, Clone, Copy)]
pub struct RelatedCards {
    pub limit: usize,
}

impl Default for RelatedCards {
    fn default() -> Self {
        Self { limit: 3 }
    }
}

impl ResultExtension for RelatedCards {
    fn annotate(&self, entry: &HistoryEntry, history: &HistoryStore) -> Option<String> {
        let related: Vec<&str> = history
            .iter()
            .filter(|other| other.id() != entry.id())
            .filter(|other| other.record.category == entry.record.category)
            .take(self.limit)
            .map(|other| other.record.title.as_str())
            .collect();
        if related.is_empty() {
            return None;
        }
        Some(format!("Related: {}", related.join(", ")))
    }
}

pub fn render(snapshot: &ViewSnapshot, reveal: RevealPhase, color: bool) -> String {
    let mut out = String::new();
    match snapshot.screen {
        Screen::Home => render_home(&mut out, snapshot),
        Screen::Scanning => {
            out.push_str("== SCANNING ==\nPresent a card to the reader (:cancel to stop).\n");
        }
        Screen::Revealing => render_reveal(&mut out, snapshot, reveal),
        Screen::Result => render_result(&mut out, snapshot, color),
        Screen::HistoryList => render_history(&mut out, snapshot),
    }
    if let Some(error) = &snapshot.error {
        let _ = writeln!(out, "\n!! {error}");
    }
    out
}

fn render_home(out: &mut String, snapshot: &ViewSnapshot) {
    out.push_str("== CASE FILE ==\nScan QR codes on cards to uncover clues.\n\n");
    out.push_str("  :scan     scan a clue\n");
    if snapshot.history_count > 0 {
        let _ = writeln!(out, "  :history  view history ({})", snapshot.history_count);
    }
}

fn render_reveal(out: &mut String, snapshot: &ViewSnapshot, reveal: RevealPhase) {
    let title = snapshot
        .revealing
        .as_ref()
        .map(|record| category_style(record.category).heading)
        .unwrap_or("Clue");
    let stage = match reveal {
        RevealPhase::Idle | RevealPhase::Preparing => "...",
        RevealPhase::Revealing {
            stage: RevealStage::Attention,
            ..
        } => "* * *",
        RevealPhase::Revealing {
            stage: RevealStage::Flip,
            ..
        }
        | RevealPhase::Done => ">> flip >>",
    };
    let _ = writeln!(out, "== {title} == {stage}");
}

fn render_result(out: &mut String, snapshot: &ViewSnapshot, color: bool) {
    let Some(entry) = &snapshot.selected else {
        return;
    };
    let record = &entry.record;
    let style = category_style(record.category);
    if color {
        let _ = writeln!(
            out,
            "\x1b[{}m{} {}\x1b[0m",
            style.accent, style.icon, record.title
        );
    } else {
        let _ = writeln!(out, "{} {}", style.icon, record.title);
    }
    let _ = writeln!(out, "{}  ({})\n", record.subtitle, record.image);
    let mut any = false;
    for paragraph in record.paragraphs() {
        let _ = writeln!(out, "{paragraph}\n");
        any = true;
    }
    if !any {
        out.push_str("(no statement recorded)\n\n");
    }
    if let Some(annotation) = &snapshot.annotation {
        let _ = writeln!(out, "{annotation}\n");
    }
    out.push_str(":back to return\n");
}

fn render_history(out: &mut String, snapshot: &ViewSnapshot) {
    out.push_str("== SCAN HISTORY ==\n");
    if snapshot.history.is_empty() {
        out.push_str("No clues scanned yet.\n");
    }
    for (idx, entry) in snapshot.history.iter().enumerate() {
        let style = category_style(entry.record.category);
        let _ = writeln!(
            out,
            "{:>3}. {} {:<28} {:<16} {}",
            idx + 1,
            style.icon,
            entry.record.title,
            entry.record.label,
            entry.scanned_at.with_timezone(&Local).format("%H:%M")
        );
    }
    out.push_str("\n:open N to read, :back to return\n");
}
