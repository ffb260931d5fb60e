//! Canonical plan text

use super::{Change, Line, Plan, Tag};
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};

/// Plan-file timestamp: `Z` for UTC, `+hh:mm` otherwise.
pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    if ts.offset().local_minus_utc() == 0 {
        ts.with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    } else {
        ts.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    }
}

/// UTC form used in identifiers and registry rows.
pub fn utc_date(ts: &DateTime<FixedOffset>) -> String {
    ts.with_timezone(&Utc).format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub(super) fn change_line(change: &Change) -> String {
    let mut line = change.name.clone();
    if !change.dependencies.is_empty() {
        let deps: Vec<String> = change.dependencies.iter().map(|d| d.to_string()).collect();
        line.push_str(&format!(" [{}]", deps.join(" ")));
    }
    line.push_str(&format!(
        " {} {}",
        format_timestamp(&change.timestamp),
        change.planner
    ));
    push_note(&mut line, change.note.as_deref());
    line
}

pub(super) fn tag_line(tag: &Tag) -> String {
    let mut line = format!(
        "@{} {} {}",
        tag.name,
        format_timestamp(&tag.timestamp),
        tag.planner
    );
    push_note(&mut line, tag.note.as_deref());
    line
}

fn push_note(line: &mut String, note: Option<&str>) {
    if let Some(note) = note.filter(|n| !n.is_empty()) {
        line.push_str(" # ");
        line.push_str(note);
    }
}

impl Plan {
    /// Serialize to plan-file text. Parsing the result yields an equal plan.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for pragma in &self.pragmas {
            out.push_str(&format!("%{}={}\n", pragma.key, pragma.value));
        }
        out.push('\n');

        for line in &self.layout {
            match line {
                Line::Change(i) => out.push_str(&change_line(&self.changes[*i])),
                Line::Tag(i) => out.push_str(&tag_line(&self.tags[*i])),
                Line::Blank => {}
                Line::Comment(text) => out.push_str(text),
            }
            out.push('\n');
        }
        out
    }
}
