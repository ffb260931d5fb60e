//! Content-addressable identifiers for changes and tags
//!
//! Identifiers are git-object-style SHA-1 digests: the canonical info text
//! of the object is hashed as `"<kind> <byte length>\0<info>"`. The info text
//! layout is fixed, so identical inputs give the same identifier on every
//! platform; the registry relies on this to recognise already-deployed
//! changes.

use sha1::{Digest, Sha1};

/// Hash an object's info text with the git-style length prefix.
pub fn object_id(kind: &str, info: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{} {}\0", kind, info.len()).as_bytes());
    hasher.update(info.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Plain SHA-1 of a script body, stored as `changes.script_hash`.
pub fn script_hash(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Inputs to a change identifier.
#[derive(Debug, Clone, Copy)]
pub struct ChangeInfo<'a> {
    pub project: &'a str,
    pub name: &'a str,
    /// Formatted planner, `Name <email>` or a bare email.
    pub planner: &'a str,
    /// UTC ISO-8601 timestamp, e.g. `2025-01-01T00:00:00Z`.
    pub date: &'a str,
    pub requires: &'a [String],
    pub conflicts: &'a [String],
    pub note: Option<&'a str>,
}

impl ChangeInfo<'_> {
    /// Canonical info text for this change.
    pub fn info(&self) -> String {
        let mut lines = vec![
            format!("project {}", self.project),
            format!("change {}", self.name),
            format!("planner {}", self.planner),
            format!("date {}", self.date),
        ];

        if !self.requires.is_empty() {
            lines.push("requires".to_string());
            lines.extend(self.requires.iter().map(|r| format!("  + {}", r)));
        }
        if !self.conflicts.is_empty() {
            lines.push("conflicts".to_string());
            lines.extend(self.conflicts.iter().map(|c| format!("  - {}", c)));
        }

        if let Some(note) = self.note.filter(|n| !n.is_empty()) {
            lines.push(String::new());
            lines.push(note.to_string());
        }

        lines.join("\n")
    }

    pub fn id(&self) -> String {
        object_id("change", &self.info())
    }
}

/// Inputs to a tag identifier.
#[derive(Debug, Clone, Copy)]
pub struct TagInfo<'a> {
    pub project: &'a str,
    pub name: &'a str,
    pub change_id: &'a str,
    pub planner: &'a str,
    pub date: &'a str,
    pub note: Option<&'a str>,
}

impl TagInfo<'_> {
    pub fn info(&self) -> String {
        let mut lines = vec![
            format!("project {}", self.project),
            format!("tag @{}", self.name),
            format!("change {}", self.change_id),
            format!("planner {}", self.planner),
            format!("date {}", self.date),
        ];
        if let Some(note) = self.note.filter(|n| !n.is_empty()) {
            lines.push(String::new());
            lines.push(note.to_string());
        }
        lines.join("\n")
    }

    pub fn id(&self) -> String {
        object_id("tag", &self.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn users() -> ChangeInfo<'static> {
        ChangeInfo {
            project: "flipr",
            name: "users",
            planner: "Jane <jane@example.com>",
            date: "2025-01-01T00:00:00Z",
            requires: &[],
            conflicts: &[],
            note: Some("init"),
        }
    }

    #[test]
    fn test_object_id_matches_git_object_digest() {
        // Same digest git computes for a blob containing "hello"
        assert_eq!(
            object_id("blob", "hello"),
            "b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0"
        );
        assert_eq!(
            object_id("change", "hello"),
            "bbb53799e60a01d4d46ae459ad6dc31fc323e1bd"
        );
    }

    #[test]
    fn test_change_id_golden_value() {
        assert_eq!(users().id(), "2743e3cdf5cd1d0734ab994e03c7336bf5618b3a");
    }

    #[test]
    fn test_change_id_golden_value_with_dependencies() {
        let requires = vec!["appschema".to_string(), "users@v1.0".to_string()];
        let conflicts = vec!["oldflips".to_string()];
        let change = ChangeInfo {
            requires: &requires,
            conflicts: &conflicts,
            ..users()
        };
        assert_eq!(change.id(), "da2da674746cc1f8567f13d8c1bfd1a8fac9a5d6");
    }

    #[test]
    fn test_change_info_layout() {
        let requires = vec!["appschema".to_string(), "users@v1.0".to_string()];
        let conflicts = vec!["oldflips".to_string()];
        let info = ChangeInfo {
            requires: &requires,
            conflicts: &conflicts,
            ..users()
        }
        .info();

        assert_eq!(
            info,
            "project flipr\n\
             change users\n\
             planner Jane <jane@example.com>\n\
             date 2025-01-01T00:00:00Z\n\
             requires\n  + appschema\n  + users@v1.0\n\
             conflicts\n  - oldflips\n\
             \n\
             init"
        );
    }

    #[test]
    fn test_change_info_without_note_or_dependencies() {
        let info = ChangeInfo { note: None, ..users() }.info();
        assert_eq!(
            info,
            "project flipr\nchange users\nplanner Jane <jane@example.com>\ndate 2025-01-01T00:00:00Z"
        );
    }

    #[test]
    fn test_note_changes_id() {
        let with_note = users().id();
        let without = ChangeInfo { note: None, ..users() }.id();
        assert_ne!(with_note, without);
    }

    #[test]
    fn test_tag_info_layout() {
        let tag = TagInfo {
            project: "flipr",
            name: "v1.0",
            change_id: "abc",
            planner: "Jane <jane@example.com>",
            date: "2025-01-02T00:00:00Z",
            note: None,
        };
        assert_eq!(
            tag.info(),
            "project flipr\ntag @v1.0\nchange abc\nplanner Jane <jane@example.com>\ndate 2025-01-02T00:00:00Z"
        );
        assert_eq!(tag.id().len(), 40);
    }

    #[test]
    fn test_script_hash_is_plain_sha1() {
        // sha1("") is well known
        assert_eq!(script_hash(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    proptest! {
        #[test]
        fn prop_change_id_is_deterministic(
            name in "[a-z][a-z0-9_]{0,12}",
            note in proptest::option::of("[ -~]{0,40}"),
            reqs in proptest::collection::vec("[a-z]{1,8}", 0..4),
        ) {
            let build = || ChangeInfo {
                project: "flipr",
                name: &name,
                planner: "Jane <jane@example.com>",
                date: "2025-01-01T00:00:00Z",
                requires: &reqs,
                conflicts: &[],
                note: note.as_deref(),
            }
            .id();
            let first = build();
            prop_assert_eq!(first.len(), 40);
            prop_assert_eq!(first, build());
        }
    }
}
