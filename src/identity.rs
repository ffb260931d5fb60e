//! Resolve who is planning or committing a change
//!
//! Name and email are resolved independently, each through the same chain:
//! config file, tool variables, legacy variables of the reference tool,
//! git author/committer variables, the OS account, and finally a generated
//! placeholder.
//!
//! The OS account is read from the login variables the shell exports
//! (`USER` on Unix, `USERNAME` on Windows, then `LOGNAME`); the account
//! database is not queried, so a process started without them falls
//! through to the placeholder. `EMAIL` stands in for the account's email.

use std::fmt;

/// Placeholder used when no source yields a usable name.
pub const PLACEHOLDER_NAME: &str = "anonymous";

/// Domain for synthesized email addresses.
pub const FALLBACK_EMAIL_DOMAIN: &str = "example.invalid";

const NAME_VARS: &[&[&str]] = &[
    &["STRATA_FULLNAME"],
    &["SQITCH_FULLNAME", "SQITCH_ORIG_FULLNAME"],
    &["GIT_AUTHOR_NAME", "GIT_COMMITTER_NAME"],
    &["USER", "USERNAME", "LOGNAME"],
];

const EMAIL_VARS: &[&[&str]] = &[
    &["STRATA_EMAIL"],
    &["SQITCH_EMAIL", "SQITCH_ORIG_EMAIL"],
    &["GIT_AUTHOR_EMAIL", "GIT_COMMITTER_EMAIL"],
    &["EMAIL"],
];

/// A human actor recorded in the plan and the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Resolve from a config `[user]` section and the process environment.
    pub fn resolve(config_name: Option<&str>, config_email: Option<&str>) -> Self {
        resolve_with(config_name, config_email, |key| std::env::var(key).ok())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Resolve an identity using `env` to look up variables.
pub fn resolve_with<F>(config_name: Option<&str>, config_email: Option<&str>, env: F) -> Identity
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |configured: Option<&str>, chain: &[&[&str]]| -> Option<String> {
        non_empty(configured.map(str::to_string)).or_else(|| {
            chain
                .iter()
                .flat_map(|rung| rung.iter())
                .find_map(|key| non_empty(env(*key)))
        })
    };

    let name = lookup(config_name, NAME_VARS).unwrap_or_else(|| PLACEHOLDER_NAME.to_string());
    let email = lookup(config_email, EMAIL_VARS)
        .unwrap_or_else(|| format!("{}@{}", sanitize(&name), FALLBACK_EMAIL_DOMAIN));

    Identity { name, email }
}

/// Lower-case and strip everything outside `[a-z0-9._]`.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '.' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        PLACEHOLDER_NAME.to_string()
    } else {
        cleaned
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_config_wins() {
        let env = env_of(&[("STRATA_FULLNAME", "Env Name"), ("STRATA_EMAIL", "env@x.org")]);
        let id = resolve_with(Some("Jane"), Some("jane@example.com"), env);
        assert_eq!(id, Identity::new("Jane", "jane@example.com"));
    }

    #[test]
    fn test_tool_vars_beat_legacy_and_git() {
        let env = env_of(&[
            ("STRATA_FULLNAME", "Tool"),
            ("SQITCH_FULLNAME", "Legacy"),
            ("GIT_AUTHOR_NAME", "Git"),
        ]);
        assert_eq!(resolve_with(None, None, env).name, "Tool");
    }

    #[test]
    fn test_legacy_vars_beat_git() {
        let env = env_of(&[
            ("SQITCH_EMAIL", "legacy@x.org"),
            ("GIT_AUTHOR_EMAIL", "git@x.org"),
            ("EMAIL", "os@x.org"),
        ]);
        assert_eq!(resolve_with(None, None, env).email, "legacy@x.org");
    }

    #[test]
    fn test_git_vars_beat_os_account() {
        let env = env_of(&[("GIT_COMMITTER_NAME", "Committer"), ("USER", "jdoe")]);
        assert_eq!(resolve_with(None, None, env).name, "Committer");
    }

    #[test]
    fn test_os_account_variables_in_order() {
        let env = env_of(&[("USERNAME", "winuser"), ("LOGNAME", "login")]);
        assert_eq!(resolve_with(None, None, env).name, "winuser");

        let env = env_of(&[("LOGNAME", "login"), ("EMAIL", "login@host.org")]);
        assert_eq!(resolve_with(None, None, env), Identity::new("login", "login@host.org"));
    }

    #[test]
    fn test_name_and_email_resolve_independently() {
        let env = env_of(&[("USER", "jdoe"), ("GIT_AUTHOR_EMAIL", "jd@x.org")]);
        let id = resolve_with(Some("Jane Doe"), None, env);
        assert_eq!(id.name, "Jane Doe");
        assert_eq!(id.email, "jd@x.org");
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let env = env_of(&[("STRATA_FULLNAME", "  "), ("USER", "jdoe")]);
        assert_eq!(resolve_with(Some(""), None, env).name, "jdoe");
    }

    #[test]
    fn test_fallback_email_is_synthesized_from_name() {
        let env = env_of(&[("USER", "J. Doe-Smith")]);
        let id = resolve_with(None, None, env);
        assert_eq!(id.email, "j.doesmith@example.invalid");
    }

    #[test]
    fn test_fallback_when_nothing_is_set() {
        let id = resolve_with(None, None, env_of(&[]));
        assert_eq!(id.name, PLACEHOLDER_NAME);
        assert_eq!(id.email, "anonymous@example.invalid");
    }

    #[test]
    fn test_sanitize_empty_result_uses_placeholder() {
        assert_eq!(sanitize("ÆØÅ!"), "anonymous");
        assert_eq!(sanitize("Jane_Doe.99"), "jane_doe.99");
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Identity::new("Jane", "jane@example.com").to_string(),
            "Jane <jane@example.com>"
        );
    }
}
