//! Persona prompt rendering and passphrase matching.
//!
//! The persona block is advisory text placed ahead of the user's message; it is not a
//! security boundary.

use chrono::NaiveDateTime;

use crate::config::PersonaConfig;

/// Placeholder replaced with the current local time in the system prompt.
pub const NOW_PLACEHOLDER: &str = "{now}";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// True when the passphrase is configured and occurs anywhere in `text`.
pub fn contains_passphrase(persona: &PersonaConfig, text: &str) -> bool {
    !persona.passphrase.is_empty() && text.contains(persona.passphrase.as_str())
}

/// Substitute `{now}` (formatted `YYYY-MM-DD HH:MM:SS`) into the template.
pub fn render_system_prompt(template: &str, now: NaiveDateTime) -> String {
    if template.contains(NOW_PLACEHOLDER) {
        template.replace(NOW_PLACEHOLDER, &now.format(TIMESTAMP_FORMAT).to_string())
    } else {
        template.to_string()
    }
}

/// Render the system prompt with the local wall clock.
pub fn render_now(template: &str) -> String {
    render_system_prompt(template, chrono::Local::now().naive_local())
}

/// Persona block, blank line, label, user text. A blank persona yields the user text alone.
pub fn compose(rendered_persona: &str, label: &str, user_text: &str) -> String {
    let persona = rendered_persona.trim();
    if persona.is_empty() {
        return user_text.to_string();
    }
    format!("{}\n\n{}{}", persona, label, user_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn passphrase_matches_as_substring() {
        let persona = PersonaConfig::default();
        assert!(contains_passphrase(&persona, "星塵未眠"));
        assert!(contains_passphrase(&persona, "嗨，星塵未眠！"));
        assert!(!contains_passphrase(&persona, "星塵"));
    }

    #[test]
    fn empty_passphrase_never_matches() {
        let persona = PersonaConfig {
            passphrase: String::new(),
            ..PersonaConfig::default()
        };
        assert!(!contains_passphrase(&persona, "anything"));
    }

    #[test]
    fn renders_timestamp_placeholder() {
        let out = render_system_prompt("time: {now}.", at(7, 5, 3));
        assert_eq!(out, "time: 2024-03-09 07:05:03.");
    }

    #[test]
    fn template_without_placeholder_is_unchanged() {
        assert_eq!(render_system_prompt("plain", at(0, 0, 0)), "plain");
    }

    #[test]
    fn compose_keeps_persona_first() {
        let out = compose("be kind", "User: ", "hello");
        assert_eq!(out, "be kind\n\nUser: hello");
    }

    #[test]
    fn compose_with_blank_persona_is_user_text() {
        assert_eq!(compose("  \n", "User: ", "hello"), "hello");
    }
}
