//! Keyboard-layout option handling.
//!
//! The X server holds the session's layout option list. One option,
//! `terminate:ctrl_alt_bksp`, lets Ctrl+Alt+Backspace kill the server —
//! an escape hatch straight past the screen locker. When that option is
//! present at startup the guard strips it from the list while the screen
//! is locked and puts it back on unlock.
//!
//! The option store belongs to the user's X session, so every query and
//! write runs in a subprocess under the unprivileged identity.

use std::process::Stdio;
use std::sync::Arc;

use crate::privilege::{Identity, PrivilegeContext};
use crate::restore::{EndpointError, SettingEndpoint};

/// The option that must not survive while the screen is locked.
pub const TERMINATE_OPTION: &str = "terminate:ctrl_alt_bksp";

const SETXKBMAP: &str = "setxkbmap";

/// Removes every occurrence of `token` from an option list, reporting
/// whether anything was removed.
#[must_use]
pub fn remove_token(options: &[String], token: &str) -> (Vec<String>, bool) {
    let mut removed = false;
    let kept = options
        .iter()
        .filter(|option| {
            if option.as_str() == token {
                removed = true;
                false
            } else {
                true
            }
        })
        .cloned()
        .collect();
    (kept, removed)
}

/// Splits a comma-separated option string into tokens, dropping empties.
#[must_use]
pub fn parse_option_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Extracts the option list from `setxkbmap -query` output.
#[must_use]
pub fn options_from_query(output: &str) -> Vec<String> {
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("options:") {
            return parse_option_list(rest);
        }
    }
    Vec::new()
}

/// Endpoint for the X server's layout option list.
#[derive(Debug)]
pub struct LayoutOptions {
    privilege: Arc<PrivilegeContext>,
}

impl LayoutOptions {
    pub fn new(privilege: Arc<PrivilegeContext>) -> Self {
        Self { privilege }
    }
}

impl SettingEndpoint for LayoutOptions {
    type Value = Vec<String>;

    fn describe(&self) -> &str {
        "keyboard layout options"
    }

    async fn read(&mut self) -> Result<Vec<String>, EndpointError> {
        let mut command = self.privilege.command_as(Identity::Unprivileged, SETXKBMAP);
        command
            .arg("-query")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let output = command.output().await?;
        if !output.status.success() {
            return Err(EndpointError::Unavailable(format!(
                "{SETXKBMAP} -query exited with {}",
                output.status
            )));
        }
        Ok(options_from_query(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn write(&mut self, value: &Vec<String>) -> Result<(), EndpointError> {
        let mut command = self.privilege.command_as(Identity::Unprivileged, SETXKBMAP);
        // A bare -option clears the server-side list before the new list
        // is installed; layout, model, and variant are left untouched.
        command.arg("-option").arg("");
        if !value.is_empty() {
            command.arg("-option").arg(value.join(","));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = command.status().await?;
        if !status.success() {
            return Err(EndpointError::Unavailable(format!(
                "{SETXKBMAP} exited with {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn remove_token_from_middle_keeps_neighbours() {
        let (kept, removed) = remove_token(
            &list(&["grp:alt_shift_toggle", TERMINATE_OPTION, "caps:escape"]),
            TERMINATE_OPTION,
        );
        assert!(removed);
        assert_eq!(kept, list(&["grp:alt_shift_toggle", "caps:escape"]));
    }

    #[test]
    fn remove_token_when_it_is_the_only_option() {
        let (kept, removed) = remove_token(&list(&[TERMINATE_OPTION]), TERMINATE_OPTION);
        assert!(removed);
        assert!(kept.is_empty());
    }

    #[test]
    fn remove_token_handles_repeats() {
        let (kept, removed) = remove_token(
            &list(&[TERMINATE_OPTION, "caps:escape", TERMINATE_OPTION]),
            TERMINATE_OPTION,
        );
        assert!(removed);
        assert_eq!(kept, list(&["caps:escape"]));
    }

    #[test]
    fn remove_token_reports_absence() {
        let original = list(&["caps:escape"]);
        let (kept, removed) = remove_token(&original, TERMINATE_OPTION);
        assert!(!removed);
        assert_eq!(kept, original);
    }

    #[test]
    fn parse_option_list_trims_and_drops_empties() {
        assert_eq!(
            parse_option_list(" caps:escape, ,grp:menu_toggle "),
            list(&["caps:escape", "grp:menu_toggle"])
        );
        assert!(parse_option_list("").is_empty());
    }

    #[test]
    fn options_are_parsed_from_query_output() {
        let output = "rules:      evdev\n\
                      model:      pc105\n\
                      layout:     gb\n\
                      options:    caps:escape,terminate:ctrl_alt_bksp\n";
        assert_eq!(
            options_from_query(output),
            list(&["caps:escape", TERMINATE_OPTION])
        );
    }

    #[test]
    fn query_without_options_line_yields_empty_list() {
        let output = "rules:      evdev\nmodel:      pc105\nlayout:     gb\n";
        assert!(options_from_query(output).is_empty());
    }
}
