//! Machine naming.
//!
//! Every machine name is produced from a per-runner template so that an
//! inventory pass can match hosts back to the runner that created them:
//! `runner-<token prefix>-<machine_name>`, where `machine_name` carries a
//! single `%s` replaced by `<unix seconds>-<random hex>`.

use regex::Regex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::RunnerConfig;

const PLACEHOLDER: &str = "%s";
const MAX_DNS_LABEL: usize = 63;

/// Lowercase, replace anything outside `[a-z0-9-]` with `-`, trim dashes and
/// cap at the DNS label length.
pub fn make_rfc1123_compatible(name: &str) -> String {
    let replaced: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect();

    let mut label: String = replaced.trim_matches('-').chars().take(MAX_DNS_LABEL).collect();
    while label.ends_with('-') {
        label.pop();
    }
    label
}

/// Template used for every machine of this runner
pub fn machine_name_template(config: &RunnerConfig) -> String {
    let machine_name = config
        .machine
        .as_ref()
        .map(|m| m.machine_name.as_str())
        .unwrap_or_default();

    let runner = make_rfc1123_compatible(&config.short_description());
    if runner.is_empty() {
        return machine_name.to_string();
    }

    format!("runner-{runner}-{machine_name}")
}

/// Scanf-like match: the text before `%s` must be a prefix and be followed by
/// at least one non-whitespace character.
pub fn matches_template(name: &str, template: &str) -> bool {
    template_matcher(template).is_some_and(|re| re.is_match(name))
}

/// Keep only names produced by the given template
pub fn filter_by_template(names: Vec<String>, template: &str) -> Vec<String> {
    let Some(matcher) = template_matcher(template) else {
        return Vec::new();
    };

    names.into_iter().filter(|name| matcher.is_match(name)).collect()
}

fn template_matcher(template: &str) -> Option<Regex> {
    let (prefix, _) = template.split_once(PLACEHOLDER)?;
    Regex::new(&format!(r"^{}\S", regex::escape(prefix))).ok()
}

/// Fresh, unique machine name for this runner
pub fn new_machine_name(config: &RunnerConfig) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let random: u32 = rand::random();

    machine_name_template(config).replacen(PLACEHOLDER, &format!("{now}-{random:08x}"), 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineSettings;
    use proptest::prelude::*;

    fn runner(token: &str, template: &str) -> RunnerConfig {
        RunnerConfig {
            token: token.to_string(),
            machine: Some(MachineSettings {
                machine_name: template.to_string(),
                ..MachineSettings::default()
            }),
            ..RunnerConfig::default()
        }
    }

    fn assert_rfc1123(name: &str) {
        assert!(name.len() <= 253, "name too long: {name}");
        assert!(
            name.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
            "invalid characters in {name}"
        );
        assert!(!name.starts_with('-') && !name.ends_with('-'), "bad edges in {name}");
    }

    #[test]
    fn test_new_machine_name_is_dns_compatible() {
        for token in ["token-of", "ToK3_?OF"] {
            let name = new_machine_name(&runner(token, "test-machine-%s"));
            assert_rfc1123(&name);
            assert!(matches_template(&name, &machine_name_template(&runner(token, "test-machine-%s"))));
        }
    }

    #[test]
    fn test_new_machine_name_is_unique() {
        let config = runner("", "test-machine-%s");
        let a = new_machine_name(&config);
        let b = new_machine_name(&config);
        assert_ne!(a, b);
        assert!(a.starts_with("test-machine-"));
    }

    #[test]
    fn test_template_includes_runner_prefix() {
        let config = runner("ToK3_?OFxyz", "auto-%s");
        assert_eq!(machine_name_template(&config), "runner-tok3--of-auto-%s");
    }

    #[test]
    fn test_matches_template() {
        assert!(matches_template("test-machine-xyz", "test-machine-%s"));
        assert!(!matches_template("test-other-machine-xyz", "test-machine-%s"));
        assert!(!matches_template("test-machine-", "test-machine-%s"));
        assert!(!matches_template("test-machine-xyz", "test-machine"));
    }

    #[test]
    fn test_filter_by_template() {
        let machines = vec!["test-machine".to_string(), "machine-template-10".to_string()];
        let filtered = filter_by_template(machines, "machine-template-%s");
        assert_eq!(filtered, vec!["machine-template-10".to_string()]);
    }

    proptest! {
        #[test]
        fn generated_names_match_their_template(token in "[A-Za-z0-9_?]{0,12}", base in "[a-z]{1,10}") {
            let config = runner(&token, &format!("{base}-%s"));
            let name = new_machine_name(&config);
            prop_assert!(matches_template(&name, &machine_name_template(&config)));
        }

        #[test]
        fn sanitized_labels_are_dns_safe(input in ".{0,80}") {
            let label = make_rfc1123_compatible(&input);
            prop_assert!(label.len() <= MAX_DNS_LABEL);
            prop_assert!(label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            prop_assert!(!label.starts_with('-') && !label.ends_with('-'));
        }
    }
}
