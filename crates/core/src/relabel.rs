//! Prometheus-style relabeling.
//!
//! [`RelabelConfig`] is the wire form (as found in PodLogs `spec.relabelings`);
//! [`Rule`] is the validated, compiled form consumed by [`process`].

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::labels::{is_valid_label_name, LabelSet};

const DEFAULT_SEPARATOR: &str = ";";
const DEFAULT_REGEX: &str = "(.*)";
const DEFAULT_REPLACEMENT: &str = "$1";

#[derive(Debug, thiserror::Error)]
pub enum RelabelError {
    #[error("unknown relabel action {0:?}")]
    UnknownAction(String),
    #[error("invalid regex {regex:?}: {source}")]
    InvalidRegex { regex: String, source: regex::Error },
    #[error("relabel action {0} requires targetLabel")]
    MissingTargetLabel(Action),
    #[error("{0:?} is an invalid target label")]
    InvalidTargetLabel(String),
    #[error("relabel action hashmod requires a non-zero modulus")]
    ZeroModulus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Replace,
    Keep,
    Drop,
    KeepEqual,
    DropEqual,
    HashMod,
    LabelMap,
    LabelDrop,
    LabelKeep,
    Lowercase,
    Uppercase,
}

impl FromStr for Action {
    type Err = RelabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "replace" => Action::Replace,
            "keep" => Action::Keep,
            "drop" => Action::Drop,
            "keepequal" => Action::KeepEqual,
            "dropequal" => Action::DropEqual,
            "hashmod" => Action::HashMod,
            "labelmap" => Action::LabelMap,
            "labeldrop" => Action::LabelDrop,
            "labelkeep" => Action::LabelKeep,
            "lowercase" => Action::Lowercase,
            "uppercase" => Action::Uppercase,
            _ => return Err(RelabelError::UnknownAction(s.to_string())),
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Replace => "replace",
            Action::Keep => "keep",
            Action::Drop => "drop",
            Action::KeepEqual => "keepequal",
            Action::DropEqual => "dropequal",
            Action::HashMod => "hashmod",
            Action::LabelMap => "labelmap",
            Action::LabelDrop => "labeldrop",
            Action::LabelKeep => "labelkeep",
            Action::Lowercase => "lowercase",
            Action::Uppercase => "uppercase",
        };
        f.write_str(s)
    }
}

/// Relabel rule as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelabelConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulus: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// A validated relabel rule with its regex compiled and anchored.
#[derive(Debug, Clone)]
pub struct Rule {
    pub source_labels: Vec<String>,
    pub separator: String,
    pub target_label: String,
    pub regex: Regex,
    pub modulus: u64,
    pub replacement: String,
    pub action: Action,
}

impl RelabelConfig {
    pub fn compile(&self) -> Result<Rule, RelabelError> {
        let action = match self.action.as_deref() {
            None | Some("") => Action::default(),
            Some(a) => a.parse()?,
        };
        let raw = self.regex.as_deref().unwrap_or(DEFAULT_REGEX);
        let regex = Regex::new(&format!("^(?:{})$", raw))
            .map_err(|source| RelabelError::InvalidRegex { regex: raw.to_string(), source })?;
        let target_label = self.target_label.clone().unwrap_or_default();

        let needs_target = matches!(
            action,
            Action::Replace | Action::HashMod | Action::Lowercase | Action::Uppercase | Action::KeepEqual | Action::DropEqual
        );
        if needs_target && target_label.is_empty() {
            return Err(RelabelError::MissingTargetLabel(action));
        }
        match action {
            Action::Replace if !is_valid_target_template(&target_label) => {
                return Err(RelabelError::InvalidTargetLabel(target_label))
            }
            Action::Lowercase | Action::Uppercase | Action::KeepEqual | Action::DropEqual | Action::HashMod
                if !is_valid_label_name(&target_label) =>
            {
                return Err(RelabelError::InvalidTargetLabel(target_label))
            }
            _ => {}
        }
        let modulus = self.modulus.unwrap_or(0);
        if action == Action::HashMod && modulus == 0 {
            return Err(RelabelError::ZeroModulus);
        }

        Ok(Rule {
            source_labels: self.source_labels.clone(),
            separator: self.separator.clone().unwrap_or_else(|| DEFAULT_SEPARATOR.to_string()),
            target_label,
            regex,
            modulus,
            replacement: self.replacement.clone().unwrap_or_else(|| DEFAULT_REPLACEMENT.to_string()),
            action,
        })
    }
}

/// Compile a list of configs, failing on the first invalid one.
pub fn compile_all(configs: &[RelabelConfig]) -> Result<Vec<Rule>, RelabelError> {
    configs.iter().map(RelabelConfig::compile).collect()
}

// Target labels for `replace` may reference capture groups, e.g. `pod_$1`.
fn is_valid_target_template(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '{' || c == '}')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

/// Apply `rules` in order. Returns `None` when a rule drops the label set.
pub fn process(labels: &LabelSet, rules: &[Rule]) -> Option<LabelSet> {
    let mut lb = labels.clone();
    for rule in rules {
        if !apply(&mut lb, rule) {
            return None;
        }
    }
    Some(lb)
}

fn apply(lb: &mut LabelSet, rule: &Rule) -> bool {
    let val = rule.source_labels.iter().map(|n| lb.get(n)).collect::<Vec<_>>().join(&rule.separator);

    match rule.action {
        Action::Drop => {
            if rule.regex.is_match(&val) { return false; }
        }
        Action::Keep => {
            if !rule.regex.is_match(&val) { return false; }
        }
        Action::DropEqual => {
            if lb.get(&rule.target_label) == val { return false; }
        }
        Action::KeepEqual => {
            if lb.get(&rule.target_label) != val { return false; }
        }
        Action::Replace => {
            let Some(caps) = rule.regex.captures(&val) else { return true; };
            let mut target = String::new();
            caps.expand(&rule.target_label, &mut target);
            if !is_valid_label_name(&target) { return true; }
            let mut res = String::new();
            caps.expand(&rule.replacement, &mut res);
            if res.is_empty() {
                lb.remove(&target);
            } else {
                lb.set(target, res);
            }
        }
        Action::Lowercase => lb.set(rule.target_label.clone(), val.to_lowercase()),
        Action::Uppercase => lb.set(rule.target_label.clone(), val.to_uppercase()),
        Action::HashMod => {
            let m = hash_mod(&val, rule.modulus);
            lb.set(rule.target_label.clone(), m.to_string());
        }
        Action::LabelMap => {
            let pairs: Vec<(String, String)> = lb.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            for (name, value) in pairs {
                if rule.regex.is_match(&name) {
                    let res = rule.regex.replace_all(&name, rule.replacement.as_str()).into_owned();
                    lb.set(res, value);
                }
            }
        }
        Action::LabelDrop => lb.retain(|k, _| !rule.regex.is_match(k)),
        Action::LabelKeep => lb.retain(|k, _| rule.regex.is_match(k)),
    }
    true
}

/// Low 64 bits of the MD5 digest, big-endian, as Prometheus computes `hashmod`.
fn hash_mod(val: &str, modulus: u64) -> u64 {
    let digest = Md5::digest(val.as_bytes());
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[8..16]);
    u64::from_be_bytes(low) % modulus
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ls(pairs: &[(&str, &str)]) -> LabelSet { pairs.iter().copied().collect() }

    fn rule(action: &str, src: &[&str], regex: Option<&str>, target: Option<&str>, repl: Option<&str>) -> Rule {
        RelabelConfig {
            source_labels: src.iter().map(|s| s.to_string()).collect(),
            target_label: target.map(str::to_string),
            regex: regex.map(str::to_string),
            replacement: repl.map(str::to_string),
            action: Some(action.to_string()),
            ..Default::default()
        }
        .compile()
        .unwrap()
    }

    #[test]
    fn drop_matching_value() {
        let r = rule("drop", &["app"], Some("frontend"), None, None);
        assert!(process(&ls(&[("app", "frontend")]), &[r.clone()]).is_none());
        assert!(process(&ls(&[("app", "backend")]), &[r]).is_some());
    }

    #[test]
    fn regex_is_fully_anchored() {
        let r = rule("keep", &["app"], Some("front"), None, None);
        assert!(process(&ls(&[("app", "frontend")]), &[r]).is_none());
    }

    #[test]
    fn replace_with_captures_and_defaults() {
        let r = rule("replace", &["ns", "pod"], Some("(.*);(.*)"), Some("instance"), Some("$1/$2"));
        let out = process(&ls(&[("ns", "a"), ("pod", "b")]), &[r]).unwrap();
        assert_eq!(out.get("instance"), "a/b");

        // Default regex + replacement copies the joined value.
        let r = RelabelConfig { source_labels: vec!["ns".into()], target_label: Some("namespace".into()), ..Default::default() }
            .compile()
            .unwrap();
        let out = process(&ls(&[("ns", "a")]), &[r]).unwrap();
        assert_eq!(out.get("namespace"), "a");
    }

    #[test]
    fn replace_without_match_is_noop_and_empty_result_deletes() {
        let r = rule("replace", &["x"], Some("nope"), Some("y"), None);
        assert_eq!(process(&ls(&[("x", "a")]), &[r]).unwrap(), ls(&[("x", "a")]));
        let r = rule("replace", &["missing"], Some("(.*)"), Some("x"), Some("$1"));
        assert!(!process(&ls(&[("x", "a")]), &[r]).unwrap().has("x"));
    }

    #[test]
    fn labelmap_labeldrop_labelkeep() {
        let input = ls(&[("__meta_kubernetes_pod_label_app", "web"), ("keep_me", "1")]);
        let r = rule("labelmap", &[], Some("__meta_kubernetes_pod_label_(.+)"), None, None);
        let out = process(&input, &[r]).unwrap();
        assert_eq!(out.get("app"), "web");

        let r = rule("labeldrop", &[], Some("__meta_.*"), None, None);
        assert_eq!(process(&input, &[r]).unwrap(), ls(&[("keep_me", "1")]));

        let r = rule("labelkeep", &[], Some("__meta_.*"), None, None);
        assert_eq!(process(&input, &[r]).unwrap().len(), 1);
    }

    #[test]
    fn equal_actions_and_case() {
        let input = ls(&[("a", "x"), ("b", "x"), ("c", "Y")]);
        assert!(process(&input, &[rule("keepequal", &["a"], None, Some("b"), None)]).is_some());
        assert!(process(&input, &[rule("dropequal", &["a"], None, Some("b"), None)]).is_none());
        let out = process(&input, &[rule("lowercase", &["c"], None, Some("d"), None)]).unwrap();
        assert_eq!(out.get("d"), "y");
    }

    #[test]
    fn hashmod_matches_prometheus_shards() {
        let shard = |modulus: u64, value: &str| {
            let r = RelabelConfig {
                source_labels: vec!["__address__".into()],
                target_label: Some("__tmp_hash".into()),
                modulus: Some(modulus),
                action: Some("hashmod".into()),
                ..Default::default()
            }
            .compile()
            .unwrap();
            process(&ls(&[("__address__", value)]), &[r]).unwrap().get("__tmp_hash").to_string()
        };
        assert_eq!(shard(4, "x"), "2");
        assert_eq!(shard(4, "ns/pod"), "3");
        assert_eq!(shard(4, "10.0.0.1:9100"), "1");
        assert_eq!(shard(1000, "x"), "726");
        assert_eq!(shard(1000, "ns/pod"), "675");
        assert_eq!(shard(1000, "10.0.0.1:9100"), "645");
    }

    #[test]
    fn validation_errors() {
        let bad = |c: RelabelConfig| c.compile().unwrap_err();
        assert!(matches!(bad(RelabelConfig { action: Some("explode".into()), ..Default::default() }), RelabelError::UnknownAction(_)));
        assert!(matches!(
            bad(RelabelConfig { regex: Some("(".into()), target_label: Some("x".into()), ..Default::default() }),
            RelabelError::InvalidRegex { .. }
        ));
        assert!(matches!(bad(RelabelConfig::default()), RelabelError::MissingTargetLabel(Action::Replace)));
        assert!(matches!(
            bad(RelabelConfig { action: Some("hashmod".into()), target_label: Some("x".into()), ..Default::default() }),
            RelabelError::ZeroModulus
        ));
    }

    #[test]
    fn deserializes_camel_case() {
        let c: RelabelConfig = serde_json::from_str(
            r#"{"sourceLabels":["__meta_kubernetes_pod_label_app"],"regex":"frontend","action":"Drop"}"#,
        )
        .unwrap();
        assert_eq!(c.compile().unwrap().action, Action::Drop);
    }
}
