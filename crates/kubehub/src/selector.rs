//! Compiled Kubernetes label selectors.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("unsupported selector operator {0:?}")]
    UnknownOperator(String),
    #[error("operator {operator} on key {key:?} requires at least one value")]
    MissingValues { key: String, operator: &'static str },
    #[error("operator {operator} on key {key:?} takes no values")]
    UnexpectedValues { key: String, operator: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::In(k, vs) => labels.get(k).is_some_and(|v| vs.contains(v)),
            // NotIn also matches when the key is absent.
            Requirement::NotIn(k, vs) => labels.get(k).map_or(true, |v| !vs.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    reqs: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self { Self::default() }

    pub fn from_label_selector(ls: &LabelSelector) -> Result<Self, SelectorError> {
        let mut reqs = Vec::new();
        for (k, v) in ls.match_labels.iter().flatten() {
            reqs.push(Requirement::Equals(k.clone(), v.clone()));
        }
        for expr in ls.match_expressions.iter().flatten() {
            let values = expr.values.clone().unwrap_or_default();
            let key = expr.key.clone();
            let req = match expr.operator.as_str() {
                "In" | "NotIn" if values.is_empty() => {
                    let operator = if expr.operator == "In" { "In" } else { "NotIn" };
                    return Err(SelectorError::MissingValues { key, operator });
                }
                "Exists" | "DoesNotExist" if !values.is_empty() => {
                    let operator = if expr.operator == "Exists" { "Exists" } else { "DoesNotExist" };
                    return Err(SelectorError::UnexpectedValues { key, operator });
                }
                "In" => Requirement::In(key, values),
                "NotIn" => Requirement::NotIn(key, values),
                "Exists" => Requirement::Exists(key),
                "DoesNotExist" => Requirement::DoesNotExist(key),
                other => return Err(SelectorError::UnknownOperator(other.to_string())),
            };
            reqs.push(req);
        }
        Ok(Self { reqs })
    }

    pub fn is_everything(&self) -> bool { self.reqs.is_empty() }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool { self.reqs.iter().all(|r| r.matches(labels)) }

    /// Like [`matches`](Self::matches) for objects whose labels may be unset.
    pub fn matches_opt(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        match labels {
            Some(l) => self.matches(l),
            None => self.matches(&BTreeMap::new()),
        }
    }
}

/// Renders the selector in the API server's query syntax.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.reqs.iter().enumerate() {
            if i > 0 { f.write_str(",")?; }
            match r {
                Requirement::Equals(k, v) => write!(f, "{}={}", k, v)?,
                Requirement::In(k, vs) => write!(f, "{} in ({})", k, vs.join(","))?,
                Requirement::NotIn(k, vs) => write!(f, "{} notin ({})", k, vs.join(","))?,
                Requirement::Exists(k) => write!(f, "{}", k)?,
                Requirement::DoesNotExist(k) => write!(f, "!{}", k)?,
            }
        }
        Ok(())
    }
}
