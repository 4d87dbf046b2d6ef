use std::collections::HashMap;
use std::sync::Arc;

use svclog_core::RingBuffer;

/// Opaque identity for a service's ring buffer.
///
/// The manager uses this to tell a restart (new buffer, same service name)
/// apart from a plan-only update (same buffer, different metadata):
/// identity, not equality of contents, is what matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Loki,
    Syslog,
    OpenTelemetry,
}

/// One token of a target's service selector.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SelectorToken {
    All,
    Name(String),
    Exclude(String),
}

/// The `services` list on a target.
///
/// An empty selector is the opt-out default: every service forwards to it.
/// Otherwise a service matches if any positive token (`all` or its own name)
/// selects it, *unless* a later `-name` token excludes it — exclusions are
/// always evaluated after positives, regardless of token order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector(Vec<SelectorToken>);

impl Selector {
    pub fn parse<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            tokens
                .into_iter()
                .map(|t| {
                    let t = t.as_ref();
                    if t == "all" {
                        SelectorToken::All
                    } else if let Some(name) = t.strip_prefix('-') {
                        SelectorToken::Exclude(name.to_string())
                    } else {
                        SelectorToken::Name(t.to_string())
                    }
                })
                .collect(),
        )
    }

    pub fn matches(&self, service: &str) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let positive = self.0.iter().any(|token| match token {
            SelectorToken::All => true,
            SelectorToken::Name(name) => name == service,
            SelectorToken::Exclude(_) => false,
        });
        if !positive {
            return false;
        }
        !self
            .0
            .iter()
            .any(|token| matches!(token, SelectorToken::Exclude(name) if name == service))
    }
}

/// Resolves `$VAR` and `${VAR}` placeholders in a label template against a
/// service's environment. Undefined variables expand to the empty string.
pub fn resolve_label_template(template: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut pos = 0;
    while pos < template.len() {
        match template[pos..].find('$') {
            None => {
                out.push_str(&template[pos..]);
                break;
            }
            Some(rel) => {
                out.push_str(&template[pos..pos + rel]);
                pos += rel;
                let after_dollar = pos + 1;
                if template[after_dollar..].starts_with('{') {
                    let brace_start = after_dollar + 1;
                    if let Some(end_rel) = template[brace_start..].find('}') {
                        let var = &template[brace_start..brace_start + end_rel];
                        out.push_str(env.get(var).map(String::as_str).unwrap_or(""));
                        pos = brace_start + end_rel + 1;
                    } else {
                        out.push('$');
                        pos = after_dollar;
                    }
                } else {
                    let ident_len = template[after_dollar..]
                        .char_indices()
                        .take_while(|&(_, c)| c.is_ascii_alphanumeric() || c == '_')
                        .count();
                    if ident_len == 0 {
                        out.push('$');
                        pos = after_dollar;
                    } else {
                        let var = &template[after_dollar..after_dollar + ident_len];
                        out.push_str(env.get(var).map(String::as_str).unwrap_or(""));
                        pos = after_dollar + ident_len;
                    }
                }
            }
        }
    }
    out
}

/// Resolves every label template of a target against one service's
/// environment.
pub fn resolve_labels(
    templates: &HashMap<String, String>,
    env: &HashMap<String, String>,
) -> HashMap<String, String> {
    templates
        .iter()
        .map(|(key, template)| (key.clone(), resolve_label_template(template, env)))
        .collect()
}

/// A narrow view onto one plan-managed service, just wide enough for the
/// gatherer and manager to do their job. Plan parsing and validation own the
/// concrete type that implements this.
pub trait ServiceView: Send + Sync {
    fn name(&self) -> &str;
    fn env(&self) -> &HashMap<String, String>;
    fn buffer_id(&self) -> BufferId;
    fn buffer(&self) -> RingBuffer;
}

/// A narrow view onto one plan-managed target.
pub trait TargetView: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> TargetKind;
    fn location(&self) -> &str;
    fn label_templates(&self) -> &HashMap<String, String>;
    fn selector(&self) -> &Selector;
}

/// A narrow view onto one plan snapshot: the services and targets the
/// manager needs, without pulling in whatever parses and validates them.
pub trait PlanView: Send + Sync {
    fn services(&self) -> &HashMap<String, Arc<dyn ServiceView>>;
    fn targets(&self) -> &HashMap<String, Arc<dyn TargetView>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_all_minus_one() {
        let selector = Selector::parse(["all", "-svc3"]);
        assert!(selector.matches("svc1"));
        assert!(selector.matches("svc2"));
        assert!(!selector.matches("svc3"));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = Selector::parse(Vec::<String>::new());
        assert!(selector.matches("anything"));
    }

    #[test]
    fn explicit_opt_in_excludes_unlisted_services() {
        let selector = Selector::parse(["svc1"]);
        assert!(selector.matches("svc1"));
        assert!(!selector.matches("svc2"));
    }

    #[test]
    fn label_templates_resolve_against_env() {
        let mut env = HashMap::new();
        env.insert("OWNER".to_string(), "alice".to_string());
        env.insert("IP".to_string(), "10.0.0.1".to_string());
        env.insert("PORT".to_string(), "80".to_string());

        assert_eq!(resolve_label_template("user-$OWNER", &env), "user-alice");
        assert_eq!(resolve_label_template("${IP}:${PORT}", &env), "10.0.0.1:80");
        assert_eq!(resolve_label_template("$MISSING-x", &env), "-x");
    }
}
