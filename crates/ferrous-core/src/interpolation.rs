use crate::trigger::TriggerEvent;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("interpolation pattern is valid")
});

/// Context for `${{ ... }}` interpolation in workflow strings.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Workflow `env` entries
    pub variables: HashMap<String, String>,
    /// Values describing the triggering event
    pub event: HashMap<String, String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a workflow reacting to `event`.
    pub fn for_event(
        workflow: &str,
        event: &TriggerEvent,
        variables: &HashMap<String, String>,
    ) -> Self {
        let mut values = HashMap::from([
            ("workflow".to_string(), workflow.to_string()),
            ("event".to_string(), event.kind.to_string()),
            ("ref".to_string(), event.git_ref.clone()),
            ("branch".to_string(), event.branch().to_string()),
        ]);
        if let Some(sha) = &event.sha {
            values.insert("sha".to_string(), sha.clone());
        }
        if let Some(actor) = &event.actor {
            values.insert("actor".to_string(), actor.clone());
        }

        Self {
            variables: variables.clone(),
            event: values,
        }
    }

    /// Interpolate expressions in a string.
    ///
    /// Supports:
    /// - `${{ ref }}`, `${{ branch }}`, `${{ event }}`, `${{ workflow }}`,
    ///   `${{ sha }}`, `${{ actor }}` - trigger values
    /// - `${{ env.VAR }}` - workflow env, then process environment
    ///
    /// Unknown expressions resolve to the empty string.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self
                .variables
                .get(var_name)
                .cloned()
                .or_else(|| std::env::var(var_name).ok())
                .unwrap_or_default();
        }

        // `github.ref` style prefixes are accepted for familiarity
        let key = expr.strip_prefix("github.").unwrap_or(expr);
        self.event.get(key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> InterpolationContext {
        let event = TriggerEvent::push("refs/heads/main", ["src/lib.rs"]).with_sha("abc123");
        let env = HashMap::from([("TIER".to_string(), "nightly".to_string())]);
        InterpolationContext::for_event("ci", &event, &env)
    }

    #[test]
    fn test_interpolate_event_values() {
        let ctx = context();
        assert_eq!(ctx.interpolate("${{ workflow }}-${{ branch }}"), "ci-main");
        assert_eq!(ctx.interpolate("${{ ref }}"), "refs/heads/main");
        assert_eq!(ctx.interpolate("${{github.sha}}"), "abc123");
        assert_eq!(ctx.interpolate("${{ event }}"), "push");
    }

    #[test]
    fn test_interpolate_env() {
        let ctx = context();
        assert_eq!(ctx.interpolate("group-${{ env.TIER }}"), "group-nightly");
    }

    #[test]
    fn test_plain_string_untouched() {
        let ctx = context();
        assert_eq!(ctx.interpolate("ci"), "ci");
    }

    #[test]
    fn test_unknown_expression_is_empty() {
        let ctx = context();
        assert_eq!(ctx.interpolate("x${{ actor }}y"), "xy");
    }
}
