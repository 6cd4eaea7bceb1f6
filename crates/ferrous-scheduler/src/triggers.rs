//! Trigger matching and evaluation.

use ferrous_core::trigger::TriggerEvent;
use ferrous_core::workflow::{TriggerConfig, WorkflowDefinition};

/// Matcher for deciding whether an event should start a run.
///
/// This is a pure admission filter: a rejected event has no side effects.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check if a workflow should be triggered by an event.
    pub fn matches(&self, workflow: &WorkflowDefinition, event: &TriggerEvent) -> bool {
        if workflow.triggers.is_empty() {
            // Default: trigger on push to any branch
            return event.kind == ferrous_core::trigger::EventKind::Push;
        }

        workflow
            .triggers
            .iter()
            .any(|trigger| self.trigger_matches(trigger, event))
    }

    fn trigger_matches(&self, trigger: &TriggerConfig, event: &TriggerEvent) -> bool {
        if trigger.trigger_type != event.kind {
            return false;
        }
        self.branch_matches(&trigger.branches, event.branch())
            && self.paths_match(&trigger.paths, &trigger.paths_ignore, event)
    }

    fn branch_matches(&self, patterns: &[String], branch: &str) -> bool {
        if patterns.is_empty() {
            return true; // Match all branches if no patterns specified
        }
        patterns.iter().any(|p| glob_match(p, branch))
    }

    fn paths_match(&self, include: &[String], exclude: &[String], event: &TriggerEvent) -> bool {
        if include.is_empty() && exclude.is_empty() {
            return true; // No path filtering
        }
        if event.changed_paths.is_empty() {
            return false;
        }

        let included = include.is_empty()
            || event
                .changed_paths
                .iter()
                .any(|path| include.iter().any(|p| glob_match(p, path)));

        let excluded = !exclude.is_empty()
            && event
                .changed_paths
                .iter()
                .all(|path| exclude.iter().any(|p| glob_match(p, path)));

        included && !excluded
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Match `text` against a glob pattern.
///
/// `*` matches within one path segment, `**` crosses segments (and `**/`
/// also matches no directory at all), `?` matches a single non-`/` character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let mut glob = Glob {
        pattern: &pattern,
        text: &text,
        memo: vec![None; (pattern.len() + 1) * (text.len() + 1)],
    };
    glob.matches(0, 0)
}

/// Backtracking matcher memoized on (pattern index, text index), so every
/// pair is decided at most once however many stars the pattern holds.
struct Glob<'a> {
    pattern: &'a [char],
    text: &'a [char],
    memo: Vec<Option<bool>>,
}

impl Glob<'_> {
    fn matches(&mut self, p: usize, t: usize) -> bool {
        let slot = p * (self.text.len() + 1) + t;
        if let Some(known) = self.memo[slot] {
            return known;
        }
        let result = self.step(p, t);
        self.memo[slot] = Some(result);
        result
    }

    fn step(&mut self, p: usize, t: usize) -> bool {
        let (pattern, text) = (self.pattern, self.text);
        match pattern.get(p) {
            None => t == text.len(),
            Some('*') if pattern.get(p + 1) == Some(&'*') => {
                let mut rest = p + 2;
                // `**/` may also match zero directories
                if pattern.get(rest) == Some(&'/') && self.matches(rest + 1, t) {
                    return true;
                }
                while pattern.get(rest) == Some(&'*') {
                    rest += 1;
                }
                (t..=text.len()).any(|i| self.matches(rest, i))
            }
            Some('*') => {
                for i in t..=text.len() {
                    if self.matches(p + 1, i) {
                        return true;
                    }
                    if text.get(i) == Some(&'/') {
                        break;
                    }
                }
                false
            }
            Some('?') => match text.get(t) {
                Some(c) if *c != '/' => self.matches(p + 1, t + 1),
                _ => false,
            },
            Some(c) => text.get(t) == Some(c) && self.matches(p + 1, t + 1),
        }
    }
}
