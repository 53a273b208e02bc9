//! Splitting a session's raw console capture into rule buckets.

use crate::config::AnalyzeRule;
use indexmap::IndexMap;
use regex::Regex;
use std::sync::LazyLock;

/// Bucketed console lines, keyed by rule name, in capture order.
pub type LogData = IndexMap<String, Vec<String>>;

/// Scope value that matches every console line.
const SCOPE_ALL: &str = "ALL";

/// Kernel console lines look like `[SYSCALL    ]exit called, code: 0`.
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([A-Za-z0-9_/-]+)\s*\]\s?(.*)$").expect("line regex is valid")
});

/// Splits raw console text into [`LogData`] buckets.
///
/// Pure function of the raw text plus the rule set: no side effects, original
/// line order preserved within each bucket. Lines matching no rule simply do
/// not appear in the result; the raw log stays on disk for post-mortem
/// reading.
pub struct LogParser<'a> {
    rules: &'a [AnalyzeRule],
}

impl<'a> LogParser<'a> {
    /// Creates a parser over the given ordered rule set.
    pub fn new(rules: &'a [AnalyzeRule]) -> Self {
        Self { rules }
    }

    /// Buckets `raw` by rule.
    pub fn parse(&self, raw: &str) -> LogData {
        let mut data = LogData::new();

        for line in raw.lines() {
            let (tag, message) = match LINE_RE.captures(line) {
                Some(caps) => {
                    let tag = caps.get(1).map(|m| m.as_str());
                    let message = caps.get(2).map_or("", |m| m.as_str());
                    (tag, message)
                }
                None => (None, line),
            };

            for rule in self.rules {
                let in_scope = rule.scope == SCOPE_ALL || tag == Some(rule.scope.as_str());
                if !in_scope {
                    continue;
                }

                let captured = match &rule.pattern {
                    Some(pattern) => pattern.captures(message).map(|caps| {
                        caps.get(1)
                            .or_else(|| caps.get(0))
                            .map_or("", |m| m.as_str())
                    }),
                    None => Some(message),
                };

                if let Some(text) = captured {
                    data.entry(rule.name.clone())
                        .or_default()
                        .push(text.to_owned());
                }
            }
        }

        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleMode;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn rule(name: &str, scope: &str, pattern: Option<&str>) -> AnalyzeRule {
        AnalyzeRule {
            name: name.to_owned(),
            scope: scope.to_owned(),
            pattern: pattern.map(|p| Regex::new(p).expect("test pattern is valid")),
            mode: RuleMode::AddAsError,
            set_status: None,
        }
    }

    #[test]
    fn buckets_by_scope_and_pattern() {
        let rules = vec![
            rule("exit_codes", "SYSCALL", Some(r"exit called, code: (-?\d+)")),
            rule("kernel_errors", "KERNEL", None),
            rule("everything", "ALL", None),
        ];
        let parser = LogParser::new(&rules);

        let raw = indoc! {"
            [THREAD  ]created thread 3
            [SYSCALL ]exit called, code: 0
            [KERNEL  ]unhandled page fault at 0xdeadbeef
            [SYSCALL ]write(1, ...)
            plain line without a tag
        "};

        let data = parser.parse(raw);

        assert_eq!(data["exit_codes"], ["0"]);
        assert_eq!(data["kernel_errors"], ["unhandled page fault at 0xdeadbeef"]);
        // ALL receives every line; tagged lines contribute their message,
        // untagged lines are kept whole.
        assert_eq!(
            data["everything"],
            [
                "created thread 3",
                "exit called, code: 0",
                "unhandled page fault at 0xdeadbeef",
                "write(1, ...)",
                "plain line without a tag",
            ]
        );
        // No bucket for unmatched rules.
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn order_within_bucket_is_capture_order() {
        let rules = vec![rule("codes", "SYSCALL", Some(r"code: (-?\d+)"))];
        let parser = LogParser::new(&rules);
        let raw = "[SYSCALL ]code: 3\n[SYSCALL ]code: 1\n[SYSCALL ]code: 2\n";
        assert_eq!(parser.parse(raw)["codes"], ["3", "1", "2"]);
    }

    #[test]
    fn pattern_without_group_keeps_whole_match() {
        let rules = vec![rule("asserts", "KERNEL", Some(r"assertion failed.*"))];
        let parser = LogParser::new(&rules);
        let raw = "[KERNEL ]assertion failed: x > 0\n[KERNEL ]all good\n";
        assert_eq!(parser.parse(raw)["asserts"], ["assertion failed: x > 0"]);
    }

    #[test]
    fn no_matches_means_no_bucket() {
        let rules = vec![rule("codes", "SYSCALL", Some(r"code: (\d+)"))];
        let parser = LogParser::new(&rules);
        assert!(parser.parse("[KERNEL ]nothing relevant\n").is_empty());
    }

    #[test]
    fn two_rules_can_share_a_bucket() {
        let rules = vec![
            rule("errors", "KERNEL", None),
            rule("errors", "LOCK", None),
        ];
        let parser = LogParser::new(&rules);
        let raw = "[KERNEL ]oops\n[LOCK   ]deadlock detected\n";
        assert_eq!(parser.parse(raw)["errors"], ["oops", "deadlock detected"]);
    }
}
