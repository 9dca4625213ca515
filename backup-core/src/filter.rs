/// One comma-separated pattern: an optional schema glob plus a required
/// table glob (`schema.table`, or just `table` to match any schema).
#[derive(Clone, Debug, PartialEq)]
struct Pattern {
    schema: Option<String>,
    table: String,
}

/// Comma-separated glob patterns over `schema.table`, with `*`/`?`
/// wildcards, used by both backup (selects which tables to archive) and
/// restore (selects which tables in the archive to restore). Spec §4.7.
#[derive(Clone, Debug, PartialEq)]
pub struct TableFilter {
    matches_all: bool,
    patterns: Vec<Pattern>,
}

impl Default for TableFilter {
    fn default() -> Self {
        Self { matches_all: true, patterns: Vec::new() }
    }
}

impl TableFilter {
    /// Empty string or `"*"` means match everything; invalid/empty pattern
    /// lists also fall back to match-all.
    pub fn parse(filter_spec: &str) -> Self {
        let trimmed = filter_spec.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Self { matches_all: true, patterns: Vec::new() };
        }

        let mut patterns = Vec::new();
        for token in trimmed.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }

            let pattern = match token.split_once('.') {
                Some((schema_part, table_part)) => {
                    let schema_part = schema_part.trim();
                    let table_part = table_part.trim();
                    let schema = if schema_part.is_empty() || schema_part == "*" {
                        None
                    } else {
                        Some(schema_part.to_string())
                    };
                    Pattern { schema, table: table_part.to_string() }
                }
                None => Pattern { schema: None, table: token.to_string() },
            };

            if pattern.table.is_empty() {
                continue;
            }
            if pattern.schema.is_none() && pattern.table == "*" {
                return Self { matches_all: true, patterns: Vec::new() };
            }
            patterns.push(pattern);
        }

        if patterns.is_empty() {
            Self { matches_all: true, patterns: Vec::new() }
        } else {
            Self { matches_all: false, patterns }
        }
    }

    pub fn matches_all(&self) -> bool {
        self.matches_all
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn matches(&self, schema: &str, table_name: &str) -> bool {
        if self.matches_all {
            return true;
        }
        self.patterns.iter().any(|pattern| {
            if let Some(schema_pattern) = &pattern.schema {
                if !glob_match(schema_pattern, schema) {
                    return false;
                }
            }
            glob_match(&pattern.table, table_name)
        })
    }

    /// Convenience used by callers that only have a flat table list without
    /// per-call schema context (e.g. CLI previews) — matches against a
    /// fixed schema for every entry.
    pub fn matches_all_in(&self, schema: &str, table_names: &[String]) -> Vec<String> {
        table_names.iter().filter(|t| self.matches(schema, t)).cloned().collect()
    }
}

/// Iterative backtracking glob match over `?`/`*`, ported verbatim from the
/// classic single-pass wildcard matching algorithm (no regex engine, no
/// memoized recursion — the pattern and text here are always short table
/// identifiers).
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let mut p = 0usize;
    let mut t = 0usize;
    let mut star_p: Option<usize> = None;
    let mut star_t = 0usize;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star_p = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(sp) = star_p {
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_star_both_match_everything() {
        assert!(TableFilter::parse("").matches_all());
        assert!(TableFilter::parse("*").matches_all());
    }

    #[test]
    fn comma_separated_list_matches_exact_names() {
        let filter = TableFilter::parse("a,b");
        assert!(filter.matches("", "a"));
        assert!(filter.matches("", "b"));
        assert!(!filter.matches("", "c"));
    }

    #[test]
    fn glob_wildcard_matches_suffix_pattern() {
        let filter = TableFilter::parse("*_log");
        assert!(filter.matches("", "error_log"));
        assert!(!filter.matches("", "error_logs"));
    }

    #[test]
    fn schema_qualified_pattern_requires_schema_match() {
        let filter = TableFilter::parse("dbo.u*");
        assert!(filter.matches("dbo", "users"));
        assert!(!filter.matches("sys", "users"));
    }

    #[test]
    fn s6_filter_precision_scenario() {
        let tables = ["users", "user_logs", "audit_log", "products"];
        let filter = TableFilter::parse("user*,*_log");
        let matched: Vec<&str> = tables.iter().copied().filter(|t| filter.matches("", t)).collect();
        assert_eq!(matched, vec!["users", "user_logs", "audit_log"]);
    }

    #[test]
    fn whitespace_around_tokens_is_trimmed() {
        let filter = TableFilter::parse(" a , b ");
        assert!(filter.matches("", "a"));
        assert!(filter.matches("", "b"));
    }
}
