use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detect::ThreatReport;

/// Directive grammar: `promptshield-ignore`, `promptshield-ignore next`,
/// `promptshield-ignore next N`, `promptshield-ignore all`.
static DIRECTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"promptshield-ignore(?:\s+(all\b|next\b(?:\s+(\d+))?))?").expect("directive regex")
});

/// `ignore all` is only honored near the top of the file.
const ALL_DIRECTIVE_WINDOW: usize = 10;

/// An inclusive range of suppressed lines (1-based). `used` is set when the
/// range swallowed at least one threat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreRange {
    pub start: usize,
    pub end: usize,
    pub used: bool,
}

/// Options for [`filter_threats`].
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    /// Disable all directive processing; threats pass through unfiltered.
    pub no_inline_ignore: bool,
}

/// Output of the directive filter: the surviving threats plus the ranges
/// that suppressed nothing (stale-suppression warnings).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilteredThreats {
    pub threats: Vec<ThreatReport>,
    pub unused_ignores: Vec<IgnoreRange>,
}

struct ParsedRange {
    range: IgnoreRange,
    is_all: bool,
}

/// Remove threats suppressed by inline `promptshield-ignore` directives.
///
/// Ranges are sorted by start line and threats by line; the merge walks both
/// lists once. An `ignore all` directive within the first ten lines
/// suppresses the whole file — and is still reported in `unused_ignores`
/// either way, which callers rely on to warn about it.
pub fn filter_threats(
    text: &str,
    threats: Vec<ThreatReport>,
    options: &FilterOptions,
) -> FilteredThreats {
    if options.no_inline_ignore {
        return FilteredThreats {
            threats,
            unused_ignores: Vec::new(),
        };
    }

    let mut ranges = collect_ranges(text);
    if ranges.is_empty() {
        return FilteredThreats {
            threats,
            unused_ignores: Vec::new(),
        };
    }
    ranges.sort_by_key(|r| r.range.start);

    let mut sorted = threats;
    sorted.sort_by_key(|t| t.location.line);

    let mut kept = Vec::new();
    let mut next_range = 0;
    let mut active: Vec<usize> = Vec::new();

    for threat in sorted {
        let line = threat.location.line;
        while next_range < ranges.len() && ranges[next_range].range.start <= line {
            active.push(next_range);
            next_range += 1;
        }
        active.retain(|&i| ranges[i].range.end >= line);
        if active.is_empty() {
            kept.push(threat);
        } else {
            for &i in &active {
                ranges[i].range.used = true;
            }
        }
    }

    let unused_ignores = ranges
        .into_iter()
        .filter(|r| !r.range.used || r.is_all)
        .map(|r| r.range)
        .collect();

    FilteredThreats {
        threats: kept,
        unused_ignores,
    }
}

fn collect_ranges(text: &str) -> Vec<ParsedRange> {
    let lines: Vec<&str> = text.lines().collect();
    let total = lines.len().max(1);
    let mut ranges = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let line_no = i + 1;
        let Some(caps) = DIRECTIVE_RE.captures(line) else {
            continue;
        };
        match caps.get(1).map(|m| m.as_str()) {
            Some("all") => {
                if line_no <= ALL_DIRECTIVE_WINDOW {
                    ranges.push(ParsedRange {
                        range: IgnoreRange {
                            start: 1,
                            end: total,
                            used: false,
                        },
                        is_all: true,
                    });
                }
            }
            Some(next) => {
                let count: usize = caps
                    .get(2)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(1);
                debug_assert!(next.starts_with("next"));
                ranges.push(ParsedRange {
                    range: IgnoreRange {
                        start: line_no + 1,
                        end: line_no + count,
                        used: false,
                    },
                    is_all: false,
                });
            }
            None => {
                // A bare directive on its own (comment-only) line shields
                // the next line; appended to a line of code it shields that
                // line itself.
                let (start, end) = if is_standalone_directive(line) {
                    (line_no + 1, line_no + 1)
                } else {
                    (line_no, line_no)
                };
                ranges.push(ParsedRange {
                    range: IgnoreRange {
                        start,
                        end,
                        used: false,
                    },
                    is_all: false,
                });
            }
        }
    }
    ranges
}

/// True when the line holds nothing but a comment wrapper around the bare
/// directive.
fn is_standalone_directive(line: &str) -> bool {
    let mut rest = line.trim();
    for opener in ["<!--", "//", "/*", "#", ";", "--", "*"] {
        if let Some(stripped) = rest.strip_prefix(opener) {
            rest = stripped.trim();
            break;
        }
    }
    let Some(after) = rest.strip_prefix("promptshield-ignore") else {
        return false;
    };
    let mut after = after.trim();
    for closer in ["-->", "*/"] {
        if let Some(stripped) = after.strip_suffix(closer) {
            after = stripped.trim();
            break;
        }
    }
    after.is_empty()
}
