use once_cell::sync::Lazy;
use regex::Regex;

use super::{ScanContext, ScanOptions, Severity, ThreatCategory, ThreatReport};

/// Maximal identifier-like runs: Unicode letters, digits, underscore.
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}_]+").expect("token regex"));

fn is_latin(c: char) -> bool {
    c.is_ascii_alphabetic()
        || matches!(c, '\u{00C0}'..='\u{024F}' | '\u{1E00}'..='\u{1EFF}')
}

fn is_cyrillic(c: char) -> bool {
    matches!(
        c,
        '\u{0400}'..='\u{04FF}' | '\u{0500}'..='\u{052F}' | '\u{1C80}'..='\u{1C88}'
            | '\u{2DE0}'..='\u{2DFF}' | '\u{A640}'..='\u{A69F}'
    )
}

fn is_greek(c: char) -> bool {
    matches!(c, '\u{0370}'..='\u{03FF}' | '\u{1F00}'..='\u{1FFF}')
}

/// Homoglyph detector. A token is flagged only when it mixes Latin with
/// Cyrillic or Greek; a token written entirely in one script is never
/// flagged, whatever the script.
pub fn detect_homoglyph(
    text: &str,
    options: &ScanOptions,
    ctx: &mut ScanContext,
) -> Vec<ThreatReport> {
    let mut threats = Vec::new();

    for token in TOKEN_RE.find_iter(text) {
        let has_latin = token.as_str().chars().any(is_latin);
        if !has_latin {
            continue;
        }
        let has_cyrillic = token.as_str().chars().any(is_cyrillic);
        let has_greek = token.as_str().chars().any(is_greek);
        if !has_cyrillic && !has_greek {
            continue;
        }

        let mut scripts = vec!["Latin"];
        if has_cyrillic {
            scripts.push("Cyrillic");
        }
        if has_greek {
            scripts.push("Greek");
        }
        let location = ctx.locate_byte(text, token.start());
        threats.push(
            ThreatReport::new(
                ThreatCategory::Homoglyph,
                1,
                Severity::Critical,
                format!(
                    "Mixed-script token `{}` ({})",
                    token.as_str(),
                    scripts.join(" + ")
                ),
                location,
                token.as_str(),
            )
            .with_suggestion("Rewrite the token in a single script"),
        );
        if options.stop_on_first_threat {
            return threats;
        }
    }
    threats
}
