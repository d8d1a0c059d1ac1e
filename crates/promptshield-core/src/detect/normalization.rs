use unicode_normalization::UnicodeNormalization;

use super::{ScanContext, ScanOptions, Severity, ThreatCategory, ThreatReport};

fn nfkc_char(c: char) -> String {
    std::iter::once(c).nfkc().collect()
}

/// Characters whose NFKC form differs from themselves (fullwidth letters,
/// ligatures, compatibility digits, ...). Contiguous differing characters
/// are grouped into one span. Heuristic by nature: legitimate multilingual
/// text can trigger it.
pub fn detect_normalization(
    text: &str,
    options: &ScanOptions,
    ctx: &mut ScanContext,
) -> Vec<ThreatReport> {
    if options.min_severity > Severity::High {
        return Vec::new();
    }

    let mut threats = Vec::new();
    let mut run: Option<(usize, String, String)> = None;

    for (pos, c) in text.chars().enumerate() {
        let normalized = nfkc_char(c);
        let differs = normalized.chars().count() != 1 || normalized.chars().next() != Some(c);
        if differs {
            match run.as_mut() {
                Some((_, original, mapped)) => {
                    original.push(c);
                    mapped.push_str(&normalized);
                }
                None => run = Some((pos, c.to_string(), normalized)),
            }
            continue;
        }
        if let Some((start, original, mapped)) = run.take() {
            threats.push(report_run(text, ctx, start, original, mapped));
            if options.stop_on_first_threat {
                return threats;
            }
        }
    }
    if let Some((start, original, mapped)) = run.take() {
        threats.push(report_run(text, ctx, start, original, mapped));
    }
    threats
}

fn report_run(
    text: &str,
    ctx: &mut ScanContext,
    start: usize,
    original: String,
    mapped: String,
) -> ThreatReport {
    let location = ctx.locate(text, start);
    ThreatReport::new(
        ThreatCategory::Normalization,
        1,
        Severity::High,
        format!("`{original}` differs from its NFKC form `{mapped}`"),
        location,
        original,
    )
    .with_payload(mapped)
    .with_suggestion("Replace with the normalized form")
}
