use super::{ScanContext, ScanOptions, Severity, ThreatCategory, ThreatReport};

/// The fixed invisible-codepoint set this detector (and the steganography
/// check) recognizes: zero-width characters, the BOM, Hangul fillers, and
/// the Unicode Tags block used for ASCII smuggling.
pub(crate) fn is_invisible_char(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'
            | '\u{200C}'
            | '\u{200D}'
            | '\u{FEFF}'
            | '\u{115F}'
            | '\u{1160}'
            | '\u{3164}'
            | '\u{FFA0}'
            | '\u{E0000}'..='\u{E007F}'
    )
}

/// Bracketed display label for one invisible codepoint.
fn label_for(c: char) -> String {
    match c {
        '\u{200B}' => "[ZWSP]".to_string(),
        '\u{200C}' => "[ZWNJ]".to_string(),
        '\u{200D}' => "[ZWJ]".to_string(),
        '\u{FEFF}' => "[BOM]".to_string(),
        '\u{115F}' => "[HANGUL CHOSEONG FILLER]".to_string(),
        '\u{1160}' => "[HANGUL JUNGSEONG FILLER]".to_string(),
        '\u{3164}' => "[HANGUL FILLER]".to_string(),
        '\u{FFA0}' => "[HALFWIDTH HANGUL FILLER]".to_string(),
        '\u{E0000}'..='\u{E007F}' => "[TAG]".to_string(),
        other => format!("[U+{:04X}]", other as u32),
    }
}

/// ASCII character hidden in a Tags-block codepoint, if printable.
fn tag_payload(c: char) -> Option<char> {
    let cp = c as u32;
    if !(0xE0000..=0xE007F).contains(&cp) {
        return None;
    }
    let ascii = cp - 0xE0000;
    (32..=126).contains(&ascii).then(|| ascii as u8 as char)
}

/// Invisible-character detector. Adjacent matches merge greedily into a
/// single span so a run of zero-width characters produces one report, not
/// hundreds.
pub fn detect_invisible(
    text: &str,
    options: &ScanOptions,
    ctx: &mut ScanContext,
) -> Vec<ThreatReport> {
    if options.min_severity > Severity::High {
        return Vec::new();
    }

    let mut threats = Vec::new();
    let mut run: Option<(usize, String)> = None;

    for (pos, c) in text.chars().enumerate() {
        if is_invisible_char(c) {
            match run.as_mut() {
                Some((_, span)) => span.push(c),
                None => run = Some((pos, c.to_string())),
            }
            continue;
        }
        if let Some((start, span)) = run.take() {
            threats.push(report_run(text, ctx, start, span));
            if options.stop_on_first_threat {
                return threats;
            }
        }
    }
    if let Some((start, span)) = run.take() {
        threats.push(report_run(text, ctx, start, span));
    }
    threats
}

fn report_run(text: &str, ctx: &mut ScanContext, start: usize, span: String) -> ThreatReport {
    let location = ctx.locate(text, start);
    let label: String = span.chars().map(label_for).collect();
    let payload: String = span.chars().filter_map(tag_payload).collect();
    let count = span.chars().count();
    let message = if count == 1 {
        format!("Invisible Unicode character {label}")
    } else {
        format!("{count} invisible Unicode characters")
    };
    let mut report = ThreatReport::new(
        ThreatCategory::Invisible,
        1,
        Severity::High,
        message,
        location,
        span,
    )
    .with_label(label)
    .with_suggestion("Delete the invisible characters");
    if !payload.is_empty() {
        report = report.with_payload(payload);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str) -> Vec<ThreatReport> {
        detect_invisible(text, &ScanOptions::default(), &mut ScanContext::new())
    }

    #[test]
    fn zwsp_between_words_is_reported_with_label_and_index() {
        let threats = scan("Hello\u{200B}World");
        assert_eq!(threats.len(), 1);
        let threat = &threats[0];
        assert_eq!(threat.offending_text, "\u{200B}");
        assert_eq!(threat.readable_label.as_deref(), Some("[ZWSP]"));
        assert_eq!(threat.location.index, 5);
        assert_eq!(threat.location.column, 6);
        assert_eq!(threat.severity, Severity::High);
        assert_eq!(threat.rule_id.as_deref(), Some("PSU001"));
    }

    #[test]
    fn adjacent_invisibles_merge_into_one_span() {
        let threats = scan("a\u{200B}\u{200C}\u{FEFF}b");
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].offending_text, "\u{200B}\u{200C}\u{FEFF}");
        assert_eq!(threats[0].readable_label.as_deref(), Some("[ZWSP][ZWNJ][BOM]"));
    }

    #[test]
    fn separated_invisibles_stay_separate_reports() {
        let threats = scan("a\u{200B}b\u{200B}c");
        assert_eq!(threats.len(), 2);
    }

    #[test]
    fn tag_block_decodes_to_ascii_payload() {
        // "hi" spelled in Tags-block codepoints.
        let threats = scan("x\u{E0068}\u{E0069}y");
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].decoded_payload.as_deref(), Some("hi"));
        assert_eq!(threats[0].readable_label.as_deref(), Some("[TAG][TAG]"));
    }

    #[test]
    fn non_printable_tag_codepoints_produce_no_payload() {
        // U+E0000 maps below the printable range and is dropped.
        let threats = scan("x\u{E0000}y");
        assert_eq!(threats.len(), 1);
        assert!(threats[0].decoded_payload.is_none());
    }

    #[test]
    fn detector_short_circuits_at_critical_floor() {
        let options = ScanOptions {
            min_severity: Severity::Critical,
            ..ScanOptions::default()
        };
        let threats = detect_invisible("a\u{200B}b", &options, &mut ScanContext::new());
        assert!(threats.is_empty());
    }

    #[test]
    fn stop_on_first_returns_single_threat() {
        let options = ScanOptions {
            stop_on_first_threat: true,
            ..ScanOptions::default()
        };
        let threats = detect_invisible("a\u{200B}b\u{200D}c", &options, &mut ScanContext::new());
        assert_eq!(threats.len(), 1);
    }

    #[test]
    fn plain_ascii_and_emoji_are_clean() {
        assert!(scan("regular text, no tricks").is_empty());
        // Bare emoji without joiners are not in the invisible set.
        assert!(scan("rocket \u{1F680} launch").is_empty());
    }
}
