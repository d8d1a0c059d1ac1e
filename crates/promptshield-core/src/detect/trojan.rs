use super::{ScanContext, ScanOptions, Severity, ThreatCategory, ThreatReport};

/// BIDI codepoints that open a directional override or isolate:
/// LRE, RLE, LRO, RLO, LRI, RLI, FSI.
fn is_bidi_push(c: char) -> bool {
    matches!(
        c,
        '\u{202A}' | '\u{202B}' | '\u{202D}' | '\u{202E}' | '\u{2066}' | '\u{2067}' | '\u{2068}'
    )
}

/// BIDI codepoints that close one: PDF, PDI.
fn is_bidi_pop(c: char) -> bool {
    matches!(c, '\u{202C}' | '\u{2069}')
}

/// Currently open override: where it started and what it spans so far.
struct OpenSlot {
    start: usize,
    raw: String,
    inner: String,
}

/// Trojan Source detector (CVE-2021-42574). Per-line state machine with a
/// single-depth open slot: a second push while one is open is ignored, so
/// nested overrides collapse into the outermost span. A pop with no open
/// slot emits nothing. The slot never survives a newline; an override left
/// open at end-of-line is reported as unterminated.
pub fn detect_trojan(
    text: &str,
    options: &ScanOptions,
    ctx: &mut ScanContext,
) -> Vec<ThreatReport> {
    let mut threats = Vec::new();
    let mut open: Option<OpenSlot> = None;

    for (pos, c) in text.chars().enumerate() {
        if c == '\n' {
            if let Some(slot) = open.take() {
                threats.push(unterminated(text, ctx, slot));
                if options.stop_on_first_threat {
                    return threats;
                }
            }
            continue;
        }
        if is_bidi_push(c) {
            match open.as_mut() {
                None => {
                    open = Some(OpenSlot {
                        start: pos,
                        raw: c.to_string(),
                        inner: String::new(),
                    });
                }
                Some(slot) => {
                    slot.raw.push(c);
                    slot.inner.push(c);
                }
            }
            continue;
        }
        if is_bidi_pop(c) {
            if let Some(mut slot) = open.take() {
                slot.raw.push(c);
                threats.push(terminated(text, ctx, slot));
                if options.stop_on_first_threat {
                    return threats;
                }
            }
            continue;
        }
        if let Some(slot) = open.as_mut() {
            slot.raw.push(c);
            slot.inner.push(c);
        }
    }

    if let Some(slot) = open.take() {
        threats.push(unterminated(text, ctx, slot));
    }
    threats
}

fn terminated(text: &str, ctx: &mut ScanContext, slot: OpenSlot) -> ThreatReport {
    let location = ctx.locate(text, slot.start);
    ThreatReport::new(
        ThreatCategory::Trojan,
        1,
        Severity::Critical,
        "Bidirectional override sequence reorders the displayed text",
        location,
        slot.raw,
    )
    .with_label("[BIDI Override]")
    .with_payload(slot.inner)
    .with_suggestion("Remove the bidirectional control characters")
}

fn unterminated(text: &str, ctx: &mut ScanContext, slot: OpenSlot) -> ThreatReport {
    let location = ctx.locate(text, slot.start);
    ThreatReport::new(
        ThreatCategory::Trojan,
        2,
        Severity::Critical,
        "Unterminated bidirectional override affects the rest of the line",
        location,
        slot.raw,
    )
    .with_label("[BIDI Override]")
    .with_suggestion("Remove the bidirectional control characters")
}
