use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;

use super::invisible::is_invisible_char;
use super::{ScanContext, ScanOptions, Severity, ThreatCategory, ThreatReport};

/// Candidate base64 payloads: long unbroken runs over the base64 alphabet.
/// The length floor is deliberately high to keep hashes and short tokens out.
static BASE64_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9+/]{50,}={0,2}").expect("base64 regex"));

pub(crate) static HIDDEN_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("hidden comment regex"));

pub(crate) static EMPTY_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\]\([^)]*\)").expect("empty link regex"));

const STEG_MIN_RUN: usize = 8;
const STEG_MAX_RUN: usize = 4096;
const MIN_BASE64_LEN: usize = 50;
const PRINTABLE_RATIO: f64 = 0.7;
const PAYLOAD_PREVIEW_CHARS: usize = 160;

/// Smuggling detector: invisible-character steganography, base64 payloads,
/// hidden markdown comments, empty links. The sub-checks are gated by the
/// severity floor so a raised floor skips whole passes, not just their
/// output.
pub fn detect_smuggling(
    text: &str,
    options: &ScanOptions,
    ctx: &mut ScanContext,
) -> Vec<ThreatReport> {
    if options.min_severity > Severity::High {
        return Vec::new();
    }

    let mut threats = Vec::new();
    steganography(text, ctx, &mut threats, options.stop_on_first_threat);
    if options.stop_on_first_threat && !threats.is_empty() {
        return threats;
    }
    if options.min_severity > Severity::Medium {
        return threats;
    }

    base64_payloads(text, ctx, &mut threats, options.stop_on_first_threat);
    if options.stop_on_first_threat && !threats.is_empty() {
        return threats;
    }
    if options.min_severity > Severity::Low {
        return threats;
    }

    literal_patterns(text, ctx, &mut threats, options.stop_on_first_threat);
    threats
}

/// Runs of invisible characters drawn from a two-character alphabet are
/// treated as candidate binary encodings. Both bit assignments are tried;
/// a decoding counts only when every 8-bit group lands in printable ASCII
/// and at least 3 characters come out.
fn steganography(text: &str, ctx: &mut ScanContext, threats: &mut Vec<ThreatReport>, stop: bool) {
    let mut run: Option<(usize, Vec<char>)> = None;
    let mut runs: Vec<(usize, Vec<char>)> = Vec::new();

    for (pos, c) in text.chars().enumerate() {
        if is_invisible_char(c) {
            match run.as_mut() {
                Some((_, chars)) => chars.push(c),
                None => run = Some((pos, vec![c])),
            }
            continue;
        }
        if let Some(done) = run.take() {
            runs.push(done);
        }
    }
    if let Some(done) = run.take() {
        runs.push(done);
    }

    for (start, chars) in runs {
        if !(STEG_MIN_RUN..=STEG_MAX_RUN).contains(&chars.len()) {
            continue;
        }
        let Some(decoded) = decode_binary_run(&chars) else {
            continue;
        };
        let location = ctx.locate(text, start);
        threats.push(
            ThreatReport::new(
                ThreatCategory::Smuggling,
                1,
                Severity::High,
                format!(
                    "Invisible characters encode a hidden binary payload ({} chars)",
                    decoded.chars().count()
                ),
                location,
                chars.iter().collect::<String>(),
            )
            .with_payload(decoded),
        );
        if stop {
            return;
        }
    }
}

fn decode_binary_run(chars: &[char]) -> Option<String> {
    let mut alphabet: Vec<char> = Vec::with_capacity(2);
    for &c in chars {
        if !alphabet.contains(&c) {
            alphabet.push(c);
            if alphabet.len() > 2 {
                return None;
            }
        }
    }
    if alphabet.len() != 2 {
        return None;
    }

    for one in [alphabet[1], alphabet[0]] {
        let bits: Vec<bool> = chars.iter().map(|&c| c == one).collect();
        let mut decoded = String::new();
        let mut valid = true;
        for group in bits.chunks_exact(8) {
            let byte = group.iter().fold(0u8, |acc, &bit| (acc << 1) | bit as u8);
            if !(32..=126).contains(&byte) {
                valid = false;
                break;
            }
            decoded.push(byte as char);
        }
        if valid && decoded.len() >= 3 {
            return Some(decoded);
        }
    }
    None
}

fn base64_payloads(text: &str, ctx: &mut ScanContext, threats: &mut Vec<ThreatReport>, stop: bool) {
    for candidate in BASE64_RE.find_iter(text) {
        if candidate.as_str().len() <= MIN_BASE64_LEN {
            continue;
        }
        let Some(bytes) = decode_base64_loose(candidate.as_str()) else {
            continue;
        };
        if bytes.is_empty() || printable_ratio(&bytes) < PRINTABLE_RATIO {
            continue;
        }
        let preview: String = String::from_utf8_lossy(&bytes)
            .chars()
            .take(PAYLOAD_PREVIEW_CHARS)
            .collect();
        let location = ctx.locate_byte(text, candidate.start());
        threats.push(
            ThreatReport::new(
                ThreatCategory::Smuggling,
                2,
                Severity::Medium,
                "Long base64 run decodes to readable text",
                location,
                candidate.as_str(),
            )
            .with_payload(preview),
        );
        if stop {
            return;
        }
    }
}

/// Padding-tolerant decode: strip `=` first; when the remainder still does
/// not decode (over-matched candidate), fall back to a whole number of
/// 4-char groups so at least the prefix comes out.
fn decode_base64_loose(candidate: &str) -> Option<Vec<u8>> {
    let trimmed = candidate.trim_end_matches('=');
    if let Ok(bytes) = STANDARD_NO_PAD.decode(trimmed) {
        return Some(bytes);
    }
    let keep = trimmed.len() - trimmed.len() % 4;
    if keep == 0 {
        return None;
    }
    STANDARD_NO_PAD.decode(&trimmed[..keep]).ok()
}

fn printable_ratio(bytes: &[u8]) -> f64 {
    let printable = bytes
        .iter()
        .filter(|&&b| (32..=126).contains(&b) || matches!(b, b'\n' | b'\r' | b'\t'))
        .count();
    printable as f64 / bytes.len() as f64
}

fn literal_patterns(text: &str, ctx: &mut ScanContext, threats: &mut Vec<ThreatReport>, stop: bool) {
    for m in HIDDEN_COMMENT_RE.find_iter(text) {
        let location = ctx.locate_byte(text, m.start());
        threats.push(
            ThreatReport::new(
                ThreatCategory::Smuggling,
                3,
                Severity::Low,
                "Hidden markdown comment",
                location,
                m.as_str(),
            )
            .with_label("[Hidden Comment]")
            .with_suggestion("Delete the comment"),
        );
        if stop {
            return;
        }
    }
    for m in EMPTY_LINK_RE.find_iter(text) {
        let location = ctx.locate_byte(text, m.start());
        threats.push(
            ThreatReport::new(
                ThreatCategory::Smuggling,
                4,
                Severity::Low,
                "Markdown link with empty text",
                location,
                m.as_str(),
            )
            .with_label("[Empty Link]")
            .with_suggestion("Delete the link"),
        );
        if stop {
            return;
        }
    }
}
