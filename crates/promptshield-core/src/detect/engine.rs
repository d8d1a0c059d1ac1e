use std::time::Instant;

use tracing::{debug, instrument};

use super::{
    homoglyph, injection, invisible, normalization, smuggling, trojan, ScanContext, ScanOptions,
    ScanResult, ScanStats, ThreatReport,
};

type DetectorFn = fn(&str, &ScanOptions, &mut ScanContext) -> Vec<ThreatReport>;

/// Run the detector pipeline over `text` in fixed priority order:
/// Trojan → Invisible → Homoglyph → Normalization → Smuggling → Injection.
///
/// Detectors run sequentially and their reports are concatenated. With
/// `stop_on_first_threat`, the first detector that yields anything ends the
/// pipeline — later detectors never run. Pure computation, no I/O; the
/// context is only a per-call cache and must not be shared across scans.
#[instrument(name = "scan", skip_all, fields(input_len = text.len()))]
pub fn scan(text: &str, options: &ScanOptions, ctx: &mut ScanContext) -> ScanResult {
    let started = Instant::now();

    let detectors: [(bool, DetectorFn); 6] = [
        (options.detect_trojan, trojan::detect_trojan),
        (options.detect_invisible, invisible::detect_invisible),
        (options.detect_homoglyph, homoglyph::detect_homoglyph),
        (
            options.detect_normalization,
            normalization::detect_normalization,
        ),
        (options.detect_smuggling, smuggling::detect_smuggling),
        (options.detect_injection, injection::detect_injection),
    ];

    let mut threats = Vec::new();
    for (enabled, detector) in detectors {
        if !enabled {
            continue;
        }
        let found = detector(text, options, ctx);
        let any = !found.is_empty();
        threats.extend(found);
        if options.stop_on_first_threat && any {
            break;
        }
    }

    // Detectors gate themselves on the floor already; this keeps the
    // guarantee even if one emits below it.
    threats.retain(|t| t.severity >= options.min_severity);

    let total_chars = ctx.line_index(text).total_chars();
    let stats = ScanStats {
        duration_ms: started.elapsed().as_millis() as u64,
        total_chars,
    };
    debug!(threats = threats.len(), total_chars, "scan completed");
    ScanResult {
        is_clean: threats.is_empty(),
        threats,
        stats,
    }
}
