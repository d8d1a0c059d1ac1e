use std::fmt::Write;

use serde::Serialize;

use crate::detect::{ScanResult, ScanStats, ThreatReport};

/// Format styles supported in default reporter implementations.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Produce a report string from a [`ScanResult`] using the desired format.
pub fn render_report(result: &ScanResult, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Human => render_human(result),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&JsonReport::from(result))?),
    }
}

fn render_human(result: &ScanResult) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(
        out,
        "Scanned {} chars in {} ms",
        result.stats.total_chars, result.stats.duration_ms
    )?;

    if result.is_clean {
        writeln!(out, "No threats detected.")?;
        return Ok(out);
    }

    writeln!(out, "Threats:")?;
    for threat in &result.threats {
        writeln!(
            out,
            "  - {severity:?} {rule} @ {line}:{col} {message}",
            severity = threat.severity,
            rule = threat.rule_id.as_deref().unwrap_or("-"),
            line = threat.location.line,
            col = threat.location.column,
            message = threat.message,
        )?;
        let excerpt = threat
            .readable_label
            .clone()
            .unwrap_or_else(|| printable_excerpt(&threat.offending_text));
        if !excerpt.trim().is_empty() {
            writeln!(out, "    \"{excerpt}\"")?;
        }
        if let Some(payload) = &threat.decoded_payload {
            writeln!(out, "    decodes to: \"{}\"", printable_excerpt(payload))?;
        }
        if let Some(suggestion) = &threat.suggestion {
            writeln!(out, "    hint: {suggestion}")?;
        }
    }
    Ok(out)
}

/// Flatten control characters so an offending span cannot mangle the
/// terminal it is being reported on.
fn printable_excerpt(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\n' | '\r' | '\t' => ' ',
            c if c.is_control() => '\u{FFFD}',
            c => c,
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport<'a> {
    threats: &'a [ThreatReport],
    stats: &'a ScanStats,
    is_clean: bool,
}

impl<'a> From<&'a ScanResult> for JsonReport<'a> {
    fn from(result: &'a ScanResult) -> Self {
        Self {
            threats: &result.threats,
            stats: &result.stats,
            is_clean: result.is_clean,
        }
    }
}
