use protocol::{OutputFormat, Payload};

/// Normalizes captured stdout according to the requested format.
///
/// Structured output that fails to parse (including empty output and
/// documents cut off by a kill) comes back as [`Payload::PartialOutput`]
/// carrying the raw text; it never fails the result.
pub fn parse_output(stdout: &str, format: OutputFormat) -> Payload {
    match format {
        OutputFormat::Structured => match serde_json::from_str(stdout.trim()) {
            Ok(value) => Payload::Structured(value),
            Err(err) => {
                tracing::debug!(error = %err, bytes = stdout.len(), "structured output did not parse");
                Payload::PartialOutput(stdout.to_string())
            }
        },
        OutputFormat::Plain => Payload::Plain(normalize_line_endings(stdout)),
    }
}

fn normalize_line_endings(text: &str) -> String {
    if text.contains('\r') {
        text.replace("\r\n", "\n")
    } else {
        text.to_string()
    }
}
