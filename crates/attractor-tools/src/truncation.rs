/// Output truncation strategies for tool results.

/// How to truncate output that exceeds the maximum character limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationMode {
    /// Keep first 40% and last 60%, with a marker in the middle.
    HeadTail,
    /// Keep last `max_chars`, with a marker at the start.
    Tail,
}

/// Truncate `output` to at most `max_chars` characters using the given mode.
///
/// If the output is within the limit, it is returned unchanged.
/// Otherwise a warning marker is inserted indicating how many characters were removed.
pub fn truncate_output(output: &str, max_chars: usize, mode: TruncationMode) -> String {
    if output.len() <= max_chars {
        return output.to_string();
    }

    match mode {
        TruncationMode::HeadTail => {
            let head_size = max_chars * 40 / 100;
            let tail_size = max_chars - head_size;
            let removed = output.len() - head_size - tail_size;
            let head = &output[..head_size];
            let tail = &output[output.len() - tail_size..];
            format!(
                "{}\n[WARNING: Output truncated. {} characters removed from middle]\n{}",
                head, removed, tail
            )
        }
        TruncationMode::Tail => {
            let kept = max_chars;
            let removed = output.len() - kept;
            let tail = &output[output.len() - kept..];
            format!(
                "\n[WARNING: Output truncated. {} characters removed from start]\n{}",
                removed, tail
            )
        }
    }
}
