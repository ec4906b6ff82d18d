/// Clipping of captured tool output for diagnostics.

/// Which part of an over-long text to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipMode {
    /// Keep the first 40% and the last 60%, marking the gap.
    HeadTail,
    /// Keep the end, which is where tools print their fatal errors.
    Tail,
}

/// Clip `text` to roughly `max_bytes`, never splitting a UTF-8 character.
pub fn clip(text: &str, max_bytes: usize, mode: ClipMode) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    match mode {
        ClipMode::HeadTail => {
            let head_end = floor_boundary(text, max_bytes * 40 / 100);
            let tail_start = ceil_boundary(text, text.len() - (max_bytes - max_bytes * 40 / 100));
            let removed = tail_start - head_end;
            format!(
                "{}\n[... {} bytes omitted ...]\n{}",
                &text[..head_end],
                removed,
                &text[tail_start..]
            )
        }
        ClipMode::Tail => {
            let tail_start = ceil_boundary(text, text.len() - max_bytes);
            format!("[... {} bytes omitted ...]\n{}", tail_start, &text[tail_start..])
        }
    }
}

fn floor_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
