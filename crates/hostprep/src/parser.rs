//! Progress scanner for the free-text output of a privileged tool.
//!
//! The feature tool has no machine-readable output. Progress is drawn as a
//! bar ending in a percentage (`[=====  55.5%  ]\r`), errors as a line
//! starting with `Error:` and success as a fixed sentence. The scanner
//! keeps a bounded tail of previous output so a token split across two
//! reads (`"5"` then `"0%\r"`) is still seen whole.
//!
//! Only a `%` that arrived in the current read is considered; the tail can
//! start in the middle of a number that was already reported.
//!
//! Known limitation: any `<number>%` in the output counts as progress, not
//! only the bar. Whole-buffer scans report the right-most value only, so
//! intermediate values inside one read are collapsed.

use hostprep_shared::ProgressEvent;
use tracing::debug;

/// Bytes of previous output carried into the next scan
pub const TAIL_CAPACITY: usize = 64;

const ERROR_MARKER: &[u8] = b"Error:";

/// Compared case-insensitively
const SUCCESS_PHRASE: &str = "the operation completed successfully.";

/// Stateful scanner for one tool run
#[derive(Debug, Default)]
pub struct ToolOutputParser {
    tail: Vec<u8>,
    /// Incomplete UTF-8 sequence held back from the last `Log`
    pending_text: Vec<u8>,
    last_percent: Option<f64>,
    saw_error: bool,
    saw_done: bool,
}

impl ToolOutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an error has been recorded for this run
    pub fn saw_error(&self) -> bool {
        self.saw_error
    }

    /// Scan one raw chunk of output (stdout or stderr, in arrival order).
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        if chunk.is_empty() {
            return events;
        }

        let fresh_from = self.tail.len();
        let mut buf = Vec::with_capacity(fresh_from + chunk.len());
        buf.extend_from_slice(&self.tail);
        buf.extend_from_slice(chunk);

        let text = self.decode_text(chunk);
        if !text.is_empty() {
            events.push(ProgressEvent::Log { text });
        }

        let fresh_percent = buf
            .iter()
            .rposition(|&b| b == b'%')
            .is_some_and(|at| at >= fresh_from);
        if fresh_percent {
            if let Some(percent) = extract_newest_percent(&buf) {
                if self.last_percent != Some(percent) {
                    self.last_percent = Some(percent);
                    events.push(ProgressEvent::Progress { percent });
                }
            }
        }

        if !self.saw_error {
            if let Some(error) = self.scan_error(&buf, false) {
                events.push(error);
            }
        }

        if !self.saw_error && !self.saw_done && contains_success_phrase(&buf) {
            self.saw_done = true;
            events.push(ProgressEvent::Done);
        }

        let keep_from = buf.len().saturating_sub(TAIL_CAPACITY);
        self.tail = buf.split_off(keep_from);
        events
    }

    /// Signals for process exit. Nothing is emitted after a recorded error.
    pub fn finish(&mut self, exit_code: Option<i32>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        if !self.pending_text.is_empty() {
            let rest = std::mem::take(&mut self.pending_text);
            events.push(ProgressEvent::Log {
                text: String::from_utf8_lossy(&rest).into_owned(),
            });
        }
        if !self.saw_error {
            // An "Error:" marker or code with nothing after it was held back
            let tail = std::mem::take(&mut self.tail);
            if let Some(error) = self.scan_error(&tail, true) {
                events.push(error);
            }
        }
        if self.saw_error {
            debug!("tool exited ({:?}) after reporting an error", exit_code);
            return events;
        }

        if !self.saw_done {
            self.saw_done = true;
            events.push(ProgressEvent::Done);
        }
        events.push(ProgressEvent::Close { exit_code });
        events
    }

    /// Chunk text with any trailing partial character carried to the next read
    fn decode_text(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending_text);
        bytes.extend_from_slice(chunk);
        let keep = incomplete_utf8_suffix(&bytes);
        self.pending_text = bytes.split_off(bytes.len() - keep);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn scan_error(&mut self, buf: &[u8], at_exit: bool) -> Option<ProgressEvent> {
        let idx = find_subslice(buf, ERROR_MARKER)?;
        let after = String::from_utf8_lossy(&buf[idx + ERROR_MARKER.len()..]);
        let rest = after.trim_start();
        // The code is only complete once whitespace follows it
        let code_open = !rest.contains(char::is_whitespace);
        if code_open && !at_exit {
            return None;
        }
        let after = rest.trim_end();

        let code = after
            .split_whitespace()
            .next()
            .map(|token| token.trim_end_matches([',', '.', ';', ':']))
            .filter(|token| !token.is_empty())
            .map(str::to_string);

        self.saw_error = true;
        Some(ProgressEvent::Error {
            code,
            message: String::from_utf8_lossy(buf).trim().to_string(),
        })
    }
}

/// Right-most `<number> %` token in `buf`, clamped to 0..=100.
///
/// Scan order: find the last `%`, skip spaces backward, then consume digits
/// and at most one decimal point with digits on both sides.
pub fn extract_newest_percent(buf: &[u8]) -> Option<f64> {
    let percent_at = buf.iter().rposition(|&b| b == b'%')?;

    let mut end = percent_at;
    while end > 0 && buf[end - 1] == b' ' {
        end -= 1;
    }

    let mut start = end;
    let mut saw_digit = false;
    let mut saw_dot = false;
    while start > 0 {
        let c = buf[start - 1];
        if c.is_ascii_digit() {
            saw_digit = true;
            start -= 1;
            continue;
        }
        let digit_before = start >= 2 && buf[start - 2].is_ascii_digit();
        if c == b'.' && !saw_dot && start < end && digit_before {
            saw_dot = true;
            start -= 1;
            continue;
        }
        break;
    }
    if !saw_digit {
        return None;
    }

    let token = std::str::from_utf8(&buf[start..end]).ok()?;
    let value: f64 = token.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.clamp(0.0, 100.0))
}

fn contains_success_phrase(buf: &[u8]) -> bool {
    String::from_utf8_lossy(buf)
        .to_ascii_lowercase()
        .contains(SUCCESS_PHRASE)
}

/// Length of a truncated multi-byte sequence at the end of `bytes`
fn incomplete_utf8_suffix(bytes: &[u8]) -> usize {
    let window = bytes.len().saturating_sub(3);
    for (i, &b) in bytes.iter().enumerate().skip(window).rev() {
        if b & 0xC0 == 0x80 {
            continue;
        }
        let width = match b {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        let have = bytes.len() - i;
        return if have < width { have } else { 0 };
    }
    0
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
