//! Streaming state detector.
//!
//! Translates raw terminal bytes into one of six session states. Control
//! sequences are stripped, the plain text is appended to a bounded rolling
//! window, and a fixed set of case-insensitive pattern groups is evaluated
//! against the window. Among all matching groups, the one whose latest match
//! ends closest to the window end wins.
//!
//! The detector is pure: the 30-second idle timer is armed by the caller,
//! which invokes [`DetectorBlock::idle_timeout`] when it fires.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::session::DetailedState;

/// Rolling window size in characters.
const WINDOW_CHARS: usize = 2048;

/// Sessions stuck in `working` with no further output fall to `idle`
/// after this long.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// A state change reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: DetailedState,
    pub next: DetailedState,
    /// Time spent in the previous state, for per-state accounting.
    pub previous_elapsed: Duration,
}

// ============================================================================
// Control-sequence stripping
// ============================================================================

/// Strips terminal control sequences, retaining plain text.
///
/// Handles CSI (`ESC [ … finalByte`, including private-mode parameters),
/// OSC (`ESC ] … BEL` or `ESC ] … ESC \`), and the two-byte charset
/// designators `ESC ( X` / `ESC ) X` for X in {A, B, 0, 1, 2}. Other lone
/// escapes are dropped along with their immediate successor byte.
pub fn strip_terminal_controls(data: &[u8]) -> String {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] != 0x1b {
            out.push(data[i]);
            i += 1;
            continue;
        }

        let Some(&next) = data.get(i + 1) else {
            // Bare ESC at end of chunk; drop it.
            break;
        };

        match next {
            b'[' => {
                // CSI: parameter/intermediate bytes are 0x20..=0x3f,
                // terminated by a final byte in 0x40..=0x7e.
                let mut j = i + 2;
                while j < data.len() && (0x20..=0x3f).contains(&data[j]) {
                    j += 1;
                }
                i = if j < data.len() { j + 1 } else { data.len() };
            }
            b']' => {
                // OSC: runs to BEL or ST (ESC \).
                let mut j = i + 2;
                loop {
                    match data.get(j) {
                        Some(0x07) => {
                            i = j + 1;
                            break;
                        }
                        Some(0x1b) if data.get(j + 1) == Some(&b'\\') => {
                            i = j + 2;
                            break;
                        }
                        Some(_) => j += 1,
                        None => {
                            i = data.len();
                            break;
                        }
                    }
                }
            }
            b'(' | b')' => {
                // Charset designator: ESC ( X / ESC ) X.
                let skip = matches!(
                    data.get(i + 2),
                    Some(b'A' | b'B' | b'0' | b'1' | b'2')
                );
                i += if skip { 3 } else { 2 };
            }
            _ => {
                // Two-byte escape (ESC c, ESC =, ...).
                i += 2;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

// ============================================================================
// Pattern groups
// ============================================================================

/// One target state plus its disjunction of expressions.
struct PatternGroup {
    target: DetailedState,
    patterns: Vec<Regex>,
}

/// Group evaluation order. Later groups win end-position ties, giving the
/// prompt glyph and permission prompts precedence over body text ending at
/// the same offset.
fn pattern_groups() -> &'static [PatternGroup] {
    static GROUPS: OnceLock<Vec<PatternGroup>> = OnceLock::new();
    GROUPS.get_or_init(|| {
        let compile = |target, exprs: &[&str]| PatternGroup {
            target,
            patterns: exprs
                .iter()
                .filter_map(|e| Regex::new(&format!("(?i){e}")).ok())
                .collect(),
        };

        vec![
            compile(
                DetailedState::Working,
                &[
                    "\u{273b}",
                    r"\b(?:thinking|working|channeling)(?:\.\.\.|…)",
                    r"\b(?:reading|writing|editing|running|searching)\s+\S+",
                ],
            ),
            compile(
                DetailedState::Compacting,
                &["compacting conversation", r"·\s*compacting"],
            ),
            compile(
                DetailedState::Error,
                &[
                    r"(?m)^error:",
                    r"\bapierror\b",
                    r"\boverloaded\b",
                    "rate limit",
                    r"\b(?:enoent|eacces|eperm|econnrefused)\b",
                    r"\b(?:spawn|exec)\s+\S+\s+enoent\b",
                    "authentication failed",
                    r"invalid[^\n]*api[^\n]*key",
                ],
            ),
            compile(
                DetailedState::PermissionNeeded,
                &[
                    r"do you want to proceed\?",
                    "\u{23f5}\u{23f5}\\s*accept",
                    r"allow\s+(?:once|always)",
                    r"\(y\)es",
                    r"yes\s*/\s*no",
                    r"deny[^\n]*allow",
                    "press enter to confirm",
                    "trust this folder",
                    "enter to confirm",
                    "yes, i trust",
                    "quick safety check",
                    "bypass permissions mode",
                    "yes, i accept",
                ],
            ),
            compile(DetailedState::Idle, &["\u{276f}\\s*$"]),
        ]
    })
}

/// Evaluates every group against the window; latest match wins.
fn classify(window: &str, current: DetailedState) -> DetailedState {
    let mut best: Option<(usize, DetailedState)> = None;

    for group in pattern_groups() {
        let latest_end = group
            .patterns
            .iter()
            .filter_map(|re| re.find_iter(window).last().map(|m| m.end()))
            .max();

        if let Some(end) = latest_end {
            // `>=` lets later groups take end-position ties.
            if best.map(|(e, _)| end >= e).unwrap_or(true) {
                best = Some((end, group.target));
            }
        }
    }

    match best {
        Some((_, state)) => state,
        None if current == DetailedState::Starting => DetailedState::Starting,
        None => DetailedState::Working,
    }
}

// ============================================================================
// Detector block
// ============================================================================

/// Per-session detector state: the rolling text window plus the current
/// state and its entry time.
#[derive(Debug)]
pub struct DetectorBlock {
    window: String,
    state: DetailedState,
    entered_at: Instant,
}

impl DetectorBlock {
    pub fn new(now: Instant) -> Self {
        Self {
            window: String::new(),
            state: DetailedState::Starting,
            entered_at: now,
        }
    }

    /// Current detected state.
    pub fn state(&self) -> DetailedState {
        self.state
    }

    /// Time spent in the current state.
    pub fn elapsed_in_state(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.entered_at)
    }

    /// Feeds one output chunk through the detector.
    ///
    /// Returns the transition if the winning state differs from the
    /// current one.
    pub fn ingest(&mut self, chunk: &[u8], now: Instant) -> Option<Transition> {
        let text = strip_terminal_controls(chunk);
        if !text.is_empty() {
            self.window.push_str(&text);
            self.trim_window();
        }

        let next = classify(&self.window, self.state);
        self.transition_to(next, now)
    }

    /// Reports expiry of the caller-armed idle timer. Only a session still
    /// in `working` falls to `idle`.
    pub fn idle_timeout(&mut self, now: Instant) -> Option<Transition> {
        if self.state != DetailedState::Working {
            return None;
        }
        self.transition_to(DetailedState::Idle, now)
    }

    fn transition_to(&mut self, next: DetailedState, now: Instant) -> Option<Transition> {
        if next == self.state {
            return None;
        }
        let transition = Transition {
            previous: self.state,
            next,
            previous_elapsed: now.saturating_duration_since(self.entered_at),
        };
        self.state = next;
        self.entered_at = now;
        Some(transition)
    }

    fn trim_window(&mut self) {
        let count = self.window.chars().count();
        if count <= WINDOW_CHARS {
            return;
        }
        let cut = self
            .window
            .char_indices()
            .nth(count - WINDOW_CHARS)
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.window.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> DetectorBlock {
        DetectorBlock::new(Instant::now())
    }

    // ── stripping ────────────────────────────────────────────────────────

    #[test]
    fn strips_csi_sequences() {
        assert_eq!(strip_terminal_controls(b"\x1b[36mhello\x1b[0m"), "hello");
        assert_eq!(strip_terminal_controls(b"\x1b[2J\x1b[Hcleared"), "cleared");
    }

    #[test]
    fn strips_private_mode_csi() {
        assert_eq!(strip_terminal_controls(b"\x1b[?25lhidden\x1b[?25h"), "hidden");
    }

    #[test]
    fn strips_osc_with_bel_and_st() {
        assert_eq!(strip_terminal_controls(b"\x1b]0;title\x07text"), "text");
        assert_eq!(strip_terminal_controls(b"\x1b]2;title\x1b\\text"), "text");
    }

    #[test]
    fn strips_charset_designators() {
        assert_eq!(strip_terminal_controls(b"\x1b(Bplain\x1b)0"), "plain");
    }

    #[test]
    fn tolerates_truncated_escape_at_end() {
        assert_eq!(strip_terminal_controls(b"tail\x1b"), "tail");
        assert_eq!(strip_terminal_controls(b"tail\x1b["), "tail");
    }

    // ── classification ───────────────────────────────────────────────────

    #[test]
    fn plain_output_on_running_session_means_working() {
        let mut b = block();
        // First recognizable spinner puts us in working.
        b.ingest("\u{273b} crunching".as_bytes(), Instant::now());
        assert_eq!(b.state(), DetailedState::Working);
        // Unrecognized output keeps us there.
        assert!(b.ingest(b"some plain text", Instant::now()).is_none());
        assert_eq!(b.state(), DetailedState::Working);
    }

    #[test]
    fn unrecognized_output_leaves_starting_alone() {
        let mut b = block();
        assert!(b.ingest(b"booting up...", Instant::now()).is_none());
        assert_eq!(b.state(), DetailedState::Starting);
    }

    #[test]
    fn prompt_glyph_at_window_end_is_idle() {
        let mut b = block();
        let t = b.ingest("some output\n\u{276f} ".as_bytes(), Instant::now());
        assert_eq!(b.state(), DetailedState::Idle);
        assert_eq!(t.unwrap().previous, DetailedState::Starting);
    }

    #[test]
    fn spinner_then_later_prompt_is_idle() {
        // latest-match-wins: the prompt glyph ends after the spinner.
        let mut b = block();
        b.ingest("\u{273b} Thinking…\nall done\n\u{276f} ".as_bytes(), Instant::now());
        assert_eq!(b.state(), DetailedState::Idle);
    }

    #[test]
    fn styled_spinner_is_working() {
        let mut b = block();
        let t = b.ingest(b"\x1b[36m\xe2\x9c\xbb\x1b[0m Thinking...", Instant::now());
        assert_eq!(t.unwrap().next, DetailedState::Working);
    }

    #[test]
    fn permission_prompt_detected() {
        let mut b = block();
        b.ingest(
            b"Some context\nDo you want to proceed?\n(Y)es / No",
            Instant::now(),
        );
        assert_eq!(b.state(), DetailedState::PermissionNeeded);
    }

    #[test]
    fn accept_edits_glyphs_detected() {
        let mut b = block();
        b.ingest("\u{23f5}\u{23f5} accept edits".as_bytes(), Instant::now());
        assert_eq!(b.state(), DetailedState::PermissionNeeded);
    }

    #[test]
    fn compacting_detected() {
        let mut b = block();
        b.ingest("\u{00b7} Compacting conversation".as_bytes(), Instant::now());
        assert_eq!(b.state(), DetailedState::Compacting);
    }

    #[test]
    fn error_requires_line_anchor() {
        let mut b = block();
        b.ingest("\u{273b} running tests".as_bytes(), Instant::now());
        assert_eq!(b.state(), DetailedState::Working);
        // Error text inside displayed code must not flip the state.
        b.ingest(b"\n  console.log(\"Error: boom\")\n\xe2\x9c\xbb ", Instant::now());
        assert_eq!(b.state(), DetailedState::Working);
    }

    #[test]
    fn error_at_line_start_detected() {
        let mut b = block();
        b.ingest(b"command output\nError: missing file", Instant::now());
        assert_eq!(b.state(), DetailedState::Error);
    }

    #[test]
    fn named_system_errors_detected() {
        let mut b = block();
        b.ingest(b"spawn claude ENOENT", Instant::now());
        assert_eq!(b.state(), DetailedState::Error);
    }

    #[test]
    fn working_verbs_detected() {
        for text in ["Reading src/main.rs", "Writing /tmp/out", "Running tests"] {
            let mut b = block();
            b.ingest(text.as_bytes(), Instant::now());
            assert_eq!(b.state(), DetailedState::Working, "{text}");
        }
    }

    // ── idle timeout ─────────────────────────────────────────────────────

    #[test]
    fn idle_timeout_only_fires_from_working() {
        let mut b = block();
        b.ingest("\u{273b} Thinking…".as_bytes(), Instant::now());
        assert_eq!(b.state(), DetailedState::Working);

        let t = b.idle_timeout(Instant::now()).unwrap();
        assert_eq!(t.previous, DetailedState::Working);
        assert_eq!(t.next, DetailedState::Idle);

        // A second firing is inert.
        assert!(b.idle_timeout(Instant::now()).is_none());
    }

    #[test]
    fn idle_timeout_reports_elapsed() {
        let start = Instant::now();
        let mut b = DetectorBlock::new(start);
        b.ingest("\u{273b}".as_bytes(), start);
        let t = b
            .idle_timeout(start + Duration::from_secs(30))
            .unwrap();
        assert_eq!(t.previous_elapsed, Duration::from_secs(30));
    }

    // ── window bounding ──────────────────────────────────────────────────

    #[test]
    fn window_keeps_most_recent_text() {
        let mut b = block();
        b.ingest("\u{276f} ".as_bytes(), Instant::now());
        assert_eq!(b.state(), DetailedState::Idle);
        // Flood with 4096 chars of noise: the old prompt scrolls out of the
        // window, and fresh unrecognized output means working.
        let noise = "n".repeat(4096);
        b.ingest(noise.as_bytes(), Instant::now());
        assert_eq!(b.state(), DetailedState::Working);
        assert!(b.window.chars().count() <= 2048);
    }

    #[test]
    fn multibyte_window_trim_respects_boundaries() {
        let mut b = block();
        let wide = "é".repeat(3000);
        b.ingest(wide.as_bytes(), Instant::now());
        assert_eq!(b.window.chars().count(), 2048);
    }
}
