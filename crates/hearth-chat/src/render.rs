//! Incremental terminal rendering of turn snapshots.

use std::io::{self, Write};

use hearth_stream::{FinalizedMessage, Role, Termination, TurnOutcome, TurnSnapshot};

/// Prints only what changed since the previous snapshot of the same turn.
///
/// Snapshot texts only ever grow, so the printed prefix lengths are enough to
/// find the new suffix even when intermediate snapshots were skipped.
#[derive(Debug, Default)]
pub struct Renderer {
    show_thinking: bool,
    reasoning_printed: usize,
    answer_printed: usize,
    last_rate: Option<f64>,
}

impl Renderer {
    pub fn new(show_thinking: bool) -> Self {
        Self {
            show_thinking,
            ..Self::default()
        }
    }

    /// Most recent throughput seen while streaming.
    pub fn last_rate(&self) -> Option<f64> {
        self.last_rate
    }

    pub fn draw(&mut self, snapshot: &TurnSnapshot, out: &mut impl Write) -> io::Result<()> {
        if snapshot.current_rate.is_some() {
            self.last_rate = snapshot.current_rate;
        }
        if self.show_thinking
            && let Some(delta) = snapshot.reasoning_text.get(self.reasoning_printed..)
            && !delta.is_empty()
        {
            if self.reasoning_printed == 0 {
                write!(out, "(thinking) ")?;
            }
            write!(out, "{delta}")?;
            self.reasoning_printed = snapshot.reasoning_text.len();
        }

        if let Some(delta) = snapshot.answer_text.get(self.answer_printed..)
            && !delta.is_empty()
        {
            if self.answer_printed == 0 && self.reasoning_printed > 0 {
                writeln!(out)?;
            }
            write!(out, "{delta}")?;
            self.answer_printed = snapshot.answer_text.len();
        }
        out.flush()
    }
}

/// Closing line for a turn. Without final statistics the last live rate is shown.
pub fn write_outcome(
    outcome: &TurnOutcome,
    last_rate: Option<f64>,
    out: &mut impl Write,
) -> io::Result<()> {
    writeln!(out)?;
    let rate = last_rate
        .map(|r| format!(", last {r:.1} tok/s"))
        .unwrap_or_default();
    match (&outcome.termination, &outcome.stats) {
        (Termination::Completed, Some(stats)) => writeln!(
            out,
            "[{} tokens in {} ms, {:.1} tok/s]",
            stats.total_tokens, stats.duration_ms, stats.avg_tokens_per_second
        ),
        (Termination::Completed, None) => writeln!(out, "[done{rate}]"),
        (Termination::Failed { failure }, _) => writeln!(out, "[error: {failure}{rate}]"),
        (Termination::Cancelled, _) => writeln!(out, "[cancelled{rate}]"),
    }
}

pub fn write_history(history: &[FinalizedMessage], out: &mut impl Write) -> io::Result<()> {
    if history.is_empty() {
        return writeln!(out, "(no messages yet)");
    }
    for message in history {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        let note = match &message.termination {
            Termination::Completed => String::new(),
            Termination::Cancelled => " (cancelled)".to_string(),
            Termination::Failed { failure } => format!(" (failed: {failure})"),
        };
        writeln!(out, "{who}{note}: {}", message.content)?;
    }
    Ok(())
}
