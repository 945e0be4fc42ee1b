//! Timestamped, level-coloured event lines on stdout.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crossterm::style::{Color, Stylize};
use node_core::events::{EventJournal, EventKind, EventLevel, EventSink, NodeEvent};

pub const JOURNAL_DEPTH: usize = 64;

pub struct Console {
    started: Instant,
    journal: Mutex<EventJournal<JOURNAL_DEPTH>>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            journal: Mutex::new(EventJournal::new()),
        }
    }

    /// Writes one line; the journal lock also serialises stdout.
    pub fn line(&self, level: EventLevel, args: fmt::Arguments<'_>) {
        let _guard = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        self.emit(level, args);
    }

    /// Operator-facing reply, not a node event.
    pub fn reply(&self, text: &str) {
        let _guard = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = io::stdout().lock();
        // A closed stdout only loses the line.
        let _ = writeln!(out, "{}", text.with(Color::Cyan));
    }

    pub fn with_journal<T>(&self, f: impl FnOnce(&EventJournal<JOURNAL_DEPTH>) -> T) -> T {
        f(&self.journal.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn recent(&self, count: usize) -> Vec<EventKind> {
        self.with_journal(|journal| {
            let kinds: Vec<EventKind> = journal.oldest_first().copied().collect();
            kinds[kinds.len().saturating_sub(count)..].to_vec()
        })
    }

    fn emit(&self, level: EventLevel, args: fmt::Arguments<'_>) {
        let elapsed = self.started.elapsed();
        let stamp = format!("[{:>5}.{:03}]", elapsed.as_secs(), elapsed.subsec_millis());
        let text = args.to_string();
        let styled = match level {
            EventLevel::Info => text.stylize(),
            EventLevel::Warn => text.with(Color::Yellow),
            EventLevel::Error => text.with(Color::Red).bold(),
        };
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{} {styled}", stamp.dark_grey());
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for &Console {
    fn record(&mut self, event: &NodeEvent<'_>) {
        let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        journal.record(event);
        self.emit(event.level(), format_args!("{event}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_land_in_the_journal() {
        let console = Console::new();
        let mut sink = &console;
        sink.record(&NodeEvent::ShortPress);
        sink.record(&NodeEvent::SessionOpened);
        sink.record(&NodeEvent::UpdateFinished);
        assert_eq!(
            console.recent(2),
            vec![EventKind::SessionOpened, EventKind::UpdateFinished]
        );
        assert_eq!(console.with_journal(EventJournal::total), 3);
    }
}
