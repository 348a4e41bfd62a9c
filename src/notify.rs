//! Console notifications for mirror events.

use chrono::Local;

use crate::models::{EventKind, MirrorEvent};

/// Prints a human-readable line per mirror event alongside the structured
/// logs, so a terminal session reads like a trade blotter.
pub struct Notifier {
    quiet: bool,
}

impl Notifier {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn announce(&self, event: &MirrorEvent) {
        if self.quiet {
            return;
        }

        let tag = if event.dry_run { " [RISK ONLY]" } else { "" };
        let mut line = format!(
            "[{}]{} {} {}",
            Local::now().format("%H:%M:%S"),
            tag,
            label(event.kind),
            event.symbol
        );

        if let Some(side) = event.side {
            line.push_str(&format!(" {}", side));
        }
        if let Some(price) = event.price {
            line.push_str(&format!(" @ {}", price));
        }
        if !event.detail.is_empty() {
            line.push_str(&format!(" ({})", event.detail));
        }

        println!("{}", line);
    }

    pub fn tick_summary(&self, tick: u64, actions: usize, open_symbols: usize) {
        if self.quiet || actions == 0 {
            return;
        }
        println!(
            "[{}] tick {} | {} action(s) | {} symbol(s) followed",
            Local::now().format("%H:%M:%S"),
            tick,
            actions,
            open_symbols
        );
    }
}

fn label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Entered => "ENTER",
        EventKind::Exited => "EXIT",
        EventKind::Replaced => "REPLACE",
        EventKind::TpSlClosed => "TP/SL CLOSE",
        EventKind::ProfitExit => "PROFIT EXIT",
        EventKind::ManualClose => "MANUAL CLOSE",
        EventKind::ReplaceLegFailed => "REPLACE FAILED",
    }
}
