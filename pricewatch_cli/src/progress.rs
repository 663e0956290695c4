//! One progress bar per source.

use std::collections::HashMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use pricewatch_lib::{BlockAlert, FetchStatus, ProgressEvent, ProgressSink, SourceId};

#[derive(Default)]
struct Tally {
    found: usize,
    not_found: usize,
    blocked: usize,
}

pub struct BarProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<SourceId, (ProgressBar, Tally)>>,
    style: ProgressStyle,
}

impl BarProgress {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(
            "{prefix:>12} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len:5} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            style,
        }
    }
}

impl ProgressSink for BarProgress {
    fn on_start(&self, source: &SourceId, total: usize) {
        let pb = self.multi.add(ProgressBar::new(total as u64));
        pb.set_style(self.style.clone());
        pb.set_prefix(source.to_string());
        pb.set_message("starting...");
        self.bars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source.clone(), (pb, Tally::default()));
    }

    fn on_event(&self, event: &ProgressEvent) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        let Some((pb, tally)) = bars.get_mut(&event.source) else {
            return;
        };
        match event.last {
            FetchStatus::Found => tally.found += 1,
            FetchStatus::NotFound => tally.not_found += 1,
            FetchStatus::Blocked => tally.blocked += 1,
        }
        pb.set_position(event.completed as u64);
        pb.set_message(format!(
            "{} found, {} missing, {} blocked",
            tally.found, tally.not_found, tally.blocked
        ));
    }

    fn on_alert(&self, alert: &BlockAlert) {
        let _ = self.multi.println(format!(
            "{}: {} responses reached {}; the shop is likely blocking requests",
            alert.source, alert.code, alert.count
        ));
    }

    fn on_finish(&self, source: &SourceId) {
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((pb, tally)) = bars.get(source) {
            pb.finish_with_message(format!(
                "done: {} found, {} missing, {} blocked",
                tally.found, tally.not_found, tally.blocked
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bars_track_outcomes() {
        let progress = BarProgress::new();
        let source = SourceId::new("np");
        progress.on_start(&source, 3);
        for (completed, last) in [FetchStatus::Found, FetchStatus::Blocked, FetchStatus::Found]
            .into_iter()
            .enumerate()
        {
            progress.on_event(&ProgressEvent {
                source: source.clone(),
                completed: completed + 1,
                total: 3,
                last,
            });
        }
        progress.on_finish(&source);

        let bars = progress.bars.lock().unwrap();
        let (pb, tally) = &bars[&source];
        assert_eq!(pb.position(), 3);
        assert!(pb.is_finished());
        assert_eq!((tally.found, tally.not_found, tally.blocked), (2, 0, 1));
    }

    #[test]
    fn unknown_sources_are_ignored() {
        let progress = BarProgress::new();
        progress.on_event(&ProgressEvent {
            source: SourceId::new("ghost"),
            completed: 1,
            total: 1,
            last: FetchStatus::Found,
        });
        assert!(progress.bars.lock().unwrap().is_empty());
    }
}
