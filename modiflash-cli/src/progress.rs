//! Terminal progress rendering: one bar per device plus a batch total.

use std::sync::Mutex;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use modiflash::identity::ModuleType;
use modiflash::report::Reporter;
use modiflash::session::UpdatePhase;

/// Reporter rendering the batch as a stack of indicatif bars.
pub struct BarReporter {
    multi: MultiProgress,
    bars: Mutex<Vec<ProgressBar>>,
    total: Mutex<Option<ProgressBar>>,
}

#[allow(clippy::unwrap_used)] // Static template strings
fn device_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:>12.bold} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .unwrap()
        .progress_chars("=>-")
}

#[allow(clippy::unwrap_used)] // Static template strings
fn total_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:>12.bold} [{bar:40.green/blue}] {pos:>3}% {msg}")
        .unwrap()
        .progress_chars("=>-")
}

fn phase_label(phase: UpdatePhase) -> &'static str {
    match phase {
        UpdatePhase::Idle => "waiting",
        UpdatePhase::Discovering => "discovering",
        UpdatePhase::WaitingForReady => "preparing",
        UpdatePhase::Reconnecting => "reconnecting",
        UpdatePhase::Flashing => "flashing",
        UpdatePhase::WritingTrailer => "verifying",
        UpdatePhase::Rebooting => "rebooting",
        UpdatePhase::Done => "done",
    }
}

impl BarReporter {
    /// Empty reporter; bars appear once the batch announces its devices.
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(Vec::new()),
            total: Mutex::new(None),
        }
    }

    #[allow(clippy::unwrap_used)] // lock poisoning means a panic already happened
    fn with_bar(&self, device: usize, f: impl FnOnce(&ProgressBar)) {
        if let Some(bar) = self.bars.lock().unwrap().get(device) {
            f(bar);
        }
    }
}

impl Default for BarReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for BarReporter {
    #[allow(clippy::unwrap_used)] // lock poisoning means a panic already happened
    fn device_list(&self, locations: &[String]) {
        let mut bars = self.bars.lock().unwrap();
        for location in locations {
            let bar = self.multi.add(ProgressBar::new(100));
            bar.set_style(device_style());
            bar.set_prefix(location.clone());
            bar.set_message(phase_label(UpdatePhase::Idle));
            bars.push(bar);
        }

        let total = self.multi.add(ProgressBar::new(100));
        total.set_style(total_style());
        total.set_prefix("total");
        *self.total.lock().unwrap() = Some(total);
    }

    fn device_phase(&self, device: usize, phase: UpdatePhase) {
        self.with_bar(device, |bar| {
            if phase == UpdatePhase::Done {
                if !bar.is_finished() {
                    bar.finish_with_message(phase_label(phase));
                }
            } else {
                bar.set_message(phase_label(phase));
            }
        });
    }

    fn device_module(&self, device: usize, module_type: ModuleType) {
        self.with_bar(device, |bar| {
            bar.set_message(format!("flashing {module_type}"));
        });
    }

    fn device_progress(&self, device: usize, _current: u8, total: u8) {
        self.with_bar(device, |bar| bar.set_position(u64::from(total)));
    }

    fn device_error(&self, device: usize, message: &str) {
        self.with_bar(device, |bar| {
            bar.abandon_with_message(style(message.to_string()).red().to_string());
        });
    }

    fn reconnect_prompt(&self, device: usize, waiting_for_detach: bool) {
        let text = if waiting_for_detach {
            "please disconnect the network module"
        } else {
            "please reconnect the network module"
        };
        self.with_bar(device, |bar| {
            bar.set_message(style(text).yellow().bold().to_string());
        });
    }

    #[allow(clippy::unwrap_used)] // lock poisoning means a panic already happened
    fn total_progress(&self, percent: u8) {
        if let Some(total) = self.total.lock().unwrap().as_ref() {
            total.set_position(u64::from(percent));
        }
    }

    #[allow(clippy::unwrap_used)] // lock poisoning means a panic already happened
    fn total_status(&self, status: &str) {
        if let Some(total) = self.total.lock().unwrap().as_ref() {
            if status == "Complete" {
                total.finish_with_message(status.to_string());
            } else {
                total.set_message(status.to_string());
            }
        }
    }
}
