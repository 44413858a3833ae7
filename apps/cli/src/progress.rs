//! Terminal progress rendering
//!
//! One [`CliProgress`] instance lives for the whole batch and is handed to
//! the engine as its [`ProgressSink`]. Each file gets a fresh indicatif bar:
//! a spinner while connecting or resolving metadata, a byte bar once sizes
//! are known, and a separate bar style for the verification pass.

use bwget_types::{ProgressEvent, ProgressSink, TransferPhase};
use console::style;
use human_bytes::human_bytes;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

pub struct CliProgress {
    state: Mutex<BarState>,
}

struct BarState {
    bar: ProgressBar,
    name: String,
    phase: Option<TransferPhase>,
    length_known: bool,
}

impl CliProgress {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarState {
                bar: ProgressBar::hidden(),
                name: String::new(),
                phase: None,
                length_known: false,
            }),
        }
    }

    /// Start a fresh bar for the next file in the batch.
    pub fn begin(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.bar.finish_and_clear();

        let bar = ProgressBar::new_spinner();
        bar.set_style(spinner_style());
        bar.set_message(name.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        state.bar = bar;
        state.name = name.to_string();
        state.phase = None;
        state.length_known = false;
    }

    /// Tear down the current bar and print the success line.
    pub fn finish_success(&self, path: &std::path::Path, bytes: u64, verified: bool) {
        let state = self.state.lock().unwrap();
        state.bar.finish_and_clear();
        let check = if verified { ", sha256 OK" } else { "" };
        println!(
            "{} {} ({}{})",
            style("✔").green().bold(),
            path.display(),
            human_bytes(bytes as f64),
            check,
        );
    }

    /// Tear down the current bar and print the failure line.
    pub fn finish_failure(&self, message: &str) {
        let state = self.state.lock().unwrap();
        state.bar.finish_and_clear();
        eprintln!("{} {}", style("⨯").red().bold(), message);
    }
}

impl Default for CliProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for CliProgress {
    fn on_event(&self, event: &ProgressEvent) {
        let mut state = self.state.lock().unwrap();

        if state.phase != Some(event.phase) {
            state.phase = Some(event.phase);
            state.length_known = false;
            match event.phase {
                TransferPhase::Connecting => {
                    state.bar.set_style(spinner_style());
                    state.bar.set_message(format!("{} (connecting)", state.name));
                }
                TransferPhase::ResolvingMetadata => {
                    state.bar.set_style(spinner_style());
                    state
                        .bar
                        .set_message(format!("{} (resolving metadata)", state.name));
                }
                TransferPhase::Transferring => {
                    state.bar.set_message(state.name.clone());
                }
                TransferPhase::Verifying => {
                    state.bar.set_style(verify_style());
                    state.bar.set_message(format!("verifying {}", state.name));
                }
            }
        }

        match event.phase {
            TransferPhase::Connecting | TransferPhase::ResolvingMetadata => {}
            TransferPhase::Transferring | TransferPhase::Verifying => {
                if let Some(total) = event.total_bytes {
                    if !state.length_known {
                        state.length_known = true;
                        if event.phase == TransferPhase::Transferring {
                            state.bar.set_style(transfer_style());
                        }
                        state.bar.disable_steady_tick();
                        state.bar.set_length(total);
                    }
                    state.bar.set_position(event.bytes_transferred.min(total));
                } else {
                    // Size unknown; keep the spinner but show the byte count.
                    if state.phase == Some(TransferPhase::Transferring) && !state.length_known {
                        state.bar.set_style(unsized_style());
                        state.bar.set_position(event.bytes_transferred);
                    }
                }
            }
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap()
}

fn transfer_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap()
        .progress_chars("█▓▒░  ")
}

fn unsized_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg} {bytes} ({bytes_per_sec})")
        .unwrap()
}

fn verify_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:40.yellow/blue}] {bytes}/{total_bytes}")
        .unwrap()
        .progress_chars("█▓▒░  ")
}
