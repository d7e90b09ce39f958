//! Terminal rendering of provisioning events.
//!
//! One bar per feature phase (percent) and one per package (bytes).
//! indicatif hides the bars when stderr is not a terminal; final status
//! lines are always printed.

use console::style;
use hostprep_shared::{FeaturePhase, Package, ProvisionEvent};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

pub struct EventRenderer {
    multi: MultiProgress,
    phases: HashMap<FeaturePhase, ProgressBar>,
    downloads: HashMap<Package, ProgressBar>,
    verbose: bool,
}

impl EventRenderer {
    pub fn new(verbose: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            phases: HashMap::new(),
            downloads: HashMap::new(),
            verbose,
        }
    }

    pub fn handle(&mut self, event: &ProvisionEvent) {
        match event {
            ProvisionEvent::FeatureProgress { phase, percent } => {
                self.phase_bar(*phase).set_position(percent.round() as u64);
            }
            ProvisionEvent::FeatureLog { phase, text } => {
                if self.verbose {
                    let text = text.trim();
                    if !text.is_empty() {
                        self.line(format!("{} {}", style(format!("[{}]", phase)).dim(), text));
                    }
                }
            }
            ProvisionEvent::FeatureError { phase, error } => {
                let bar = self.phase_bar(*phase);
                bar.abandon_with_message(format!("{}", style("failed").red()));
                self.line(format!(
                    "{} {} feature: {}",
                    style("✗").red(),
                    phase,
                    error
                ));
            }
            ProvisionEvent::FeatureComplete { phase, success } => {
                let bar = self.phase_bar(*phase);
                if *success {
                    bar.finish_with_message(format!("{}", style("enabled").green()));
                    self.line(format!("{} {} feature enabled", style("✓").green(), phase));
                } else if !bar.is_finished() {
                    bar.abandon();
                }
            }
            ProvisionEvent::DownloadStarted { package, status } => {
                let bar = self.download_bar(*package);
                if status.is_length_known() {
                    bar.set_length(status.total);
                }
            }
            ProvisionEvent::DownloadProgress { package, status } => {
                let bar = self.download_bar(*package);
                if status.is_length_known() && bar.length() != Some(status.total) {
                    bar.set_length(status.total);
                }
                bar.set_position(status.downloaded);
                if status.error.is_some() {
                    bar.set_message(format!("{}", style("interrupted").red()));
                } else if let Some(fraction) = status.fraction() {
                    bar.set_message(format!("{:.0}%", fraction * 100.0));
                }
            }
            ProvisionEvent::InstallComplete { package, result } => {
                let bar = self.download_bar(*package);
                bar.finish_with_message(format!("{}", style("installed").green()));
                let note = if result.needs_restart {
                    format!(" {}", style("(restart required)").yellow())
                } else {
                    String::new()
                };
                self.line(format!("{} {} installed{}", style("✓").green(), package, note));
            }
            ProvisionEvent::InstallError { package, error } => {
                let bar = self.download_bar(*package);
                bar.abandon_with_message(format!("{}", style("failed").red()));
                self.line(format!("{} {}: {}", style("✗").red(), package, error));
            }
        }
    }

    /// Stop drawing; bars still running are left as they are
    pub fn finish(self) {
        for bar in self.phases.values().chain(self.downloads.values()) {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }

    fn line(&self, text: String) {
        self.multi.suspend(|| println!("{}", text));
    }

    fn phase_bar(&mut self, phase: FeaturePhase) -> ProgressBar {
        let multi = &self.multi;
        self.phases
            .entry(phase)
            .or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(100));
                if let Ok(s) = ProgressStyle::with_template(
                    "{prefix:>10} [{bar:30.cyan/blue}] {pos:>3}% {msg}",
                ) {
                    bar.set_style(s.progress_chars("=> "));
                }
                bar.set_prefix(phase.to_string());
                bar
            })
            .clone()
    }

    fn download_bar(&mut self, package: Package) -> ProgressBar {
        let multi = &self.multi;
        self.downloads
            .entry(package)
            .or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(0));
                if let Ok(s) = ProgressStyle::with_template(
                    "{prefix:>10} [{bar:30.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
                ) {
                    bar.set_style(s.progress_chars("=> "));
                }
                bar.set_prefix(package.to_string());
                bar
            })
            .clone()
    }
}
