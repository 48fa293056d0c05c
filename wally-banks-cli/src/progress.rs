use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use wally_banks::{BankDescriptor, BankIndex, Label, ProgressSink};

/// Terminal progress bar over source images, labelled with the current group.
pub struct BarProgress {
    bar: ProgressBar,
    style: ProgressStyle,
}

impl BarProgress {
    pub fn new() -> Result<Self> {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("█▓░");
        Ok(Self {
            bar: ProgressBar::hidden(),
            style,
        })
    }
}

impl ProgressSink for BarProgress {
    fn start(&mut self, total_groups: usize, total_images: usize) {
        self.bar = ProgressBar::new(total_images as u64);
        self.bar.set_style(self.style.clone());
        self.bar.set_message(format!("Building {} banks...", total_groups));
    }

    fn image_done(&mut self, label: &Label) {
        self.bar.set_message(label.to_string());
        self.bar.inc(1);
    }

    fn group_done(&mut self, label: &Label, descriptor: Option<&BankDescriptor>) {
        match descriptor {
            Some(d) => self.bar.set_message(format!("{} (k={})", label, d.k)),
            None => self.bar.set_message(format!("{} (skipped)", label)),
        }
    }

    fn finish(&mut self, _index: &BankIndex) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_advances_per_image() {
        let mut progress = BarProgress::new().unwrap();
        let label = Label::new("negatives_hard", "frame");

        progress.start(1, 3);
        progress.image_done(&label);
        progress.image_done(&label);
        assert_eq!(progress.bar.position(), 2);
        assert_eq!(progress.bar.length(), Some(3));

        progress.group_done(&label, None);
        assert_eq!(progress.bar.position(), 2);
    }
}
