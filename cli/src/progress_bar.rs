use indicatif::{ProgressBar, ProgressStyle};
use neural_style::{ProgressUpdate, TransferProgress};

pub struct TransferBar {
    pb: ProgressBar,
}

impl TransferBar {
    pub fn new(total_steps: u32) -> Self {
        let sty = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len:5} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        let pb = ProgressBar::new(u64::from(total_steps));
        pb.set_style(sty);

        Self { pb }
    }
}

impl Drop for TransferBar {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl TransferProgress for TransferBar {
    fn update(&mut self, update: ProgressUpdate) {
        self.pb.set_position(u64::from(update.step));
        self.pb.set_message(format!(
            "style {:.2} content {:.2}",
            update.loss.style, update.loss.content
        ));
    }
}
