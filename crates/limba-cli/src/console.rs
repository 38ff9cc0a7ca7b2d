//! Terminal reporter rendering transaction progress.

use std::io::Write;
use std::sync::Mutex;

use limba_core::Reporter;
use limba_core::graph::PackageStage;

/// Prints stage changes and download progress to stdout.
#[derive(Debug)]
pub struct Console {
    quiet: bool,
    // Remembers whether the cursor sits on an unfinished progress line.
    progress_open: Mutex<bool>,
}

impl Console {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            progress_open: Mutex::new(false),
        }
    }

    fn finish_progress_line(&self) {
        let mut open = self.progress_open.lock().unwrap_or_else(|e| e.into_inner());
        if *open {
            println!();
            *open = false;
        }
    }
}

impl Reporter for Console {
    fn progress(&self, id: Option<&str>, percentage: u32) {
        if self.quiet {
            return;
        }
        let label = id.unwrap_or("repository data");
        print!("\r  {label}: {percentage:>3}%");
        let _ = std::io::stdout().flush();
        let mut open = self.progress_open.lock().unwrap_or_else(|e| e.into_inner());
        *open = percentage < 100;
        if percentage >= 100 {
            println!();
        }
    }

    fn stage_changed(&self, id: &str, stage: PackageStage) {
        if self.quiet {
            return;
        }
        self.finish_progress_line();
        println!("{stage}: {id}");
    }

    fn info(&self, msg: &str) {
        if self.quiet {
            return;
        }
        self.finish_progress_line();
        println!("{msg}");
    }

    fn warning(&self, msg: &str) {
        self.finish_progress_line();
        eprintln!("W: {msg}");
    }
}
