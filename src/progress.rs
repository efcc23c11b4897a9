//! In-place progress line for long scans.
//!
//! Workers call [`Progress::update`] every 10 000 blocks (and once at block
//! 10 so short scans show life early). The line is overwritten in place and
//! shows blocks scanned, MiB processed and current/average bandwidth since
//! the start of the scan.

use std::io::Write;
use std::time::Instant;

use crate::util::safe_div;

pub struct Progress {
    start: Instant,
    prev: Instant,
    prev_bytes: u64,
    width: usize,
    quiet: bool,
}

impl Progress {
    pub fn new(quiet: bool) -> Self {
        let now = Instant::now();
        Progress {
            start: now,
            prev: now,
            prev_bytes: 0,
            width: 0,
            quiet,
        }
    }

    /// Rewrite the progress line; `msg` appends a note (e.g. total scan time).
    pub fn update(&mut self, blocks: u64, blocksize: u64, bytes: u64, msg: Option<&str>) {
        if self.quiet {
            return;
        }
        let avg_us = self.start.elapsed().as_micros() as f64;
        let cur_us = self.prev.elapsed().as_micros() as f64;
        // bytes per microsecond equals MB/s
        let avg = safe_div(bytes as f64, avg_us);
        let cur = safe_div((bytes - self.prev_bytes) as f64, cur_us);

        let mut line = format!(
            "{} {}k blocks ({} MiB) processed, {:.0}/{:.0} MB/s (cur/avg)",
            blocks,
            blocksize / 1024,
            bytes / 1048576,
            cur,
            avg
        );
        if let Some(m) = msg {
            line.push_str(m);
        }
        if line.len() > self.width {
            self.width = line.len();
        }
        print!("\r{line:<width$}", width = self.width);
        let _ = std::io::stdout().flush();

        self.prev = Instant::now();
        self.prev_bytes = bytes;
    }

    /// Terminate the progress line with a newline.
    pub fn finish(&mut self) {
        if self.quiet || self.width == 0 {
            return;
        }
        println!();
        let _ = std::io::stdout().flush();
    }
}
