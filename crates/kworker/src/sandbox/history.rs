//! Ring of recent job command lines, dumped when a job dies on an
//! unhandled exception so the crash report names what was running.

use itertools::Itertools as _;

const HISTORY_DEPTH: usize = 16;

#[derive(Debug, Default)]
pub struct HistoryRing {
    entries: Vec<String>,
    next: usize,
    total: u64,
}

impl HistoryRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command_line: &str) {
        self.total += 1;
        if self.entries.len() < HISTORY_DEPTH {
            self.entries.push(command_line.to_owned());
        } else {
            self.entries[self.next] = command_line.to_owned();
        }
        self.next = (self.next + 1) % HISTORY_DEPTH;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Entries newest first.
    pub fn iter_recent(&self) -> impl Iterator<Item = &str> {
        let n = self.entries.len();
        (0..n).map(move |i| {
            let idx = (self.next + n - 1 - i) % n;
            self.entries[idx].as_str()
        })
    }

    /// Dump to stderr, newest first, the way the crash path wants it.
    pub fn dump(&self) {
        let listing = self
            .iter_recent()
            .enumerate()
            .map(|(i, line)| format!("kWorker:  #{i}: {line}"))
            .join("\n");
        eprintln!("kWorker: last {} job(s), newest first:", self.entries.len());
        if !listing.is_empty() {
            eprintln!("{listing}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_first_and_bounded() {
        let mut ring = HistoryRing::new();
        for i in 0..20 {
            ring.push(&format!("job {i}"));
        }
        assert_eq!(ring.total(), 20);
        let recent: Vec<_> = ring.iter_recent().collect();
        assert_eq!(recent.len(), HISTORY_DEPTH);
        assert_eq!(recent[0], "job 19");
        assert_eq!(recent[15], "job 4");
    }

    #[test]
    fn partial_ring() {
        let mut ring = HistoryRing::new();
        ring.push("a");
        ring.push("b");
        let recent: Vec<_> = ring.iter_recent().collect();
        assert_eq!(recent, ["b", "a"]);
    }
}
