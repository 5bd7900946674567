//! Cache Info Inspection
//!
//! Read-only reporting over `.cinfo` records: given a record it prints its
//! completeness and access history, given a directory it walks the tree and
//! reports every record found. Never writes to the cache.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone};
use serde::Serialize;
use tracing::debug;

use crate::cache::is_info_file;
use crate::error::{Error, Result};
use crate::info::{AccessRecord, CacheInfo};

/// Presence cells printed per row in verbose mode
pub const GRID_WIDTH: usize = 64;

/// Totals over one inspection run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InspectSummary {
    /// Records printed
    pub records: usize,
    /// Records with every bit set
    pub complete: usize,
    /// Records that could not be read
    pub errors: usize,
}

/// Prints cache info records to a writer
pub struct Inspector<W: Write> {
    out: W,
    verbose: bool,
    summary: InspectSummary,
}

impl<W: Write> Inspector<W> {
    /// Create an inspector writing to `out`
    pub fn new(out: W, verbose: bool) -> Self {
        Self {
            out,
            verbose,
            summary: InspectSummary::default(),
        }
    }

    /// Inspect a record or a directory tree
    pub fn inspect(&mut self, path: &Path) -> Result<InspectSummary> {
        if is_info_file(path) {
            self.print_file(path)?;
        } else if path.is_dir() {
            self.print_dir(path)?;
        } else {
            return Err(Error::Config(format!(
                "{} is neither a cache info record nor a directory",
                path.display()
            )));
        }
        Ok(self.summary)
    }

    /// Totals so far
    pub fn summary(&self) -> InspectSummary {
        self.summary
    }

    /// Consume the inspector, returning the writer
    pub fn into_inner(self) -> W {
        self.out
    }

    fn print_file(&mut self, path: &Path) -> Result<()> {
        writeln!(self.out, "printing {} ...", path.display())?;
        let info = match fs::read(path)
            .map_err(Error::from)
            .and_then(|bytes| CacheInfo::decode(&bytes))
        {
            Ok(info) => info,
            Err(e) => {
                self.summary.errors += 1;
                writeln!(self.out, "error reading {}: {}\n", path.display(), e)?;
                return Err(e);
            }
        };

        let n_bits = info.size_in_bits();
        let n_present = info.count_present();
        let complete = n_bits == n_present;
        writeln!(
            self.out,
            "version == {}, bufferSize {} nBlocks {} nDownloaded {}{}",
            info.version(),
            info.buffer_size(),
            n_bits,
            n_present,
            if complete { " complete" } else { "" }
        )?;

        if self.verbose {
            writeln!(self.out, "printing {} blocks:", n_bits)?;
            let cells: Vec<char> = (0..n_bits)
                .map(|i| if info.test_bit(i) { 'x' } else { '.' })
                .collect();
            for row in cells.chunks(GRID_WIDTH) {
                let line: Vec<String> = row.iter().map(|c| c.to_string()).collect();
                writeln!(self.out, "{}", line.join(" "))?;
            }
        }

        for (i, record) in info.access_records().iter().enumerate() {
            writeln!(
                self.out,
                "access {} >> [{}], bytesDisk={}, bytesRAM={}, bytesMissed={}",
                i,
                format_detach_time(record),
                record.bytes_disk,
                record.bytes_ram,
                record.bytes_missed
            )?;
        }
        writeln!(self.out)?;

        self.summary.records += 1;
        if complete {
            self.summary.complete += 1;
        }
        Ok(())
    }

    fn print_dir(&mut self, dir: &Path) -> Result<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .map(|entry| entry.path())
            .collect();
        entries.sort();

        for path in entries {
            if is_info_file(&path) {
                if let Err(e) = self.print_file(&path) {
                    debug!("Skipping {}: {}", path.display(), e);
                }
            } else if path.is_dir() {
                if let Err(e) = self.print_dir(&path) {
                    debug!("Cannot walk {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }
}

fn format_detach_time(record: &AccessRecord) -> String {
    match Local.timestamp_opt(record.detach_time, 0).single() {
        Some(t) => t.format("%c").to_string(),
        None => record.detach_time.to_string(),
    }
}

/// Resolve a `root://` path against the cache root; other paths pass through.
pub fn resolve_inspect_path(path: &str, local_root: Option<&Path>) -> Result<PathBuf> {
    match path.strip_prefix("root:/") {
        Some(rest) => {
            let root = local_root.ok_or_else(|| {
                Error::Config("a configuration file is required for root:// paths".to_string())
            })?;
            Ok(root.join(rest.trim_start_matches('/')))
        }
        None => Ok(PathBuf::from(path)),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn write_record(path: &Path, n_bits: u64, present: &[u32], history: &[AccessRecord]) {
        let info = CacheInfo::new(100, n_bits * 100).unwrap();
        for i in present {
            info.mark_present(*i);
        }
        for record in history {
            info.append_access(*record);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, info.encode()).unwrap();
    }

    fn output(inspector: Inspector<Vec<u8>>) -> String {
        String::from_utf8(inspector.into_inner()).unwrap()
    }

    #[test]
    fn test_print_incomplete_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f___800_0.cinfo");
        write_record(&path, 8, &[0, 2, 5], &[]);

        let mut inspector = Inspector::new(Vec::new(), false);
        let summary = inspector.inspect(&path).unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.complete, 0);

        let text = output(inspector);
        assert!(text.contains("version == 1, bufferSize 100 nBlocks 8 nDownloaded 3\n"));
        assert!(!text.contains("complete"));
        assert!(!text.contains("printing 8 blocks"));
    }

    #[test]
    fn test_print_verbose_grid_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.cinfo");
        let record = AccessRecord {
            detach_time: 1_700_000_000,
            bytes_disk: 10,
            bytes_ram: 20,
            bytes_missed: 30,
        };
        write_record(&path, 4, &[0, 1, 2, 3], &[record]);

        let mut inspector = Inspector::new(Vec::new(), true);
        inspector.inspect(&path).unwrap();
        let text = output(inspector);

        assert!(text.contains("nDownloaded 4 complete"));
        assert!(text.contains("printing 4 blocks:\nx x x x\n"));
        assert!(text.contains("access 0 >> ["));
        assert!(text.contains("bytesDisk=10, bytesRAM=20, bytesMissed=30"));
    }

    #[test]
    fn test_grid_wraps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.cinfo");
        write_record(&path, 70, &[69], &[]);

        let mut inspector = Inspector::new(Vec::new(), true);
        inspector.inspect(&path).unwrap();
        let text = output(inspector);
        let rows: Vec<&str> = text
            .lines()
            .skip_while(|l| !l.starts_with("printing 70 blocks"))
            .skip(1)
            .take(2)
            .collect();
        assert_eq!(rows[0].split(' ').count(), GRID_WIDTH);
        assert_eq!(rows[1], ". . . . . x");
    }

    #[test]
    fn test_walk_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        write_record(&dir.path().join("a/f1___100_0.cinfo"), 2, &[0, 1], &[]);
        write_record(&dir.path().join("a/b/f2___100_0.cinfo"), 2, &[0], &[]);
        write_record(&dir.path().join(".hidden/f3.cinfo"), 2, &[0], &[]);
        fs::write(dir.path().join("a/f1___100_0"), b"data").unwrap();
        fs::write(dir.path().join("a/broken.cinfo"), b"xx").unwrap();

        let mut inspector = Inspector::new(Vec::new(), false);
        let summary = inspector.inspect(dir.path()).unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.complete, 1);
        assert_eq!(summary.errors, 1);

        let text = output(inspector);
        assert!(text.contains("f1___100_0.cinfo"));
        assert!(text.contains("f2___100_0.cinfo"));
        assert!(!text.contains("f3.cinfo"));
        assert!(text.contains("error reading"));
    }

    #[test]
    fn test_non_record_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.bin");
        fs::write(&path, b"data").unwrap();
        let mut inspector = Inspector::new(Vec::new(), false);
        assert_matches!(inspector.inspect(&path), Err(Error::Config(_)));
    }

    #[test]
    fn test_resolve_root_paths() {
        assert_eq!(
            resolve_inspect_path("/data/x.cinfo", None).unwrap(),
            PathBuf::from("/data/x.cinfo")
        );
        assert_eq!(
            resolve_inspect_path("root://store/x.cinfo", Some(Path::new("/cache"))).unwrap(),
            PathBuf::from("/cache/store/x.cinfo")
        );
        assert_matches!(
            resolve_inspect_path("root://store/x.cinfo", None),
            Err(Error::Config(_))
        );
    }
}
