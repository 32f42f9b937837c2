//! Buffered line reader over `/proc/<pid>/maps`, plus the record parser for
//! individual mapping lines. Kept as a standalone building block so the
//! Module Enumerator and Process Ranges module can each apply their own
//! filtering without re-reading the file.

use std::fs::File;
use std::io::Read;

use crate::error::Result;

const REFILL_SIZE: usize = 8 * 1024;

/// Buffered, refilling line reader. Each call to `next_line` yields a
/// borrowed view of exactly one line (trailing `\n` stripped), valid only
/// until the next call — the backing buffer is compacted and refilled in
/// place rather than growing unbounded, since the only unbounded field in
/// a maps line is the trailing path.
pub struct LineReader {
    file: File,
    buf: Vec<u8>,
    /// Start of unconsumed, valid bytes in `buf`.
    start: usize,
    /// End of valid bytes in `buf`.
    end: usize,
    eof: bool,
}

impl LineReader {
    pub fn open(path: &str) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            buf: vec![0u8; REFILL_SIZE],
            start: 0,
            end: 0,
            eof: false,
        })
    }

    /// Returns the next line, or `None` on clean EOF. A read error is
    /// surfaced once and then treated as EOF for subsequent calls: on EOF
    /// or read error, iteration ends cleanly.
    pub fn next_line(&mut self) -> Option<&str> {
        loop {
            if let Some(nl) = self.buf[self.start..self.end]
                .iter()
                .position(|&b| b == b'\n')
            {
                let line_end = self.start + nl;
                let line_start = self.start;
                self.start = line_end + 1;
                return Some(
                    std::str::from_utf8(&self.buf[line_start..line_end])
                        .unwrap_or("")
                        .trim_end_matches('\r'),
                );
            }

            if self.eof {
                // Whatever remains without a trailing newline is the last
                // (possibly partial) line; hand it back once, then stop.
                if self.start < self.end {
                    let s = self.start;
                    self.start = self.end;
                    return std::str::from_utf8(&self.buf[s..self.end]).ok();
                }
                return None;
            }

            self.compact_and_refill();
        }
    }

    fn compact_and_refill(&mut self) {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() {
            self.buf.resize(self.buf.len() * 2, 0);
        }
        match self.file.read(&mut self.buf[self.end..]) {
            Ok(0) => self.eof = true,
            Ok(n) => self.end += n,
            Err(_) => self.eof = true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

impl Perms {
    fn parse(s: &str) -> Self {
        let b = s.as_bytes();
        Perms {
            read: b.first() == Some(&b'r'),
            write: b.get(1) == Some(&b'w'),
            exec: b.get(2) == Some(&b'x'),
            shared: b.get(3) == Some(&b's'),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub offset: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    /// Empty for anonymous mappings; `[heap]`/`[stack]`/`[vdso]`-style
    /// pseudo-paths are passed through verbatim.
    pub path: String,
}

/// Parses one `/proc/<pid>/maps` line:
/// `start-end perms offset dev inode path`.
pub fn parse_line(line: &str) -> Option<MapEntry> {
    let mut fields = line.splitn(6, char::is_whitespace);
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let dev = fields.next()?;
    let inode = fields.next()?;
    // The rest of the line (after however much whitespace separates the
    // inode column from the path) is the path, verbatim.
    let rest = fields.next().unwrap_or("").trim_start();

    let (start_s, end_s) = range.split_once('-')?;
    let start = u64::from_str_radix(start_s, 16).ok()?;
    let end = u64::from_str_radix(end_s, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;
    let (maj_s, min_s) = dev.split_once(':')?;
    let dev_major = u32::from_str_radix(maj_s, 16).ok()?;
    let dev_minor = u32::from_str_radix(min_s, 16).ok()?;
    let inode = inode.parse().ok()?;

    Some(MapEntry {
        start,
        end,
        perms: Perms::parse(perms),
        offset,
        dev_major,
        dev_minor,
        inode,
        path: rest.to_string(),
    })
}

/// Convenience iterator over `/proc/<pid>/maps` that owns each parsed
/// record (unlike `LineReader`, whose borrowed lines are only valid until
/// the next call) so callers can collect or filter without juggling
/// lifetimes.
pub struct ProcMaps {
    reader: LineReader,
}

impl ProcMaps {
    pub fn for_pid(pid: i32) -> Result<Self> {
        let path = if pid < 0 {
            "/proc/self/maps".to_string()
        } else {
            format!("/proc/{pid}/maps")
        };
        Ok(Self {
            reader: LineReader::open(&path)?,
        })
    }

    pub fn this_process() -> Result<Self> {
        Self::for_pid(-1)
    }
}

impl Iterator for ProcMaps {
    type Item = MapEntry;

    fn next(&mut self) -> Option<MapEntry> {
        loop {
            let line = self.reader.next_line()?;
            if let Some(entry) = parse_line(line) {
                return Some(entry);
            }
            // Malformed line (shouldn't happen on Linux): skip it.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_line() {
        let line = "7f1234560000-7f1234580000 r-xp 00000000 08:01 131074  /usr/lib/libc.so.6";
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.start, 0x7f1234560000);
        assert_eq!(entry.end, 0x7f1234580000);
        assert!(entry.perms.read && entry.perms.exec && !entry.perms.write);
        assert!(entry.perms.shared == false);
        assert_eq!(entry.path, "/usr/lib/libc.so.6");
    }

    #[test]
    fn parses_anonymous_mapping_with_empty_path() {
        let line = "00400000-00401000 rw-p 00000000 00:00 0 ";
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.path, "");
    }

    #[test]
    fn self_maps_has_at_least_one_executable_mapping() {
        let maps = ProcMaps::this_process().expect("open /proc/self/maps");
        let any_exec = maps.into_iter().any(|e| e.perms.exec);
        assert!(any_exec);
    }
}
