//! Usage totals and the outstanding-block report.

use std::io::{self, Write};

use serde::Serialize;

use crate::backing::BackingAllocator;
use crate::ledger::Ledger;
use crate::record::AllocationRecord;
use crate::site::CallSite;

/// Block and byte counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub blocks: usize,
    pub bytes: usize,
}

/// One outstanding block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakRow {
    pub serial: u64,
    pub address: String,
    pub size: usize,
    pub site: CallSite,
}

impl From<&AllocationRecord> for LeakRow {
    fn from(record: &AllocationRecord) -> Self {
        Self {
            serial: record.serial,
            address: format!("{:#x}", record.user_base),
            size: record.user_size,
            site: record.site,
        }
    }
}

/// Machine-readable form of [`write_table`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub usage: Usage,
    pub released: Usage,
    pub rows: Vec<LeakRow>,
}

/// Write the human-readable table of `live` records (already ordered by serial).
pub fn write_table(sink: &mut dyn Write, live: &[AllocationRecord]) -> io::Result<()> {
    if live.is_empty() {
        return writeln!(sink, "memdbg: no outstanding allocations");
    }
    let bytes: usize = live.iter().map(|r| r.user_size).sum();
    writeln!(
        sink,
        "memdbg: {} block(s) outstanding, {bytes} bytes",
        live.len()
    )?;
    writeln!(sink, "{:>8}  {:<18}  {:>10}  site", "serial", "address", "size")?;
    for record in live {
        writeln!(
            sink,
            "{:>8}  {:<18}  {:>10}  {}",
            record.serial,
            format!("{:#x}", record.user_base),
            record.user_size,
            record.site
        )?;
    }
    Ok(())
}

/// Write released tombstones in the leak-table layout, with the release site
/// and the payload tail captured at release. Writes nothing for an empty list.
pub fn write_released(sink: &mut dyn Write, released: &[AllocationRecord]) -> io::Result<()> {
    if released.is_empty() {
        return Ok(());
    }
    writeln!(sink, "memdbg: {} released block(s) in ledger", released.len())?;
    writeln!(
        sink,
        "{:>8}  {:<18}  {:>10}  site / released / tail",
        "serial", "address", "size"
    )?;
    for record in released {
        let tail = record.tail.as_ref().map_or_else(
            || "-".to_string(),
            |snap| snap.bytes().iter().map(|b| format!("{b:02x}")).collect(),
        );
        writeln!(
            sink,
            "{:>8}  {:<18}  {:>10}  {}  released at {}  tail {tail}",
            record.serial,
            format!("{:#x}", record.user_base),
            record.user_size,
            record.site,
            record.released_at.unwrap_or(CallSite::UNKNOWN)
        )?;
    }
    Ok(())
}

impl<B: BackingAllocator> Ledger<B> {
    /// Outstanding blocks, plus released tombstones when `include_released`.
    #[must_use]
    pub fn used(&self, include_released: bool) -> Usage {
        let totals = self.totals();
        let mut usage = Usage {
            blocks: totals.live_blocks,
            bytes: totals.live_bytes,
        };
        if include_released {
            usage.blocks += totals.released_blocks;
            usage.bytes += totals.released_bytes;
        }
        usage
    }

    /// Print every live record with its allocation site.
    pub fn display(&self, sink: &mut dyn Write) -> io::Result<()> {
        write_table(sink, &self.live_records())
    }

    #[must_use]
    pub fn leak_report(&self) -> LeakReport {
        let totals = self.totals();
        LeakReport {
            usage: Usage {
                blocks: totals.live_blocks,
                bytes: totals.live_bytes,
            },
            released: Usage {
                blocks: totals.released_blocks,
                bytes: totals.released_bytes,
            },
            rows: self.live_records().iter().map(LeakRow::from).collect(),
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    fn site(line: u32) -> CallSite {
        CallSite::new("report_test.rs", line)
    }

    #[test]
    fn used_counts_live_and_optionally_released() {
        let ledger = Ledger::system();
        let a = ledger.create(10, site(1)).unwrap();
        let _b = ledger.create(20, site(2)).unwrap();
        ledger.release(a.user_ptr(), site(3)).unwrap();

        assert_eq!(ledger.used(false), Usage { blocks: 1, bytes: 20 });
        assert_eq!(ledger.used(true), Usage { blocks: 2, bytes: 30 });
    }

    #[test]
    fn display_lists_outstanding_blocks_by_serial() {
        let ledger = Ledger::system();
        let first = ledger.create(5, site(10)).unwrap();
        let second = ledger.create(7, site(11)).unwrap();

        let mut out = Vec::new();
        ledger.display(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "memdbg: 2 block(s) outstanding, 12 bytes");
        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("report_test.rs:10"));
        assert!(lines[2].contains(&format!("{:#x}", first.user_base)));
        assert!(lines[3].contains("report_test.rs:11"));
        assert!(lines[3].contains(&format!("{:#x}", second.user_base)));
    }

    #[test]
    fn display_of_empty_ledger() {
        let ledger = Ledger::system();
        let mut out = Vec::new();
        ledger.display(&mut out).unwrap();
        assert_eq!(out, b"memdbg: no outstanding allocations\n");
    }

    #[test]
    fn leak_report_serializes_rows() {
        let ledger = Ledger::system();
        ledger.create(3, site(4)).unwrap();
        let report = ledger.leak_report();
        assert_eq!(report.rows.len(), 1);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["usage"]["blocks"], 1);
        assert_eq!(json["rows"][0]["site"]["line"], 4);
        assert_eq!(json["rows"][0]["site"]["file"], "report_test.rs");
    }

    #[test]
    fn released_rows_carry_both_sites_and_tail() {
        let ledger = Ledger::system();
        let block = ledger.create(4, site(20)).unwrap();
        unsafe { block.user_ptr().copy_from(b"abcd".as_ptr(), 4) };
        let record = ledger.release(block.user_ptr(), site(21)).unwrap();

        let mut out = Vec::new();
        write_released(&mut out, std::slice::from_ref(&record)).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "memdbg: 1 released block(s) in ledger");
        assert!(lines[2].contains(&format!("{:#x}", record.user_base)), "{text}");
        assert!(lines[2].contains("report_test.rs:20"), "{text}");
        assert!(lines[2].contains("released at report_test.rs:21"), "{text}");
        assert!(lines[2].ends_with("tail 61626364"), "{text}");

        let mut empty = Vec::new();
        write_released(&mut empty, &[]).unwrap();
        assert!(empty.is_empty());
    }
}
