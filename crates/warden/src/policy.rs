//! Allow-list policy store
//!
//! Holds the administrator's allow-list and rebuilds it from the policy file
//! on demand. A reload parses the whole file into a fresh [`AllowList`] and
//! only then replaces the current snapshot, so a decision never sees a
//! partially loaded list.
//!
//! File format, one record per line:
//! ```text
//! # serial      vendor  product
//! A1B2C3        1234    5678
//! ```

use crate::engine::IdFormat;
use common::{AllowListEntry, Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Immutable allow-list snapshot
///
/// Entries keep file order and duplicates. Lookups go through an index keyed
/// by `(vendor_id, product_id)`; the serial prefix check runs on the
/// candidates in file order.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: Vec<AllowListEntry>,
    index: HashMap<(u32, u32), Vec<usize>>,
    id_format: IdFormat,
}

impl AllowList {
    /// Empty list, denies everything
    pub fn empty(id_format: IdFormat) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            id_format,
        }
    }

    /// Build a list from already parsed entries
    pub fn from_entries(entries: Vec<AllowListEntry>, id_format: IdFormat) -> Self {
        let mut index: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
        for (position, entry) in entries.iter().enumerate() {
            index
                .entry((entry.vendor_id, entry.product_id))
                .or_default()
                .push(position);
        }

        Self {
            entries,
            index,
            id_format,
        }
    }

    /// Parse policy file content, returning the list and the lines it skipped
    pub fn parse(content: &str, id_format: IdFormat) -> (Self, Vec<SkippedLine>) {
        let mut entries = Vec::new();
        let mut skipped = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match parse_record(trimmed, id_format) {
                Ok(entry) => entries.push(entry),
                Err(reason) => skipped.push(SkippedLine {
                    line_number: idx + 1,
                    content: trimmed.to_string(),
                    reason,
                }),
            }
        }

        (Self::from_entries(entries, id_format), skipped)
    }

    /// First entry satisfied by the observed identity
    pub fn find_match(
        &self,
        serial: &str,
        vendor_id: u32,
        product_id: u32,
    ) -> Option<&AllowListEntry> {
        self.index
            .get(&(vendor_id, product_id))?
            .iter()
            .map(|&position| &self.entries[position])
            .find(|entry| entry.matches(serial, vendor_id, product_id))
    }

    pub fn entries(&self) -> &[AllowListEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn id_format(&self) -> IdFormat {
        self.id_format
    }
}

fn parse_record(
    line: &str,
    id_format: IdFormat,
) -> std::result::Result<AllowListEntry, &'static str> {
    let mut fields = line.split_whitespace();
    let (Some(serial), Some(vendor), Some(product)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err("expected <serial> <vendorId> <productId>");
    };
    if fields.next().is_some() {
        return Err("unexpected trailing fields");
    }

    let vendor_id = id_format
        .parse_policy_field(vendor)
        .ok_or("invalid vendor id")?;
    let product_id = id_format
        .parse_policy_field(product)
        .ok_or("invalid product id")?;

    Ok(AllowListEntry::new(serial, vendor_id, product_id))
}

/// A policy line that was not loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    pub line_number: usize,
    pub content: String,
    pub reason: &'static str,
}

/// Summary of one load or reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub path: PathBuf,
    pub entries: usize,
    pub skipped: Vec<SkippedLine>,
}

/// Owner of the current allow-list snapshot
#[derive(Debug)]
pub struct PolicyStore {
    path: PathBuf,
    id_format: IdFormat,
    current: Arc<AllowList>,
}

impl PolicyStore {
    /// Load the policy file at start-up
    ///
    /// The store is always returned; when the file cannot be read it is
    /// empty and the error is handed back alongside it.
    pub fn load(path: impl Into<PathBuf>, id_format: IdFormat) -> (Self, Result<LoadReport>) {
        let mut store = Self {
            path: path.into(),
            id_format,
            current: Arc::new(AllowList::empty(id_format)),
        };
        let report = store.reload();
        (store, report)
    }

    /// Store over an in-memory list, not backed by a readable file
    pub fn with_list(path: impl Into<PathBuf>, list: AllowList) -> Self {
        Self {
            path: path.into(),
            id_format: list.id_format(),
            current: Arc::new(list),
        }
    }

    /// Re-read the policy file and swap in the new list
    ///
    /// On a read error the current list stays in place.
    pub fn reload(&mut self) -> Result<LoadReport> {
        let (list, report) = read_allow_list(&self.path, self.id_format)?;
        self.current = Arc::new(list);
        info!(
            "Loaded {} allow-list entries from {}",
            report.entries,
            self.path.display()
        );
        Ok(report)
    }

    /// Current allow-list snapshot
    pub fn snapshot(&self) -> Arc<AllowList> {
        Arc::clone(&self.current)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_allow_list(path: &Path, id_format: IdFormat) -> Result<(AllowList, LoadReport)> {
    let bytes = fs::read(path).map_err(|e| {
        Error::Policy(format!("Failed to read policy file {}: {}", path.display(), e))
    })?;
    let content = String::from_utf8_lossy(&bytes);

    let (list, skipped) = AllowList::parse(&content, id_format);
    for line in &skipped {
        warn!(
            "{}:{}: skipping malformed policy record ({}): {}",
            path.display(),
            line.line_number,
            line.reason,
            line.content
        );
    }
    debug!(
        "Parsed {}: {} entries, {} skipped",
        path.display(),
        list.len(),
        skipped.len()
    );

    let report = LoadReport {
        path: path.to_path_buf(),
        entries: list.len(),
        skipped,
    };
    Ok((list, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let content = "# header\n\n   \n  # indented comment\nA1 1 2\n";
        let (list, skipped) = AllowList::parse(content, IdFormat::LegacyDecimal);
        assert_eq!(list.len(), 1);
        assert!(skipped.is_empty());
        assert_eq!(list.entries()[0], AllowListEntry::new("A1", 1, 2));
    }

    #[test]
    fn test_parse_malformed_records() {
        let content = "only-serial\nS 12\nS abc 1\nS 1 -2\nS 1 2 extra\nGOOD 3 4\n";
        let (list, skipped) = AllowList::parse(content, IdFormat::LegacyDecimal);
        assert_eq!(list.entries(), &[AllowListEntry::new("GOOD", 3, 4)]);
        assert_eq!(skipped.len(), 5);
        assert_eq!(skipped[0].line_number, 1);
        assert_eq!(skipped[2].reason, "invalid vendor id");
        assert_eq!(skipped[3].reason, "invalid product id");
        assert_eq!(skipped[4].reason, "unexpected trailing fields");
    }

    #[test]
    fn test_parse_accepts_tabs_and_crlf() {
        let content = "SER\t1234\t5678\r\nOTHER  1 2\r\n";
        let (list, skipped) = AllowList::parse(content, IdFormat::LegacyDecimal);
        assert!(skipped.is_empty());
        assert_eq!(list.len(), 2);
        assert_eq!(list.entries()[0].serial, "SER");
        assert_eq!(list.entries()[0].product_id, 5678);
    }

    #[test]
    fn test_parse_hex_records() {
        let (list, skipped) = AllowList::parse("SER 0x046d c52b\n", IdFormat::Hex);
        assert!(skipped.is_empty());
        assert_eq!(list.entries()[0], AllowListEntry::new("SER", 0x046d, 0xc52b));
    }

    #[test]
    fn test_find_match_keeps_file_order() {
        let list = AllowList::from_entries(
            vec![
                AllowListEntry::new("AB", 1, 2),
                AllowListEntry::new("A", 1, 2),
            ],
            IdFormat::LegacyDecimal,
        );
        assert_eq!(list.find_match("ABC", 1, 2).unwrap().serial, "AB");
        assert_eq!(list.find_match("AXY", 1, 2).unwrap().serial, "A");
        assert!(list.find_match("B", 1, 2).is_none());
        assert!(list.find_match("AB", 1, 3).is_none());
    }

    #[test]
    fn test_load_missing_file_gives_empty_store() {
        let (store, report) = PolicyStore::load(
            "/nonexistent/usbwarden/allowlist",
            IdFormat::LegacyDecimal,
        );
        assert!(matches!(report, Err(Error::Policy(_))));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_with_list_snapshot() {
        let list = AllowList::from_entries(
            vec![AllowListEntry::new("S", 1, 2)],
            IdFormat::LegacyDecimal,
        );
        let store = PolicyStore::with_list("/unused", list);
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.path(), Path::new("/unused"));
    }
}
