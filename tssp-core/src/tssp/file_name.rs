//! TSSP file identity and naming
//!
//! A sealed file is named `<seq>-<level>-<merge><extent>.tssp`, every field in lower-case
//! hex. The sequence takes 1 to 16 digits and is rendered with at least 8; level, merge
//! and extent take exactly 4 digits each. While being written the file carries an extra
//! `.init` suffix. Whether a file is ordered is not part of the name: out-of-order files
//! live in the [`OUT_OF_ORDER_DIR`] subdirectory of their measurement.

use crate::{Result, TsspError};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Suffix of a sealed file
pub const TSSP_FILE_SUFFIX: &str = ".tssp";

/// Suffix appended while a file is still being written
pub const TMP_FILE_SUFFIX: &str = ".init";

/// Subdirectory of a measurement holding out-of-order files
pub const OUT_OF_ORDER_DIR: &str = "out-of-order";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([0-9a-f]{1,16})-([0-9a-f]{4})-([0-9a-f]{4})([0-9a-f]{4})\.tssp(\.init)?$")
            .expect("file name pattern compiles")
    })
}

/// Identity of one TSSP file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TsspFileName {
    pub seq: u64,
    pub level: u16,
    pub merge: u16,
    pub extent: u16,
    pub order: bool,
}

impl TsspFileName {
    pub fn new(seq: u64, level: u16, merge: u16, extent: u16, order: bool) -> Self {
        Self {
            seq,
            level,
            merge,
            extent,
            order,
        }
    }

    /// Parse the final component of `path`.
    ///
    /// The result is marked ordered; callers loading an out-of-order directory flip it
    /// with [`set_order`](Self::set_order).
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let base = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TsspError::InvalidFileName(path.display().to_string()))?;
        let caps = name_pattern()
            .captures(base)
            .ok_or_else(|| TsspError::InvalidFileName(base.to_string()))?;

        let hex = |i: usize| -> Result<u64> {
            u64::from_str_radix(&caps[i], 16)
                .map_err(|e| TsspError::InvalidFileName(format!("{}: {}", base, e)))
        };
        Ok(Self {
            seq: hex(1)?,
            level: hex(2)? as u16,
            merge: hex(3)? as u16,
            extent: hex(4)? as u16,
            order: true,
        })
    }

    /// True when `path` names a file that is still being written
    pub fn is_tmp(path: impl AsRef<Path>) -> bool {
        path.as_ref()
            .to_str()
            .map_or(false, |p| p.ends_with(TMP_FILE_SUFFIX))
    }

    pub fn set_order(&mut self, order: bool) {
        self.order = order;
    }

    /// `<canonical>.tssp`
    pub fn file_name(&self) -> String {
        format!("{}{}", self, TSSP_FILE_SUFFIX)
    }

    /// `<canonical>.tssp.init`
    pub fn tmp_file_name(&self) -> String {
        format!("{}{}{}", self, TSSP_FILE_SUFFIX, TMP_FILE_SUFFIX)
    }

    /// Full path of this file under the measurement directory `mst_dir`
    pub fn path(&self, mst_dir: &Path, tmp: bool) -> PathBuf {
        let dir = if self.order {
            mst_dir.to_path_buf()
        } else {
            mst_dir.join(OUT_OF_ORDER_DIR)
        };
        if tmp {
            dir.join(self.tmp_file_name())
        } else {
            dir.join(self.file_name())
        }
    }

    /// The same logical file, one extent further
    pub fn next_extent(&self) -> Self {
        Self {
            extent: self.extent + 1,
            ..*self
        }
    }

    /// True when both names belong to the same logical file
    pub fn same_logical_file(&self, other: &TsspFileName) -> bool {
        self.seq == other.seq
    }
}

impl Ord for TsspFileName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq
            .cmp(&other.seq)
            .then(self.extent.cmp(&other.extent))
            .then(self.level.cmp(&other.level))
            .then(self.merge.cmp(&other.merge))
            .then(self.order.cmp(&other.order))
    }
}

impl PartialOrd for TsspFileName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TsspFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}{:04x}",
            self.seq, self.level, self.merge, self.extent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_name() {
        // (name, seq, level, merge, extent, canonical)
        let valid = [
            ("00000001-0001-00010001.tssp", 1, 1, 1, 1, "00000001-0001-00010001"),
            ("100000001-0001-00010001.tssp", 0x1_0000_0001, 1, 1, 1, "100000001-0001-00010001"),
            ("000100001-0001-00010001.tssp", 0x10_0001, 1, 1, 1, "00100001-0001-00010001"),
            ("0000000100000001-0001-00010001.tssp", 0x1_0000_0001, 1, 1, 1, "100000001-0001-00010001"),
            ("0000000100000001-0001-00010001.tssp.init", 0x1_0000_0001, 1, 1, 1, "100000001-0001-00010001"),
            ("00000001-0001-00010001.tssp.init", 1, 1, 1, 1, "00000001-0001-00010001"),
            ("0000001a-0002-000b000f.tssp", 26, 2, 11, 15, "0000001a-0002-000b000f"),
            ("0000001a-0012-000b000f.tssp.init", 26, 18, 11, 15, "0000001a-0012-000b000f"),
        ];
        for (name, seq, level, merge, extent, canonical) in valid {
            let path = Path::new("/data/test/").join(name);
            let parsed = TsspFileName::parse(&path).unwrap_or_else(|e| panic!("{}: {}", name, e));
            assert_eq!(parsed.seq, seq, "{}", name);
            assert_eq!(parsed.level, level, "{}", name);
            assert_eq!(parsed.merge, merge, "{}", name);
            assert_eq!(parsed.extent, extent, "{}", name);
            assert_eq!(parsed.to_string(), canonical);
        }

        let invalid = [
            "00000000000000001-0001-00010001.tssp",
            "0000001a-0002-000b000f.tssx",
            "0000001a-0002-000b000f.tssp.ini",
            "00000001-0001-00010001.tssp.initt",
            "00000001-001-00010001.tssp",
            "00000001-0001-0001001.tssp",
            "0000000g-0001-00010001.tssp",
            "-0001-00010001.tssp",
        ];
        for name in invalid {
            let err = TsspFileName::parse(Path::new("/data/test/").join(name)).unwrap_err();
            assert!(err.is_corruption(), "{}", name);
        }
    }

    #[test]
    fn test_format_then_parse() {
        for (seq, level, merge, extent) in [(0, 0, 0, 0), (u64::MAX, 7, 0xffff, 3), (0xabc, 2, 1, 0)] {
            let name = TsspFileName::new(seq, level, merge, extent, true);
            assert_eq!(TsspFileName::parse(name.file_name()).unwrap(), name);
            assert_eq!(TsspFileName::parse(name.tmp_file_name()).unwrap(), name);
        }
    }

    #[test]
    fn test_ordering_and_paths() {
        let a = TsspFileName::new(9, 2, 0, 0, true);
        let b = TsspFileName::new(9, 2, 0, 1, true);
        let c = TsspFileName::new(0x11, 2, 0, 0, true);
        assert!(a < b && b < c);
        assert!(a.same_logical_file(&b));
        assert_eq!(a.next_extent(), b);

        let mut unordered = a;
        unordered.set_order(false);
        let p = unordered.path(Path::new("/shard/mst"), true);
        assert_eq!(p, Path::new("/shard/mst/out-of-order/00000009-0002-00000000.tssp.init"));
        assert!(TsspFileName::is_tmp(&p));
        assert!(!TsspFileName::is_tmp(a.path(Path::new("/shard/mst"), false)));
    }
}
