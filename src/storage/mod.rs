//! Splayed and parted tables on disk.
//!
//! A splayed table is a directory where each column is one file: an 8-byte
//! header whose first byte is the column's type tag (the rest reserved, so
//! the payload stays 8-aligned), then the raw little-endian payload. A
//! parted table is a directory of date-named partitions, each a splayed
//! table with the same schema.
//!
//! Reading memory-maps every column file and wraps it as a mapped-mode
//! vector; the maps live in a process-wide registry for the life of the
//! process, matching the lifetime of the values that point into them.
//! Parted columns come back as PARTEDI64 lists of per-partition vectors
//! plus a virtual `Date` column (MAPCOMMON) carrying one date per
//! partition.

use std::fs;
use std::path::Path;

use memmap2::Mmap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::obj::{elem_size, Obj, TAG_DATE, TAG_I64, TAG_PARTEDI64, TAG_SYM, TAG_TABLE};
use crate::symbols;
use crate::{RayError, Result};

const COL_HEADER: usize = 8;

/// Maps stay alive as long as the process; values reference them raw.
static MAPS: Lazy<Mutex<Vec<Mmap>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Write one column file: tag byte, 7 reserved bytes, raw payload.
fn write_column(path: &Path, col: &Obj) -> Result<()> {
    let mut bytes = vec![0u8; COL_HEADER];
    bytes[0] = col.tag() as u8;
    bytes.extend_from_slice(col.payload_bytes());
    fs::write(path, bytes)?;
    Ok(())
}

/// Persist `table` as a splayed directory (test fixture support; the
/// running system consumes this layout, it does not produce it).
pub fn write_splayed(dir: &Path, table: &Obj) -> Result<()> {
    fs::create_dir_all(dir)?;
    let names = table.as_list()[0].as_i64s();
    let cols = table.as_list()[1].as_list();
    for (i, &name) in names.iter().enumerate() {
        let fname = symbols::str_of(name)
            .ok_or_else(|| RayError::InvalidColumnFile(format!("unknown symbol {}", name)))?;
        write_column(&dir.join(fname), &cols[i])?;
    }
    Ok(())
}

fn map_column(path: &Path) -> Result<Obj> {
    let file = fs::File::open(path)?;
    let map = unsafe { Mmap::map(&file)? };
    if map.len() < COL_HEADER {
        return Err(RayError::InvalidColumnFile(path.display().to_string()));
    }
    let tag = map[0] as i8;
    if tag <= 0 {
        return Err(RayError::InvalidColumnFile(path.display().to_string()));
    }
    let esz = elem_size(tag);
    let len = (map.len() - COL_HEADER) / esz;
    let data = unsafe { map.as_ptr().add(COL_HEADER) };
    let obj = Obj::mapped_vector(tag, len, data);
    MAPS.lock().push(map);
    Ok(obj)
}

/// Load a splayed table directory. Columns come back in filename order.
pub fn read_splayed(dir: &Path) -> Result<Obj> {
    if !dir.is_dir() {
        return Err(RayError::NotSplayed(dir.display().to_string()));
    }
    let mut files: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.path())
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(RayError::NotSplayed(dir.display().to_string()));
    }

    let mut names = Obj::vector(TAG_SYM, 0);
    let mut cols = Obj::list(0);
    for path in &files {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RayError::InvalidColumnFile(path.display().to_string()))?;
        let col = map_column(path)?;
        Obj::push_i64(&mut names, symbols::intern(name));
        Obj::push_obj(&mut cols, col);
    }
    debug!(dir = %dir.display(), columns = names.len(), "splayed table mapped");
    Ok(Obj::table(names, cols))
}

/// Days since 2000-01-01 for a `YYYY.MM.DD` partition name.
pub fn parse_date(name: &str) -> Option<i32> {
    let mut parts = name.split('.');
    let y: i64 = parts.next()?.parse().ok()?;
    let m: i64 = parts.next()?.parse().ok()?;
    let d: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return None;
    }
    // Days from civil epoch (Howard Hinnant's algorithm), rebased to 2000.
    let y_adj = if m <= 2 { y - 1 } else { y };
    let era = if y_adj >= 0 { y_adj } else { y_adj - 399 } / 400;
    let yoe = y_adj - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days_from_1970 = era * 146_097 + doe - 719_468;
    Some((days_from_1970 - 10_957) as i32)
}

/// Load a parted table: date-named partition directories sharing a schema.
/// The result's first column is the virtual `Date`.
pub fn read_parted(dir: &Path) -> Result<Obj> {
    if !dir.is_dir() {
        return Err(RayError::NotSplayed(dir.display().to_string()));
    }
    let mut parts: Vec<(i32, std::path::PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            Some((parse_date(&name)?, e.path()))
        })
        .collect();
    parts.sort();
    if parts.is_empty() {
        return Err(RayError::NotSplayed(dir.display().to_string()));
    }

    let tables: Vec<Obj> = parts
        .iter()
        .map(|(_, p)| read_splayed(p))
        .collect::<Result<_>>()?;

    // Schema comes from the first partition.
    let schema = tables[0].as_list()[0].clone();
    let ncols = schema.len();
    let nparts = tables.len();

    let mut dates = Obj::vector(TAG_DATE, nparts);
    let mut counts = Obj::vector(TAG_I64, nparts);
    for (i, (date, _)) in parts.iter().enumerate() {
        dates.as_i32s_mut()[i] = *date;
        let rows = tables[i].as_list()[1]
            .as_list()
            .first()
            .map(|c| c.len())
            .unwrap_or(0);
        counts.as_i64s_mut()[i] = rows as i64;
    }

    let mut names = Obj::vector(TAG_SYM, 0);
    Obj::push_i64(&mut names, symbols::intern("Date"));
    let mut cols = Obj::list(0);
    Obj::push_obj(&mut cols, Obj::map_common(dates, counts));

    for c in 0..ncols {
        let mut per_part = Obj::list(nparts);
        for (p, t) in tables.iter().enumerate() {
            per_part.list_set(p, t.as_list()[1].as_list()[c].clone());
        }
        unsafe { (*per_part.raw()).tag = TAG_PARTEDI64 };
        Obj::push_i64(&mut names, schema.as_i64s()[c]);
        Obj::push_obj(&mut cols, per_part);
    }

    // Parted tables bypass the equal-length column check: logical length is
    // the sum of partitions.
    let mut out = Obj::list(2);
    out.list_set(0, names);
    out.list_set(1, cols);
    unsafe { (*out.raw()).tag = TAG_TABLE };
    Ok(out)
}

/// Per-partition row counts if `table` has parted or virtual columns.
pub fn parted_counts(table: &Obj) -> Option<Vec<i64>> {
    for col in table.as_list()[1].as_list() {
        match col.tag() {
            crate::obj::TAG_MAPCOMMON => {
                return Some(col.as_list()[1].as_i64s().to_vec());
            }
            TAG_PARTEDI64 => {
                return Some(col.as_list().iter().map(|p| p.len() as i64).collect());
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Obj {
        Obj::table(
            Obj::sym_vec_strs(&["price", "qty"]),
            Obj::list_from(vec![
                Obj::f64_vec(&[1.5, 2.5, 3.5]),
                Obj::i64_vec(&[10, 20, 30]),
            ]),
        )
    }

    #[test]
    fn test_splayed_roundtrip() {
        let dir = TempDir::new().unwrap();
        let t = sample();
        write_splayed(dir.path(), &t).unwrap();
        let back = read_splayed(dir.path()).unwrap();
        assert_eq!(back.tag(), TAG_TABLE);
        let cols = back.as_list()[1].as_list();
        // Filename order: price, qty.
        assert!(cols[0].is_mapped());
        assert_eq!(cols[0].as_f64s(), &[1.5, 2.5, 3.5]);
        assert_eq!(cols[1].as_i64s(), &[10, 20, 30]);
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("2000.01.01"), Some(0));
        assert_eq!(parse_date("2000.01.02"), Some(1));
        assert_eq!(parse_date("2001.01.01"), Some(366)); // 2000 is a leap year
        assert_eq!(parse_date("not.a.date"), None);
        assert_eq!(parse_date("2024.13.01"), None);
    }

    #[test]
    fn test_parted_read() {
        let dir = TempDir::new().unwrap();
        for (day, base) in [("2024.01.01", 0i64), ("2024.01.02", 100)] {
            let t = Obj::table(
                Obj::sym_vec_strs(&["v"]),
                Obj::list_from(vec![Obj::i64_vec(&[base + 1, base + 2])]),
            );
            write_splayed(&dir.path().join(day), &t).unwrap();
        }
        let t = read_parted(dir.path()).unwrap();
        let names = t.as_list()[0].as_i64s();
        assert_eq!(symbols::str_of(names[0]).as_deref(), Some("Date"));
        let cols = t.as_list()[1].as_list();
        assert_eq!(cols[0].tag(), crate::obj::TAG_MAPCOMMON);
        assert_eq!(cols[1].tag(), TAG_PARTEDI64);
        assert_eq!(parted_counts(&t), Some(vec![2, 2]));
        assert_eq!(cols[1].as_list()[1].as_i64s(), &[101, 102]);
    }
}
