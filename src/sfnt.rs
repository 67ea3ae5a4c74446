//! # SFNT Table Module
//!
//! Lettura minima delle tabelle di un font TrueType/OpenType (e WOFF non compresso).
//!
//! - `cmap_coverage()`: code point mappati dai subtable `cmap` formato 4 e 12
//! - `strip_dsig()`: riscrive un font sfnt senza la tabella `DSIG`, ricalcolando
//!   directory e `head.checkSumAdjustment`
//!
//! Nessun glifo viene toccato: il subsetting vero resta agli encoder esterni.

use std::collections::BTreeSet;

const SFNT_HEADER: usize = 12;
const SFNT_RECORD: usize = 16;
const WOFF_HEADER: usize = 44;
const WOFF_RECORD: usize = 20;
const CHECKSUM_MAGIC: u32 = 0xB1B0_AFBA;
/// Largest format 12 group accepted
const MAX_GROUP_SPAN: u32 = 0x11_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TableRecord {
    tag: [u8; 4],
    checksum: u32,
    offset: usize,
    length: usize,
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_tag(data: &[u8], offset: usize) -> Option<[u8; 4]> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn is_sfnt(data: &[u8]) -> bool {
    matches!(read_tag(data, 0).as_ref(), Some(&[0, 1, 0, 0]) | Some(b"OTTO") | Some(b"true"))
}

fn sfnt_tables(data: &[u8]) -> Option<Vec<TableRecord>> {
    if !is_sfnt(data) {
        return None;
    }
    let count = read_u16(data, 4)? as usize;
    (0..count)
        .map(|i| {
            let at = SFNT_HEADER + i * SFNT_RECORD;
            Some(TableRecord {
                tag: read_tag(data, at)?,
                checksum: read_u32(data, at + 4)?,
                offset: read_u32(data, at + 8)? as usize,
                length: read_u32(data, at + 12)? as usize,
            })
        })
        .collect()
}

/// Raw bytes of a table, from sfnt or from an uncompressed WOFF entry
fn find_table<'a>(data: &'a [u8], wanted: &[u8; 4]) -> Option<&'a [u8]> {
    if let Some(tables) = sfnt_tables(data) {
        let record = tables.iter().find(|t| &t.tag == wanted)?;
        return data.get(record.offset..record.offset.checked_add(record.length)?);
    }

    if read_tag(data, 0)? != *b"wOFF" {
        return None;
    }
    let count = read_u16(data, 12)? as usize;
    for i in 0..count {
        let at = WOFF_HEADER + i * WOFF_RECORD;
        if read_tag(data, at)? != *wanted {
            continue;
        }
        let offset = read_u32(data, at + 4)? as usize;
        let comp_length = read_u32(data, at + 8)? as usize;
        let orig_length = read_u32(data, at + 12)? as usize;
        if comp_length != orig_length {
            return None;
        }
        return data.get(offset..offset.checked_add(orig_length)?);
    }
    None
}

/// Code points the font maps to a glyph; `None` when the inventory cannot be read
pub fn cmap_coverage(data: &[u8]) -> Option<BTreeSet<u32>> {
    let cmap = find_table(data, b"cmap")?;
    let count = read_u16(cmap, 2)? as usize;
    let mut coverage = BTreeSet::new();
    let mut parsed_any = false;

    for i in 0..count {
        let at = 4 + i * 8;
        let platform = read_u16(cmap, at)?;
        let encoding = read_u16(cmap, at + 2)?;
        let offset = read_u32(cmap, at + 4)? as usize;
        let unicode = platform == 0 || (platform == 3 && (encoding == 1 || encoding == 10));
        if !unicode {
            continue;
        }
        let parsed = match read_u16(cmap, offset) {
            Some(4) => parse_format4(cmap, offset, &mut coverage),
            Some(12) => parse_format12(cmap, offset, &mut coverage),
            _ => None,
        };
        parsed_any |= parsed.is_some();
    }

    parsed_any.then_some(coverage)
}

fn parse_format4(cmap: &[u8], base: usize, coverage: &mut BTreeSet<u32>) -> Option<()> {
    let seg_count = read_u16(cmap, base + 6)? as usize / 2;
    let ends = base + 14;
    let starts = ends + seg_count * 2 + 2;
    let deltas = starts + seg_count * 2;
    let range_offsets = deltas + seg_count * 2;

    for seg in 0..seg_count {
        let end = read_u16(cmap, ends + seg * 2)?;
        let start = read_u16(cmap, starts + seg * 2)?;
        let delta = read_u16(cmap, deltas + seg * 2)?;
        let range_at = range_offsets + seg * 2;
        let range_offset = read_u16(cmap, range_at)? as usize;
        if start > end {
            continue;
        }

        for code in start..=end {
            if code == 0xFFFF {
                break;
            }
            let glyph = if range_offset == 0 {
                code.wrapping_add(delta)
            } else {
                let at = range_at + range_offset + 2 * (code - start) as usize;
                match read_u16(cmap, at)? {
                    0 => 0,
                    g => g.wrapping_add(delta),
                }
            };
            if glyph != 0 {
                coverage.insert(code as u32);
            }
        }
    }
    Some(())
}

fn parse_format12(cmap: &[u8], base: usize, coverage: &mut BTreeSet<u32>) -> Option<()> {
    let groups = read_u32(cmap, base + 12)? as usize;
    for g in 0..groups {
        let at = base + 16 + g * 12;
        let start = read_u32(cmap, at)?;
        let end = read_u32(cmap, at + 4)?;
        if end < start || end - start > MAX_GROUP_SPAN || end > 0x10_FFFF {
            continue;
        }
        coverage.extend(start..=end);
    }
    Some(())
}

/// Sum of big-endian words, zero-padded to a multiple of four
pub fn table_checksum(bytes: &[u8]) -> u32 {
    bytes.chunks(4).fold(0u32, |sum, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum.wrapping_add(u32::from_be_bytes(word))
    })
}

/// Rebuild an sfnt font without its `DSIG` table.
/// Returns `None` for non-sfnt input, a font without `DSIG`, or a malformed directory.
pub fn strip_dsig(data: &[u8]) -> Option<Vec<u8>> {
    let tables = sfnt_tables(data)?;
    if !tables.iter().any(|t| &t.tag == b"DSIG") {
        return None;
    }
    let kept: Vec<TableRecord> = tables.into_iter().filter(|t| &t.tag != b"DSIG").collect();
    let count = kept.len();

    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(data.get(..4)?);
    let entry_selector = if count == 0 { 0 } else { usize::BITS - 1 - count.leading_zeros() };
    let search_range = (1usize << entry_selector) * SFNT_RECORD;
    out.extend_from_slice(&(count as u16).to_be_bytes());
    out.extend_from_slice(&(search_range as u16).to_be_bytes());
    out.extend_from_slice(&(entry_selector as u16).to_be_bytes());
    out.extend_from_slice(&((count * SFNT_RECORD).saturating_sub(search_range) as u16).to_be_bytes());
    out.resize(SFNT_HEADER + count * SFNT_RECORD, 0);

    let mut records = Vec::with_capacity(count);
    let mut head_at = None;
    for table in &kept {
        let bytes = data.get(table.offset..table.offset.checked_add(table.length)?)?;
        let offset = out.len();
        out.extend_from_slice(bytes);
        let mut checksum = table.checksum;
        if &table.tag == b"head" && table.length >= 12 {
            out[offset + 8..offset + 12].fill(0);
            checksum = table_checksum(&out[offset..offset + table.length]);
            head_at = Some(offset);
        }
        while out.len() % 4 != 0 {
            out.push(0);
        }
        records.push(TableRecord {
            tag: table.tag,
            checksum,
            offset,
            length: table.length,
        });
    }

    for (i, record) in records.iter().enumerate() {
        let at = SFNT_HEADER + i * SFNT_RECORD;
        out[at..at + 4].copy_from_slice(&record.tag);
        out[at + 4..at + 8].copy_from_slice(&record.checksum.to_be_bytes());
        out[at + 8..at + 12].copy_from_slice(&(record.offset as u32).to_be_bytes());
        out[at + 12..at + 16].copy_from_slice(&(record.length as u32).to_be_bytes());
    }

    if let Some(head) = head_at {
        let adjustment = CHECKSUM_MAGIC.wrapping_sub(table_checksum(&out));
        out[head + 8..head + 12].copy_from_slice(&adjustment.to_be_bytes());
    }
    Some(out)
}

#[cfg(test)]
pub(crate) mod testing {
    /// cmap with a format 4 subtable for 'A'..='Z' and a format 12 group U+1F600..=U+1F602
    pub fn cmap_table() -> Vec<u8> {
        let mut t = Vec::new();
        t.extend_from_slice(&0u16.to_be_bytes());
        t.extend_from_slice(&2u16.to_be_bytes());
        t.extend_from_slice(&[0, 3, 0, 1]);
        t.extend_from_slice(&20u32.to_be_bytes());
        t.extend_from_slice(&[0, 3, 0, 10]);
        t.extend_from_slice(&52u32.to_be_bytes());

        // format 4, two segments
        for v in [4u16, 32, 0, 4, 4, 1, 0] {
            t.extend_from_slice(&v.to_be_bytes());
        }
        for v in [0x5Au16, 0xFFFF, 0, 0x41, 0xFFFF, 1u16.wrapping_sub(0x41), 1, 0, 0] {
            t.extend_from_slice(&v.to_be_bytes());
        }

        // format 12, one group
        t.extend_from_slice(&12u16.to_be_bytes());
        t.extend_from_slice(&0u16.to_be_bytes());
        for v in [28u32, 0, 1, 0x1F600, 0x1F602, 27] {
            t.extend_from_slice(&v.to_be_bytes());
        }
        t
    }

    pub fn head_table() -> Vec<u8> {
        let mut head = vec![0u8; 54];
        head[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
        head[8..12].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        head[12..16].copy_from_slice(&0x5F0F_3CF5u32.to_be_bytes());
        head
    }

    pub fn build_sfnt(tables: &[(&[u8; 4], Vec<u8>)]) -> Vec<u8> {
        let count = tables.len();
        let mut out = Vec::new();
        out.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        out.extend_from_slice(&(count as u16).to_be_bytes());
        out.extend_from_slice(&[0u8; 6]);
        out.resize(12 + 16 * count, 0);
        for (i, (tag, bytes)) in tables.iter().enumerate() {
            let offset = out.len();
            out.extend_from_slice(bytes);
            while out.len() % 4 != 0 {
                out.push(0);
            }
            let at = 12 + 16 * i;
            out[at..at + 4].copy_from_slice(*tag);
            out[at + 4..at + 8].copy_from_slice(&super::table_checksum(bytes).to_be_bytes());
            out[at + 8..at + 12].copy_from_slice(&(offset as u32).to_be_bytes());
            out[at + 12..at + 16].copy_from_slice(&(bytes.len() as u32).to_be_bytes());
        }
        out
    }

    /// Font with cmap, a large glyf stand-in, head and an 8 KB DSIG
    pub fn sample_font(glyf_len: usize) -> Vec<u8> {
        build_sfnt(&[
            (b"DSIG", vec![0x11; 8 * 1024]),
            (b"cmap", cmap_table()),
            (b"glyf", (0..glyf_len).map(|i| (i % 251) as u8).collect()),
            (b"head", head_table()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_cmap_coverage_formats_4_and_12() {
        let font = sample_font(1_000);
        let coverage = cmap_coverage(&font).unwrap();
        assert_eq!(coverage.len(), 29);
        assert!(coverage.contains(&('A' as u32)));
        assert!(coverage.contains(&('Z' as u32)));
        assert!(!coverage.contains(&('a' as u32)));
        assert!(coverage.contains(&0x1F601));
    }

    #[test]
    fn test_cmap_coverage_unknown_inputs() {
        assert!(cmap_coverage(b"not a font at all").is_none());
        let no_cmap = build_sfnt(&[(b"head", head_table())]);
        assert!(cmap_coverage(&no_cmap).is_none());
    }

    #[test]
    fn test_cmap_coverage_uncompressed_woff() {
        let cmap = cmap_table();
        let mut woff = Vec::new();
        woff.extend_from_slice(b"wOFF");
        woff.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        woff.extend_from_slice(&0u32.to_be_bytes());
        woff.extend_from_slice(&1u16.to_be_bytes());
        woff.resize(WOFF_HEADER, 0);
        let offset = (WOFF_HEADER + WOFF_RECORD) as u32;
        woff.extend_from_slice(b"cmap");
        woff.extend_from_slice(&offset.to_be_bytes());
        woff.extend_from_slice(&(cmap.len() as u32).to_be_bytes());
        woff.extend_from_slice(&(cmap.len() as u32).to_be_bytes());
        woff.extend_from_slice(&table_checksum(&cmap).to_be_bytes());
        woff.extend_from_slice(&cmap);

        assert_eq!(cmap_coverage(&woff).unwrap().len(), 29);

        // compressed entry: inventory unknown
        let at = WOFF_HEADER + 8;
        woff[at..at + 4].copy_from_slice(&10u32.to_be_bytes());
        assert!(cmap_coverage(&woff).is_none());
    }

    #[test]
    fn test_strip_dsig() {
        let font = sample_font(2_000);
        let stripped = strip_dsig(&font).unwrap();
        assert!(stripped.len() < font.len());

        let tables = sfnt_tables(&stripped).unwrap();
        let tags: Vec<&[u8; 4]> = tables.iter().map(|t| &t.tag).collect();
        assert_eq!(tags, vec![b"cmap", b"glyf", b"head"]);
        assert_eq!(read_u16(&stripped, 4), Some(3));
        assert_eq!(read_u16(&stripped, 6), Some(32));
        assert_eq!(read_u16(&stripped, 8), Some(1));
        assert_eq!(read_u16(&stripped, 10), Some(16));

        assert_eq!(table_checksum(&stripped), CHECKSUM_MAGIC);
        assert_eq!(cmap_coverage(&stripped), cmap_coverage(&font));

        let glyf = tables.iter().find(|t| &t.tag == b"glyf").unwrap();
        let original = find_table(&font, b"glyf").unwrap();
        assert_eq!(&stripped[glyf.offset..glyf.offset + glyf.length], original);
    }

    #[test]
    fn test_strip_dsig_noop_cases() {
        let without = build_sfnt(&[(b"cmap", cmap_table()), (b"head", head_table())]);
        assert!(strip_dsig(&without).is_none());
        assert!(strip_dsig(b"wOFF....").is_none());
    }
}
