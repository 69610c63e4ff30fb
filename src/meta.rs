// ---------------- TIFF meta (minimal first-IFD reader: resolution) ----------------

use anyhow::{bail, Context, Result};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};
use tiff::tags::{ResolutionUnit, Tag};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rational {
    pub n: u32,
    pub d: u32,
}

impl Rational {
    fn value(self) -> f64 {
        self.n as f64 / self.d as f64
    }

    /// Pixels-per-unit after `level` halvings.
    pub fn at_level(self, level: u32) -> Rational {
        Rational {
            n: self.n,
            d: self.d.saturating_mul(1u32 << level.min(31)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub x: Rational,
    pub y: Rational,
    pub unit: ResolutionUnit,
}

impl Resolution {
    /// Pixel size in micrometres, if the unit is a physical one.
    pub fn pixel_size_um(&self) -> Option<(f64, f64)> {
        let um_per_unit = match self.unit {
            ResolutionUnit::Inch => 25_400.0,
            ResolutionUnit::Centimeter => 10_000.0,
            _ => return None,
        };
        let (x, y) = (self.x.value(), self.y.value());
        if x <= 0.0 || y <= 0.0 {
            return None;
        }
        Some((um_per_unit / x, um_per_unit / y))
    }
}

fn read_exact_at(f: &mut File, off: u64, buf: &mut [u8]) -> Result<()> {
    f.seek(SeekFrom::Start(off))
        .with_context(|| format!("Seek @ {off}"))?;
    f.read_exact(buf)
        .with_context(|| format!("Read {} bytes @ {off}", buf.len()))?;
    Ok(())
}

fn read_u16_endian(b: [u8; 2], le: bool) -> u16 {
    if le { u16::from_le_bytes(b) } else { u16::from_be_bytes(b) }
}
fn read_u32_endian(b: [u8; 4], le: bool) -> u32 {
    if le { u32::from_le_bytes(b) } else { u32::from_be_bytes(b) }
}
fn read_u64_endian(b: [u8; 8], le: bool) -> u64 {
    if le { u64::from_le_bytes(b) } else { u64::from_be_bytes(b) }
}

fn type_size(t: u16) -> Option<u64> {
    match t {
        1 => Some(1),  // BYTE
        3 => Some(2),  // SHORT
        4 => Some(4),  // LONG
        5 => Some(8),  // RATIONAL (2x u32)
        7 => Some(1),  // UNDEFINED
        16 => Some(8), // LONG8 (BigTIFF)
        _ => None,
    }
}

/// Layout differences between classic TIFF and BigTIFF directories.
struct IfdLayout {
    count_len: usize,
    entry_len: usize,
    /// Width of the count field and of the inline value slot.
    word: usize,
}

const CLASSIC: IfdLayout = IfdLayout { count_len: 2, entry_len: 12, word: 4 };
const BIG: IfdLayout = IfdLayout { count_len: 8, entry_len: 20, word: 8 };

/// Reads XResolution (282), YResolution (283) and ResolutionUnit (296) from
/// the first IFD of a TIFF or BigTIFF. `Ok(None)` when the tags are absent.
pub fn read_resolution(path: &Path) -> Result<Option<Resolution>> {
    let mut f = File::open(path).with_context(|| format!("Open TIFF: {}", path.display()))?;

    let mut head = [0u8; 16];
    read_exact_at(&mut f, 0, &mut head[..8])?;

    let le = match &head[0..2] {
        b"II" => true,
        b"MM" => false,
        _ => bail!("Not a TIFF (bad endian marker)"),
    };

    let magic = read_u16_endian([head[2], head[3]], le);
    let (layout, ifd0_off) = match magic {
        42 => (&CLASSIC, read_u32_endian([head[4], head[5], head[6], head[7]], le) as u64),
        43 => {
            read_exact_at(&mut f, 8, &mut head[8..16])?;
            let off_size = read_u16_endian([head[4], head[5]], le);
            if off_size != 8 {
                bail!("Unsupported BigTIFF offset size: {}", off_size);
            }
            let mut off = [0u8; 8];
            off.copy_from_slice(&head[8..16]);
            (&BIG, read_u64_endian(off, le))
        }
        _ => bail!("Unknown TIFF magic: {}", magic),
    };

    // Reads a `word`-sized unsigned integer starting at b[0].
    let word = |b: &[u8]| -> u64 {
        if layout.word == 4 {
            read_u32_endian([b[0], b[1], b[2], b[3]], le) as u64
        } else {
            read_u64_endian([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]], le)
        }
    };

    let mut nbuf = [0u8; 8];
    read_exact_at(&mut f, ifd0_off, &mut nbuf[..layout.count_len])?;
    let n = if layout.count_len == 2 {
        read_u16_endian([nbuf[0], nbuf[1]], le) as u64
    } else {
        read_u64_endian(nbuf, le)
    };

    let xres_tag = Tag::XResolution.to_u16();
    let yres_tag = Tag::YResolution.to_u16();
    let unit_tag = Tag::ResolutionUnit.to_u16();

    let mut x_res = None;
    let mut y_res = None;
    let mut unit = None;

    let mut ent_off = ifd0_off + layout.count_len as u64;
    let mut ent = [0u8; 20];
    for _ in 0..n {
        let ent = &mut ent[..layout.entry_len];
        read_exact_at(&mut f, ent_off, ent)?;
        ent_off += layout.entry_len as u64;

        let tag = read_u16_endian([ent[0], ent[1]], le);
        if tag != xres_tag && tag != yres_tag && tag != unit_tag {
            continue;
        }
        let ty = read_u16_endian([ent[2], ent[3]], le);
        let count = word(&ent[4..]);
        let value_at = 4 + layout.word;

        let tsz = match type_size(ty) {
            Some(s) => s,
            None => continue,
        };
        let bytes_len = count.saturating_mul(tsz);
        if bytes_len == 0 {
            continue;
        }
        let b = if bytes_len <= layout.word as u64 {
            ent[value_at..value_at + bytes_len as usize].to_vec()
        } else {
            let mut v = vec![0u8; bytes_len as usize];
            read_exact_at(&mut f, word(&ent[value_at..]), &mut v)?;
            v
        };

        if tag == unit_tag {
            if b.len() >= 2 {
                unit = Some(match read_u16_endian([b[0], b[1]], le) {
                    2 => ResolutionUnit::Inch,
                    3 => ResolutionUnit::Centimeter,
                    _ => ResolutionUnit::None,
                });
            }
        } else if b.len() >= 8 {
            let n = read_u32_endian([b[0], b[1], b[2], b[3]], le);
            let d = read_u32_endian([b[4], b[5], b[6], b[7]], le);
            if d != 0 {
                let r = Some(Rational { n, d });
                if tag == xres_tag { x_res = r } else { y_res = r }
            }
        }
    }

    // A lone X or Y resolution is mirrored to the other axis.
    let (x, y) = match (x_res, y_res) {
        (Some(x), Some(y)) => (x, y),
        (Some(x), None) => (x, x),
        (None, Some(y)) => (y, y),
        (None, None) => return Ok(None),
    };

    Ok(Some(Resolution {
        x,
        y,
        // TIFF's default unit is inch.
        unit: unit.unwrap_or(ResolutionUnit::Inch),
    }))
}
