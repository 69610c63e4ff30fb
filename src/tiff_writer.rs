// ---------------- Tiled BigTIFF writer ----------------
//
// `tiff::encoder` only writes stripped images into the main IFD chain, so
// tiles and SubIFDs are laid out here by hand. Compression itself reuses the
// `tiff` crate's algorithms.

use std::{
    collections::BTreeMap,
    io::{self, Seek, SeekFrom, Write},
};

use anyhow::{Context, Result};
use clap::ValueEnum;
use rayon::prelude::*;
use tiff::encoder::compression::{CompressionAlgorithm, Deflate, Lzw, Packbits};
use tiff::tags::{CompressionMethod, PhotometricInterpretation, PlanarConfiguration, Tag, Type};
use tracing::debug;

use crate::meta::Rational;
use crate::pixel::{with_plane, Channel, Plane, Sample};

pub const TAG_SUB_IFDS: Tag = Tag::Unknown(330);

const PREDICTOR_NONE: u16 = 1;
const PREDICTOR_HORIZONTAL: u16 = 2;

pub const SUBFILE_FULL: u32 = 0;
pub const SUBFILE_REDUCED: u32 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Compression {
    None,
    Lzw,
    Deflate,
    Packbits,
}

impl Compression {
    fn method(self) -> CompressionMethod {
        match self {
            Compression::None => CompressionMethod::None,
            Compression::Lzw => CompressionMethod::LZW,
            Compression::Deflate => CompressionMethod::Deflate,
            Compression::Packbits => CompressionMethod::PackBits,
        }
    }

    pub fn compress(self, raw: Vec<u8>) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(raw.len() / 2);
        match self {
            Compression::None => return Ok(raw),
            Compression::Lzw => Lzw::default().write_to(&mut out, &raw)?,
            Compression::Deflate => Deflate::default().write_to(&mut out, &raw)?,
            Compression::Packbits => Packbits::default().write_to(&mut out, &raw)?,
        };
        Ok(out)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum PredictorMode {
    None,
    Horizontal,
}

#[derive(Clone, Debug)]
pub struct TileOptions {
    pub tile: u32,
    pub compression: Compression,
    pub predictor: PredictorMode,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    Short(Vec<u16>),
    Long(Vec<u32>),
    Long8(Vec<u64>),
    Ascii(String),
    Rational(Vec<Rational>),
}

impl Field {
    fn type_code(&self) -> u16 {
        match self {
            Field::Short(_) => Type::SHORT.to_u16(),
            Field::Long(_) => Type::LONG.to_u16(),
            Field::Long8(_) => Type::LONG8.to_u16(),
            Field::Ascii(_) => Type::ASCII.to_u16(),
            Field::Rational(_) => Type::RATIONAL.to_u16(),
        }
    }

    fn count(&self) -> u64 {
        match self {
            Field::Short(v) => v.len() as u64,
            Field::Long(v) => v.len() as u64,
            Field::Long8(v) => v.len() as u64,
            // NUL terminator included
            Field::Ascii(s) => s.len() as u64 + 1,
            Field::Rational(v) => v.len() as u64,
        }
    }

    fn bytes(&self) -> Vec<u8> {
        let mut b = Vec::new();
        match self {
            Field::Short(v) => v.iter().for_each(|x| b.extend_from_slice(&x.to_le_bytes())),
            Field::Long(v) => v.iter().for_each(|x| b.extend_from_slice(&x.to_le_bytes())),
            Field::Long8(v) => v.iter().for_each(|x| b.extend_from_slice(&x.to_le_bytes())),
            Field::Ascii(s) => {
                b.extend_from_slice(s.as_bytes());
                b.push(0);
            }
            Field::Rational(v) => v.iter().for_each(|r| {
                b.extend_from_slice(&r.n.to_le_bytes());
                b.extend_from_slice(&r.d.to_le_bytes());
            }),
        }
        b
    }
}

fn padded(len: u64) -> u64 {
    len + (len & 1)
}

/// One BigTIFF directory. Entries are kept sorted by tag.
#[derive(Clone, Debug, Default)]
pub struct Ifd {
    fields: BTreeMap<u16, Field>,
}

impl Ifd {
    pub fn set(&mut self, tag: Tag, field: Field) {
        self.fields.insert(tag.to_u16(), field);
    }

    pub fn get(&self, tag: Tag) -> Option<&Field> {
        self.fields.get(&tag.to_u16())
    }

    /// Entry table plus the out-of-line values that follow it.
    pub fn encoded_len(&self) -> u64 {
        let table = 8 + 20 * self.fields.len() as u64 + 8;
        let overflow: u64 = self
            .fields
            .values()
            .map(|f| f.bytes().len() as u64)
            .filter(|&len| len > 8)
            .map(padded)
            .sum();
        table + overflow
    }
}

pub struct BigTiffWriter<W: Write + Seek> {
    out: W,
    pos: u64,
}

impl<W: Write + Seek> BigTiffWriter<W> {
    /// Writes a little-endian BigTIFF header whose first-IFD offset is
    /// filled in by `finish`.
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(b"II")?;
        out.write_all(&43u16.to_le_bytes())?;
        out.write_all(&8u16.to_le_bytes())?;
        out.write_all(&0u16.to_le_bytes())?;
        out.write_all(&0u64.to_le_bytes())?;
        Ok(Self { out, pos: 16 })
    }

    fn align(&mut self) -> io::Result<()> {
        if self.pos & 1 == 1 {
            self.out.write_all(&[0])?;
            self.pos += 1;
        }
        Ok(())
    }

    /// Appends raw bytes at a word boundary and returns their offset.
    pub fn write_block(&mut self, bytes: &[u8]) -> io::Result<u64> {
        self.align()?;
        let at = self.pos;
        self.out.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(at)
    }

    /// Writes `ifd` followed by its out-of-line values; returns its offset.
    pub fn write_ifd(&mut self, ifd: &Ifd, next: u64) -> io::Result<u64> {
        self.align()?;
        let at = self.pos;

        let mut table = Vec::with_capacity(16 + 20 * ifd.fields.len());
        let mut overflow = Vec::new();
        let overflow_at = at + 8 + 20 * ifd.fields.len() as u64 + 8;

        table.extend_from_slice(&(ifd.fields.len() as u64).to_le_bytes());
        for (&tag, field) in &ifd.fields {
            let bytes = field.bytes();
            table.extend_from_slice(&tag.to_le_bytes());
            table.extend_from_slice(&field.type_code().to_le_bytes());
            table.extend_from_slice(&field.count().to_le_bytes());
            if bytes.len() <= 8 {
                let mut inline = [0u8; 8];
                inline[..bytes.len()].copy_from_slice(&bytes);
                table.extend_from_slice(&inline);
            } else {
                let off = overflow_at + overflow.len() as u64;
                table.extend_from_slice(&off.to_le_bytes());
                overflow.extend_from_slice(&bytes);
                if bytes.len() & 1 == 1 {
                    overflow.push(0);
                }
            }
        }
        table.extend_from_slice(&next.to_le_bytes());

        self.out.write_all(&table)?;
        self.out.write_all(&overflow)?;
        self.pos += (table.len() + overflow.len()) as u64;
        Ok(at)
    }

    /// Writes `ifds` back to back as a linked chain; returns the first offset.
    pub fn write_chain(&mut self, ifds: &[Ifd]) -> io::Result<u64> {
        self.align()?;
        let first = self.pos;
        let mut at = first;
        for (i, ifd) in ifds.iter().enumerate() {
            let next = if i + 1 < ifds.len() { at + ifd.encoded_len() } else { 0 };
            let written = self.write_ifd(ifd, next)?;
            debug_assert_eq!(written, at);
            at = next;
        }
        Ok(first)
    }

    pub fn finish(mut self, first_ifd: u64) -> io::Result<W> {
        self.out.seek(SeekFrom::Start(8))?;
        self.out.write_all(&first_ifd.to_le_bytes())?;
        self.out.seek(SeekFrom::End(0))?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Samples of tile (`tx`, `ty`), zero-padded past the image edge, as
/// little-endian bytes.
fn tile_bytes<T: Sample>(plane: &Plane<T>, tx: u32, ty: u32, tile: u32, predict: bool) -> Vec<u8> {
    let (w, h) = plane.dimensions();
    let (w, h, tile) = (w as usize, h as usize, tile as usize);
    let (x0, y0) = (tx as usize * tile, ty as usize * tile);
    let raw = plane.as_raw();

    let mut samples = vec![T::narrow(0.0); tile * tile];
    let cols = tile.min(w - x0);
    for r in 0..tile.min(h - y0) {
        let src = (y0 + r) * w + x0;
        samples[r * tile..r * tile + cols].copy_from_slice(&raw[src..src + cols]);
    }

    if predict {
        for row in samples.chunks_exact_mut(tile) {
            for i in (1..tile).rev() {
                row[i] = row[i].wrapping_diff(row[i - 1]);
            }
        }
    }

    let mut bytes = Vec::with_capacity(tile * tile * std::mem::size_of::<T>());
    for s in samples {
        s.put_le(&mut bytes);
    }
    bytes
}

impl Channel {
    fn tile_bytes(&self, tx: u32, ty: u32, tile: u32, predict: bool) -> Vec<u8> {
        with_plane!(self, p => tile_bytes(p, tx, ty, tile, predict))
    }
}

/// Compresses and writes every tile of `channel`, returning the directory
/// that describes them. Tags beyond the image structure are the caller's.
pub fn write_tiled<W: Write + Seek>(
    out: &mut BigTiffWriter<W>,
    channel: &Channel,
    opts: &TileOptions,
    subfile: u32,
) -> Result<Ifd> {
    let (width, height) = channel.dimensions();
    let pixel_type = channel.pixel_type();
    let tile = opts.tile;
    let across = width.div_ceil(tile);
    let down = height.div_ceil(tile);

    let predict = opts.predictor == PredictorMode::Horizontal
        && opts.compression != Compression::None
        && !pixel_type.is_float();

    let tiles: Vec<Vec<u8>> = (0..across * down)
        .into_par_iter()
        .map(|i| {
            opts.compression
                .compress(channel.tile_bytes(i % across, i / across, tile, predict))
        })
        .collect::<io::Result<Vec<Vec<u8>>>>()
        .context("compress tiles")?;

    let mut offsets = Vec::with_capacity(tiles.len());
    let mut counts = Vec::with_capacity(tiles.len());
    for t in &tiles {
        offsets.push(out.write_block(t).context("write tile")?);
        counts.push(t.len() as u64);
    }
    debug!(width, height, tiles = tiles.len(), bytes = counts.iter().sum::<u64>(), "wrote level");

    let mut ifd = Ifd::default();
    ifd.set(Tag::NewSubfileType, Field::Long(vec![subfile]));
    ifd.set(Tag::ImageWidth, Field::Long(vec![width]));
    ifd.set(Tag::ImageLength, Field::Long(vec![height]));
    ifd.set(Tag::BitsPerSample, Field::Short(vec![pixel_type.bits()]));
    ifd.set(Tag::Compression, Field::Short(vec![opts.compression.method().to_u16()]));
    ifd.set(
        Tag::PhotometricInterpretation,
        Field::Short(vec![PhotometricInterpretation::BlackIsZero.to_u16()]),
    );
    ifd.set(Tag::SamplesPerPixel, Field::Short(vec![1]));
    ifd.set(
        Tag::PlanarConfiguration,
        Field::Short(vec![PlanarConfiguration::Chunky.to_u16()]),
    );
    ifd.set(
        Tag::Predictor,
        Field::Short(vec![if predict { PREDICTOR_HORIZONTAL } else { PREDICTOR_NONE }]),
    );
    ifd.set(Tag::TileWidth, Field::Long(vec![tile]));
    ifd.set(Tag::TileLength, Field::Long(vec![tile]));
    ifd.set(Tag::TileOffsets, Field::Long8(offsets));
    ifd.set(Tag::TileByteCounts, Field::Long8(counts));
    ifd.set(Tag::SampleFormat, Field::Short(vec![pixel_type.sample_format().to_u16()]));
    Ok(ifd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::plane_from_raw;
    use std::io::Cursor;
    use tiff::decoder::{Decoder, DecodingResult};

    fn encode(channel: &Channel, opts: &TileOptions) -> Vec<u8> {
        let mut out = BigTiffWriter::new(Cursor::new(Vec::new())).unwrap();
        let ifd = write_tiled(&mut out, channel, opts, SUBFILE_FULL).unwrap();
        let first = out.write_chain(&[ifd]).unwrap();
        out.finish(first).unwrap().into_inner()
    }

    fn opts(compression: Compression, predictor: PredictorMode) -> TileOptions {
        TileOptions { tile: 16, compression, predictor }
    }

    #[test]
    fn header_is_little_endian_bigtiff() {
        let plane: Plane<u8> = plane_from_raw(3, 2, vec![1, 2, 3, 4, 5, 6]);
        let bytes = encode(&plane.into(), &opts(Compression::None, PredictorMode::None));
        assert_eq!(&bytes[0..8], &[b'I', b'I', 43, 0, 8, 0, 0, 0]);
        let first = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        assert!(first >= 16 && first % 2 == 0);
    }

    #[test]
    fn lzw_with_predictor_round_trips_through_the_tiff_decoder() {
        let data: Vec<u16> = (0..20 * 18).map(|i| (i * 37 % 4096) as u16).collect();
        let plane: Plane<u16> = plane_from_raw(20, 18, data.clone());
        let bytes = encode(&plane.into(), &opts(Compression::Lzw, PredictorMode::Horizontal));

        let mut dec = Decoder::new(Cursor::new(bytes)).unwrap();
        assert_eq!(dec.dimensions().unwrap(), (20, 18));
        assert_eq!(dec.get_tag_u32(Tag::Predictor).unwrap(), 2);
        match dec.read_image().unwrap() {
            DecodingResult::U16(v) => assert_eq!(v, data),
            _ => panic!("expected 16-bit samples"),
        }
    }

    #[test]
    fn float_planes_skip_the_predictor() {
        let data: Vec<f32> = (0..17 * 5).map(|i| i as f32 / 100.0).collect();
        let plane: Plane<f32> = plane_from_raw(17, 5, data.clone());
        let bytes = encode(&plane.into(), &opts(Compression::Deflate, PredictorMode::Horizontal));

        let mut dec = Decoder::new(Cursor::new(bytes)).unwrap();
        assert_eq!(dec.get_tag_u32(Tag::Predictor).unwrap(), 1);
        assert_eq!(dec.get_tag_u32(Tag::SampleFormat).unwrap(), 3);
        match dec.read_image().unwrap() {
            DecodingResult::F32(v) => assert_eq!(v, data),
            _ => panic!("expected float samples"),
        }
    }

    #[test]
    fn packbits_signed_samples() {
        let data: Vec<i16> = (0..16 * 3).map(|i| (i as i16 - 20) * 100).collect();
        let plane: Plane<i16> = plane_from_raw(16, 3, data.clone());
        let bytes = encode(&plane.into(), &opts(Compression::Packbits, PredictorMode::None));

        let mut dec = Decoder::new(Cursor::new(bytes)).unwrap();
        match dec.read_image().unwrap() {
            DecodingResult::I16(v) => assert_eq!(v, data),
            _ => panic!("expected signed 16-bit samples"),
        }
    }

    #[test]
    fn chain_links_directories_and_long_values_go_out_of_line() {
        let plane: Plane<u8> = plane_from_raw(2, 2, vec![9; 4]);
        let channel: Channel = plane.into();
        let o = opts(Compression::None, PredictorMode::None);

        let mut out = BigTiffWriter::new(Cursor::new(Vec::new())).unwrap();
        let mut first = write_tiled(&mut out, &channel, &o, SUBFILE_FULL).unwrap();
        first.set(Tag::ImageDescription, Field::Ascii("a description longer than eight bytes".into()));
        let second = write_tiled(&mut out, &channel, &o, SUBFILE_FULL).unwrap();
        assert!(first.encoded_len() > second.encoded_len());

        let start = out.write_chain(&[first, second]).unwrap();
        let bytes = out.finish(start).unwrap().into_inner();

        let mut dec = Decoder::new(Cursor::new(bytes)).unwrap();
        assert_eq!(
            dec.get_tag_ascii_string(Tag::ImageDescription).unwrap(),
            "a description longer than eight bytes"
        );
        assert!(dec.more_images());
        dec.next_image().unwrap();
        assert!(!dec.more_images());
        match dec.read_image().unwrap() {
            DecodingResult::U8(v) => assert_eq!(v, vec![9; 4]),
            _ => panic!("expected 8-bit samples"),
        }
    }

    #[test]
    fn encoded_len_matches_written_bytes() {
        let mut ifd = Ifd::default();
        ifd.set(Tag::ImageWidth, Field::Long(vec![5]));
        ifd.set(Tag::Software, Field::Ascii("odd".into()));
        ifd.set(TAG_SUB_IFDS, Field::Long8(vec![1, 2, 3]));
        ifd.set(Tag::XResolution, Field::Rational(vec![Rational { n: 3, d: 1 }]));

        let mut out = BigTiffWriter::new(Cursor::new(Vec::new())).unwrap();
        let at = out.write_ifd(&ifd, 0).unwrap();
        let bytes = out.finish(at).unwrap().into_inner();
        assert_eq!(bytes.len() as u64 - at, ifd.encoded_len());
    }
}
