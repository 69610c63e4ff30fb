use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::{fs::File, io::BufReader, path::Path};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::{PhotometricInterpretation, Tag};
use tracing::debug;

use crate::error::MergeError;
use crate::pixel::{plane_from_raw, Channel, Sample};

/// Per-pixel maximum over `bands` interleaved samples.
pub fn max_project<T: Sample>(samples: &[T], bands: usize) -> Vec<T> {
    samples
        .par_chunks_exact(bands)
        .map(|px| px[1..].iter().fold(px[0], |m, &v| if v > m { v } else { m }))
        .collect()
}

fn reduce_bands<T: Sample>(path: &Path, width: u32, height: u32, samples: Vec<T>) -> Result<(Channel, usize)> {
    let pixels = width as usize * height as usize;
    if pixels == 0 || samples.len() % pixels != 0 || samples.is_empty() {
        bail!(MergeError::SampleCount {
            path: path.to_path_buf(),
            len: samples.len(),
            width,
            height,
        });
    }

    let bands = samples.len() / pixels;
    let data = if bands == 1 { samples } else { max_project(&samples, bands) };
    Ok((plane_from_raw(width, height, data).into(), bands))
}

/// Decodes the first image of a TIFF into a single band, keeping its sample
/// type. Multi-band images collapse to their per-pixel maximum. Returns the
/// channel and the number of bands it was reduced from.
pub fn load_channel(path: &Path) -> Result<(Channel, usize)> {
    let f = File::open(path).with_context(|| format!("Open TIFF: {}", path.display()))?;
    let mut dec = Decoder::new(BufReader::new(f))
        .with_context(|| format!("Read TIFF header: {}", path.display()))?
        .with_limits(Limits::unlimited());
    let (w, h) = dec.dimensions()?;

    // Palette samples are colormap indices, not intensities.
    let photometric = dec.get_tag_u32(Tag::PhotometricInterpretation).ok();
    if photometric == Some(PhotometricInterpretation::RGBPalette.to_u16().into()) {
        bail!(MergeError::UnsupportedSamples {
            path: path.to_path_buf(),
            kind: "palette colour".into(),
        });
    }
    let color = dec.colortype()?;

    let image = dec
        .read_image()
        .with_context(|| format!("decode {}", path.display()))?;

    let (channel, bands) = match image {
        DecodingResult::U8(v) => reduce_bands(path, w, h, v)?,
        DecodingResult::I8(v) => reduce_bands(path, w, h, v)?,
        DecodingResult::U16(v) => reduce_bands(path, w, h, v)?,
        DecodingResult::I16(v) => reduce_bands(path, w, h, v)?,
        DecodingResult::U32(v) => reduce_bands(path, w, h, v)?,
        DecodingResult::I32(v) => reduce_bands(path, w, h, v)?,
        DecodingResult::F32(v) => reduce_bands(path, w, h, v)?,
        DecodingResult::F64(v) => reduce_bands(path, w, h, v)?,
        _ => bail!(MergeError::UnsupportedSamples {
            path: path.to_path_buf(),
            kind: format!("{color:?}"),
        }),
    };

    debug!(
        path = %path.display(),
        width = w,
        height = h,
        bands,
        pixel_type = %channel.pixel_type(),
        "decoded"
    );
    Ok((channel, bands))
}
