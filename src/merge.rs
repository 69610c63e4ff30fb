use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use regex::Regex;
use std::{
    collections::HashSet,
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tiff::tags::{ResolutionUnit, Tag};
use tracing::{debug, info, warn};

use crate::cli::Cli;
use crate::discover::{channel_name, discover_inputs};
use crate::error::MergeError;
use crate::load::load_channel;
use crate::meta::{read_resolution, Resolution};
use crate::ome::{ome_xml, OmeImage};
use crate::pixel::{Channel, PixelType};
use crate::pyramid::level_sizes;
use crate::tiff_writer::{
    write_tiled, BigTiffWriter, Field, Ifd, TileOptions, SUBFILE_FULL, SUBFILE_REDUCED, TAG_SUB_IFDS,
};

#[derive(Clone, Debug)]
pub struct WriteOptions {
    pub tiles: TileOptions,
    pub pyramid: bool,
}

impl From<&Cli> for WriteOptions {
    fn from(cli: &Cli) -> Self {
        Self {
            tiles: TileOptions {
                tile: cli.tile_size,
                compression: cli.compression,
                predictor: cli.predictor,
            },
            pyramid: !cli.no_pyramid,
        }
    }
}

/// Checks that every channel has the first one's size and promotes them all
/// to their common pixel type.
pub fn assemble(paths: &[PathBuf], channels: Vec<Channel>) -> Result<(Vec<Channel>, PixelType)> {
    let Some(first) = channels.first() else {
        bail!("nothing to merge");
    };
    let expected = first.dimensions();

    for (path, channel) in paths.iter().zip(&channels) {
        let found = channel.dimensions();
        if found != expected {
            bail!(MergeError::DimensionMismatch {
                path: path.clone(),
                expected,
                found,
            });
        }
    }

    let target = channels
        .iter()
        .map(Channel::pixel_type)
        .reduce(PixelType::common)
        .unwrap_or(PixelType::U8);

    let channels = paths
        .iter()
        .zip(channels)
        .map(|(path, channel)| {
            if channel.pixel_type() != target {
                info!(
                    path = %path.display(),
                    from = %channel.pixel_type(),
                    to = %target,
                    "promoting channel"
                );
            }
            channel.convert(target)
        })
        .collect();

    Ok((channels, target))
}

fn set_resolution(ifd: &mut Ifd, resolution: Option<&Resolution>, level: u32) {
    let Some(r) = resolution else { return };
    ifd.set(Tag::XResolution, Field::Rational(vec![r.x.at_level(level)]));
    ifd.set(Tag::YResolution, Field::Rational(vec![r.y.at_level(level)]));
    let unit = match r.unit {
        ResolutionUnit::Inch => 2,
        ResolutionUnit::Centimeter => 3,
        _ => 1,
    };
    ifd.set(Tag::ResolutionUnit, Field::Short(vec![unit]));
}

/// Runs `write` against a temporary file beside `path` and renames it onto
/// `path` once `write` returns `Ok`. On error the temporary file is removed
/// and whatever was at `path` is left untouched.
fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&File) -> Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Create temporary output in {}", dir.display()))?;
    write(tmp.as_file())?;
    tmp.persist(path)
        .with_context(|| format!("Move output into place: {}", path.display()))?;
    Ok(())
}

/// One full-resolution IFD per channel in the main chain, each with its
/// reduced levels hanging off `SubIFDs`. The OME-XML goes on the first.
pub fn write_ome_tiff(
    path: &Path,
    channels: &[Channel],
    description: &str,
    resolution: Option<&Resolution>,
    opts: &WriteOptions,
) -> Result<()> {
    write_atomically(path, |f| write_pages(f, channels, description, resolution, opts))
}

fn write_pages(
    f: &File,
    channels: &[Channel],
    description: &str,
    resolution: Option<&Resolution>,
    opts: &WriteOptions,
) -> Result<()> {
    let mut out = BigTiffWriter::new(BufWriter::new(f)).context("write BigTIFF header")?;
    let tile = opts.tiles.tile;

    let mut planes = Vec::with_capacity(channels.len());
    for (c, channel) in channels.iter().enumerate() {
        let (w, h) = channel.dimensions();
        let levels = if opts.pyramid { level_sizes(w, h, tile) } else { Vec::new() };

        let mut ifd = write_tiled(&mut out, channel, &opts.tiles, SUBFILE_FULL)
            .with_context(|| format!("write channel {c}"))?;
        set_resolution(&mut ifd, resolution, 0);

        let mut sub_ifds = Vec::with_capacity(levels.len());
        let mut reduced: Option<Channel> = None;
        for (level, &size) in (1u32..).zip(&levels) {
            let next = reduced.as_ref().unwrap_or(channel).halve();
            debug_assert_eq!(next.dimensions(), size);
            let mut level_ifd = write_tiled(&mut out, &next, &opts.tiles, SUBFILE_REDUCED)
                .with_context(|| format!("write channel {c} level {level}"))?;
            set_resolution(&mut level_ifd, resolution, level);
            sub_ifds.push(out.write_ifd(&level_ifd, 0).context("write level IFD")?);
            reduced = Some(next);
        }
        if !sub_ifds.is_empty() {
            ifd.set(TAG_SUB_IFDS, Field::Long8(sub_ifds));
        }

        if c == 0 {
            ifd.set(Tag::ImageDescription, Field::Ascii(description.to_string()));
            ifd.set(
                Tag::Software,
                Field::Ascii(format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))),
            );
        }
        debug!(channel = c, levels = levels.len(), "plane written");
        planes.push(ifd);
    }

    let first = out.write_chain(&planes).context("write IFD chain")?;
    out.finish(first).context("finalize BigTIFF header")?;
    Ok(())
}

/// Names that already appeared earlier in `names`, once per repeat.
fn duplicate_names(names: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(String::as_str)
        .filter(|name| !seen.insert(*name))
        .collect()
}

/// Runs the whole merge. Returns the written path, or `None` when the
/// output already exists and `--force` was not given.
pub fn run(cli: &Cli) -> Result<Option<PathBuf>> {
    cli.validate()?;

    let output = cli.output_path();
    if output.exists() && !cli.force {
        info!(output = %output.display(), "output exists, skipping (use --force to overwrite)");
        return Ok(None);
    }

    let pattern = Regex::new(&cli.channel_pattern)
        .with_context(|| format!("invalid --channel-pattern {:?}", cli.channel_pattern))?;

    let paths = if cli.inputs.is_empty() {
        discover_inputs(&cli.input_dir, &cli.suffix, &cli.excludes, cli.recursive, &output)?
    } else {
        cli.inputs.clone()
    };

    let names: Vec<String> = paths.iter().map(|p| channel_name(p, &pattern)).collect();
    info!(channels = paths.len(), "merging");
    for (path, name) in paths.iter().zip(&names) {
        info!(channel = %name, path = %path.display(), "input");
    }
    for name in duplicate_names(&names) {
        warn!(channel = %name, "duplicate channel name");
    }

    let load = |p: &PathBuf| load_channel(p).with_context(|| format!("load {}", p.display()));
    let loaded: Vec<(Channel, usize)> = if cli.sequential {
        paths.iter().map(load).collect::<Result<_>>()?
    } else {
        paths.par_iter().map(load).collect::<Result<_>>()?
    };

    for (name, (_, bands)) in names.iter().zip(&loaded) {
        if *bands > 1 {
            info!(channel = %name, bands = *bands, "max-projected bands");
        }
    }

    let (channels, pixel_type) = assemble(&paths, loaded.into_iter().map(|(c, _)| c).collect())?;
    let (width, height) = channels[0].dimensions();

    let resolution = match read_resolution(&paths[0]) {
        Ok(r) => r,
        Err(e) => {
            warn!(path = %paths[0].display(), error = %e, "cannot read resolution tags");
            None
        }
    };

    let xml = ome_xml(&OmeImage {
        name: &cli.image_name,
        width,
        height,
        pixel_type,
        channels: &names,
        pixel_size_um: resolution.as_ref().and_then(Resolution::pixel_size_um),
    });

    info!(
        output = %output.display(),
        width,
        height,
        pixel_type = %pixel_type,
        compression = ?cli.compression,
        "writing OME-TIFF"
    );
    write_ome_tiff(&output, &channels, &xml, resolution.as_ref(), &WriteOptions::from(cli))
        .with_context(|| format!("write {}", output.display()))?;

    Ok(Some(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::{plane_from_raw, Plane};
    use std::io::Write;

    fn gray8(w: u32, h: u32, v: u8) -> Channel {
        let p: Plane<u8> = plane_from_raw(w, h, vec![v; (w * h) as usize]);
        p.into()
    }

    #[test]
    fn mismatched_size_names_the_file() {
        let paths = vec![PathBuf::from("a.tif"), PathBuf::from("b.tif")];
        let err = assemble(&paths, vec![gray8(4, 4, 1), gray8(4, 3, 1)]).unwrap_err();
        match err.downcast_ref::<MergeError>() {
            Some(MergeError::DimensionMismatch { path, expected, found }) => {
                assert_eq!(path, &PathBuf::from("b.tif"));
                assert_eq!(*expected, (4, 4));
                assert_eq!(*found, (4, 3));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn mixed_types_are_promoted() {
        let paths = vec![PathBuf::from("a.tif"), PathBuf::from("b.tif")];
        let wide: Plane<u16> = plane_from_raw(2, 1, vec![1000, 2000]);
        let (channels, ty) = assemble(&paths, vec![gray8(2, 1, 9), wide.into()]).unwrap();
        assert_eq!(ty, PixelType::U16);
        assert!(channels.iter().all(|c| c.pixel_type() == PixelType::U16));
        assert_eq!(channels[0].value(1, 0), 9.0);
    }

    #[test]
    fn repeated_channel_names_are_reported_once_per_repeat() {
        let names: Vec<String> = ["DAPI", "FITC", "DAPI", "DAPI"].map(String::from).into();
        assert_eq!(duplicate_names(&names), vec!["DAPI", "DAPI"]);
        assert!(duplicate_names(&names[..2]).is_empty());
    }

    #[test]
    fn failed_write_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.ome.tif");

        let err = write_atomically(&output, |f| {
            let mut w = f;
            w.write_all(b"II+\0partial")?;
            bail!("disk full")
        })
        .unwrap_err();

        assert_eq!(err.to_string(), "disk full");
        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_rewrite_keeps_the_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.ome.tif");
        std::fs::write(&output, b"previous").unwrap();

        assert!(write_atomically(&output, |_| bail!("interrupted")).is_err());
        assert_eq!(std::fs::read(&output).unwrap(), b"previous");

        write_atomically(&output, |f| {
            let mut w = f;
            w.write_all(b"complete")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"complete");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn resolution_tags_scale_with_level() {
        use crate::meta::Rational;
        let r = Resolution {
            x: Rational { n: 1000, d: 1 },
            y: Rational { n: 1000, d: 1 },
            unit: ResolutionUnit::Centimeter,
        };
        let mut ifd = Ifd::default();
        set_resolution(&mut ifd, Some(&r), 1);
        assert_eq!(
            ifd.get(Tag::XResolution),
            Some(&Field::Rational(vec![Rational { n: 1000, d: 2 }]))
        );
        assert_eq!(ifd.get(Tag::ResolutionUnit), Some(&Field::Short(vec![3])));
    }
}
