use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use crate::discover::{DEFAULT_CHANNEL_PATTERN, DEFAULT_SUFFIX};
use crate::tiff_writer::{Compression, PredictorMode};

pub const DEFAULT_OUTPUT: &str = "Final_Result_Max.ome.tif";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ome-merge",
    version,
    about = "Merge single-channel extended-focus TIFFs into one pyramidal OME-TIFF (max-intensity band reduction)."
)]
pub struct Cli {
    /// Input TIFF files in channel order (default: discover them in --input-dir)
    #[arg(value_name = "FILES")]
    pub inputs: Vec<PathBuf>,

    /// Directory scanned for inputs when no FILES are given
    #[arg(long, default_value = ".")]
    pub input_dir: PathBuf,

    /// File name suffix that marks an input
    #[arg(long, default_value = DEFAULT_SUFFIX)]
    pub suffix: String,

    /// Skip discovered files whose name contains TEXT (repeatable)
    #[arg(long = "exclude", value_name = "TEXT", default_values = ["Result", "Fix"])]
    pub excludes: Vec<String>,

    /// Descend into subdirectories of --input-dir
    #[arg(long)]
    pub recursive: bool,

    /// Regex applied to the file stem; capture group 1 is the channel name
    #[arg(long, default_value = DEFAULT_CHANNEL_PATTERN)]
    pub channel_pattern: String,

    /// Output OME-TIFF (default: Final_Result_Max.ome.tif inside --input-dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// OME Image name
    #[arg(long, default_value = "Merged_Max")]
    pub image_name: String,

    #[arg(long, value_enum, default_value = "lzw")]
    pub compression: Compression,

    /// Horizontal differencing for integer data (ignored for floats and uncompressed output)
    #[arg(long, value_enum, default_value = "horizontal")]
    pub predictor: PredictorMode,

    /// Tile edge in pixels (multiple of 16)
    #[arg(long, default_value_t = 512)]
    pub tile_size: u32,

    /// Write only full-resolution planes
    #[arg(long)]
    pub no_pyramid: bool,

    /// Decode inputs one at a time
    #[arg(long)]
    pub sequential: bool,

    /// Overwrite an existing output
    #[arg(long)]
    pub force: bool,
}

impl Cli {
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.input_dir.join(DEFAULT_OUTPUT))
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 || self.tile_size % 16 != 0 {
            bail!("--tile-size must be a positive multiple of 16 (got {})", self.tile_size);
        }
        if self.image_name.is_empty() {
            bail!("--image-name must not be empty");
        }
        Ok(())
    }
}
