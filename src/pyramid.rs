use rayon::prelude::*;

use crate::pixel::{plane_from_raw, with_plane, Channel, Plane, Sample};

/// Sizes of the reduced levels below a `width` x `height` base, halving
/// until the level fits inside a single `tile` x `tile` tile.
pub fn level_sizes(width: u32, height: u32, tile: u32) -> Vec<(u32, u32)> {
    let mut sizes = Vec::new();
    let (mut w, mut h) = (width, height);
    while w > tile || h > tile {
        w = (w / 2).max(1);
        h = (h / 2).max(1);
        sizes.push((w, h));
    }
    sizes
}

/// 2x2 box average. An odd trailing row or column is dropped; a side that
/// is already one pixel wide stays one pixel wide.
pub fn halve<T: Sample>(src: &Plane<T>) -> Plane<T> {
    let (w, h) = src.dimensions();
    let (nw, nh) = ((w / 2).max(1), (h / 2).max(1));
    let raw = src.as_raw();
    let (w, h) = (w as usize, h as usize);

    let mut out = vec![T::narrow(0.0); nw as usize * nh as usize];
    out.par_chunks_mut(nw as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y0 = y * 2;
            let y1 = (y0 + 2).min(h);
            for (x, dst) in row.iter_mut().enumerate() {
                let x0 = x * 2;
                let x1 = (x0 + 2).min(w);
                let mut sum = 0.0f64;
                let mut n = 0u32;
                for yy in y0..y1 {
                    for xx in x0..x1 {
                        sum += raw[yy * w + xx].widen();
                        n += 1;
                    }
                }
                *dst = T::narrow(sum / n.max(1) as f64);
            }
        });

    plane_from_raw(nw, nh, out)
}

impl Channel {
    pub fn halve(&self) -> Channel {
        with_plane!(self, p => halve(p).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::PixelType;

    #[test]
    fn no_levels_when_image_fits_one_tile() {
        assert!(level_sizes(512, 300, 512).is_empty());
    }

    #[test]
    fn halves_until_within_a_tile() {
        assert_eq!(
            level_sizes(2000, 1100, 512),
            vec![(1000, 550), (500, 275)]
        );
    }

    #[test]
    fn thin_images_bottom_out_at_one_pixel() {
        assert_eq!(level_sizes(3, 40, 16), vec![(1, 20), (1, 10)]);
    }

    #[test]
    fn averages_two_by_two_blocks() {
        let src: Plane<u8> = plane_from_raw(4, 2, vec![0, 2, 10, 20, 4, 6, 30, 40]);
        let out = halve(&src);
        assert_eq!(out.dimensions(), (2, 1));
        assert_eq!(out.as_raw(), &vec![3, 25]);
    }

    #[test]
    fn odd_edges_are_dropped() {
        let src: Plane<u16> = plane_from_raw(3, 3, vec![1, 1, 9, 1, 1, 9, 5, 5, 7]);
        let out = halve(&src);
        assert_eq!(out.dimensions(), (1, 1));
        assert_eq!(out.as_raw(), &vec![1]);
    }

    #[test]
    fn signed_and_float_values_survive() {
        let src: Plane<i16> = plane_from_raw(2, 2, vec![-100, -200, -300, -400]);
        assert_eq!(halve(&src).as_raw(), &vec![-250]);

        let src: Plane<f32> = plane_from_raw(2, 2, vec![0.25, 0.5, 0.75, 1.0]);
        let channel = Channel::from(src).halve();
        assert_eq!(channel.pixel_type(), PixelType::F32);
        assert!((channel.value(0, 0) - 0.625).abs() < 1e-6);
    }
}
