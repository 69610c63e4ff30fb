//! Sample types and single-band planes.
//!
//! Every channel ends up as one band of one concrete sample type. The
//! `Channel` enum erases that type so channels of different formats can
//! travel together until they are promoted to a common one.

use image::{ImageBuffer, Luma, Primitive};
use rayon::prelude::*;
use tiff::tags::SampleFormat;

pub type Plane<T> = ImageBuffer<Luma<T>, Vec<T>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl PixelType {
    /// Name used by the OME `Pixels/@Type` attribute.
    pub fn ome_name(self) -> &'static str {
        match self {
            PixelType::U8 => "uint8",
            PixelType::I8 => "int8",
            PixelType::U16 => "uint16",
            PixelType::I16 => "int16",
            PixelType::U32 => "uint32",
            PixelType::I32 => "int32",
            PixelType::F32 => "float",
            PixelType::F64 => "double",
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            PixelType::U8 | PixelType::I8 => 8,
            PixelType::U16 | PixelType::I16 => 16,
            PixelType::U32 | PixelType::I32 | PixelType::F32 => 32,
            PixelType::F64 => 64,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, PixelType::F32 | PixelType::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, PixelType::I8 | PixelType::I16 | PixelType::I32)
    }

    pub fn sample_format(self) -> SampleFormat {
        if self.is_float() {
            SampleFormat::IEEEFP
        } else if self.is_signed() {
            SampleFormat::Int
        } else {
            SampleFormat::Uint
        }
    }

    fn integer(signed: bool, bits: u16) -> PixelType {
        match (signed, bits) {
            (false, 8) => PixelType::U8,
            (true, 8) => PixelType::I8,
            (false, 16) => PixelType::U16,
            (true, 16) => PixelType::I16,
            (false, _) => PixelType::U32,
            (true, _) => PixelType::I32,
        }
    }

    /// Smallest type that represents every value of both `self` and `other`.
    pub fn common(self, other: PixelType) -> PixelType {
        if self == other {
            return self;
        }

        if self.is_float() || other.is_float() {
            // f32 has a 24-bit mantissa: 32-bit integers need double.
            let needs_double = |t: PixelType| t == PixelType::F64 || (!t.is_float() && t.bits() == 32);
            return if needs_double(self) || needs_double(other) {
                PixelType::F64
            } else {
                PixelType::F32
            };
        }

        let signed = self.is_signed() || other.is_signed();
        let bits = if signed {
            let signed_bits = |t: PixelType| if t.is_signed() { t.bits() } else { t.bits() * 2 };
            signed_bits(self).max(signed_bits(other))
        } else {
            self.bits().max(other.bits())
        };

        if bits > 32 {
            PixelType::F64
        } else {
            PixelType::integer(signed, bits)
        }
    }
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ome_name())
    }
}

pub trait Sample: Primitive + Send + Sync + 'static {
    const TYPE: PixelType;

    fn widen(self) -> f64;

    /// Rounds to nearest and saturates for integer types.
    fn narrow(v: f64) -> Self;

    fn put_le(self, out: &mut Vec<u8>);

    /// Horizontal-differencing step; integer types wrap.
    fn wrapping_diff(self, prev: Self) -> Self;

    fn into_channel(plane: Plane<Self>) -> Channel;
}

macro_rules! int_sample {
    ($t:ty, $variant:ident) => {
        impl Sample for $t {
            const TYPE: PixelType = PixelType::$variant;

            fn widen(self) -> f64 {
                self as f64
            }
            fn narrow(v: f64) -> Self {
                v.round() as $t
            }
            fn put_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn wrapping_diff(self, prev: Self) -> Self {
                self.wrapping_sub(prev)
            }
            fn into_channel(plane: Plane<Self>) -> Channel {
                Channel::$variant(plane)
            }
        }
    };
}

macro_rules! float_sample {
    ($t:ty, $variant:ident) => {
        impl Sample for $t {
            const TYPE: PixelType = PixelType::$variant;

            fn widen(self) -> f64 {
                self as f64
            }
            fn narrow(v: f64) -> Self {
                v as $t
            }
            fn put_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn wrapping_diff(self, prev: Self) -> Self {
                self - prev
            }
            fn into_channel(plane: Plane<Self>) -> Channel {
                Channel::$variant(plane)
            }
        }
    };
}

int_sample!(u8, U8);
int_sample!(i8, I8);
int_sample!(u16, U16);
int_sample!(i16, I16);
int_sample!(u32, U32);
int_sample!(i32, I32);
float_sample!(f32, F32);
float_sample!(f64, F64);

pub(crate) fn plane_from_raw<T: Sample>(width: u32, height: u32, data: Vec<T>) -> Plane<T> {
    ImageBuffer::from_raw(width, height, data).expect("plane buffer sized to its dimensions")
}

/// One band of pixels with its sample type erased.
#[derive(Clone, Debug)]
pub enum Channel {
    U8(Plane<u8>),
    I8(Plane<i8>),
    U16(Plane<u16>),
    I16(Plane<i16>),
    U32(Plane<u32>),
    I32(Plane<i32>),
    F32(Plane<f32>),
    F64(Plane<f64>),
}

/// Runs `$body` with `$plane` bound to the typed plane inside a `Channel`.
macro_rules! with_plane {
    ($channel:expr, $plane:ident => $body:expr) => {
        match $channel {
            $crate::pixel::Channel::U8($plane) => $body,
            $crate::pixel::Channel::I8($plane) => $body,
            $crate::pixel::Channel::U16($plane) => $body,
            $crate::pixel::Channel::I16($plane) => $body,
            $crate::pixel::Channel::U32($plane) => $body,
            $crate::pixel::Channel::I32($plane) => $body,
            $crate::pixel::Channel::F32($plane) => $body,
            $crate::pixel::Channel::F64($plane) => $body,
        }
    };
}
pub(crate) use with_plane;

impl<T: Sample> From<Plane<T>> for Channel {
    fn from(plane: Plane<T>) -> Self {
        T::into_channel(plane)
    }
}

impl Channel {
    pub fn pixel_type(&self) -> PixelType {
        match self {
            Channel::U8(_) => PixelType::U8,
            Channel::I8(_) => PixelType::I8,
            Channel::U16(_) => PixelType::U16,
            Channel::I16(_) => PixelType::I16,
            Channel::U32(_) => PixelType::U32,
            Channel::I32(_) => PixelType::I32,
            Channel::F32(_) => PixelType::F32,
            Channel::F64(_) => PixelType::F64,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        with_plane!(self, p => p.dimensions())
    }

    /// Value at `(x, y)` widened to f64.
    pub fn value(&self, x: u32, y: u32) -> f64 {
        with_plane!(self, p => p.get_pixel(x, y).0[0].widen())
    }

    /// Re-expresses every sample in `target`, through f64.
    pub fn convert(self, target: PixelType) -> Channel {
        if self.pixel_type() == target {
            return self;
        }
        with_plane!(&self, p => cast_to(p, target))
    }
}

fn cast_to<S: Sample>(plane: &Plane<S>, target: PixelType) -> Channel {
    match target {
        PixelType::U8 => cast::<S, u8>(plane).into(),
        PixelType::I8 => cast::<S, i8>(plane).into(),
        PixelType::U16 => cast::<S, u16>(plane).into(),
        PixelType::I16 => cast::<S, i16>(plane).into(),
        PixelType::U32 => cast::<S, u32>(plane).into(),
        PixelType::I32 => cast::<S, i32>(plane).into(),
        PixelType::F32 => cast::<S, f32>(plane).into(),
        PixelType::F64 => cast::<S, f64>(plane).into(),
    }
}

fn cast<S: Sample, D: Sample>(plane: &Plane<S>) -> Plane<D> {
    let (w, h) = plane.dimensions();
    let data: Vec<D> = plane
        .as_raw()
        .par_iter()
        .map(|&v| D::narrow(v.widen()))
        .collect();
    plane_from_raw(w, h, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_type_is_its_own_common_type() {
        assert_eq!(PixelType::U16.common(PixelType::U16), PixelType::U16);
    }

    #[test]
    fn unsigned_widths_take_the_larger() {
        assert_eq!(PixelType::U8.common(PixelType::U16), PixelType::U16);
        assert_eq!(PixelType::U32.common(PixelType::U8), PixelType::U32);
    }

    #[test]
    fn mixed_sign_doubles_the_unsigned_width() {
        assert_eq!(PixelType::U8.common(PixelType::I8), PixelType::I16);
        assert_eq!(PixelType::I8.common(PixelType::U16), PixelType::I32);
        assert_eq!(PixelType::U32.common(PixelType::I16), PixelType::F64);
    }

    #[test]
    fn floats_absorb_integers() {
        assert_eq!(PixelType::U16.common(PixelType::F32), PixelType::F32);
        assert_eq!(PixelType::F32.common(PixelType::I32), PixelType::F64);
        assert_eq!(PixelType::F64.common(PixelType::U8), PixelType::F64);
    }

    #[test]
    fn ome_names() {
        assert_eq!(PixelType::U8.ome_name(), "uint8");
        assert_eq!(PixelType::F32.ome_name(), "float");
        assert_eq!(PixelType::F64.ome_name(), "double");
    }

    #[test]
    fn narrowing_rounds_and_saturates() {
        assert_eq!(u8::narrow(254.6), 255);
        assert_eq!(u8::narrow(300.0), 255);
        assert_eq!(u8::narrow(-3.0), 0);
        assert_eq!(i16::narrow(-40000.0), i16::MIN);
    }

    #[test]
    fn convert_keeps_values_and_dimensions() {
        let plane: Plane<u8> = plane_from_raw(2, 1, vec![7, 200]);
        let channel = Channel::from(plane).convert(PixelType::F32);
        assert_eq!(channel.pixel_type(), PixelType::F32);
        assert_eq!(channel.dimensions(), (2, 1));
        assert_eq!(channel.value(1, 0), 200.0);
    }
}
