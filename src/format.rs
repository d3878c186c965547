//! Sound parameters and sample-format helpers (spec §3, §4.6).
//!
//! `SampleFormat` is a direct port of the bit-packed `sfmt` representation in
//! `original_source/trunk/audio.h`: a width/signedness pair plus an
//! explicit endianness, so `sfmt_best_matching`/`sfmt_bps` below read the
//! same as the C originals instead of reinventing a format algebra.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
    Native,
}

impl Endian {
    pub fn resolved(self) -> Endian {
        match self {
            Endian::Native => {
                if cfg!(target_endian = "big") {
                    Endian::Big
                } else {
                    Endian::Little
                }
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseFormat {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    F32,
}

impl BaseFormat {
    pub fn width_bytes(self) -> usize {
        match self {
            BaseFormat::U8 | BaseFormat::S8 => 1,
            BaseFormat::U16 | BaseFormat::S16 => 2,
            BaseFormat::U32 | BaseFormat::S32 | BaseFormat::F32 => 4,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            BaseFormat::S8 | BaseFormat::S16 | BaseFormat::S32 | BaseFormat::F32
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, BaseFormat::F32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleFormat {
    pub base: BaseFormat,
    pub endian: Endian,
}

impl SampleFormat {
    pub const fn new(base: BaseFormat, endian: Endian) -> Self {
        Self { base, endian }
    }

    pub fn bytes_per_sample(self) -> usize {
        self.base.width_bytes()
    }
}

/// `(sample_format, channels, rate_hz)` triple from spec §3. Equality over
/// all three fields is the device-reopen trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoundParams {
    pub format: SampleFormat,
    pub channels: u16,
    pub rate: u32,
}

impl SoundParams {
    pub fn bytes_per_second(self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize * self.rate as usize
    }

    pub fn bytes_per_frame(self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }
}

impl fmt::Display for SoundParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}ch {}Hz",
            self.format.base, self.channels, self.rate
        )
    }
}

/// Mask of formats a device/driver supports, one bit per [`BaseFormat`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatMask(u8);

impl FormatMask {
    pub const EMPTY: FormatMask = FormatMask(0);

    pub fn add(mut self, fmt: BaseFormat) -> Self {
        self.0 |= 1 << fmt as u8;
        self
    }

    pub fn contains(self, fmt: BaseFormat) -> bool {
        self.0 & (1 << fmt as u8) != 0
    }

    pub fn iter(self) -> impl Iterator<Item = BaseFormat> {
        [
            BaseFormat::U8,
            BaseFormat::S8,
            BaseFormat::U16,
            BaseFormat::S16,
            BaseFormat::U32,
            BaseFormat::S32,
            BaseFormat::F32,
        ]
        .into_iter()
        .filter(move |f| self.contains(*f))
    }
}

/// Port of `audio.c`'s `sfmt_best_matching`: prefer an exact match,
/// otherwise the widest format with the same signedness, otherwise the
/// widest available; float is always acceptable.
pub fn sfmt_best_matching(mask: FormatMask, requested: BaseFormat) -> Option<BaseFormat> {
    if mask.contains(requested) {
        return Some(requested);
    }

    if let Some(f) = mask
        .iter()
        .filter(|f| f.is_signed() == requested.is_signed() && !f.is_float())
        .max_by_key(|f| f.width_bytes())
    {
        return Some(f);
    }

    if let Some(f) = mask.iter().find(|f| f.is_float()) {
        return Some(f);
    }

    mask.iter().max_by_key(|f| f.width_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins() {
        let mask = FormatMask::EMPTY.add(BaseFormat::S16).add(BaseFormat::S32);
        assert_eq!(sfmt_best_matching(mask, BaseFormat::S16), Some(BaseFormat::S16));
    }

    #[test]
    fn widest_same_signedness_when_no_exact() {
        let mask = FormatMask::EMPTY.add(BaseFormat::S8).add(BaseFormat::S32);
        assert_eq!(sfmt_best_matching(mask, BaseFormat::S16), Some(BaseFormat::S32));
    }

    #[test]
    fn float_always_acceptable_fallback() {
        let mask = FormatMask::EMPTY.add(BaseFormat::F32);
        let best = sfmt_best_matching(mask, BaseFormat::S16).unwrap();
        assert!(best.is_float());
    }

    #[test]
    fn best_matching_is_at_least_as_wide_when_mask_has_a_wider_option() {
        for requested in [BaseFormat::U8, BaseFormat::S8, BaseFormat::S16] {
            let mask = FormatMask::EMPTY.add(BaseFormat::S32);
            let best = sfmt_best_matching(mask, requested).unwrap();
            assert!(mask.contains(best));
            assert!(best.width_bytes() >= requested.width_bytes());
        }
    }
}
