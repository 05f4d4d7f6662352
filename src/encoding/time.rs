//! Fixed-width, order-preserving encodings of instants.
//!
//! An instant is truncated (floored) to the configured precision, counted in
//! units of that precision since the Unix epoch and written as offset binary,
//! big-endian, so that byte order matches chronological order including
//! instants before 1970.

use chrono::{DateTime, Utc};

use super::EncodingError;
use crate::config::TemporalPrecision;
use crate::error::Result;
use crate::Error;

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 60 * 60;
const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeCodec {
    precision: TemporalPrecision,
}

impl TimeCodec {
    pub fn new(precision: TemporalPrecision) -> Self {
        Self { precision }
    }

    pub fn precision(&self) -> TemporalPrecision {
        self.precision
    }

    /// Width in bytes of every encoded instant.
    pub fn width(&self) -> usize {
        match self.precision {
            TemporalPrecision::Nanosecond | TemporalPrecision::Millisecond => 8,
            TemporalPrecision::Second => 6,
            TemporalPrecision::Minute => 5,
            TemporalPrecision::Hour => 4,
            TemporalPrecision::Day => 3,
        }
    }

    fn offset(&self) -> u64 {
        1u64 << (self.width() * 8 - 1)
    }

    fn count(&self, t: DateTime<Utc>) -> Result<i64> {
        match self.precision {
            TemporalPrecision::Nanosecond => t.timestamp_nanos_opt().ok_or_else(|| {
                Error::InvalidInput(format!("{} is not representable in nanoseconds", t))
            }),
            TemporalPrecision::Millisecond => Ok(t.timestamp_millis()),
            TemporalPrecision::Second => Ok(t.timestamp()),
            TemporalPrecision::Minute => Ok(t.timestamp().div_euclid(SECONDS_PER_MINUTE)),
            TemporalPrecision::Hour => Ok(t.timestamp().div_euclid(SECONDS_PER_HOUR)),
            TemporalPrecision::Day => Ok(t.timestamp().div_euclid(SECONDS_PER_DAY)),
        }
    }

    fn from_count(&self, count: i64) -> Option<DateTime<Utc>> {
        let seconds = |unit: i64| count.checked_mul(unit).and_then(|s| DateTime::from_timestamp(s, 0));
        match self.precision {
            TemporalPrecision::Nanosecond => Some(DateTime::from_timestamp_nanos(count)),
            TemporalPrecision::Millisecond => DateTime::from_timestamp_millis(count),
            TemporalPrecision::Second => seconds(1),
            TemporalPrecision::Minute => seconds(SECONDS_PER_MINUTE),
            TemporalPrecision::Hour => seconds(SECONDS_PER_HOUR),
            TemporalPrecision::Day => seconds(SECONDS_PER_DAY),
        }
    }

    /// Floors `t` to the codec's precision.
    pub fn truncate(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let count = self.count(t)?;
        self.from_count(count).ok_or_else(|| {
            Error::InvalidInput(format!("{} cannot be truncated to {:?}", t, self.precision))
        })
    }

    /// Appends the encoding of `t`. Fails if the truncated count does not fit
    /// the codec's width.
    pub fn write(&self, t: DateTime<Utc>, out: &mut Vec<u8>) -> Result<()> {
        let count = self.count(t)?;
        let width = self.width();
        let half = self.offset() as i128;
        if (count as i128) < -half || (count as i128) >= half {
            return Err(Error::InvalidInput(format!(
                "{} is out of range for {:?} precision",
                t, self.precision
            )));
        }
        let biased = (count as u64).wrapping_add(self.offset());
        out.extend_from_slice(&biased.to_be_bytes()[8 - width..]);
        Ok(())
    }

    pub fn encode(&self, t: DateTime<Utc>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.width());
        self.write(t, &mut out)?;
        Ok(out)
    }

    /// Reads an instant from the first `width()` bytes of `bytes`.
    pub fn read(&self, bytes: &[u8]) -> Result<DateTime<Utc>> {
        let width = self.width();
        if bytes.len() < width {
            return Err(EncodingError::TruncatedData.into());
        }
        let mut buf = [0u8; 8];
        buf[8 - width..].copy_from_slice(&bytes[..width]);
        let count = u64::from_be_bytes(buf).wrapping_sub(self.offset()) as i64;
        self.from_count(count).ok_or_else(|| {
            EncodingError::InvalidFormat(format!("time count {} out of range", count)).into()
        })
    }

    /// Appends the largest possible encoding, sorting after every instant.
    pub fn write_max(&self, out: &mut Vec<u8>) {
        out.extend(std::iter::repeat(0xFF).take(self.width()));
    }
}
