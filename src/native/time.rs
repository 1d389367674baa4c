//! Implements wrappers for various Windows time structures.
use std::convert::TryFrom;

use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Wrapper for [FILETIME](https://learn.microsoft.com/en-us/windows/win32/api/minwinbase/ns-minwinbase-filetime)
///
/// Number of 100-nanosecond intervals since January 1, 1601 (UTC), which is also the unit of
/// `EVENT_HEADER::TimeStamp`.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FileTime(i64);

const SECONDS_BETWEEN_1601_AND_1970: i64 = 11_644_473_600;
const NS_IN_SECOND: i64 = 1_000_000_000;
const MS_IN_SECOND: i64 = 1_000;
const TICKS_IN_SECOND: i64 = 10_000_000;

impl FileTime {
    pub fn from_quad(quad: i64) -> Self {
        Self(quad)
    }

    pub fn as_quad(&self) -> i64 {
        self.0
    }

    /// Converts to a unix timestamp with millisecond granularity.
    pub fn as_unix_timestamp(&self) -> i64 {
        self.0 / 10_000 - (SECONDS_BETWEEN_1601_AND_1970 * MS_IN_SECOND)
    }

    /// Converts to a unix timestamp with second granularity.
    pub fn as_unix_timestamp_secs(&self) -> i64 {
        self.0.div_euclid(TICKS_IN_SECOND) - SECONDS_BETWEEN_1601_AND_1970
    }

    /// Converts to a unix timestamp with nanosecond granularity.
    pub fn as_unix_timestamp_nanos(&self) -> i128 {
        self.0 as i128 * 100 - (SECONDS_BETWEEN_1601_AND_1970 as i128 * NS_IN_SECOND as i128)
    }

    /// Converts to a [`std::time::SystemTime`]
    pub fn as_system_time(&self) -> std::time::SystemTime {
        let nanos = self.as_unix_timestamp_nanos();
        let magnitude = std::time::Duration::new(
            (nanos.unsigned_abs() / NS_IN_SECOND as u128) as u64,
            (nanos.unsigned_abs() % NS_IN_SECOND as u128) as u32,
        );
        if nanos >= 0 {
            std::time::UNIX_EPOCH + magnitude
        } else {
            std::time::UNIX_EPOCH - magnitude
        }
    }

    /// Converts to OffsetDateTime
    pub fn as_date_time(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(self.as_unix_timestamp_nanos()).ok()
    }

    /// Formats as an ISO 8601 UTC date, with the full 100ns precision
    pub fn to_iso8601(&self) -> Option<String> {
        self.as_date_time()?
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:7]Z"
            ))
            .ok()
    }
}

/// Wrapper for [SYSTEMTIME](https://learn.microsoft.com/en-us/windows/win32/api/minwinbase/ns-minwinbase-systemtime)
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct SystemTime {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub milliseconds: u16,
}

impl SystemTime {
    /// Formats as an ISO 8601 date, as TDH does for `SYSTEMTIME` properties
    ///
    /// Returns `None` when the fields do not make up a valid date.
    pub fn to_iso8601(&self) -> Option<String> {
        let month = Month::try_from(u8::try_from(self.month).ok()?).ok()?;
        let date = Date::from_calendar_date(i32::from(self.year), month, u8::try_from(self.day).ok()?).ok()?;
        let time = Time::from_hms_milli(
            u8::try_from(self.hour).ok()?,
            u8::try_from(self.minute).ok()?,
            u8::try_from(self.second).ok()?,
            self.milliseconds,
        )
        .ok()?;

        PrimitiveDateTime::new(date, time)
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
            ))
            .ok()
    }
}

#[cfg(feature = "serde")]
impl serde::ser::Serialize for FileTime {
    #[cfg(feature = "time_rs")]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self.as_date_time() {
            Some(date_time) => date_time.serialize(serializer),
            None => self.as_unix_timestamp().serialize(serializer),
        }
    }

    #[cfg(not(feature = "time_rs"))]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.as_unix_timestamp().serialize(serializer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // 2023-01-01T00:00:00Z
    const NEW_YEAR_2023: i64 = 133_170_048_000_000_000;

    #[test]
    fn test_unix_conversion() {
        let ft = FileTime::from_quad(NEW_YEAR_2023);
        assert_eq!(ft.as_unix_timestamp_secs(), 1_672_531_200);
        assert_eq!(ft.as_unix_timestamp(), 1_672_531_200_000);
        assert_eq!(ft.as_unix_timestamp_nanos(), 1_672_531_200_000_000_000);
        assert_eq!(
            ft.as_system_time(),
            std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_672_531_200)
        );
    }

    #[test]
    fn test_epoch_boundaries() {
        let unix_epoch = FileTime::from_quad(SECONDS_BETWEEN_1601_AND_1970 * TICKS_IN_SECOND);
        assert_eq!(unix_epoch.as_unix_timestamp_secs(), 0);
        assert_eq!(unix_epoch.as_system_time(), std::time::UNIX_EPOCH);

        let zero = FileTime::default();
        assert_eq!(zero.as_unix_timestamp_secs(), -SECONDS_BETWEEN_1601_AND_1970);
        assert_eq!(zero.to_iso8601().as_deref(), Some("1601-01-01T00:00:00.0000000Z"));
    }

    #[test]
    fn test_iso8601() {
        let ft = FileTime::from_quad(NEW_YEAR_2023 + 5 * TICKS_IN_SECOND + 1234);
        assert_eq!(ft.to_iso8601().as_deref(), Some("2023-01-01T00:00:05.0001234Z"));

        let st = SystemTime {
            year: 2024,
            month: 2,
            day: 29,
            hour: 13,
            minute: 7,
            second: 1,
            milliseconds: 42,
            ..Default::default()
        };
        assert_eq!(st.to_iso8601().as_deref(), Some("2024-02-29T13:07:01.042Z"));

        let not_a_leap_year = SystemTime { year: 2023, ..st };
        assert_eq!(not_a_leap_year.to_iso8601(), None);
        let bad_hour = SystemTime { hour: 24, ..st };
        assert_eq!(bad_hour.to_iso8601(), None);
    }

    #[test]
    fn test_iso8601_far_dates() {
        // Largest tick count a FILETIME can hold
        let last = FileTime::from_quad(i64::MAX).to_iso8601().unwrap();
        assert!(last.ends_with("30828-09-14T02:48:05.4775807Z"), "{}", last);
    }

    #[test]
    fn test_date_time() {
        let dt = FileTime::from_quad(NEW_YEAR_2023).as_date_time().unwrap();
        assert_eq!(dt.unix_timestamp(), 1_672_531_200);
    }
}
