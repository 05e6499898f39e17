//! adapters for the date and time types.
//!
//! binary forms use the server epoch (2000-01-01) with microsecond
//! resolution. `timestamptz` always travels as utc on the wire; on load the
//! session offset from the adaptation context is applied when known.

use core::any::TypeId;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc,
};
use postgres_protocol::types as pgtypes;
use postgres_types::Oid;

use crate::{
    adapt::{AdaptContext, AdaptersMap, Dumper, DumperEntry, DumperKey, Loader, LoaderEntry},
    errors::{Error, InterfaceError},
    oids,
    pq::Format,
    value::{downcast, SqlValue},
};

fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("valid constant date")
}

fn pg_epoch_datetime() -> NaiveDateTime {
    pg_epoch_date().and_hms_opt(0, 0, 0).expect("valid constant time")
}

struct DateDumper {
    key: DumperKey,
    format: Format,
}

impl Dumper for DateDumper {
    fn oid(&self) -> Oid {
        oids::DATE_OID
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let date = downcast::<NaiveDate>(value)
            .ok_or_else(|| InterfaceError::new(format!("date dumper got a {}", value.type_name())))?;
        match self.format {
            Format::Text => Ok(Bytes::from(date.format("%Y-%m-%d").to_string())),
            Format::Binary => {
                let days = (*date - pg_epoch_date()).num_days();
                let days = i32::try_from(days)
                    .map_err(|_| InterfaceError::new("date out of range for the wire format"))?;
                let mut buf = BytesMut::with_capacity(4);
                pgtypes::date_to_sql(days, &mut buf);
                Ok(buf.freeze())
            }
        }
    }
}

struct TimeDumper {
    key: DumperKey,
    format: Format,
}

pub(crate) fn time_to_micros(time: &NaiveTime) -> i64 {
    let since_midnight = *time - NaiveTime::from_hms_opt(0, 0, 0).expect("valid constant time");
    since_midnight.num_microseconds().unwrap_or(0)
}

impl Dumper for TimeDumper {
    fn oid(&self) -> Oid {
        oids::TIME_OID
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let time = downcast::<NaiveTime>(value)
            .ok_or_else(|| InterfaceError::new(format!("time dumper got a {}", value.type_name())))?;
        match self.format {
            Format::Text => Ok(Bytes::from(time.format("%H:%M:%S%.6f").to_string())),
            Format::Binary => {
                let mut buf = BytesMut::with_capacity(8);
                pgtypes::time_to_sql(time_to_micros(time), &mut buf);
                Ok(buf.freeze())
            }
        }
    }
}

struct TimestampDumper {
    key: DumperKey,
    format: Format,
}

impl Dumper for TimestampDumper {
    fn oid(&self) -> Oid {
        oids::TIMESTAMP_OID
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let dt = downcast::<NaiveDateTime>(value)
            .ok_or_else(|| InterfaceError::new(format!("timestamp dumper got a {}", value.type_name())))?;
        match self.format {
            Format::Text => Ok(Bytes::from(dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string())),
            Format::Binary => {
                let micros = micros_since_epoch(dt)?;
                let mut buf = BytesMut::with_capacity(8);
                pgtypes::timestamp_to_sql(micros, &mut buf);
                Ok(buf.freeze())
            }
        }
    }
}

fn micros_since_epoch(dt: &NaiveDateTime) -> Result<i64, Error> {
    (*dt - pg_epoch_datetime())
        .num_microseconds()
        .ok_or_else(|| InterfaceError::new("timestamp out of range for the wire format").into())
}

struct TimestampTzDumper {
    key: DumperKey,
    format: Format,
}

fn tz_value(value: &dyn SqlValue) -> Result<DateTime<Utc>, Error> {
    if let Some(v) = downcast::<DateTime<Utc>>(value) {
        return Ok(*v);
    }
    if let Some(v) = downcast::<DateTime<FixedOffset>>(value) {
        return Ok(v.with_timezone(&Utc));
    }
    Err(InterfaceError::new(format!("timestamptz dumper got a {}", value.type_name())).into())
}

impl Dumper for TimestampTzDumper {
    fn oid(&self) -> Oid {
        oids::TIMESTAMPTZ_OID
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let utc = tz_value(value)?;
        match self.format {
            Format::Text => Ok(Bytes::from(utc.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string())),
            Format::Binary => {
                let micros = micros_since_epoch(&utc.naive_utc())?;
                let mut buf = BytesMut::with_capacity(8);
                pgtypes::timestamp_to_sql(micros, &mut buf);
                Ok(buf.freeze())
            }
        }
    }
}

struct DateLoader {
    format: Format,
}

impl Loader for DateLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        match self.format {
            Format::Text => {
                let text = utf8(raw)?;
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .map(|v| Box::new(v) as Box<dyn SqlValue>)
                    .map_err(|e| bad_value("date", e))
            }
            Format::Binary => {
                let days = pgtypes::date_from_sql(raw).map_err(|e| bad_value("date", e))?;
                pg_epoch_date()
                    .checked_add_signed(Duration::days(days as i64))
                    .map(|v| Box::new(v) as Box<dyn SqlValue>)
                    .ok_or_else(|| bad_value("date", "out of range"))
            }
        }
    }
}

struct TimeLoader {
    format: Format,
}

impl Loader for TimeLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        match self.format {
            Format::Text => {
                let text = utf8(raw)?;
                NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                    .map(|v| Box::new(v) as Box<dyn SqlValue>)
                    .map_err(|e| bad_value("time", e))
            }
            Format::Binary => {
                let micros = pgtypes::time_from_sql(raw).map_err(|e| bad_value("time", e))?;
                let midnight = NaiveTime::from_hms_opt(0, 0, 0).expect("valid constant time");
                let (time, _) = midnight.overflowing_add_signed(Duration::microseconds(micros));
                Ok(Box::new(time))
            }
        }
    }
}

struct TimestampLoader {
    format: Format,
}

impl Loader for TimestampLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        match self.format {
            Format::Text => {
                let text = utf8(raw)?;
                NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                    .map(|v| Box::new(v) as Box<dyn SqlValue>)
                    .map_err(|e| bad_value("timestamp", e))
            }
            Format::Binary => {
                let micros = pgtypes::timestamp_from_sql(raw).map_err(|e| bad_value("timestamp", e))?;
                pg_epoch_datetime()
                    .checked_add_signed(Duration::microseconds(micros))
                    .map(|v| Box::new(v) as Box<dyn SqlValue>)
                    .ok_or_else(|| bad_value("timestamp", "out of range"))
            }
        }
    }
}

struct TimestampTzLoader {
    format: Format,
    timezone: Option<FixedOffset>,
}

impl Loader for TimestampTzLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        match self.format {
            Format::Text => {
                let text = utf8(raw)?;
                DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                    .map(|v| Box::new(v) as Box<dyn SqlValue>)
                    .map_err(|e| bad_value("timestamptz", e))
            }
            Format::Binary => {
                let micros = pgtypes::timestamp_from_sql(raw).map_err(|e| bad_value("timestamptz", e))?;
                let naive = pg_epoch_datetime()
                    .checked_add_signed(Duration::microseconds(micros))
                    .ok_or_else(|| bad_value("timestamptz", "out of range"))?;
                let utc = Utc.from_utc_datetime(&naive);
                // normalise into the session timezone when its offset is known
                let offset = self.timezone.unwrap_or_else(|| Utc.fix());
                Ok(Box::new(utc.with_timezone(&offset)))
            }
        }
    }
}

fn utf8(raw: &[u8]) -> Result<&str, Error> {
    core::str::from_utf8(raw).map_err(|_| InterfaceError::new("datetime value is not valid utf8").into())
}

fn bad_value(what: &str, e: impl core::fmt::Display) -> Error {
    InterfaceError::new(format!("bad {what} value: {e}")).into()
}

pub(crate) fn register(map: &mut AdaptersMap) {
    let date_dumper: crate::adapt::DumperFactory = |key, format, _| Ok(Arc::new(DateDumper { key, format }));
    let time_dumper: crate::adapt::DumperFactory = |key, format, _| Ok(Arc::new(TimeDumper { key, format }));
    let ts_dumper: crate::adapt::DumperFactory = |key, format, _| Ok(Arc::new(TimestampDumper { key, format }));
    let tstz_dumper: crate::adapt::DumperFactory =
        |key, format, _| Ok(Arc::new(TimestampTzDumper { key, format }));

    let date_loader: crate::adapt::LoaderFactory = |_, format, _| Ok(Arc::new(DateLoader { format }));
    let time_loader: crate::adapt::LoaderFactory = |_, format, _| Ok(Arc::new(TimeLoader { format }));
    let ts_loader: crate::adapt::LoaderFactory = |_, format, _| Ok(Arc::new(TimestampLoader { format }));
    let tstz_loader: crate::adapt::LoaderFactory = |_, format, ctx: &AdaptContext| {
        Ok(Arc::new(TimestampTzLoader {
            format,
            timezone: ctx.timezone,
        }))
    };

    for format in [Format::Text, Format::Binary] {
        map.register_dumper(
            DumperKey::Type(TypeId::of::<NaiveDate>()),
            DumperEntry { format, factory: date_dumper },
        );
        map.register_dumper(
            DumperKey::Type(TypeId::of::<NaiveTime>()),
            DumperEntry { format, factory: time_dumper },
        );
        map.register_dumper(
            DumperKey::Type(TypeId::of::<NaiveDateTime>()),
            DumperEntry { format, factory: ts_dumper },
        );
        for type_id in [
            TypeId::of::<DateTime<Utc>>(),
            TypeId::of::<DateTime<FixedOffset>>(),
        ] {
            map.register_dumper(DumperKey::Type(type_id), DumperEntry { format, factory: tstz_dumper });
        }

        map.register_loader(oids::DATE_OID, LoaderEntry { format, factory: date_loader });
        map.register_loader(oids::TIME_OID, LoaderEntry { format, factory: time_loader });
        map.register_loader(oids::TIMESTAMP_OID, LoaderEntry { format, factory: ts_loader });
        map.register_loader(oids::TIMESTAMPTZ_OID, LoaderEntry { format, factory: tstz_loader });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn date_text_round_trip() {
        let date = NaiveDate::from_ymd_opt(2021, 3, 14).unwrap();
        let dumper = DateDumper {
            key: DumperKey::Type(TypeId::of::<NaiveDate>()),
            format: Format::Text,
        };
        let raw = dumper.dump(&date).unwrap();
        assert_eq!(&raw[..], b"2021-03-14");
        let loaded = DateLoader { format: Format::Text }.load(&raw).unwrap();
        assert_eq!(downcast::<NaiveDate>(&*loaded), Some(&date));
    }

    #[test]
    fn date_binary_round_trip() {
        let date = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();
        let dumper = DateDumper {
            key: DumperKey::Type(TypeId::of::<NaiveDate>()),
            format: Format::Binary,
        };
        let raw = dumper.dump(&date).unwrap();
        let loaded = DateLoader { format: Format::Binary }.load(&raw).unwrap();
        assert_eq!(downcast::<NaiveDate>(&*loaded), Some(&date));
    }

    #[test]
    fn timestamp_binary_round_trip() {
        let dt = NaiveDate::from_ymd_opt(2021, 6, 1)
            .unwrap()
            .and_hms_micro_opt(12, 30, 45, 123456)
            .unwrap();
        let dumper = TimestampDumper {
            key: DumperKey::Type(TypeId::of::<NaiveDateTime>()),
            format: Format::Binary,
        };
        let raw = dumper.dump(&dt).unwrap();
        let loaded = TimestampLoader { format: Format::Binary }.load(&raw).unwrap();
        assert_eq!(downcast::<NaiveDateTime>(&*loaded), Some(&dt));
    }

    #[test]
    fn timestamptz_text_parses_short_offset() {
        let loader = TimestampTzLoader {
            format: Format::Text,
            timezone: None,
        };
        let loaded = loader.load(b"2021-06-01 10:00:00+02").unwrap();
        let dt = downcast::<DateTime<FixedOffset>>(&*loaded).unwrap();
        assert_eq!(dt.offset().local_minus_utc(), 2 * 3600);
    }

    #[test]
    fn timestamptz_binary_is_utc_micros() {
        let dt = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 1).unwrap();
        let dumper = TimestampTzDumper {
            key: DumperKey::Type(TypeId::of::<DateTime<Utc>>()),
            format: Format::Binary,
        };
        let raw = dumper.dump(&dt).unwrap();
        assert_eq!(&raw[..], 1_000_000i64.to_be_bytes());
    }
}
