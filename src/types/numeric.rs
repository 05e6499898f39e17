//! adapters for the integer and floating point types.
//!
//! integers upgrade dynamically: the dumper constructed for a host integer
//! type inspects each value's magnitude and asks for the narrowest server
//! type that holds it, so a `1` travels as int2 while `2^40` travels as int8.

use core::any::TypeId;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use postgres_protocol::types as pgtypes;
use postgres_types::Oid;

use crate::{
    adapt::{AdaptersMap, Dumper, DumperEntry, DumperKey, Loader, LoaderEntry, ParamFormat},
    errors::{Error, InterfaceError},
    oids,
    pq::Format,
    value::{downcast, SqlValue},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntWidth {
    Int2,
    Int4,
    Int8,
}

impl IntWidth {
    fn for_value(v: i64) -> Self {
        if (i16::MIN as i64..=i16::MAX as i64).contains(&v) {
            Self::Int2
        } else if (i32::MIN as i64..=i32::MAX as i64).contains(&v) {
            Self::Int4
        } else {
            Self::Int8
        }
    }

    fn oid(self) -> Oid {
        match self {
            Self::Int2 => oids::INT2_OID,
            Self::Int4 => oids::INT4_OID,
            Self::Int8 => oids::INT8_OID,
        }
    }

    fn key(self) -> DumperKey {
        match self {
            Self::Int2 => DumperKey::Name("int2"),
            Self::Int4 => DumperKey::Name("int4"),
            Self::Int8 => DumperKey::Name("int8"),
        }
    }
}

pub(crate) fn int_value(value: &dyn SqlValue) -> Result<i64, Error> {
    if let Some(v) = downcast::<i64>(value) {
        return Ok(*v);
    }
    if let Some(v) = downcast::<i32>(value) {
        return Ok(*v as i64);
    }
    if let Some(v) = downcast::<i16>(value) {
        return Ok(*v as i64);
    }
    Err(InterfaceError::new(format!("integer dumper got a {}", value.type_name())).into())
}

/// integer dumper for one wire format. `width` is `None` for the generic
/// instance the registry constructs; `get_key` demands the width matching
/// each value and `upgrade` pins it.
struct IntDumper {
    key: DumperKey,
    width: Option<IntWidth>,
    format: Format,
}

impl Dumper for IntDumper {
    fn oid(&self) -> Oid {
        match self.width {
            Some(width) => width.oid(),
            None => oids::INVALID_OID,
        }
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let v = int_value(value)?;
        match self.format {
            Format::Text => Ok(Bytes::from(v.to_string())),
            Format::Binary => {
                let mut buf = BytesMut::with_capacity(8);
                match self.width.unwrap_or(IntWidth::Int8) {
                    IntWidth::Int2 => pgtypes::int2_to_sql(narrow::<i16>(v)?, &mut buf),
                    IntWidth::Int4 => pgtypes::int4_to_sql(narrow::<i32>(v)?, &mut buf),
                    IntWidth::Int8 => pgtypes::int8_to_sql(v, &mut buf),
                }
                Ok(buf.freeze())
            }
        }
    }

    fn quote(&self, value: &dyn SqlValue) -> Result<Vec<u8>, Error> {
        Ok(int_value(value)?.to_string().into_bytes())
    }

    fn get_key(&self, value: &dyn SqlValue, _format: ParamFormat) -> DumperKey {
        match int_value(value) {
            Ok(v) => IntWidth::for_value(v).key(),
            Err(_) => self.key,
        }
    }

    fn upgrade(&self, value: &dyn SqlValue, _format: ParamFormat) -> Result<Arc<dyn Dumper>, Error> {
        let width = IntWidth::for_value(int_value(value)?);
        Ok(Arc::new(IntDumper {
            key: width.key(),
            width: Some(width),
            format: self.format,
        }))
    }
}

fn narrow<T: TryFrom<i64>>(v: i64) -> Result<T, Error> {
    T::try_from(v).map_err(|_| InterfaceError::new(format!("integer {v} out of range for its wire width")).into())
}

pub(crate) fn float_value(value: &dyn SqlValue) -> Result<f64, Error> {
    if let Some(v) = downcast::<f64>(value) {
        return Ok(*v);
    }
    if let Some(v) = downcast::<f32>(value) {
        return Ok(*v as f64);
    }
    Err(InterfaceError::new(format!("float dumper got a {}", value.type_name())).into())
}

struct FloatDumper {
    key: DumperKey,
    oid: Oid,
    format: Format,
}

impl Dumper for FloatDumper {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        match self.format {
            Format::Text => Ok(Bytes::from(float_text(float_value(value)?))),
            Format::Binary => {
                let mut buf = BytesMut::with_capacity(8);
                if self.oid == oids::FLOAT4_OID {
                    let v = downcast::<f32>(value)
                        .copied()
                        .ok_or_else(|| InterfaceError::new("float4 dumper got a non f32 value"))?;
                    pgtypes::float4_to_sql(v, &mut buf);
                } else {
                    pgtypes::float8_to_sql(float_value(value)?, &mut buf);
                }
                Ok(buf.freeze())
            }
        }
    }

    fn quote(&self, value: &dyn SqlValue) -> Result<Vec<u8>, Error> {
        let v = float_value(value)?;
        let text = float_text(v);
        // NaN and the infinities only parse back as quoted literals
        if v.is_finite() {
            Ok(text.into_bytes())
        } else {
            Ok(format!("'{text}'::float8").into_bytes())
        }
    }
}

fn float_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        let mut s = v.to_string();
        if s.contains('e') && !s.contains('.') {
            // keep the exponent form the server accepts
            s = format!("{v:e}");
        }
        s
    }
}

struct IntLoader {
    width: IntWidth,
    format: Format,
}

impl Loader for IntLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        match self.format {
            Format::Text => {
                let text = core::str::from_utf8(raw).map_err(bad_value)?;
                match self.width {
                    IntWidth::Int2 => Ok(Box::new(text.parse::<i16>().map_err(bad_value)?)),
                    IntWidth::Int4 => Ok(Box::new(text.parse::<i32>().map_err(bad_value)?)),
                    IntWidth::Int8 => Ok(Box::new(text.parse::<i64>().map_err(bad_value)?)),
                }
            }
            Format::Binary => match self.width {
                IntWidth::Int2 => Ok(Box::new(pgtypes::int2_from_sql(raw).map_err(bad_value)?)),
                IntWidth::Int4 => Ok(Box::new(pgtypes::int4_from_sql(raw).map_err(bad_value)?)),
                IntWidth::Int8 => Ok(Box::new(pgtypes::int8_from_sql(raw).map_err(bad_value)?)),
            },
        }
    }
}

struct OidLoader {
    format: Format,
}

impl Loader for OidLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        let v = match self.format {
            Format::Text => core::str::from_utf8(raw)
                .map_err(bad_value)?
                .parse::<u32>()
                .map_err(bad_value)?,
            Format::Binary => pgtypes::oid_from_sql(raw).map_err(bad_value)?,
        };
        // oid columns surface as i64 so every value fits
        Ok(Box::new(v as i64))
    }
}

struct FloatLoader {
    oid: Oid,
    format: Format,
}

impl Loader for FloatLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        match (self.format, self.oid) {
            (Format::Text, oid) => {
                let text = core::str::from_utf8(raw).map_err(bad_value)?;
                let v = parse_float_text(text)?;
                if oid == oids::FLOAT4_OID {
                    Ok(Box::new(v as f32))
                } else {
                    Ok(Box::new(v))
                }
            }
            (Format::Binary, oid) if oid == oids::FLOAT4_OID => {
                Ok(Box::new(pgtypes::float4_from_sql(raw).map_err(bad_value)?))
            }
            (Format::Binary, _) => Ok(Box::new(pgtypes::float8_from_sql(raw).map_err(bad_value)?)),
        }
    }
}

fn parse_float_text(text: &str) -> Result<f64, Error> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => text.parse::<f64>().map_err(bad_value),
    }
}

/// `numeric` loads as its text form: the corpus carries no arbitrary
/// precision decimal crate and silently rounding through f64 would be worse.
struct NumericTextLoader;

impl Loader for NumericTextLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        let text = core::str::from_utf8(raw).map_err(bad_value)?;
        Ok(Box::new(text.to_string()))
    }
}

fn bad_value(e: impl core::fmt::Display) -> Error {
    InterfaceError::new(format!("bad value for numeric type: {e}")).into()
}

pub(crate) fn register(map: &mut AdaptersMap) {
    let int_dumper: crate::adapt::DumperFactory = |key, format, _| {
        Ok(Arc::new(IntDumper {
            key,
            width: width_for_key(key),
            format,
        }))
    };
    let float_dumper: crate::adapt::DumperFactory = |key, format, _| {
        let oid = if key == DumperKey::Type(TypeId::of::<f32>()) {
            oids::FLOAT4_OID
        } else {
            oids::FLOAT8_OID
        };
        Ok(Arc::new(FloatDumper { key, oid, format }))
    };
    let int_loader: crate::adapt::LoaderFactory = |oid, format, _| {
        let width = match oid {
            oids::INT2_OID => IntWidth::Int2,
            oids::INT4_OID => IntWidth::Int4,
            _ => IntWidth::Int8,
        };
        Ok(Arc::new(IntLoader { width, format }))
    };
    let oid_loader: crate::adapt::LoaderFactory = |_, format, _| Ok(Arc::new(OidLoader { format }));
    let float_loader: crate::adapt::LoaderFactory = |oid, format, _| Ok(Arc::new(FloatLoader { oid, format }));

    for format in [Format::Text, Format::Binary] {
        for type_id in [TypeId::of::<i16>(), TypeId::of::<i32>(), TypeId::of::<i64>()] {
            map.register_dumper(DumperKey::Type(type_id), DumperEntry { format, factory: int_dumper });
        }
        for type_id in [TypeId::of::<f32>(), TypeId::of::<f64>()] {
            map.register_dumper(DumperKey::Type(type_id), DumperEntry { format, factory: float_dumper });
        }
        for oid in [oids::INT2_OID, oids::INT4_OID, oids::INT8_OID] {
            map.register_loader(oid, LoaderEntry { format, factory: int_loader });
        }
        map.register_loader(oids::OID_OID, LoaderEntry { format, factory: oid_loader });
        for oid in [oids::FLOAT4_OID, oids::FLOAT8_OID] {
            map.register_loader(oid, LoaderEntry { format, factory: float_loader });
        }
    }
    map.register_loader(
        oids::NUMERIC_OID,
        LoaderEntry {
            format: Format::Text,
            factory: |_, _, _| Ok(Arc::new(NumericTextLoader)),
        },
    );
}

fn width_for_key(key: DumperKey) -> Option<IntWidth> {
    match key {
        DumperKey::Type(id) if id == TypeId::of::<i16>() => Some(IntWidth::Int2),
        DumperKey::Type(id) if id == TypeId::of::<i32>() => Some(IntWidth::Int4),
        DumperKey::Name("int2") => Some(IntWidth::Int2),
        DumperKey::Name("int4") => Some(IntWidth::Int4),
        DumperKey::Name("int8") => Some(IntWidth::Int8),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::ParamFormat;

    #[test]
    fn int_width_thresholds() {
        assert_eq!(IntWidth::for_value(-(1 << 15)), IntWidth::Int2);
        assert_eq!(IntWidth::for_value((1 << 15) - 1), IntWidth::Int2);
        assert_eq!(IntWidth::for_value(1 << 15), IntWidth::Int4);
        assert_eq!(IntWidth::for_value(-(1 << 31)), IntWidth::Int4);
        assert_eq!(IntWidth::for_value((1 << 31) - 1), IntWidth::Int4);
        assert_eq!(IntWidth::for_value(1 << 31), IntWidth::Int8);
        assert_eq!(IntWidth::for_value(i64::MIN), IntWidth::Int8);
        assert_eq!(IntWidth::for_value(i64::MAX), IntWidth::Int8);
    }

    #[test]
    fn int_dumper_upgrades_by_magnitude() {
        let dumper = IntDumper {
            key: DumperKey::Type(TypeId::of::<i64>()),
            width: None,
            format: Format::Binary,
        };
        let v = 70_000i64;
        let key = dumper.get_key(&v, ParamFormat::Auto);
        assert_eq!(key, DumperKey::Name("int4"));
        let upgraded = dumper.upgrade(&v, ParamFormat::Auto).unwrap();
        assert_eq!(upgraded.oid(), oids::INT4_OID);
        assert_eq!(upgraded.dump(&v).unwrap().len(), 4);
    }

    #[test]
    fn int_text_dump() {
        let dumper = IntDumper {
            key: DumperKey::Type(TypeId::of::<i32>()),
            width: Some(IntWidth::Int4),
            format: Format::Text,
        };
        assert_eq!(&dumper.dump(&-42i32).unwrap()[..], b"-42");
    }

    #[test]
    fn int_loaders_round_trip() {
        let loader = IntLoader {
            width: IntWidth::Int8,
            format: Format::Text,
        };
        let loaded = loader.load(b"123").unwrap();
        assert_eq!(downcast::<i64>(&*loaded), Some(&123));
    }

    #[test]
    fn float_text_forms() {
        assert_eq!(float_text(f64::NAN), "NaN");
        assert_eq!(float_text(f64::INFINITY), "Infinity");
        assert_eq!(float_text(-1.5), "-1.5");
        let loaded = parse_float_text("NaN").unwrap();
        assert!(loaded.is_nan());
    }
}
