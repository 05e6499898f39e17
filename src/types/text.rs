//! adapters for the character and byte string types.

use core::any::TypeId;

use std::sync::Arc;

use bytes::Bytes;
use postgres_types::Oid;

use crate::{
    adapt::{AdaptersMap, Dumper, DumperEntry, DumperKey, Loader, LoaderEntry},
    errors::{Error, InterfaceError},
    oids,
    pq::Format,
    value::{downcast, SqlValue},
};

pub(crate) fn str_value(value: &dyn SqlValue) -> Result<&str, Error> {
    if let Some(v) = downcast::<String>(value) {
        return Ok(v);
    }
    if let Some(v) = downcast::<&'static str>(value) {
        return Ok(v);
    }
    Err(InterfaceError::new(format!("string dumper got a {}", value.type_name())).into())
}

/// dumper for host strings. oid 0 in text format so the server can infer the
/// column type; the binary form must commit to `text`.
struct StrDumper {
    key: DumperKey,
    format: Format,
}

impl Dumper for StrDumper {
    fn oid(&self) -> Oid {
        match self.format {
            Format::Text => oids::INVALID_OID,
            Format::Binary => oids::TEXT_OID,
        }
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let s = str_value(value)?;
        // the server cannot represent NUL in a text value in either format
        if s.as_bytes().contains(&0) {
            return Err(InterfaceError::new("string contains a NUL byte and cannot be dumped").into());
        }
        Ok(Bytes::copy_from_slice(s.as_bytes()))
    }
}

struct ByteaDumper {
    key: DumperKey,
    format: Format,
}

impl Dumper for ByteaDumper {
    fn oid(&self) -> Oid {
        oids::BYTEA_OID
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let bytes = downcast::<Vec<u8>>(value)
            .ok_or_else(|| InterfaceError::new(format!("bytea dumper got a {}", value.type_name())))?;
        match self.format {
            Format::Binary => Ok(Bytes::copy_from_slice(bytes)),
            Format::Text => {
                let mut out = String::with_capacity(2 + bytes.len() * 2);
                out.push_str("\\x");
                for b in bytes {
                    out.push_str(&format!("{b:02x}"));
                }
                Ok(Bytes::from(out))
            }
        }
    }

    fn quote(&self, value: &dyn SqlValue) -> Result<Vec<u8>, Error> {
        let bytes = downcast::<Vec<u8>>(value)
            .ok_or_else(|| InterfaceError::new(format!("bytea dumper got a {}", value.type_name())))?;
        let mut out = String::with_capacity(6 + bytes.len() * 2);
        out.push_str("'\\x");
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out.push_str("'::bytea");
        Ok(out.into_bytes())
    }
}

/// loader for every textual type, and the text format fallback for unknown
/// oids.
struct TextLoader;

impl Loader for TextLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        let s = core::str::from_utf8(raw)
            .map_err(|_| InterfaceError::new("text value is not valid utf8"))?;
        Ok(Box::new(s.to_string()))
    }
}

/// binary format fallback for unknown oids: bytes pass through untouched.
struct PassThroughLoader;

impl Loader for PassThroughLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        Ok(Box::new(raw.to_vec()))
    }
}

struct ByteaTextLoader;

impl Loader for ByteaTextLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        let hex = raw
            .strip_prefix(b"\\x")
            .ok_or_else(|| InterfaceError::new("bad bytea text representation"))?;
        if hex.len() % 2 != 0 {
            return Err(InterfaceError::new("bad bytea text representation").into());
        }
        let mut out = Vec::with_capacity(hex.len() / 2);
        for pair in hex.chunks_exact(2) {
            let hi = hex_digit(pair[0])?;
            let lo = hex_digit(pair[1])?;
            out.push((hi << 4) | lo);
        }
        Ok(Box::new(out))
    }
}

fn hex_digit(b: u8) -> Result<u8, Error> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(InterfaceError::new("bad hex digit in bytea value").into()),
    }
}

pub(crate) fn register(map: &mut AdaptersMap) {
    let str_dumper: crate::adapt::DumperFactory = |key, format, _| Ok(Arc::new(StrDumper { key, format }));
    let bytea_dumper: crate::adapt::DumperFactory = |key, format, _| Ok(Arc::new(ByteaDumper { key, format }));
    let text_loader: crate::adapt::LoaderFactory = |_, _, _| Ok(Arc::new(TextLoader));
    let pass_loader: crate::adapt::LoaderFactory = |_, _, _| Ok(Arc::new(PassThroughLoader));

    for format in [Format::Text, Format::Binary] {
        for type_id in [TypeId::of::<String>(), TypeId::of::<&'static str>()] {
            map.register_dumper(DumperKey::Type(type_id), DumperEntry { format, factory: str_dumper });
        }
        map.register_dumper(
            DumperKey::Type(TypeId::of::<Vec<u8>>()),
            DumperEntry { format, factory: bytea_dumper },
        );
        for oid in [
            oids::TEXT_OID,
            oids::VARCHAR_OID,
            oids::BPCHAR_OID,
            oids::NAME_OID,
            oids::UNKNOWN_OID,
        ] {
            map.register_loader(oid, LoaderEntry { format, factory: text_loader });
        }
    }

    // the INVALID_OID fallbacks: decode as string in text, pass bytes through
    // in binary
    map.register_loader(oids::INVALID_OID, LoaderEntry { format: Format::Text, factory: text_loader });
    map.register_loader(
        oids::INVALID_OID,
        LoaderEntry { format: Format::Binary, factory: pass_loader },
    );

    map.register_loader(
        oids::BYTEA_OID,
        LoaderEntry { format: Format::Text, factory: |_, _, _| Ok(Arc::new(ByteaTextLoader)) },
    );
    map.register_loader(
        oids::BYTEA_OID,
        LoaderEntry { format: Format::Binary, factory: pass_loader },
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn str_dump_rejects_nul() {
        let dumper = StrDumper {
            key: DumperKey::Type(TypeId::of::<String>()),
            format: Format::Binary,
        };
        let err = dumper.dump(&"a\0b".to_string()).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Interface);
    }

    #[test]
    fn bytea_text_round_trip() {
        let dumper = ByteaDumper {
            key: DumperKey::Type(TypeId::of::<Vec<u8>>()),
            format: Format::Text,
        };
        let data: Vec<u8> = vec![0x00, 0xff, 0x41];
        let raw = dumper.dump(&data).unwrap();
        assert_eq!(&raw[..], b"\\x00ff41");
        let loaded = ByteaTextLoader.load(&raw).unwrap();
        assert_eq!(downcast::<Vec<u8>>(&*loaded), Some(&data));
    }

    #[test]
    fn text_loader_decodes_utf8() {
        let loaded = TextLoader.load("héllo".as_bytes()).unwrap();
        assert_eq!(downcast::<String>(&*loaded).map(String::as_str), Some("héllo"));
    }
}
