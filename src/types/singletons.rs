use core::any::TypeId;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use postgres_protocol::types as pgtypes;
use postgres_types::Oid;

use crate::{
    adapt::{AdaptersMap, Dumper, DumperEntry, DumperKey, Loader, LoaderEntry},
    errors::{Error, InterfaceError},
    oids,
    pq::Format,
    value::{downcast, SqlValue},
};

struct BoolTextDumper;

impl Dumper for BoolTextDumper {
    fn oid(&self) -> Oid {
        oids::BOOL_OID
    }

    fn format(&self) -> Format {
        Format::Text
    }

    fn key(&self) -> DumperKey {
        DumperKey::Type(TypeId::of::<bool>())
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let v = bool_value(value)?;
        Ok(Bytes::from_static(if v { b"t" } else { b"f" }))
    }

    fn quote(&self, value: &dyn SqlValue) -> Result<Vec<u8>, Error> {
        let v = bool_value(value)?;
        Ok(if v { b"true".to_vec() } else { b"false".to_vec() })
    }
}

struct BoolBinaryDumper;

impl Dumper for BoolBinaryDumper {
    fn oid(&self) -> Oid {
        oids::BOOL_OID
    }

    fn format(&self) -> Format {
        Format::Binary
    }

    fn key(&self) -> DumperKey {
        DumperKey::Type(TypeId::of::<bool>())
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let mut buf = BytesMut::with_capacity(1);
        pgtypes::bool_to_sql(bool_value(value)?, &mut buf);
        Ok(buf.freeze())
    }
}

fn bool_value(value: &dyn SqlValue) -> Result<bool, Error> {
    downcast::<bool>(value)
        .copied()
        .ok_or_else(|| InterfaceError::new(format!("bool dumper got a {}", value.type_name())).into())
}

struct BoolTextLoader;

impl Loader for BoolTextLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        match raw {
            b"t" => Ok(Box::new(true)),
            b"f" => Ok(Box::new(false)),
            _ => Err(InterfaceError::new("bad bool text representation").into()),
        }
    }
}

struct BoolBinaryLoader;

impl Loader for BoolBinaryLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        pgtypes::bool_from_sql(raw)
            .map(|v| Box::new(v) as Box<dyn SqlValue>)
            .map_err(|e| InterfaceError::new(e.to_string()).into())
    }
}

pub(crate) fn register(map: &mut AdaptersMap) {
    map.register_dumper(
        DumperKey::Type(TypeId::of::<bool>()),
        DumperEntry {
            format: Format::Text,
            factory: |_, _, _| Ok(Arc::new(BoolTextDumper)),
        },
    );
    map.register_dumper(
        DumperKey::Type(TypeId::of::<bool>()),
        DumperEntry {
            format: Format::Binary,
            factory: |_, _, _| Ok(Arc::new(BoolBinaryDumper)),
        },
    );
    map.register_loader(
        oids::BOOL_OID,
        LoaderEntry {
            format: Format::Text,
            factory: |_, _, _| Ok(Arc::new(BoolTextLoader)),
        },
    );
    map.register_loader(
        oids::BOOL_OID,
        LoaderEntry {
            format: Format::Binary,
            factory: |_, _, _| Ok(Arc::new(BoolBinaryLoader)),
        },
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bool_text_round_trip() {
        let dumper = BoolTextDumper;
        let raw = dumper.dump(&true).unwrap();
        assert_eq!(&raw[..], b"t");
        let loaded = BoolTextLoader.load(&raw).unwrap();
        assert_eq!(downcast::<bool>(&*loaded), Some(&true));
    }

    #[test]
    fn bool_binary_round_trip() {
        let raw = BoolBinaryDumper.dump(&false).unwrap();
        let loaded = BoolBinaryLoader.load(&raw).unwrap();
        assert_eq!(downcast::<bool>(&*loaded), Some(&false));
    }
}
