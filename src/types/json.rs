//! adapters for `json` and `jsonb`.

use core::any::TypeId;

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use postgres_types::Oid;

use crate::{
    adapt::{AdaptersMap, Dumper, DumperEntry, DumperKey, Loader, LoaderEntry},
    errors::{Error, InterfaceError},
    oids,
    pq::Format,
    value::{downcast, SqlValue},
};

const JSONB_VERSION: u8 = 1;

struct JsonDumper {
    key: DumperKey,
    format: Format,
}

impl Dumper for JsonDumper {
    fn oid(&self) -> Oid {
        oids::JSONB_OID
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let v = downcast::<serde_json::Value>(value)
            .ok_or_else(|| InterfaceError::new(format!("json dumper got a {}", value.type_name())))?;
        let text = serde_json::to_string(v).map_err(|e| InterfaceError::new(e.to_string()))?;
        match self.format {
            Format::Text => Ok(Bytes::from(text)),
            Format::Binary => {
                let mut buf = BytesMut::with_capacity(text.len() + 1);
                buf.put_u8(JSONB_VERSION);
                buf.extend_from_slice(text.as_bytes());
                Ok(buf.freeze())
            }
        }
    }
}

struct JsonLoader {
    oid: Oid,
    format: Format,
}

impl Loader for JsonLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        let data = match (self.format, self.oid) {
            (Format::Binary, oids::JSONB_OID) => match raw.split_first() {
                Some((&JSONB_VERSION, rest)) => rest,
                _ => return Err(InterfaceError::new("unknown jsonb binary version").into()),
            },
            _ => raw,
        };
        serde_json::from_slice::<serde_json::Value>(data)
            .map(|v| Box::new(v) as Box<dyn SqlValue>)
            .map_err(|e| InterfaceError::new(format!("bad json value: {e}")).into())
    }
}

pub(crate) fn register(map: &mut AdaptersMap) {
    let dumper: crate::adapt::DumperFactory = |key, format, _| Ok(Arc::new(JsonDumper { key, format }));
    let loader: crate::adapt::LoaderFactory = |oid, format, _| Ok(Arc::new(JsonLoader { oid, format }));

    for format in [Format::Text, Format::Binary] {
        map.register_dumper(
            DumperKey::Type(TypeId::of::<serde_json::Value>()),
            DumperEntry { format, factory: dumper },
        );
        map.register_loader(oids::JSON_OID, LoaderEntry { format, factory: loader });
        map.register_loader(oids::JSONB_OID, LoaderEntry { format, factory: loader });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn jsonb_binary_round_trip() {
        let v = json!({"a": [1, 2, null]});
        let dumper = JsonDumper {
            key: DumperKey::Type(TypeId::of::<serde_json::Value>()),
            format: Format::Binary,
        };
        let raw = dumper.dump(&v).unwrap();
        assert_eq!(raw[0], JSONB_VERSION);
        let loaded = JsonLoader {
            oid: oids::JSONB_OID,
            format: Format::Binary,
        }
        .load(&raw)
        .unwrap();
        assert_eq!(downcast::<serde_json::Value>(&*loaded), Some(&v));
    }

    #[test]
    fn json_text_load() {
        let loaded = JsonLoader {
            oid: oids::JSON_OID,
            format: Format::Text,
        }
        .load(br#"{"k": true}"#)
        .unwrap();
        assert_eq!(downcast::<serde_json::Value>(&*loaded), Some(&json!({"k": true})));
    }
}
