//! entry point into the adaptation system.
//!
//! [`AdaptersMap`] maps host type keys to dumpers and oids to loaders. maps
//! start empty or layered over a template; layers are copy on write, so
//! deriving a connection map from the global one, or a cursor map from a
//! connection's, costs one `Arc` clone per format until the first
//! customisation.

use core::any::TypeId;

use std::sync::{Arc, OnceLock, RwLock};

use bytes::Bytes;
use postgres_types::Oid;

use crate::{
    errors::{Error, ProgrammingError},
    oids,
    pq::Format,
    sql,
    typeinfo::TypesRegistry,
    value::SqlValue,
};

/// format requested by a query placeholder: `%s` adapts automatically, `%t`
/// forces the text form, `%b` the binary form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamFormat {
    Auto,
    Text,
    Binary,
}

/// key a dumper is registered and cached under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DumperKey {
    /// a concrete host type.
    Type(TypeId),
    /// a container specialised by its element type.
    Pair(TypeId, TypeId),
    /// a type referenced by name before its first value is seen.
    Name(&'static str),
}

/// context a dumper or loader is constructed against: the session state that
/// affects adaptation but never changes within one query.
#[derive(Clone, Default)]
pub struct AdaptContext {
    pub adapters: Arc<AdaptersMap>,
    /// session client encoding. the crate always talks utf8 to the server.
    pub encoding: Option<Arc<str>>,
    /// session TimeZone, for loading `timestamptz`.
    pub timezone: Option<chrono::FixedOffset>,
}

/// converter from a host value to wire bytes.
///
/// a dumper is constructed once per (type key, format) per query and reused
/// for every value of that type. [`Dumper::get_key`] lets an instance demand
/// a richer key for a specific value — an integer dumper picking int2/int4/
/// int8 by magnitude, a list dumper picking its array oid by element type —
/// and [`Dumper::upgrade`] builds the specialised instance for that key.
pub trait Dumper: Send + Sync {
    /// the oid sent to the server. 0 leaves the type to server inference.
    fn oid(&self) -> Oid;

    /// the wire format this dumper produces.
    fn format(&self) -> Format;

    /// the key this instance was constructed under.
    fn key(&self) -> DumperKey;

    /// convert the value to its wire representation.
    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error>;

    /// convert the value to a form safe to embed in a sql literal.
    fn quote(&self, value: &dyn SqlValue) -> Result<Vec<u8>, Error> {
        let raw = self.dump(value)?;
        let text = core::str::from_utf8(&raw)
            .map_err(|_| ProgrammingError::new("cannot quote a non textual value"))?;
        Ok(sql::quote_literal(text).into_bytes())
    }

    /// key identifying the dumper actually able to represent `value`.
    /// returning something other than [`Dumper::key`] requests an upgrade.
    fn get_key(&self, value: &dyn SqlValue, format: ParamFormat) -> DumperKey {
        let _ = (value, format);
        self.key()
    }

    /// build the dumper for the key [`Dumper::get_key`] returned for `value`.
    fn upgrade(&self, value: &dyn SqlValue, format: ParamFormat) -> Result<Arc<dyn Dumper>, Error> {
        let _ = (value, format);
        Err(crate::errors::InternalError::new("dumper demanded an upgrade it does not implement").into())
    }
}

/// converter from wire bytes to a host value.
pub trait Loader: Send + Sync {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error>;
}

/// constructor for a dumper: called with the key it was found under and the
/// format of its registration.
pub type DumperFactory = fn(DumperKey, Format, &AdaptContext) -> Result<Arc<dyn Dumper>, Error>;

/// constructor for a loader: called with the oid it was found under and the
/// format of its registration.
pub type LoaderFactory = fn(Oid, Format, &AdaptContext) -> Result<Arc<dyn Loader>, Error>;

#[derive(Clone, Copy)]
pub struct DumperEntry {
    pub format: Format,
    pub factory: DumperFactory,
}

#[derive(Clone, Copy)]
pub struct LoaderEntry {
    pub format: Format,
    pub factory: LoaderFactory,
}

/// copy on write map layer. `owned` is true iff the map has been mutated
/// since it was layered; mutation promotes the layer to a private copy first.
#[derive(Debug, Clone)]
struct CowMap<K, V> {
    inner: Arc<std::collections::HashMap<K, V>>,
    owned: bool,
}

impl<K, V> Default for CowMap<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(std::collections::HashMap::new()),
            owned: true,
        }
    }
}

impl<K, V> CowMap<K, V>
where
    K: core::hash::Hash + Eq + Clone,
    V: Clone,
{
    fn layer(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            owned: false,
        }
    }

    fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    fn insert(&mut self, key: K, value: V) {
        if !self.owned {
            self.inner = Arc::new((*self.inner).clone());
            self.owned = true;
        }
        Arc::make_mut(&mut self.inner).insert(key, value);
    }

    #[cfg(test)]
    fn is_owned(&self) -> bool {
        self.owned
    }
}

/// the layered dumper and loader maps plus the types catalogue.
#[derive(Clone, Default)]
pub struct AdaptersMap {
    // index 0 text, 1 binary
    dumpers: [CowMap<DumperKey, DumperEntry>; 2],
    loaders: [CowMap<Oid, LoaderEntry>; 2],
    pub types: TypesRegistry,
}

fn fmt_index(format: Format) -> usize {
    match format {
        Format::Text => 0,
        Format::Binary => 1,
    }
}

impl AdaptersMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// derive a cheap child map. promotion to a private copy happens on the
    /// first registration, per format.
    pub fn layer(template: &Self) -> Self {
        Self {
            dumpers: [template.dumpers[0].layer(), template.dumpers[1].layer()],
            loaders: [template.loaders[0].layer(), template.loaders[1].layer()],
            types: template.types.clone(),
        }
    }

    pub fn register_dumper(&mut self, key: DumperKey, entry: DumperEntry) {
        self.dumpers[fmt_index(entry.format)].insert(key, entry);
    }

    pub fn register_loader(&mut self, oid: Oid, entry: LoaderEntry) {
        self.loaders[fmt_index(entry.format)].insert(oid, entry);
    }

    /// register a loader under a type name resolved through the catalogue.
    pub fn register_loader_by_name(&mut self, name: &str, entry: LoaderEntry) -> Result<(), Error> {
        let oid = self
            .types
            .get_by_name(name)
            .map(|info| info.oid())
            .ok_or_else(|| ProgrammingError::new(format!("unknown type name {name:?}")))?;
        self.register_loader(oid, entry);
        Ok(())
    }

    /// find the dumper class for a host type.
    ///
    /// `Auto` searches binary first then text, except for string types which
    /// stay textual to preserve the server's type inference. `name` is the
    /// stable type name tried when no registration by [`TypeId`] exists.
    pub fn get_dumper(
        &self,
        key: DumperKey,
        name: &'static str,
        format: ParamFormat,
    ) -> Result<DumperEntry, Error> {
        let lookup = |fmt: Format| {
            self.dumpers[fmt_index(fmt)]
                .get(&key)
                .or_else(|| self.dumpers[fmt_index(fmt)].get(&DumperKey::Name(name)))
                .copied()
        };
        let found = match format {
            ParamFormat::Auto => {
                let binary = if is_string_key(key) { None } else { lookup(Format::Binary) };
                binary.or_else(|| lookup(Format::Text))
            }
            ParamFormat::Text => lookup(Format::Text),
            ParamFormat::Binary => lookup(Format::Binary),
        };
        found.ok_or_else(|| cannot_adapt(name, format))
    }

    /// find the loader class for an oid. a miss is legal; the caller falls
    /// back to the unknown-oid loader of the format.
    pub fn get_loader(&self, oid: Oid, format: Format) -> Option<LoaderEntry> {
        self.loaders[fmt_index(format)].get(&oid).copied()
    }
}

fn is_string_key(key: DumperKey) -> bool {
    match key {
        DumperKey::Type(id) => id == TypeId::of::<String>() || id == TypeId::of::<&'static str>(),
        _ => false,
    }
}

#[cold]
#[inline(never)]
fn cannot_adapt(name: &str, format: ParamFormat) -> Error {
    ProgrammingError::new(format!("cannot adapt type {name:?} to format {format:?}")).into()
}

/// the process wide registry new connections layer their maps over.
///
/// mutation is permitted through the registration apis; connections snapshot
/// it at creation time.
pub fn global_adapters() -> &'static RwLock<AdaptersMap> {
    static GLOBAL: OnceLock<RwLock<AdaptersMap>> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        let mut map = AdaptersMap {
            types: TypesRegistry::builtin(),
            ..AdaptersMap::default()
        };
        crate::types::register_default_adapters(&mut map);
        RwLock::new(map)
    })
}

/// the loader oid used when no loader is registered for a result column:
/// text decodes to a string, binary passes bytes through.
pub const INVALID_OID: Oid = oids::INVALID_OID;

#[cfg(test)]
mod test {
    use super::*;

    fn probe_dumper(_: DumperKey, _: Format, _: &AdaptContext) -> Result<Arc<dyn Dumper>, Error> {
        unreachable!("factory is never constructed in these tests")
    }

    #[test]
    fn layer_promotes_on_write() {
        let mut base = AdaptersMap::new();
        base.register_dumper(
            DumperKey::Type(TypeId::of::<i32>()),
            DumperEntry {
                format: Format::Binary,
                factory: probe_dumper,
            },
        );

        let mut child = AdaptersMap::layer(&base);
        assert!(!child.dumpers[1].is_owned());
        // lookup through the layer sees the template entry
        assert!(child
            .get_dumper(DumperKey::Type(TypeId::of::<i32>()), "i32", ParamFormat::Binary)
            .is_ok());

        child.register_dumper(
            DumperKey::Type(TypeId::of::<i64>()),
            DumperEntry {
                format: Format::Binary,
                factory: probe_dumper,
            },
        );
        assert!(child.dumpers[1].is_owned());
        // the template does not see the child registration
        assert!(base
            .get_dumper(DumperKey::Type(TypeId::of::<i64>()), "i64", ParamFormat::Binary)
            .is_err());
    }

    #[test]
    fn auto_format_prefers_binary_except_strings() {
        let mut map = AdaptersMap::new();
        map.register_dumper(
            DumperKey::Type(TypeId::of::<String>()),
            DumperEntry {
                format: Format::Binary,
                factory: probe_dumper,
            },
        );
        map.register_dumper(
            DumperKey::Type(TypeId::of::<String>()),
            DumperEntry {
                format: Format::Text,
                factory: probe_dumper,
            },
        );
        let entry = map
            .get_dumper(DumperKey::Type(TypeId::of::<String>()), "alloc::string::String", ParamFormat::Auto)
            .unwrap();
        assert_eq!(entry.format, Format::Text);
    }

    #[test]
    fn missing_dumper_is_a_programming_error() {
        let map = AdaptersMap::new();
        let err = map
            .get_dumper(DumperKey::Type(TypeId::of::<i32>()), "i32", ParamFormat::Auto)
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Programming);
    }
}
