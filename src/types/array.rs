//! adapters for array types.
//!
//! dumping dispatches on the element type: the base list dumper asks for an
//! upgrade keyed by `(list, element)` and the upgraded instance carries the
//! element dumper plus the array oid resolved through the types catalogue.
//! loading resolves the element loader the same way, through the oid the
//! array was described with.

use core::any::TypeId;
use core::fmt;

use std::io::Read;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use postgres_types::Oid;

use crate::{
    adapt::{
        AdaptContext, AdaptersMap, Dumper, DumperEntry, DumperKey, Loader, LoaderEntry, ParamFormat,
    },
    errors::{Error, InterfaceError, ProgrammingError},
    oids,
    pq::Format,
    value::{ListValue, SqlValue},
};

/// an array loaded from the server: elements in row major order plus the
/// dimension vector.
pub struct PgArray {
    items: Vec<ArrayCell>,
    dims: Vec<usize>,
}

pub(crate) struct ArrayCell(pub(crate) Option<Box<dyn SqlValue>>);

impl fmt::Debug for ArrayCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(v) => v.fmt(f),
            None => f.write_str("NULL"),
        }
    }
}

impl SqlValue for ArrayCell {
    fn as_any(&self) -> &dyn core::any::Any {
        self
    }

    fn unwrap_opt(&self) -> Option<&dyn SqlValue> {
        self.0.as_deref().and_then(|v| v.unwrap_opt())
    }

    fn type_name(&self) -> &'static str {
        "array element"
    }
}

impl fmt::Debug for PgArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgArray")
            .field("dims", &self.dims)
            .field("items", &self.items)
            .finish()
    }
}

impl PgArray {
    pub(crate) fn new(items: Vec<ArrayCell>, dims: Vec<usize>) -> Self {
        Self { items, dims }
    }

    /// total number of elements, across every dimension.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// sizes of each dimension. empty for the empty array.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// element in row major order. `None` is the sql NULL.
    pub fn get(&self, idx: usize) -> Option<&dyn SqlValue> {
        self.items
            .as_slice()
            .get(idx)
            .and_then(|cell| cell.0.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&dyn SqlValue>> {
        self.items.iter().map(|cell| cell.0.as_deref())
    }
}

impl SqlValue for PgArray {
    fn as_any(&self) -> &dyn core::any::Any {
        self
    }

    fn unwrap_opt(&self) -> Option<&dyn SqlValue> {
        Some(self)
    }

    fn type_name(&self) -> &'static str {
        "PgArray"
    }

    fn as_list(&self) -> Option<&dyn ListValue> {
        Some(self)
    }
}

impl ListValue for PgArray {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(&self, idx: usize) -> &dyn SqlValue {
        &self.items[idx]
    }
}

/// the dumper constructed for a plain list key, before the element type is
/// known. its only job is to demand the `(list, element)` upgrade.
struct ListDumper {
    key: DumperKey,
    format: Format,
    ctx: AdaptContext,
}

impl Dumper for ListDumper {
    fn oid(&self) -> Oid {
        // all-null and empty lists keep oid 0 so the server infers the type
        oids::INVALID_OID
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        // reachable only for lists with no typed element
        let list = list_of(value)?;
        match self.format {
            Format::Text => {
                let mut out = Vec::new();
                dump_untyped_text(list, &mut out)?;
                Ok(Bytes::from(out))
            }
            Format::Binary => dump_binary(list, None, oids::INVALID_OID),
        }
    }

    fn get_key(&self, value: &dyn SqlValue, _format: ParamFormat) -> DumperKey {
        let outer = value.as_any().type_id();
        match value.as_list().and_then(|l| l.element_type()) {
            Some(elem) => DumperKey::Pair(outer, elem),
            None => self.key,
        }
    }

    fn upgrade(&self, value: &dyn SqlValue, format: ParamFormat) -> Result<Arc<dyn Dumper>, Error> {
        let list = list_of(value)?;
        let elem = first_element(list)
            .ok_or_else(|| InterfaceError::new("list upgrade requested without a typed element"))?;

        let param_format = match self.format {
            Format::Text => ParamFormat::Text,
            Format::Binary => ParamFormat::Binary,
        };
        let entry = self
            .ctx
            .adapters
            .get_dumper(DumperKey::Type(elem.as_any().type_id()), elem.type_name(), param_format)?;
        let mut elem_dumper = (entry.factory)(DumperKey::Type(elem.as_any().type_id()), entry.format, &self.ctx)?;
        // element dumpers may themselves specialise, e.g. integers by width
        let elem_key = elem_dumper.get_key(elem, format);
        if elem_key != elem_dumper.key() {
            elem_dumper = elem_dumper.upgrade(elem, format)?;
        }

        let elem_oid = elem_dumper.oid();
        let array_oid = self
            .ctx
            .adapters
            .types
            .get_by_oid(elem_oid)
            .map(|info| info.array_oid())
            .unwrap_or(oids::INVALID_OID);

        Ok(Arc::new(ArrayDumper {
            key: self.get_key(value, format),
            format: self.format,
            elem: elem_dumper,
            elem_oid,
            array_oid,
        }))
    }
}

struct ArrayDumper {
    key: DumperKey,
    format: Format,
    elem: Arc<dyn Dumper>,
    elem_oid: Oid,
    array_oid: Oid,
}

impl Dumper for ArrayDumper {
    fn oid(&self) -> Oid {
        self.array_oid
    }

    fn format(&self) -> Format {
        self.format
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let list = list_of(value)?;
        match self.format {
            Format::Text => {
                let mut out = Vec::new();
                dump_text(list, &*self.elem, &mut out)?;
                Ok(Bytes::from(out))
            }
            Format::Binary => dump_binary(list, Some(&*self.elem), self.elem_oid),
        }
    }

    fn get_key(&self, value: &dyn SqlValue, _format: ParamFormat) -> DumperKey {
        let outer = value.as_any().type_id();
        match value.as_list().and_then(|l| l.element_type()) {
            Some(elem) => DumperKey::Pair(outer, elem),
            None => self.key,
        }
    }
}

fn list_of(value: &dyn SqlValue) -> Result<&dyn ListValue, Error> {
    value
        .as_list()
        .ok_or_else(|| InterfaceError::new(format!("array dumper got a {}", value.type_name())).into())
}

fn first_element(list: &dyn ListValue) -> Option<&dyn SqlValue> {
    for i in 0..list.len() {
        match list.get(i).unwrap_opt() {
            None => continue,
            Some(inner) => match inner.as_list() {
                Some(nested) => {
                    if let Some(elem) = first_element(nested) {
                        return Some(elem);
                    }
                }
                None => return Some(inner),
            },
        }
    }
    None
}

fn dump_text(list: &dyn ListValue, elem: &dyn Dumper, out: &mut Vec<u8>) -> Result<(), Error> {
    out.push(b'{');
    for i in 0..list.len() {
        if i > 0 {
            out.push(b',');
        }
        match list.get(i).unwrap_opt() {
            None => out.extend_from_slice(b"NULL"),
            Some(inner) => match inner.as_list() {
                Some(nested) => dump_text(nested, elem, out)?,
                None => {
                    let raw = elem.dump(inner)?;
                    push_element_text(&raw, out);
                }
            },
        }
    }
    out.push(b'}');
    Ok(())
}

fn dump_untyped_text(list: &dyn ListValue, out: &mut Vec<u8>) -> Result<(), Error> {
    out.push(b'{');
    for i in 0..list.len() {
        if i > 0 {
            out.push(b',');
        }
        match list.get(i).unwrap_opt() {
            None => out.extend_from_slice(b"NULL"),
            Some(inner) => match inner.as_list() {
                Some(nested) => dump_untyped_text(nested, out)?,
                None => {
                    return Err(
                        InterfaceError::new("typed element in a list dumped without an upgrade").into(),
                    )
                }
            },
        }
    }
    out.push(b'}');
    Ok(())
}

fn push_element_text(raw: &[u8], out: &mut Vec<u8>) {
    let needs_quote = raw.is_empty()
        || raw.eq_ignore_ascii_case(b"null")
        || raw.iter().any(|&b| {
            matches!(b, b'{' | b'}' | b',' | b'"' | b'\\') || b.is_ascii_whitespace()
        });
    if !needs_quote {
        out.extend_from_slice(raw);
        return;
    }
    out.push(b'"');
    for &b in raw {
        if b == b'"' || b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b'"');
}

fn dump_binary(list: &dyn ListValue, elem: Option<&dyn Dumper>, elem_oid: Oid) -> Result<Bytes, Error> {
    let mut dims = Vec::new();
    measure_dims(list, 0, &mut dims)?;

    let mut out = Vec::new();
    out.write_i32::<BigEndian>(dims.len() as i32)?;
    let has_null = contains_null(list);
    out.write_i32::<BigEndian>(if has_null { 1 } else { 0 })?;
    out.write_u32::<BigEndian>(elem_oid)?;
    for dim in &dims {
        out.write_i32::<BigEndian>(*dim as i32)?;
        out.write_i32::<BigEndian>(1)?;
    }
    write_binary_elements(list, elem, &mut out)?;
    Ok(Bytes::from(out))
}

fn measure_dims(list: &dyn ListValue, depth: usize, dims: &mut Vec<usize>) -> Result<(), Error> {
    if dims.len() == depth {
        dims.push(list.len());
    } else if dims[depth] != list.len() {
        return Err(ProgrammingError::new("multidimensional arrays must be rectangular").into());
    }
    for i in 0..list.len() {
        if let Some(inner) = list.get(i).unwrap_opt() {
            if let Some(nested) = inner.as_list() {
                measure_dims(nested, depth + 1, dims)?;
            }
        }
    }
    Ok(())
}

fn contains_null(list: &dyn ListValue) -> bool {
    for i in 0..list.len() {
        match list.get(i).unwrap_opt() {
            None => return true,
            Some(inner) => {
                if let Some(nested) = inner.as_list() {
                    if contains_null(nested) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn write_binary_elements(
    list: &dyn ListValue,
    elem: Option<&dyn Dumper>,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    for i in 0..list.len() {
        match list.get(i).unwrap_opt() {
            None => out.write_i32::<BigEndian>(-1)?,
            Some(inner) => match inner.as_list() {
                Some(nested) => write_binary_elements(nested, elem, out)?,
                None => {
                    let elem = elem.ok_or_else(|| {
                        InterfaceError::new("typed element in a list dumped without an upgrade")
                    })?;
                    let raw = elem.dump(inner)?;
                    out.write_i32::<BigEndian>(raw.len() as i32)?;
                    out.extend_from_slice(&raw);
                }
            },
        }
    }
    Ok(())
}

struct ArrayLoader {
    format: Format,
    elem: Arc<dyn Loader>,
}

impl Loader for ArrayLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        match self.format {
            Format::Text => load_text(raw, &*self.elem),
            Format::Binary => load_binary(raw, &*self.elem),
        }
    }
}

fn load_text(raw: &[u8], elem: &dyn Loader) -> Result<Box<dyn SqlValue>, Error> {
    let mut pos = 0;
    let mut items = Vec::new();
    let mut dims = Vec::new();
    parse_text_array(raw, &mut pos, 0, elem, &mut items, &mut dims)?;
    if pos != raw.len() {
        return Err(bad_array("trailing data after the closing brace"));
    }
    Ok(Box::new(PgArray::new(items, dims)))
}

fn parse_text_array(
    raw: &[u8],
    pos: &mut usize,
    depth: usize,
    elem: &dyn Loader,
    items: &mut Vec<ArrayCell>,
    dims: &mut Vec<usize>,
) -> Result<(), Error> {
    if raw.get(*pos) != Some(&b'{') {
        return Err(bad_array("expected an opening brace"));
    }
    *pos += 1;

    let mut count = 0usize;
    if raw.get(*pos) == Some(&b'}') {
        *pos += 1;
        record_dim(dims, depth, 0)?;
        return Ok(());
    }

    loop {
        match raw.get(*pos) {
            Some(&b'{') => {
                parse_text_array(raw, pos, depth + 1, elem, items, dims)?;
            }
            Some(&b'"') => {
                *pos += 1;
                let mut value = Vec::new();
                loop {
                    match raw.get(*pos) {
                        None => return Err(bad_array("unterminated quoted element")),
                        Some(&b'"') => {
                            *pos += 1;
                            break;
                        }
                        Some(&b'\\') => {
                            let next = raw.get(*pos + 1).ok_or_else(|| bad_array("bad escape"))?;
                            value.push(*next);
                            *pos += 2;
                        }
                        Some(&b) => {
                            value.push(b);
                            *pos += 1;
                        }
                    }
                }
                items.push(ArrayCell(Some(elem.load(&value)?)));
            }
            Some(_) => {
                let start = *pos;
                while let Some(&b) = raw.get(*pos) {
                    if b == b',' || b == b'}' {
                        break;
                    }
                    *pos += 1;
                }
                let token = &raw[start..*pos];
                if token.eq_ignore_ascii_case(b"null") {
                    items.push(ArrayCell(None));
                } else {
                    items.push(ArrayCell(Some(elem.load(token)?)));
                }
            }
            None => return Err(bad_array("unterminated array")),
        }
        count += 1;
        match raw.get(*pos) {
            Some(&b',') => *pos += 1,
            Some(&b'}') => {
                *pos += 1;
                break;
            }
            _ => return Err(bad_array("expected a comma or closing brace")),
        }
    }
    record_dim(dims, depth, count)
}

fn record_dim(dims: &mut Vec<usize>, depth: usize, count: usize) -> Result<(), Error> {
    if dims.len() == depth {
        dims.push(count);
        Ok(())
    } else if dims.get(depth) == Some(&count) {
        Ok(())
    } else {
        Err(bad_array("ragged dimensions"))
    }
}

fn load_binary(raw: &[u8], elem: &dyn Loader) -> Result<Box<dyn SqlValue>, Error> {
    let mut cur = raw;
    let ndims = cur.read_i32::<BigEndian>().map_err(|_| bad_array("truncated header"))?;
    let _has_null = cur.read_i32::<BigEndian>().map_err(|_| bad_array("truncated header"))?;
    let _elem_oid = cur.read_u32::<BigEndian>().map_err(|_| bad_array("truncated header"))?;

    if !(0..=6).contains(&ndims) {
        return Err(bad_array("implausible dimension count"));
    }

    let mut dims = Vec::with_capacity(ndims as usize);
    let mut total = 1usize;
    for _ in 0..ndims {
        let len = cur.read_i32::<BigEndian>().map_err(|_| bad_array("truncated header"))?;
        let _lbound = cur.read_i32::<BigEndian>().map_err(|_| bad_array("truncated header"))?;
        let len = usize::try_from(len).map_err(|_| bad_array("negative dimension"))?;
        dims.push(len);
        total = total.saturating_mul(len);
    }
    if ndims == 0 {
        total = 0;
    }

    let mut items = Vec::with_capacity(total);
    for _ in 0..total {
        let len = cur.read_i32::<BigEndian>().map_err(|_| bad_array("truncated element"))?;
        if len < 0 {
            items.push(ArrayCell(None));
            continue;
        }
        let len = len as usize;
        if cur.len() < len {
            return Err(bad_array("truncated element"));
        }
        let mut value = vec![0u8; len];
        cur.read_exact(&mut value).map_err(|_| bad_array("truncated element"))?;
        items.push(ArrayCell(Some(elem.load(&value)?)));
    }

    Ok(Box::new(PgArray::new(items, dims)))
}

#[cold]
fn bad_array(what: &str) -> Error {
    InterfaceError::new(format!("bad array representation: {what}")).into()
}

const ARRAY_OIDS: &[Oid] = &[
    oids::BOOL_ARRAY_OID,
    oids::BYTEA_ARRAY_OID,
    oids::NAME_ARRAY_OID,
    oids::INT8_ARRAY_OID,
    oids::INT2_ARRAY_OID,
    oids::INT4_ARRAY_OID,
    oids::TEXT_ARRAY_OID,
    oids::OID_ARRAY_OID,
    oids::JSON_ARRAY_OID,
    oids::FLOAT4_ARRAY_OID,
    oids::FLOAT8_ARRAY_OID,
    oids::BPCHAR_ARRAY_OID,
    oids::VARCHAR_ARRAY_OID,
    oids::DATE_ARRAY_OID,
    oids::TIME_ARRAY_OID,
    oids::TIMESTAMP_ARRAY_OID,
    oids::TIMESTAMPTZ_ARRAY_OID,
    oids::NUMERIC_ARRAY_OID,
    oids::JSONB_ARRAY_OID,
];

fn array_loader_factory(array_oid: Oid, format: Format, ctx: &AdaptContext) -> Result<Arc<dyn Loader>, Error> {
    let elem_oid = ctx
        .adapters
        .types
        .get_by_oid(array_oid)
        .map(|info| info.oid())
        .unwrap_or(oids::INVALID_OID);
    let entry = ctx
        .adapters
        .get_loader(elem_oid, format)
        .or_else(|| ctx.adapters.get_loader(oids::INVALID_OID, format))
        .ok_or_else(|| InterfaceError::new("unknown oid loader not found"))?;
    let elem = (entry.factory)(elem_oid, format, ctx)?;
    Ok(Arc::new(ArrayLoader { format, elem }))
}

pub(crate) fn register(map: &mut AdaptersMap) {
    let list_dumper: crate::adapt::DumperFactory =
        |key, format, ctx| Ok(Arc::new(ListDumper { key, format, ctx: ctx.clone() }));

    for format in [Format::Text, Format::Binary] {
        // structural fallback key used by the transformer for any value with
        // a list view; see Transformer::get_dumper
        map.register_dumper(DumperKey::Name("list"), DumperEntry { format, factory: list_dumper });
        map.register_dumper(
            DumperKey::Type(TypeId::of::<PgArray>()),
            DumperEntry { format, factory: list_dumper },
        );
        for &oid in ARRAY_OIDS {
            map.register_loader(oid, LoaderEntry { format, factory: array_loader_factory });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::downcast;

    fn ctx() -> AdaptContext {
        AdaptContext {
            adapters: Arc::new(AdaptersMap::layer(&crate::adapt::global_adapters().read().unwrap())),
            encoding: None,
            timezone: None,
        }
    }

    fn upgraded(value: &dyn SqlValue, format: Format) -> Arc<dyn Dumper> {
        let ctx = ctx();
        let base = ListDumper {
            key: DumperKey::Name("list"),
            format,
            ctx,
        };
        base.upgrade(value, ParamFormat::Auto).unwrap()
    }

    #[test]
    fn text_array_dump() {
        let v: Vec<Option<String>> = vec![
            Some("plain".into()),
            None,
            Some("with, comma".into()),
            Some("qu\"ote".into()),
        ];
        let dumper = upgraded(&v, Format::Text);
        assert_eq!(dumper.oid(), oids::TEXT_ARRAY_OID);
        let raw = dumper.dump(&v).unwrap();
        assert_eq!(&raw[..], br#"{plain,NULL,"with, comma","qu\"ote"}"#);
    }

    #[test]
    fn int_array_picks_oid_from_elements() {
        let v: Vec<i64> = vec![1, 2, 3];
        let dumper = upgraded(&v, Format::Binary);
        // magnitude upgrade narrows the elements to int2
        assert_eq!(dumper.oid(), oids::INT2_ARRAY_OID);
    }

    #[test]
    fn all_null_list_keeps_unknown_oid() {
        let ctx = ctx();
        let base = ListDumper {
            key: DumperKey::Name("list"),
            format: Format::Text,
            ctx,
        };
        let v: Vec<Option<i64>> = vec![None, None];
        assert_eq!(base.get_key(&v, ParamFormat::Auto), DumperKey::Name("list"));
        assert_eq!(base.oid(), oids::INVALID_OID);
        let raw = base.dump(&v).unwrap();
        assert_eq!(&raw[..], b"{NULL,NULL}");
    }

    #[test]
    fn text_array_load() {
        let ctx = ctx();
        let loader = array_loader_factory(oids::INT4_ARRAY_OID, Format::Text, &ctx).unwrap();
        let loaded = loader.load(b"{1,NULL,3}").unwrap();
        let arr = downcast::<PgArray>(&*loaded).unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.get(0).and_then(|v| downcast::<i32>(v)), Some(&1));
        assert!(arr.get(1).is_none());
        assert_eq!(arr.dims(), &[3]);
    }

    #[test]
    fn text_array_load_quoted_and_nested() {
        let ctx = ctx();
        let loader = array_loader_factory(oids::TEXT_ARRAY_OID, Format::Text, &ctx).unwrap();
        let loaded = loader.load(br#"{{"a,b",NULL},{c,"d\"e"}}"#).unwrap();
        let arr = downcast::<PgArray>(&*loaded).unwrap();
        assert_eq!(arr.dims(), &[2, 2]);
        assert_eq!(
            arr.get(0).and_then(|v| downcast::<String>(v)).map(String::as_str),
            Some("a,b")
        );
        assert_eq!(
            arr.get(3).and_then(|v| downcast::<String>(v)).map(String::as_str),
            Some("d\"e")
        );
    }

    #[test]
    fn binary_array_round_trip() {
        let v: Vec<Option<i64>> = vec![Some(70_000), None, Some(-1)];
        let dumper = upgraded(&v, Format::Binary);
        assert_eq!(dumper.oid(), oids::INT4_ARRAY_OID);
        let raw = dumper.dump(&v).unwrap();

        let ctx = ctx();
        let loader = array_loader_factory(oids::INT4_ARRAY_OID, Format::Binary, &ctx).unwrap();
        let loaded = loader.load(&raw).unwrap();
        let arr = downcast::<PgArray>(&*loaded).unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.get(0).and_then(|v| downcast::<i32>(v)), Some(&70_000));
        assert!(arr.get(1).is_none());
        assert_eq!(arr.get(2).and_then(|v| downcast::<i32>(v)), Some(&-1));
    }

    #[test]
    fn ragged_binary_dump_fails() {
        let v: Vec<Vec<i64>> = vec![vec![1, 2], vec![3]];
        let dumper = upgraded(&v, Format::Binary);
        assert!(dumper.dump(&v).is_err());
    }
}
