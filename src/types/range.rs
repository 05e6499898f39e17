//! adapters for range types, in their text form.
//!
//! the binary form mirrors the composite layout with flag bits; servers
//! render ranges in text for every cursor this crate opens, so the text form
//! is the one carried here.

use core::any::TypeId;
use core::fmt;
use core::ops::Bound;

use std::sync::Arc;

use bytes::Bytes;
use postgres_types::Oid;

use crate::{
    adapt::{
        AdaptContext, AdaptersMap, Dumper, DumperEntry, DumperKey, Loader, LoaderEntry, ParamFormat,
    },
    errors::{Error, InterfaceError},
    oids,
    pq::Format,
    value::{RangeView, SqlValue},
};

/// a range value: two optional bounds with inclusivity flags, or the empty
/// range.
pub struct PgRange {
    lower: Option<Box<dyn SqlValue>>,
    upper: Option<Box<dyn SqlValue>>,
    lower_inc: bool,
    upper_inc: bool,
    empty: bool,
}

impl fmt::Debug for PgRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty {
            return f.write_str("PgRange(empty)");
        }
        write!(
            f,
            "PgRange({}{:?},{:?}{})",
            if self.lower_inc { '[' } else { '(' },
            self.lower,
            self.upper,
            if self.upper_inc { ']' } else { ')' },
        )
    }
}

impl PgRange {
    /// the empty range.
    pub fn empty() -> Self {
        Self {
            lower: None,
            upper: None,
            lower_inc: false,
            upper_inc: false,
            empty: true,
        }
    }

    /// a range with explicit bounds; `None` is an open (infinite) side.
    pub fn new<T: SqlValue>(
        lower: Option<T>,
        upper: Option<T>,
        lower_inc: bool,
        upper_inc: bool,
    ) -> Self {
        Self {
            lower: lower.map(|v| Box::new(v) as Box<dyn SqlValue>),
            upper: upper.map(|v| Box::new(v) as Box<dyn SqlValue>),
            lower_inc,
            upper_inc,
            empty: false,
        }
    }

    /// the conventional `[lower, upper)` range.
    pub fn bounded<T: SqlValue>(lower: T, upper: T) -> Self {
        Self::new(Some(lower), Some(upper), true, false)
    }

    pub fn lower(&self) -> Option<&dyn SqlValue> {
        self.lower.as_deref()
    }

    pub fn upper(&self) -> Option<&dyn SqlValue> {
        self.upper.as_deref()
    }

    pub fn lower_inc(&self) -> bool {
        self.lower_inc
    }

    pub fn upper_inc(&self) -> bool {
        self.upper_inc
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    fn bound_type(&self) -> Option<TypeId> {
        self.lower
            .as_deref()
            .or(self.upper.as_deref())
            .map(|v| v.as_any().type_id())
    }
}

impl SqlValue for PgRange {
    fn as_any(&self) -> &dyn core::any::Any {
        self
    }

    fn unwrap_opt(&self) -> Option<&dyn SqlValue> {
        Some(self)
    }

    fn type_name(&self) -> &'static str {
        "PgRange"
    }

    fn as_range(&self) -> Option<RangeView<'_>> {
        fn bound(value: &Option<Box<dyn SqlValue>>, inc: bool) -> Bound<&dyn SqlValue> {
            match value.as_deref() {
                None => Bound::Unbounded,
                Some(v) if inc => Bound::Included(v),
                Some(v) => Bound::Excluded(v),
            }
        }
        Some(RangeView {
            lower: bound(&self.lower, self.lower_inc),
            upper: bound(&self.upper, self.upper_inc),
            empty: self.empty,
        })
    }
}

struct RangeDumper {
    key: DumperKey,
    ctx: AdaptContext,
    elem: Option<Arc<dyn Dumper>>,
    oid: Oid,
}

impl Dumper for RangeDumper {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn format(&self) -> Format {
        Format::Text
    }

    fn key(&self) -> DumperKey {
        self.key
    }

    fn dump(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        let range = range_of(value)?;
        if range.empty {
            return Ok(Bytes::from_static(b"empty"));
        }

        let mut out = Vec::new();
        let (lower, lower_inc) = bound_parts(&range.lower);
        let (upper, upper_inc) = bound_parts(&range.upper);

        out.push(if lower_inc { b'[' } else { b'(' });
        if let Some(v) = lower {
            push_bound_text(&self.dump_bound(v)?, &mut out);
        }
        out.push(b',');
        if let Some(v) = upper {
            push_bound_text(&self.dump_bound(v)?, &mut out);
        }
        out.push(if upper_inc { b']' } else { b')' });
        Ok(Bytes::from(out))
    }

    fn get_key(&self, value: &dyn SqlValue, _format: ParamFormat) -> DumperKey {
        match value
            .as_any()
            .downcast_ref::<PgRange>()
            .and_then(PgRange::bound_type)
        {
            Some(elem) => DumperKey::Pair(TypeId::of::<PgRange>(), elem),
            None => self.key,
        }
    }

    fn upgrade(&self, value: &dyn SqlValue, format: ParamFormat) -> Result<Arc<dyn Dumper>, Error> {
        let range = value
            .as_any()
            .downcast_ref::<PgRange>()
            .ok_or_else(|| InterfaceError::new(format!("range dumper got a {}", value.type_name())))?;
        let elem_value = range
            .lower()
            .or(range.upper())
            .ok_or_else(|| InterfaceError::new("range upgrade requested without a typed bound"))?;

        let entry = self.ctx.adapters.get_dumper(
            DumperKey::Type(elem_value.as_any().type_id()),
            elem_value.type_name(),
            ParamFormat::Text,
        )?;
        let mut elem = (entry.factory)(
            DumperKey::Type(elem_value.as_any().type_id()),
            entry.format,
            &self.ctx,
        )?;
        let elem_key = elem.get_key(elem_value, format);
        if elem_key != elem.key() {
            elem = elem.upgrade(elem_value, format)?;
        }

        let oid = find_range_oid(&self.ctx, elem.oid());

        Ok(Arc::new(RangeDumper {
            key: self.get_key(value, format),
            ctx: self.ctx.clone(),
            elem: Some(elem),
            oid,
        }))
    }
}

impl RangeDumper {
    fn dump_bound(&self, value: &dyn SqlValue) -> Result<Bytes, Error> {
        match self.elem.as_deref() {
            Some(elem) => elem.dump(value),
            None => Err(InterfaceError::new("typed bound in a range dumped without an upgrade").into()),
        }
    }
}

// no range type is built over int2; integer bounds that narrowed below int4
// widen back until a registered range is found.
fn find_range_oid(ctx: &AdaptContext, mut elem_oid: Oid) -> Oid {
    loop {
        if let Some(info) = ctx.adapters.types.range_for_subtype(elem_oid) {
            return info.oid();
        }
        elem_oid = match elem_oid {
            oids::INT2_OID => oids::INT4_OID,
            _ => return oids::INVALID_OID,
        };
    }
}

fn range_of(value: &dyn SqlValue) -> Result<RangeView<'_>, Error> {
    value
        .as_range()
        .ok_or_else(|| InterfaceError::new(format!("range dumper got a {}", value.type_name())).into())
}

fn bound_parts<'a>(bound: &Bound<&'a dyn SqlValue>) -> (Option<&'a dyn SqlValue>, bool) {
    match bound {
        Bound::Included(v) => (Some(*v), true),
        Bound::Excluded(v) => (Some(*v), false),
        Bound::Unbounded => (None, false),
    }
}

fn push_bound_text(raw: &[u8], out: &mut Vec<u8>) {
    let needs_quote = raw.is_empty()
        || raw.iter().any(|&b| {
            matches!(b, b',' | b'"' | b'\\' | b'(' | b')' | b'[' | b']' | b'{' | b'}')
                || b.is_ascii_whitespace()
        });
    if !needs_quote {
        out.extend_from_slice(raw);
        return;
    }
    out.push(b'"');
    for &b in raw {
        if b == b'"' {
            // inner quotes double inside a quoted bound
            out.push(b'"');
        } else if b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b'"');
}

struct RangeLoader {
    elem: Arc<dyn Loader>,
}

impl Loader for RangeLoader {
    fn load(&self, raw: &[u8]) -> Result<Box<dyn SqlValue>, Error> {
        if raw.eq_ignore_ascii_case(b"empty") {
            return Ok(Box::new(PgRange::empty()));
        }
        if raw.len() < 2 {
            return Err(bad_range("too short"));
        }

        let lower_inc = match raw[0] {
            b'[' => true,
            b'(' => false,
            _ => return Err(bad_range("bad lower bound flag")),
        };
        let upper_inc = match raw[raw.len() - 1] {
            b']' => true,
            b')' => false,
            _ => return Err(bad_range("bad upper bound flag")),
        };

        let inner = &raw[1..raw.len() - 1];
        let (lower_raw, upper_raw) = split_bounds(inner)?;

        let load_bound = |token: BoundToken| -> Result<Option<Box<dyn SqlValue>>, Error> {
            match token {
                BoundToken::Infinite => Ok(None),
                BoundToken::Value(bytes) => self.elem.load(&bytes).map(Some),
            }
        };

        Ok(Box::new(PgRange {
            lower: load_bound(lower_raw)?,
            upper: load_bound(upper_raw)?,
            lower_inc,
            upper_inc,
            empty: false,
        }))
    }
}

enum BoundToken {
    Infinite,
    Value(Vec<u8>),
}

fn split_bounds(inner: &[u8]) -> Result<(BoundToken, BoundToken), Error> {
    let mut bounds = Vec::with_capacity(2);
    let mut current = Vec::new();
    let mut current_quoted = false;
    let mut i = 0;

    while i <= inner.len() {
        match inner.get(i) {
            Some(&b'"') => {
                current_quoted = true;
                i += 1;
                loop {
                    match inner.get(i) {
                        None => return Err(bad_range("unterminated quoted bound")),
                        Some(&b'"') if inner.get(i + 1) == Some(&b'"') => {
                            current.push(b'"');
                            i += 2;
                        }
                        Some(&b'"') => {
                            i += 1;
                            break;
                        }
                        Some(&b'\\') => {
                            let next = inner.get(i + 1).ok_or_else(|| bad_range("bad escape"))?;
                            current.push(*next);
                            i += 2;
                        }
                        Some(&b) => {
                            current.push(b);
                            i += 1;
                        }
                    }
                }
            }
            Some(&b',') | None => {
                let token = if current.is_empty() && !current_quoted {
                    BoundToken::Infinite
                } else {
                    BoundToken::Value(std::mem::take(&mut current))
                };
                bounds.push(token);
                current_quoted = false;
                i += 1;
            }
            Some(&b) => {
                current.push(b);
                i += 1;
            }
        }
    }

    if bounds.len() != 2 {
        return Err(bad_range("expected exactly one comma"));
    }
    let upper = bounds.pop().expect("len checked");
    let lower = bounds.pop().expect("len checked");
    Ok((lower, upper))
}

#[cold]
fn bad_range(what: &str) -> Error {
    InterfaceError::new(format!("bad range representation: {what}")).into()
}

const RANGE_OIDS: &[Oid] = &[
    oids::INT4RANGE_OID,
    oids::INT8RANGE_OID,
    oids::NUMRANGE_OID,
    oids::TSRANGE_OID,
    oids::TSTZRANGE_OID,
    oids::DATERANGE_OID,
];

fn range_loader_factory(range_oid: Oid, format: Format, ctx: &AdaptContext) -> Result<Arc<dyn Loader>, Error> {
    let subtype = ctx
        .adapters
        .types
        .get_by_oid(range_oid)
        .and_then(|info| info.range_subtype())
        .unwrap_or(oids::INVALID_OID);
    let entry = ctx
        .adapters
        .get_loader(subtype, format)
        .or_else(|| ctx.adapters.get_loader(oids::INVALID_OID, format))
        .ok_or_else(|| InterfaceError::new("unknown oid loader not found"))?;
    let elem = (entry.factory)(subtype, format, ctx)?;
    Ok(Arc::new(RangeLoader { elem }))
}

pub(crate) fn register(map: &mut AdaptersMap) {
    let range_dumper: crate::adapt::DumperFactory = |key, _, ctx| {
        Ok(Arc::new(RangeDumper {
            key,
            ctx: ctx.clone(),
            elem: None,
            oid: oids::INVALID_OID,
        }))
    };

    map.register_dumper(
        DumperKey::Type(TypeId::of::<PgRange>()),
        DumperEntry {
            format: Format::Text,
            factory: range_dumper,
        },
    );
    map.register_dumper(
        DumperKey::Name("range"),
        DumperEntry {
            format: Format::Text,
            factory: range_dumper,
        },
    );
    for &oid in RANGE_OIDS {
        map.register_loader(
            oid,
            LoaderEntry {
                format: Format::Text,
                factory: range_loader_factory,
            },
        );
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

    fn dumper_for(value: &dyn SqlValue) -> Arc<dyn Dumper> {
        let base = RangeDumper {
            key: DumperKey::Type(TypeId::of::<PgRange>()),
            ctx: ctx(),
            elem: None,
            oid: oids::INVALID_OID,
        };
        base.upgrade(value, ParamFormat::Auto).unwrap()
    }

    #[test]
    fn dump_bounded_int_range() {
        let range = PgRange::bounded(1i64, 10i64);
        let dumper = dumper_for(&range);
        assert_eq!(dumper.oid(), oids::INT4RANGE_OID);
        assert_eq!(&dumper.dump(&range).unwrap()[..], b"[1,10)");
    }

    #[test]
    fn dump_open_sides_as_empty_strings() {
        let range = PgRange::new::<i64>(None, Some(5), false, true);
        let dumper = dumper_for(&range);
        assert_eq!(&dumper.dump(&range).unwrap()[..], b"(,5]");
    }

    #[test]
    fn dump_empty_range() {
        let range = PgRange::empty();
        let base = RangeDumper {
            key: DumperKey::Type(TypeId::of::<PgRange>()),
            ctx: ctx(),
            elem: None,
            oid: oids::INVALID_OID,
        };
        assert_eq!(&base.dump(&range).unwrap()[..], b"empty");
    }

    #[test]
    fn load_int_range() {
        let loader = range_loader_factory(oids::INT4RANGE_OID, Format::Text, &ctx()).unwrap();
        let loaded = loader.load(b"[1,10)").unwrap();
        let range = downcast::<PgRange>(&*loaded).unwrap();
        assert!(range.lower_inc());
        assert!(!range.upper_inc());
        assert_eq!(range.lower().and_then(downcast::<i32>), Some(&1));
        assert_eq!(range.upper().and_then(downcast::<i32>), Some(&10));
    }

    #[test]
    fn load_infinite_and_empty() {
        let loader = range_loader_factory(oids::INT8RANGE_OID, Format::Text, &ctx()).unwrap();

        let loaded = loader.load(b"(,5]").unwrap();
        let range = downcast::<PgRange>(&*loaded).unwrap();
        assert!(range.lower().is_none());
        assert_eq!(range.upper().and_then(downcast::<i64>), Some(&5));

        let loaded = loader.load(b"empty").unwrap();
        assert!(downcast::<PgRange>(&*loaded).unwrap().is_empty());
    }

    #[test]
    fn quoted_bound_with_comma() {
        let loader = range_loader_factory(oids::TSRANGE_OID, Format::Text, &ctx()).unwrap();
        let loaded = loader.load(br#"["2021-01-01 00:00:00","2021-06-01 00:00:00")"#).unwrap();
        let range = downcast::<PgRange>(&*loaded).unwrap();
        assert!(range.lower().is_some());
        assert!(range.upper().is_some());
    }
}
