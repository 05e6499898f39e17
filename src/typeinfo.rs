//! the types catalogue: what the client knows about server types.

use std::{collections::HashMap, sync::Arc};

use postgres_types::Oid;

use crate::oids;

/// description of a server data type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    name: Box<str>,
    oid: Oid,
    array_oid: Oid,
    delimiter: u8,
    alt_name: Option<Box<str>>,
    kind: TypeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Base,
    Range { subtype_oid: Oid },
}

impl TypeInfo {
    pub fn new(name: &str, oid: Oid, array_oid: Oid) -> Self {
        Self {
            name: name.into(),
            oid,
            array_oid,
            delimiter: b',',
            alt_name: None,
            kind: TypeKind::Base,
        }
    }

    pub fn range(name: &str, oid: Oid, array_oid: Oid, subtype_oid: Oid) -> Self {
        Self {
            kind: TypeKind::Range { subtype_oid },
            ..Self::new(name, oid, array_oid)
        }
    }

    pub fn with_alt_name(mut self, alt_name: &str) -> Self {
        self.alt_name = Some(alt_name.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn array_oid(&self) -> Oid {
        self.array_oid
    }

    /// separator between elements in the text array form. `,` for every
    /// builtin type except `box`.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn alt_name(&self) -> Option<&str> {
        self.alt_name.as_deref()
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// subtype oid when the type is a range.
    pub fn range_subtype(&self) -> Option<Oid> {
        match self.kind {
            TypeKind::Range { subtype_oid } => Some(subtype_oid),
            TypeKind::Base => None,
        }
    }
}

/// index of [`TypeInfo`] by oid, array oid, name and range subtype.
#[derive(Debug, Clone, Default)]
pub struct TypesRegistry {
    by_oid: HashMap<Oid, Arc<TypeInfo>>,
    by_name: HashMap<Box<str>, Arc<TypeInfo>>,
    range_by_subtype: HashMap<Oid, Arc<TypeInfo>>,
}

impl TypesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// register a type. both its oid and array oid resolve back to it, as do
    /// its name and alt name; range types are additionally indexed by their
    /// subtype oid.
    pub fn add(&mut self, info: TypeInfo) {
        let info = Arc::new(info);
        self.by_oid.insert(info.oid(), info.clone());
        if info.array_oid() != oids::INVALID_OID {
            self.by_oid.insert(info.array_oid(), info.clone());
        }
        self.by_name.insert(info.name().into(), info.clone());
        if let Some(alt) = info.alt_name() {
            self.by_name.insert(alt.into(), info.clone());
        }
        if let Some(subtype) = info.range_subtype() {
            self.range_by_subtype.insert(subtype, info);
        }
    }

    pub fn get_by_oid(&self, oid: Oid) -> Option<&TypeInfo> {
        self.by_oid.get(&oid).map(Arc::as_ref)
    }

    /// look a type up by name. a trailing `[]` is stripped and the element
    /// type returned; use [`TypeInfo::array_oid`] on the result.
    pub fn get_by_name(&self, name: &str) -> Option<&TypeInfo> {
        let name = name.strip_suffix("[]").unwrap_or(name);
        self.by_name.get(name).map(Arc::as_ref)
    }

    /// the range type built over the given subtype, if one is registered.
    pub fn range_for_subtype(&self, subtype_oid: Oid) -> Option<&TypeInfo> {
        self.range_by_subtype.get(&subtype_oid).map(Arc::as_ref)
    }

    /// catalogue of the builtin types the crate ships adapters for.
    pub fn builtin() -> Self {
        let mut reg = Self::new();

        reg.add(TypeInfo::new("bool", oids::BOOL_OID, oids::BOOL_ARRAY_OID).with_alt_name("boolean"));
        reg.add(TypeInfo::new("bytea", oids::BYTEA_OID, oids::BYTEA_ARRAY_OID));
        reg.add(TypeInfo::new("name", oids::NAME_OID, oids::NAME_ARRAY_OID));
        reg.add(TypeInfo::new("int8", oids::INT8_OID, oids::INT8_ARRAY_OID).with_alt_name("bigint"));
        reg.add(TypeInfo::new("int2", oids::INT2_OID, oids::INT2_ARRAY_OID).with_alt_name("smallint"));
        reg.add(TypeInfo::new("int4", oids::INT4_OID, oids::INT4_ARRAY_OID).with_alt_name("integer"));
        reg.add(TypeInfo::new("text", oids::TEXT_OID, oids::TEXT_ARRAY_OID));
        reg.add(TypeInfo::new("oid", oids::OID_OID, oids::OID_ARRAY_OID));
        reg.add(TypeInfo::new("json", oids::JSON_OID, oids::JSON_ARRAY_OID));
        reg.add(TypeInfo::new("float4", oids::FLOAT4_OID, oids::FLOAT4_ARRAY_OID).with_alt_name("real"));
        reg.add(
            TypeInfo::new("float8", oids::FLOAT8_OID, oids::FLOAT8_ARRAY_OID).with_alt_name("double precision"),
        );
        reg.add(TypeInfo::new("unknown", oids::UNKNOWN_OID, oids::INVALID_OID));
        reg.add(TypeInfo::new("bpchar", oids::BPCHAR_OID, oids::BPCHAR_ARRAY_OID).with_alt_name("character"));
        reg.add(
            TypeInfo::new("varchar", oids::VARCHAR_OID, oids::VARCHAR_ARRAY_OID).with_alt_name("character varying"),
        );
        reg.add(TypeInfo::new("date", oids::DATE_OID, oids::DATE_ARRAY_OID));
        reg.add(TypeInfo::new("time", oids::TIME_OID, oids::TIME_ARRAY_OID));
        reg.add(TypeInfo::new("timestamp", oids::TIMESTAMP_OID, oids::TIMESTAMP_ARRAY_OID));
        reg.add(
            TypeInfo::new("timestamptz", oids::TIMESTAMPTZ_OID, oids::TIMESTAMPTZ_ARRAY_OID)
                .with_alt_name("timestamp with time zone"),
        );
        reg.add(TypeInfo::new("interval", oids::INTERVAL_OID, oids::INTERVAL_ARRAY_OID));
        reg.add(TypeInfo::new("numeric", oids::NUMERIC_OID, oids::NUMERIC_ARRAY_OID).with_alt_name("decimal"));
        reg.add(TypeInfo::new("jsonb", oids::JSONB_OID, oids::JSONB_ARRAY_OID));

        reg.add(TypeInfo::range(
            "int4range",
            oids::INT4RANGE_OID,
            oids::INT4RANGE_ARRAY_OID,
            oids::INT4_OID,
        ));
        reg.add(TypeInfo::range(
            "int8range",
            oids::INT8RANGE_OID,
            oids::INT8RANGE_ARRAY_OID,
            oids::INT8_OID,
        ));
        reg.add(TypeInfo::range(
            "numrange",
            oids::NUMRANGE_OID,
            oids::NUMRANGE_ARRAY_OID,
            oids::NUMERIC_OID,
        ));
        reg.add(TypeInfo::range(
            "tsrange",
            oids::TSRANGE_OID,
            oids::TSRANGE_ARRAY_OID,
            oids::TIMESTAMP_OID,
        ));
        reg.add(TypeInfo::range(
            "tstzrange",
            oids::TSTZRANGE_OID,
            oids::TSTZRANGE_ARRAY_OID,
            oids::TIMESTAMPTZ_OID,
        ));
        reg.add(TypeInfo::range(
            "daterange",
            oids::DATERANGE_OID,
            oids::DATERANGE_ARRAY_OID,
            oids::DATE_OID,
        ));

        reg
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builtin_lookup() {
        let reg = TypesRegistry::builtin();
        assert_eq!(reg.get_by_oid(oids::INT4_OID).unwrap().name(), "int4");
        assert_eq!(reg.get_by_oid(oids::INT4_ARRAY_OID).unwrap().name(), "int4");
        assert_eq!(reg.get_by_name("integer").unwrap().oid(), oids::INT4_OID);
    }

    #[test]
    fn array_suffix_returns_element_info() {
        let reg = TypesRegistry::builtin();
        let info = reg.get_by_name("text[]").unwrap();
        assert_eq!(info.oid(), oids::TEXT_OID);
        assert_eq!(info.array_oid(), oids::TEXT_ARRAY_OID);
    }

    #[test]
    fn range_subtype_index() {
        let reg = TypesRegistry::builtin();
        assert_eq!(reg.range_for_subtype(oids::INT4_OID).unwrap().name(), "int4range");
        assert_eq!(reg.get_by_oid(oids::DATERANGE_OID).unwrap().range_subtype(), Some(oids::DATE_OID));
    }
}
