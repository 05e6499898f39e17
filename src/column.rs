use postgres_types::Oid;

use crate::{oids, pq::FieldDescription, pq::Format};

/// description of one column of query results, in the shape cursor users
/// inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: Box<str>,
    type_oid: Oid,
    format: Format,
    type_size: i16,
    type_modifier: i32,
}

impl Column {
    pub(crate) fn from_field(field: &FieldDescription) -> Self {
        Self {
            name: field.name().into(),
            type_oid: field.type_oid(),
            format: field.format(),
            type_size: field.type_size(),
            type_modifier: field.type_modifier(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// declared display size for varchar/bpchar columns.
    pub fn display_size(&self) -> Option<i32> {
        match self.type_oid {
            oids::VARCHAR_OID | oids::BPCHAR_OID if self.type_modifier >= 4 => Some(self.type_modifier - 4),
            _ => None,
        }
    }

    /// storage size of the type; `None` for variable length types.
    pub fn internal_size(&self) -> Option<i16> {
        (self.type_size > 0).then_some(self.type_size)
    }

    /// numeric precision, for numeric columns with an explicit typmod.
    pub fn precision(&self) -> Option<i32> {
        match self.type_oid {
            oids::NUMERIC_OID if self.type_modifier >= 4 => Some((self.type_modifier - 4) >> 16),
            _ => None,
        }
    }

    /// numeric scale, for numeric columns with an explicit typmod.
    pub fn scale(&self) -> Option<i32> {
        match self.type_oid {
            oids::NUMERIC_OID if self.type_modifier >= 4 => Some((self.type_modifier - 4) & 0xffff),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn field(oid: Oid, typmod: i32, size: i16) -> FieldDescription {
        FieldDescription::new("col", 0, 0, oid, size, typmod, Format::Text)
    }

    #[test]
    fn varchar_display_size() {
        let col = Column::from_field(&field(oids::VARCHAR_OID, 36, -1));
        assert_eq!(col.display_size(), Some(32));
        assert_eq!(col.internal_size(), None);
    }

    #[test]
    fn numeric_precision_scale() {
        // numeric(8, 2) travels as ((8 << 16) | 2) + 4
        let col = Column::from_field(&field(oids::NUMERIC_OID, (8 << 16) + 2 + 4, -1));
        assert_eq!(col.precision(), Some(8));
        assert_eq!(col.scale(), Some(2));
    }

    #[test]
    fn fixed_width_internal_size() {
        let col = Column::from_field(&field(oids::INT4_OID, -1, 4));
        assert_eq!(col.internal_size(), Some(4));
        assert_eq!(col.display_size(), None);
    }
}
