use core::ops::Range;

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::{DataRowBody, RowDescriptionBody};
use postgres_types::Oid;

use crate::errors::{Diagnostic, Error, InterfaceError};

use super::{ExecStatus, Format};

/// metadata of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    name: Box<str>,
    table_oid: Oid,
    column_id: i16,
    type_oid: Oid,
    type_size: i16,
    type_modifier: i32,
    format: Format,
}

impl FieldDescription {
    pub(crate) fn new(
        name: &str,
        table_oid: Oid,
        column_id: i16,
        type_oid: Oid,
        type_size: i16,
        type_modifier: i32,
        format: Format,
    ) -> Self {
        Self {
            name: name.into(),
            table_oid,
            column_id,
            type_oid,
            type_size,
            type_modifier,
            format,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    pub fn column_id(&self) -> i16 {
        self.column_id
    }

    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }

    /// storage size of the type. negative for variable length types.
    pub fn type_size(&self) -> i16 {
        self.type_size
    }

    pub fn type_modifier(&self) -> i32 {
        self.type_modifier
    }

    pub fn format(&self) -> Format {
        self.format
    }
}

/// a single server result: status, field metadata and row values.
///
/// row values are borrowed slices into the received network buffers; the
/// result owns those buffers until it is dropped with the cursor's result
/// vector.
#[derive(Debug)]
pub struct PgResult {
    status: ExecStatus,
    fields: Vec<FieldDescription>,
    param_oids: Vec<Oid>,
    rows: Vec<ResultRow>,
    command_tag: Option<Box<str>>,
    diagnostic: Option<Diagnostic>,
    copy_format: Format,
}

pub(crate) struct ResultRow {
    body: DataRowBody,
    ranges: Vec<Option<Range<usize>>>,
}

impl core::fmt::Debug for ResultRow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResultRow").field("ranges", &self.ranges).finish()
    }
}

impl PgResult {
    pub(crate) fn new(status: ExecStatus) -> Self {
        Self {
            status,
            fields: Vec::new(),
            param_oids: Vec::new(),
            rows: Vec::new(),
            command_tag: None,
            diagnostic: None,
            copy_format: Format::Text,
        }
    }

    pub(crate) fn set_copy_format(&mut self, format: Format) {
        self.copy_format = format;
    }

    /// overall data format of a `CopyIn`/`CopyOut` result.
    pub fn copy_format(&self) -> Format {
        self.copy_format
    }

    pub(crate) fn with_fields(status: ExecStatus, fields: Vec<FieldDescription>) -> Self {
        Self {
            fields,
            ..Self::new(status)
        }
    }

    pub(crate) fn parse_fields(body: &RowDescriptionBody, default_format: Format) -> Result<Vec<FieldDescription>, Error> {
        let mut fields = Vec::new();
        let mut iter = body.fields();
        while let Some(field) = iter.next().map_err(Error::from)? {
            // format is only meaningful once bind has chosen one; a describe
            // reply reports 0 for all columns.
            let format = match field.format() {
                1 => Format::Binary,
                0 => default_format,
                _ => Format::Text,
            };
            fields.push(FieldDescription::new(
                field.name(),
                field.table_oid(),
                field.column_id(),
                field.type_oid(),
                field.type_size(),
                field.type_modifier(),
                format,
            ));
        }
        Ok(fields)
    }

    pub(crate) fn push_row(&mut self, body: DataRowBody) -> Result<(), Error> {
        let ranges = body.ranges().collect::<Vec<_>>().map_err(Error::from)?;
        self.rows.push(ResultRow { body, ranges });
        Ok(())
    }

    pub(crate) fn set_command_tag(&mut self, tag: &str) {
        self.command_tag = Some(tag.into());
    }

    pub(crate) fn set_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostic = Some(diagnostic);
    }

    pub(crate) fn set_param_oids(&mut self, oids: Vec<Oid>) {
        self.param_oids = oids;
    }

    pub fn status(&self) -> ExecStatus {
        self.status
    }

    /// number of rows in the result.
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    /// number of columns in the result.
    pub fn nfields(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    pub(crate) fn fields_mut(&mut self) -> &mut Vec<FieldDescription> {
        &mut self.fields
    }

    /// oids of the statement parameters, for results of a describe.
    pub fn param_oids(&self) -> &[Oid] {
        &self.param_oids
    }

    /// value of the cell at (row, col). `None` is the sql NULL.
    ///
    /// out of range indexes raise an interface error rather than panic; the
    /// cursor relies on this for its bounds reporting.
    pub fn get_value(&self, row: usize, col: usize) -> Result<Option<&[u8]>, Error> {
        let r = self
            .rows
            .get(row)
            .ok_or_else(|| InterfaceError::new(format!("row {row} out of range ({} rows)", self.rows.len())))?;
        let range = r
            .ranges
            .get(col)
            .ok_or_else(|| InterfaceError::new(format!("column {col} out of range ({} columns)", self.fields.len())))?;
        Ok(range.clone().map(|range| &r.body.buffer()[range]))
    }

    /// the command tag, e.g. `INSERT 0 2`.
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// rows affected by the command, parsed from the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        let tag = self.command_tag.as_deref()?;
        tag.rsplit(' ').next()?.parse().ok()
    }

    /// diagnostic fields, for `FatalError` and `NonfatalError` results.
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        self.diagnostic.as_ref()
    }

    /// convert an error result into the matching taxonomy error.
    pub(crate) fn into_error(mut self) -> Error {
        match self.diagnostic.take() {
            Some(diag) => crate::errors::DbError::new(diag).into(),
            None => Error::unexpected(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rows_affected_parses_tag() {
        let mut res = PgResult::new(ExecStatus::CommandOk);
        res.set_command_tag("INSERT 0 42");
        assert_eq!(res.rows_affected(), Some(42));

        let mut res = PgResult::new(ExecStatus::CommandOk);
        res.set_command_tag("DROP TABLE");
        assert_eq!(res.rows_affected(), None);
    }

    #[test]
    fn out_of_range_access() {
        let res = PgResult::new(ExecStatus::TuplesOk);
        assert!(res.get_value(0, 0).is_err());
    }
}
