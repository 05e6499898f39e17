//! the per-query adaptation engine.
//!
//! a [`Transformer`] lives for one query (reused across re-executions of the
//! same prepared statement) and caches constructed dumper and loader
//! instances so adapting many values of the same type costs one registry
//! lookup total.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use postgres_types::Oid;

use crate::{
    adapt::{AdaptContext, Dumper, DumperKey, Loader, ParamFormat},
    column::Column,
    errors::{Error, InterfaceError, ProgrammingError},
    oids,
    pq::{Format, PgResult},
    rows::{tuple_row, BoxValue, Row, RowFactory},
    value::SqlValue,
};

pub struct Transformer {
    ctx: AdaptContext,
    dumpers_cache: HashMap<(DumperKey, ParamFormat), Arc<dyn Dumper>>,
    loaders_cache: [HashMap<Oid, Arc<dyn Loader>>; 2],
    row_loaders: Vec<Arc<dyn Loader>>,
    // per parameter slot dumper cache, the executemany fast path
    row_dumpers: Vec<Option<Arc<dyn Dumper>>>,
    columns: Arc<[Column]>,
    ntuples: usize,
    row_factory: RowFactory,
}

impl Transformer {
    pub fn new(ctx: AdaptContext) -> Self {
        Self {
            ctx,
            dumpers_cache: HashMap::new(),
            loaders_cache: [HashMap::new(), HashMap::new()],
            row_loaders: Vec::new(),
            row_dumpers: Vec::new(),
            columns: Arc::from([]),
            ntuples: 0,
            row_factory: tuple_row(),
        }
    }

    pub fn set_row_factory(&mut self, factory: RowFactory) {
        self.row_factory = factory;
    }

    pub fn columns(&self) -> Arc<[Column]> {
        self.columns.clone()
    }

    /// dump one parameter sequence into wire form.
    ///
    /// each slot caches its dumper across calls, so re-dumping row after row
    /// for `executemany` never repeats the registry walk.
    pub fn dump_sequence(
        &mut self,
        params: &[&dyn SqlValue],
        formats: &[ParamFormat],
    ) -> Result<(Vec<Option<Bytes>>, Vec<Oid>, Vec<Format>), Error> {
        let mut values = Vec::with_capacity(params.len());
        let mut types = Vec::with_capacity(params.len());
        let mut fmts = Vec::with_capacity(params.len());

        if self.row_dumpers.len() != params.len() {
            self.row_dumpers = vec![None; params.len()];
        }

        for (i, param) in params.iter().enumerate() {
            match param.unwrap_opt() {
                None => {
                    values.push(None);
                    types.push(oids::INVALID_OID);
                    fmts.push(Format::Text);
                    self.row_dumpers[i] = None;
                }
                Some(value) => {
                    let dumper = match self.row_dumpers[i].clone() {
                        Some(dumper) => {
                            // the cached dumper may not fit this row's value,
                            // e.g. an integer crossing a width threshold
                            let key = dumper.get_key(value, formats[i]);
                            if key == dumper.key() {
                                dumper
                            } else {
                                let dumper = self.get_dumper(value, formats[i])?;
                                self.row_dumpers[i] = Some(dumper.clone());
                                dumper
                            }
                        }
                        None => {
                            let dumper = self.get_dumper(value, formats[i])?;
                            self.row_dumpers[i] = Some(dumper.clone());
                            dumper
                        }
                    };
                    values.push(Some(dumper.dump(value)?));
                    types.push(dumper.oid());
                    fmts.push(dumper.format());
                }
            }
        }

        Ok((values, types, fmts))
    }

    /// a dumper instance fit for this value, constructing, caching and
    /// upgrading as needed.
    pub fn get_dumper(&mut self, value: &dyn SqlValue, format: ParamFormat) -> Result<Arc<dyn Dumper>, Error> {
        let key = DumperKey::Type(value.as_any().type_id());

        let dumper = match self.dumpers_cache.get(&(key, format)) {
            Some(dumper) => dumper.clone(),
            None => {
                let lookup_key = self.registry_key(key, value, format);
                let entry = self
                    .ctx
                    .adapters
                    .get_dumper(lookup_key, value.type_name(), format)?;
                let dumper = (entry.factory)(lookup_key, entry.format, &self.ctx)?;
                self.dumpers_cache.insert((key, format), dumper.clone());
                dumper
            }
        };

        // ask the dumper whether this value needs a more specific instance
        let upgraded_key = dumper.get_key(value, format);
        if upgraded_key == dumper.key() {
            return Ok(dumper);
        }
        if let Some(upgraded) = self.dumpers_cache.get(&(upgraded_key, format)) {
            return Ok(upgraded.clone());
        }
        let upgraded = dumper.upgrade(value, format)?;
        self.dumpers_cache.insert((upgraded_key, format), upgraded.clone());
        Ok(upgraded)
    }

    // a type key with no direct registration falls back to the structural
    // keys the container dumpers register under
    fn registry_key(&self, key: DumperKey, value: &dyn SqlValue, format: ParamFormat) -> DumperKey {
        if self
            .ctx
            .adapters
            .get_dumper(key, value.type_name(), format)
            .is_ok()
        {
            return key;
        }
        if value.as_list().is_some() {
            return DumperKey::Name("list");
        }
        if value.as_range().is_some() {
            return DumperKey::Name("range");
        }
        key
    }

    /// install the per-column loader vector for a new result.
    pub fn set_result(&mut self, res: Option<&PgResult>) -> Result<(), Error> {
        let res = match res {
            Some(res) => res,
            None => {
                self.row_loaders.clear();
                self.columns = Arc::from([]);
                self.ntuples = 0;
                return Ok(());
            }
        };

        self.ntuples = res.ntuples();
        let mut loaders = Vec::with_capacity(res.nfields());
        let mut columns = Vec::with_capacity(res.nfields());
        for field in res.fields() {
            loaders.push(self.get_loader(field.type_oid(), field.format())?);
            columns.push(Column::from_field(field));
        }
        self.row_loaders = loaders;
        self.columns = Arc::from(columns);
        Ok(())
    }

    /// a loader for the oid, falling back to the unknown-oid loader of the
    /// format when nothing is registered.
    pub fn get_loader(&mut self, oid: Oid, format: Format) -> Result<Arc<dyn Loader>, Error> {
        let idx = match format {
            Format::Text => 0,
            Format::Binary => 1,
        };
        if let Some(loader) = self.loaders_cache[idx].get(&oid) {
            return Ok(loader.clone());
        }
        let entry = self
            .ctx
            .adapters
            .get_loader(oid, format)
            .or_else(|| self.ctx.adapters.get_loader(oids::INVALID_OID, format))
            .ok_or_else(|| InterfaceError::new("unknown oid loader not found"))?;
        let loader = (entry.factory)(oid, entry.format, &self.ctx)?;
        self.loaders_cache[idx].insert(oid, loader.clone());
        Ok(loader)
    }

    /// materialise one row. `None` when the index is out of range.
    pub fn load_row(&self, res: &PgResult, row: usize) -> Result<Option<Row>, Error> {
        if row >= res.ntuples() {
            return Ok(None);
        }
        self.load_one(res, row).map(Some)
    }

    /// materialise the rows in `[row0, row1)`.
    pub fn load_rows(&self, res: &PgResult, row0: usize, row1: usize) -> Result<Vec<Row>, Error> {
        if row0 > res.ntuples() || row1 > res.ntuples() {
            return Err(InterfaceError::new(format!(
                "rows must be included between 0 and {}",
                res.ntuples()
            ))
            .into());
        }
        (row0..row1).map(|row| self.load_one(res, row)).collect()
    }

    fn load_one(&self, res: &PgResult, row: usize) -> Result<Row, Error> {
        let mut cells: Vec<Option<BoxValue>> = Vec::with_capacity(self.row_loaders.len());
        for (col, loader) in self.row_loaders.iter().enumerate() {
            match res.get_value(row, col)? {
                None => cells.push(None),
                Some(raw) => cells.push(Some(loader.load(raw)?)),
            }
        }
        Ok((self.row_factory)(cells, self.columns.clone()))
    }

    /// load an out of band sequence of raw cells (the COPY read path) through
    /// the current loader vector.
    pub fn load_sequence(&self, record: &[Option<&[u8]>]) -> Result<Vec<Option<BoxValue>>, Error> {
        if record.len() != self.row_loaders.len() {
            return Err(ProgrammingError::new(format!(
                "cannot load sequence of {} items: {} loaders registered",
                record.len(),
                self.row_loaders.len()
            ))
            .into());
        }
        record
            .iter()
            .zip(&self.row_loaders)
            .map(|(cell, loader)| match cell {
                None => Ok(None),
                Some(raw) => loader.load(raw).map(Some),
            })
            .collect()
    }

    /// install loaders for explicitly given column types, for result-less
    /// paths that still need to decode values.
    pub fn set_row_types(&mut self, types: &[Oid], formats: &[Format]) -> Result<(), Error> {
        let mut loaders = Vec::with_capacity(types.len());
        for (oid, format) in types.iter().zip(formats) {
            loaders.push(self.get_loader(*oid, *format)?);
        }
        self.row_loaders = loaders;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::downcast;

    fn transformer() -> Transformer {
        let adapters = Arc::new(crate::adapt::AdaptersMap::layer(
            &crate::adapt::global_adapters().read().unwrap(),
        ));
        Transformer::new(AdaptContext {
            adapters,
            encoding: None,
            timezone: None,
        })
    }

    #[test]
    fn dump_sequence_basic() {
        let mut tx = transformer();
        let one = 1i64;
        let foo = "foo".to_string();
        let nil: Option<i64> = None;
        let params: Vec<&dyn SqlValue> = vec![&one, &foo, &nil];
        let (values, types, formats) = tx
            .dump_sequence(&params, &[ParamFormat::Auto; 3])
            .unwrap();

        assert_eq!(values[0].as_deref(), Some(&1i16.to_be_bytes()[..]));
        assert_eq!(types[0], oids::INT2_OID);
        assert_eq!(formats[0], Format::Binary);

        assert_eq!(values[1].as_deref(), Some(&b"foo"[..]));
        assert_eq!(types[1], oids::INVALID_OID);
        assert_eq!(formats[1], Format::Text);

        assert_eq!(values[2], None);
        assert_eq!(types[2], oids::INVALID_OID);
    }

    #[test]
    fn dumper_upgrade_is_cached_per_width() {
        let mut tx = transformer();
        let small = 1i64;
        let large = 1i64 << 40;

        let d1 = tx.get_dumper(&small, ParamFormat::Binary).unwrap();
        assert_eq!(d1.oid(), oids::INT2_OID);
        let d2 = tx.get_dumper(&large, ParamFormat::Binary).unwrap();
        assert_eq!(d2.oid(), oids::INT8_OID);
        // same widths come back from the cache
        let d3 = tx.get_dumper(&small, ParamFormat::Binary).unwrap();
        assert!(Arc::ptr_eq(&d1, &d3));
    }

    #[test]
    fn executemany_slot_cache_requires_no_relookup() {
        let mut tx = transformer();
        let a = 1i64;
        let b = 2i64;
        let pa: Vec<&dyn SqlValue> = vec![&a];
        let pb: Vec<&dyn SqlValue> = vec![&b];
        tx.dump_sequence(&pa, &[ParamFormat::Auto]).unwrap();
        let (values, types, _) = tx.dump_sequence(&pb, &[ParamFormat::Auto]).unwrap();
        assert_eq!(types[0], oids::INT2_OID);
        assert_eq!(values[0].as_deref(), Some(&2i16.to_be_bytes()[..]));
    }

    #[test]
    fn list_dumper_dispatches_structurally() {
        let mut tx = transformer();
        let v: Vec<i64> = vec![1, 2];
        let dumper = tx.get_dumper(&v, ParamFormat::Text).unwrap();
        assert_eq!(dumper.oid(), oids::INT2_ARRAY_OID);
        assert_eq!(&dumper.dump(&v).unwrap()[..], b"{1,2}");
    }

    #[test]
    fn load_sequence_length_mismatch() {
        let tx = transformer();
        let err = tx.load_sequence(&[Some(&b"1"[..])]).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Programming);
    }

    #[test]
    fn loader_fallback_for_unknown_oid() {
        let mut tx = transformer();
        let loader = tx.get_loader(999_999, Format::Text).unwrap();
        let loaded = loader.load(b"anything").unwrap();
        assert_eq!(downcast::<String>(&*loaded).map(String::as_str), Some("anything"));
    }
}
