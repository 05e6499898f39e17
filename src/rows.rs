//! row values and row factories.

use core::fmt;

use std::sync::Arc;

use crate::{
    column::Column,
    value::{downcast, SqlValue},
};

pub type BoxValue = Box<dyn SqlValue>;

/// closure producing a host row from an ordered sequence of loaded cells.
/// the default keeps the cells as they are.
pub type RowFactory = Arc<dyn Fn(Vec<Option<BoxValue>>, Arc<[Column]>) -> Row + Send + Sync>;

/// the identity row factory.
pub fn tuple_row() -> RowFactory {
    Arc::new(|cells, columns| Row { cells, columns })
}

/// one result row: loaded cell values plus the column metadata they came from.
pub struct Row {
    cells: Vec<Option<BoxValue>>,
    columns: Arc<[Column]>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// cell by position. `None` is the sql NULL.
    pub fn get(&self, idx: usize) -> Option<&dyn SqlValue> {
        self.cells.get(idx).and_then(|cell| cell.as_deref())
    }

    /// cell by position, downcast to a concrete host type.
    pub fn get_as<T: 'static>(&self, idx: usize) -> Option<&T> {
        self.get(idx).and_then(downcast::<T>)
    }

    /// cell by column name. the first column with that name wins.
    pub fn get_by_name(&self, name: &str) -> Option<&dyn SqlValue> {
        let idx = self.columns.iter().position(|col| col.name() == name)?;
        self.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&dyn SqlValue>> {
        self.cells.iter().map(|cell| cell.as_deref())
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (col, cell) in self.columns.iter().zip(&self.cells) {
            match cell {
                Some(v) => map.entry(&col.name(), v),
                None => map.entry(&col.name(), &"NULL"),
            };
        }
        map.finish()
    }
}
