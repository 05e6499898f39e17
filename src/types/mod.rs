//! the adapter catalogue: dumpers and loaders for the builtin types.

pub(crate) mod array;
pub(crate) mod datetime;
pub(crate) mod json;
pub(crate) mod numeric;
pub(crate) mod range;
pub(crate) mod singletons;
pub(crate) mod text;

pub use self::{array::PgArray, range::PgRange};

use crate::adapt::AdaptersMap;

/// fill a map with the adapters for every type the crate supports out of the
/// box. called once when the global registry is first touched.
pub(crate) fn register_default_adapters(map: &mut AdaptersMap) {
    singletons::register(map);
    numeric::register(map);
    text::register(map);
    datetime::register(map);
    json::register(map);
    array::register(map);
    range::register(map);
}
