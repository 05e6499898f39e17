//! the host value model.
//!
//! adaptation is type directed: the registry is keyed by the runtime type of
//! the value being dumped. [`SqlValue`] is the object safe surface that makes
//! that possible: any value behind it exposes its [`TypeId`] for registry
//! lookup, unwraps its `Option` layer (the sql NULL), and opts into the
//! structural views (list, range) the container dumpers dispatch on.

use core::{
    any::{Any, TypeId},
    fmt,
    ops::Bound,
};

/// a value that can travel through the adaptation layer.
pub trait SqlValue: Any + fmt::Debug + Send + Sync {
    /// the value as [`Any`], for dumper downcasts.
    fn as_any(&self) -> &dyn Any;

    /// strip the `Option` layer. `None` is the sql NULL; scalar values return
    /// themselves.
    fn unwrap_opt(&self) -> Option<&dyn SqlValue>;

    /// stable name of the concrete type, used for registrations made by name
    /// before the type's dumper is first constructed.
    fn type_name(&self) -> &'static str;

    /// structural view for array dumping.
    fn as_list(&self) -> Option<&dyn ListValue> {
        None
    }

    /// structural view for range dumping.
    fn as_range(&self) -> Option<RangeView<'_>> {
        None
    }
}

/// element access for values dumped as arrays.
pub trait ListValue: Send + Sync {
    fn len(&self) -> usize;
    fn get(&self, idx: usize) -> &dyn SqlValue;

    /// type id of the first non null, non list element, recursing into nested
    /// lists. drives the array dumper's key upgrade.
    fn element_type(&self) -> Option<TypeId> {
        for i in 0..self.len() {
            let item = self.get(i);
            match item.unwrap_opt() {
                None => continue,
                Some(inner) => match inner.as_list() {
                    Some(list) => match list.element_type() {
                        Some(id) => return Some(id),
                        None => continue,
                    },
                    None => return Some(inner.as_any().type_id()),
                },
            }
        }
        None
    }
}

/// borrowed view over a range value's parts.
pub struct RangeView<'a> {
    pub lower: Bound<&'a dyn SqlValue>,
    pub upper: Bound<&'a dyn SqlValue>,
    pub empty: bool,
}

macro_rules! scalar_value {
    ($($t:ty),* $(,)?) => {
        $(
            impl SqlValue for $t {
                fn as_any(&self) -> &dyn Any {
                    self
                }

                fn unwrap_opt(&self) -> Option<&dyn SqlValue> {
                    Some(self)
                }

                fn type_name(&self) -> &'static str {
                    core::any::type_name::<$t>()
                }
            }
        )*
    };
}

scalar_value!(
    bool,
    i16,
    i32,
    i64,
    f32,
    f64,
    String,
    &'static str,
    Vec<u8>,
    serde_json::Value,
    chrono::NaiveDate,
    chrono::NaiveTime,
    chrono::NaiveDateTime,
    chrono::DateTime<chrono::FixedOffset>,
    chrono::DateTime<chrono::Utc>,
);

impl<T> SqlValue for Option<T>
where
    T: SqlValue,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn unwrap_opt(&self) -> Option<&dyn SqlValue> {
        self.as_ref().and_then(|v| v.unwrap_opt())
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<Option<T>>()
    }
}

impl<T> SqlValue for Vec<T>
where
    T: SqlValue,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn unwrap_opt(&self) -> Option<&dyn SqlValue> {
        Some(self)
    }

    fn type_name(&self) -> &'static str {
        core::any::type_name::<Vec<T>>()
    }

    fn as_list(&self) -> Option<&dyn ListValue> {
        Some(self)
    }
}

impl<T> ListValue for Vec<T>
where
    T: SqlValue,
{
    fn len(&self) -> usize {
        self.len()
    }

    fn get(&self, idx: usize) -> &dyn SqlValue {
        &self[idx]
    }
}

/// downcast helper. `None` when the value is of another type.
pub fn downcast<T: 'static>(value: &dyn SqlValue) -> Option<&T> {
    value.as_any().downcast_ref::<T>()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn option_layers_unwrap_to_inner() {
        let v: Option<i32> = Some(5);
        let inner = v.unwrap_opt().unwrap();
        assert_eq!(inner.as_any().type_id(), TypeId::of::<i32>());

        let v: Option<i32> = None;
        assert!(v.unwrap_opt().is_none());
    }

    #[test]
    fn list_element_type_skips_nulls() {
        let v: Vec<Option<i64>> = vec![None, Some(3)];
        let list = v.as_list().unwrap();
        assert_eq!(list.element_type(), Some(TypeId::of::<i64>()));

        let v: Vec<Option<i64>> = vec![None, None];
        assert_eq!(v.as_list().unwrap().element_type(), None);
    }

    #[test]
    fn nested_list_element_type() {
        let v: Vec<Vec<String>> = vec![vec!["x".to_string()]];
        assert_eq!(v.as_list().unwrap().element_type(), Some(TypeId::of::<String>()));
    }
}
