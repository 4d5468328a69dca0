//! Serialization of state into a JSON atom tree.
//!
//! A snapshot is a `serde_json::Value` restricted to numbers, strings,
//! booleans, null, ordered maps and lists. Records serialize as ordered maps
//! whose first key is `_type` (the record's local type name) followed by the
//! fields in declaration order; the [`record`] builder enforces that shape.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::SnapshotError;


/// Types that can serialize themselves into a snapshot atom tree.
///
/// ```rust
/// use eddy_core::snapshot::{self, Snapshot};
/// use eddy_core::error::SnapshotError;
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct CounterState {
///     value: i64,
/// }
///
/// impl Snapshot for CounterState {
///     fn snapshot(&self) -> Result<serde_json::Value, SnapshotError> {
///         Ok(snapshot::record(
///             "CounterState",
///             [("value", self.value.snapshot()?)],
///         ))
///     }
/// }
/// ```
pub trait Snapshot {
    /// Serialize this value.
    fn snapshot(&self) -> Result<Value, SnapshotError>;
}

/// Build the ordered map for a record: `_type` first, then the fields in
/// the given order.
pub fn record<'a>(type_name: &str, fields: impl IntoIterator<Item = (&'a str, Value)>) -> Value {
    let mut map = Map::new();
    map.insert("_type".to_owned(), Value::String(type_name.to_owned()));
    for (name, value) in fields {
        map.insert(name.to_owned(), value);
    }
    Value::Object(map)
}

/// Serialize any `serde`-serializable value into an atom.
///
/// Convenience for leaf fields that already derive `Serialize`; values that
/// serde cannot represent yield [`SnapshotError::Unsupported`].
pub fn atom<T: Serialize>(value: &T) -> Result<Value, SnapshotError> {
    serde_json::to_value(value).map_err(|_| SnapshotError::Unsupported {
        type_name: std::any::type_name::<T>(),
    })
}

macro_rules! impl_snapshot_for_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Snapshot for $ty {
                fn snapshot(&self) -> Result<Value, SnapshotError> {
                    Ok(Value::from(*self))
                }
            }
        )*
    };
}

impl_snapshot_for_int!(i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

impl Snapshot for f32 {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        (f64::from(*self)).snapshot()
    }
}

impl Snapshot for f64 {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        if self.is_finite() {
            Ok(Value::from(*self))
        } else {
            Err(SnapshotError::NonFiniteNumber { value: *self })
        }
    }
}

impl Snapshot for bool {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        Ok(Value::Bool(*self))
    }
}

impl Snapshot for String {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        Ok(Value::String(self.clone()))
    }
}

impl Snapshot for &str {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        Ok(Value::String((*self).to_owned()))
    }
}

impl<T: Snapshot> Snapshot for Option<T> {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        match self {
            Some(value) => value.snapshot(),
            None => Ok(Value::Null),
        }
    }
}

impl<T: Snapshot> Snapshot for Vec<T> {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        self.as_slice().snapshot()
    }
}

impl<T: Snapshot> Snapshot for [T] {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        self.iter()
            .map(Snapshot::snapshot)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }
}

impl<T: Snapshot> Snapshot for &[T] {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        (**self).snapshot()
    }
}

impl<A: Snapshot, B: Snapshot> Snapshot for (A, B) {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        Ok(Value::Array(vec![self.0.snapshot()?, self.1.snapshot()?]))
    }
}

impl<A: Snapshot, B: Snapshot, C: Snapshot> Snapshot for (A, B, C) {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        Ok(Value::Array(vec![
            self.0.snapshot()?,
            self.1.snapshot()?,
            self.2.snapshot()?,
        ]))
    }
}
