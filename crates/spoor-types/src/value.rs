//! Variable-value conversion: how a typed value at a call site becomes a
//! `(name, type, stringified)` triple.
//!
//! Two layers. `TraceValue` is the compile-time path the `watch!` macros
//! use for primitives. `ConverterRegistry` lets an application install a
//! converter for its own types, keyed by `TypeId`; a registered converter
//! wins over the trait impl.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use crate::{ConverterFn, RegistryInner, VariableType, VariableValue};

/// A value that knows how to snapshot itself.
pub trait TraceValue {
    fn variable_type(&self) -> VariableType;
    fn render(&self) -> String;
}

impl TraceValue for str {
    fn variable_type(&self) -> VariableType {
        VariableType::String
    }

    fn render(&self) -> String {
        self.to_owned()
    }
}

impl TraceValue for String {
    fn variable_type(&self) -> VariableType {
        VariableType::String
    }

    fn render(&self) -> String {
        self.clone()
    }
}

impl TraceValue for bool {
    fn variable_type(&self) -> VariableType {
        VariableType::Boolean
    }

    fn render(&self) -> String {
        self.to_string()
    }
}

impl<T: TraceValue + ?Sized> TraceValue for &T {
    fn variable_type(&self) -> VariableType {
        (**self).variable_type()
    }

    fn render(&self) -> String {
        (**self).render()
    }
}

macro_rules! integer_trace_value {
    ($($ty:ty),+ $(,)?) => {
        $(impl TraceValue for $ty {
            fn variable_type(&self) -> VariableType {
                VariableType::Integer
            }

            fn render(&self) -> String {
                self.to_string()
            }
        })+
    };
}

integer_trace_value!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

macro_rules! float_trace_value {
    ($($ty:ty),+ $(,)?) => {
        $(impl TraceValue for $ty {
            fn variable_type(&self) -> VariableType {
                VariableType::Float
            }

            fn render(&self) -> String {
                self.to_string()
            }
        })+
    };
}

float_trace_value!(f32, f64);

/// Snapshot a value through its `TraceValue` impl.
pub fn variable<T: TraceValue + ?Sized>(name: &str, value: &T) -> VariableValue {
    VariableValue {
        name: name.to_owned(),
        value_type: value.variable_type(),
        value: value.render(),
    }
}

/// Per-type converter registry keyed by `TypeId`.
///
/// Registration is expected at process startup, before tracing begins;
/// the registry itself is immutable while shared (the dispatcher keeps it
/// behind a lock).
pub struct ConverterRegistry {
    inner: RegistryInner,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self {
            inner: RegistryInner {
                converters: HashMap::new(),
            },
        }
    }

    pub fn register<T, F>(&mut self, convert: F)
    where
        T: Any,
        F: Fn(&T) -> (VariableType, String) + Send + Sync + 'static,
    {
        let erased: ConverterFn = Box::new(move |value: &dyn Any| {
            value.downcast_ref::<T>().map(|v| convert(v))
        });
        self.inner.converters.insert(TypeId::of::<T>(), erased);
    }

    pub fn is_registered<T: Any>(&self) -> bool {
        self.inner.converters.contains_key(&TypeId::of::<T>())
    }

    /// Convert a primitive: a registered converter overrides the
    /// `TraceValue` impl.
    pub fn convert<T>(&self, name: &str, value: &T) -> VariableValue
    where
        T: Any + TraceValue,
    {
        if let Some(converted) = self.lookup(value) {
            return converted.into_variable(name);
        }
        variable(name, value)
    }

    /// Convert an arbitrary type: a registered converter if there is one,
    /// otherwise an opaque `Debug` rendering.
    pub fn convert_opaque<T>(&self, name: &str, value: &T) -> VariableValue
    where
        T: Any + fmt::Debug,
    {
        if let Some(converted) = self.lookup(value) {
            return converted.into_variable(name);
        }
        VariableValue {
            name: name.to_owned(),
            value_type: VariableType::Opaque,
            value: format!("{value:?}"),
        }
    }

    fn lookup<T: Any>(&self, value: &T) -> Option<Converted> {
        let convert = self.inner.converters.get(&TypeId::of::<T>())?;
        let (value_type, rendered) = convert(value)?;
        Some(Converted {
            value_type,
            rendered,
        })
    }
}

struct Converted {
    value_type: VariableType,
    rendered: String,
}

impl Converted {
    fn into_variable(self, name: &str) -> VariableValue {
        VariableValue {
            name: name.to_owned(),
            value_type: self.value_type,
            value: self.rendered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_pick_their_type_tag() {
        assert_eq!(variable("n", &7u32).value_type, VariableType::Integer);
        assert_eq!(variable("x", &1.5f64).value_type, VariableType::Float);
        assert_eq!(variable("ok", &true).value_type, VariableType::Boolean);
        let v = variable("name", "Max");
        assert_eq!(v.value_type, VariableType::String);
        assert_eq!(v.value, "Max");
    }

    #[test]
    fn registered_converter_overrides_trait_impl() {
        let mut registry = ConverterRegistry::new();
        registry.register::<u32, _>(|n| (VariableType::String, format!("#{n}")));

        let v = registry.convert("id", &42u32);
        assert_eq!(v.value_type, VariableType::String);
        assert_eq!(v.value, "#42");

        // Unregistered primitive falls back to the trait impl.
        let v = registry.convert("id", &42u64);
        assert_eq!(v.value_type, VariableType::Integer);
        assert_eq!(v.value, "42");
    }

    #[test]
    fn unregistered_custom_type_is_opaque() {
        #[derive(Debug)]
        struct Point {
            x: i32,
            y: i32,
        }

        let registry = ConverterRegistry::new();
        let v = registry.convert_opaque("p", &Point { x: 1, y: 2 });
        assert_eq!(v.value_type, VariableType::Opaque);
        assert_eq!(v.value, "Point { x: 1, y: 2 }");
    }

    #[test]
    fn registered_custom_type_uses_its_converter() {
        struct Celsius(f64);

        let mut registry = ConverterRegistry::new();
        registry.register::<Celsius, _>(|c| (VariableType::Float, format!("{:.1}", c.0)));
        assert!(registry.is_registered::<Celsius>());

        let v = registry
            .lookup(&Celsius(21.52))
            .expect("registered type must resolve");
        assert_eq!(v.rendered, "21.5");
    }
}
