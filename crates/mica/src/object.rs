//! Host-facing value type.
//!
//! `Object` is the exchange currency at the embedding boundary: globals go
//! in and out as `Object`s, and native functions receive their arguments
//! as `Object`s and return one. Data variants convert both ways (arrays
//! deep-copy, strings intern); closures and natives surface as opaque
//! markers.

use std::fmt;

use crate::{
    heap::{Heap, HeapData, HeapId},
    intern::Interner,
    io::PrintWriter,
    value::Value,
};

/// A mica value as seen by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(String),
    Array(Vec<Object>),
    /// Marker for a closure value; closures do not round-trip to the host.
    Closure,
    /// Marker for a native-function value.
    Native,
}

impl Object {
    /// Language truthiness: `false`, `None`, `0`, and `0.0` are falsy;
    /// everything else (including empty arrays and strings) is truthy.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::None | Self::Bool(false) | Self::Int(0) => false,
            Self::Float(f) => *f != 0.0,
            _ => true,
        }
    }

    /// Deep-copies a runtime value out of the interpreter.
    pub(crate) fn from_value(value: &Value, heap: &Heap) -> Self {
        match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) => Self::Float(*f),
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Self::Str(s.text.to_string()),
                HeapData::Array(elems) => Self::Array(elems.iter().map(|e| Self::from_value(e, heap)).collect()),
                HeapData::Closure(_) => Self::Closure,
                // Iterators and upvalue cells never escape the VM.
                HeapData::Upvalue(_) | HeapData::Iter(_) => Self::None,
            },
            Value::Native(_) => Self::Native,
        }
    }

    /// Converts a host value into a retained runtime value, interning
    /// strings and allocating arrays. The opaque markers carry no payload
    /// and come in as `none`.
    pub(crate) fn into_value(self, heap: &mut Heap, interner: &mut Interner) -> Value {
        match self {
            Self::None | Self::Closure | Self::Native => Value::None,
            Self::Bool(b) => Value::Bool(b),
            Self::Int(i) => Value::Int(i),
            Self::Float(f) => Value::Float(f),
            Self::Str(s) => Value::Ref(interner.intern(heap, &s)),
            Self::Array(items) => {
                let elems: Vec<Value> = items.into_iter().map(|o| o.into_value(heap, interner)).collect();
                Value::Ref(heap.allocate(HeapData::Array(elems)))
            }
        }
    }
}

/// Formats a float the way the language displays it: shortest
/// round-tripping decimal, with `inf`/`NaN` spelled out since ryu only
/// handles finite values.
fn write_float(f: &mut fmt::Formatter<'_>, value: f32) -> fmt::Result {
    if value.is_finite() {
        let mut buffer = ryu::Buffer::new();
        f.write_str(buffer.format(value))
    } else if value.is_nan() {
        f.write_str("NaN")
    } else if value > 0.0 {
        f.write_str("inf")
    } else {
        f.write_str("-inf")
    }
}

impl fmt::Display for Object {
    /// The single formatting path used by `print` and `str`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("true"),
            Self::Bool(false) => f.write_str("false"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write_float(f, *v),
            Self::Str(s) => f.write_str(s),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Closure => f.write_str("<fn>"),
            Self::Native => f.write_str("<native fn>"),
        }
    }
}

/// Context handed to native functions.
pub struct NativeCtx<'a> {
    pub(crate) print: &'a mut dyn PrintWriter,
}

impl NativeCtx<'_> {
    /// The writer program output goes to.
    pub fn print_writer(&mut self) -> &mut dyn PrintWriter {
        self.print
    }
}

/// A host-supplied native function. Arguments are borrowed copies; the
/// return value is owned. A returned `Err` becomes a fatal runtime error
/// naming the native.
pub type NativeFn = fn(&mut NativeCtx<'_>, &[Object]) -> Result<Object, String>;

/// One entry in the bounded native registry.
pub(crate) struct NativeEntry {
    /// Interned function name, retained by the registry.
    pub name: HeapId,
    pub func: NativeFn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(Object::None.to_string(), "None");
        assert_eq!(Object::Bool(true).to_string(), "true");
        assert_eq!(Object::Int(-7).to_string(), "-7");
        assert_eq!(Object::Float(2.5).to_string(), "2.5");
        assert_eq!(Object::Float(1.0).to_string(), "1.0");
        assert_eq!(Object::Str("hi".to_owned()).to_string(), "hi");
        let arr = Object::Array(vec![Object::Int(1), Object::Str("x".to_owned())]);
        assert_eq!(arr.to_string(), "[1, x]");
        assert_eq!(Object::Closure.to_string(), "<fn>");
    }

    #[test]
    fn value_round_trip() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let obj = Object::Array(vec![Object::Int(1), Object::Str("s".to_owned()), Object::None]);
        let value = obj.clone().into_value(&mut heap, &mut interner);
        assert_eq!(Object::from_value(&value, &heap), obj);
        value.drop_with_heap(&mut heap);
        // The interner still holds the "s" literal.
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn host_truthiness_matches_language() {
        assert!(!Object::Int(0).truthy());
        assert!(!Object::Float(0.0).truthy());
        assert!(Object::Str(String::new()).truthy());
        assert!(Object::Array(Vec::new()).truthy());
    }
}
