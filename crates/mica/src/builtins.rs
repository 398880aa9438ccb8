//! The default native set.
//!
//! These are host-side collaborators, not part of the core: they see
//! their arguments as borrowed [`Object`]s and return an owned result.
//! Hosts that want them call [`install`]; the CLI does.

use crate::{
    object::{NativeCtx, Object},
    run::Interp,
};

/// Registers the default natives: print, len, assert, type_of, str, abs,
/// sqrt, floor.
pub fn install(interp: &mut Interp) {
    interp.register_native("print", print);
    interp.register_native("len", len);
    interp.register_native("assert", assert_true);
    interp.register_native("type_of", type_of);
    interp.register_native("str", to_str);
    interp.register_native("abs", abs);
    interp.register_native("sqrt", sqrt);
    interp.register_native("floor", floor);
}

fn one_arg<'a>(args: &'a [Object]) -> Result<&'a Object, String> {
    match args {
        [arg] => Ok(arg),
        _ => Err(format!("expected 1 argument, got {}", args.len())),
    }
}

/// Space-separated arguments, newline-terminated, through the host's
/// print writer.
fn print(ctx: &mut NativeCtx<'_>, args: &[Object]) -> Result<Object, String> {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            ctx.print_writer().stdout_push(' ');
        }
        ctx.print_writer().stdout_write(&arg.to_string());
    }
    ctx.print_writer().stdout_push('\n');
    Ok(Object::None)
}

fn len(_ctx: &mut NativeCtx<'_>, args: &[Object]) -> Result<Object, String> {
    match one_arg(args)? {
        Object::Array(items) => Ok(Object::Int(i32::try_from(items.len()).unwrap_or(i32::MAX))),
        Object::Str(text) => Ok(Object::Int(i32::try_from(text.len()).unwrap_or(i32::MAX))),
        other => Err(format!("expected an array or string, got {}", kind_name(other))),
    }
}

fn assert_true(_ctx: &mut NativeCtx<'_>, args: &[Object]) -> Result<Object, String> {
    if one_arg(args)?.truthy() {
        Ok(Object::None)
    } else {
        Err("assertion failed".to_owned())
    }
}

fn type_of(_ctx: &mut NativeCtx<'_>, args: &[Object]) -> Result<Object, String> {
    Ok(Object::Str(kind_name(one_arg(args)?).to_owned()))
}

fn to_str(_ctx: &mut NativeCtx<'_>, args: &[Object]) -> Result<Object, String> {
    Ok(Object::Str(one_arg(args)?.to_string()))
}

fn abs(_ctx: &mut NativeCtx<'_>, args: &[Object]) -> Result<Object, String> {
    match one_arg(args)? {
        Object::Int(v) => Ok(Object::Int(v.wrapping_abs())),
        Object::Float(v) => Ok(Object::Float(v.abs())),
        other => Err(format!("expected a number, got {}", kind_name(other))),
    }
}

fn sqrt(_ctx: &mut NativeCtx<'_>, args: &[Object]) -> Result<Object, String> {
    match one_arg(args)? {
        Object::Int(v) => Ok(Object::Float((*v as f32).sqrt())),
        Object::Float(v) => Ok(Object::Float(v.sqrt())),
        other => Err(format!("expected a number, got {}", kind_name(other))),
    }
}

fn floor(_ctx: &mut NativeCtx<'_>, args: &[Object]) -> Result<Object, String> {
    match one_arg(args)? {
        Object::Int(v) => Ok(Object::Int(*v)),
        Object::Float(v) => Ok(Object::Float(v.floor())),
        other => Err(format!("expected a number, got {}", kind_name(other))),
    }
}

fn kind_name(object: &Object) -> &'static str {
    match object {
        Object::None => "none",
        Object::Bool(_) => "bool",
        Object::Int(_) => "int",
        Object::Float(_) => "float",
        Object::Str(_) => "string",
        Object::Array(_) => "array",
        Object::Closure => "fn",
        Object::Native => "native",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::CollectStringPrint;

    fn call(func: crate::object::NativeFn, args: &[Object]) -> (Result<Object, String>, String) {
        let mut collect = CollectStringPrint::new();
        let result = {
            let mut ctx = NativeCtx { print: &mut collect };
            func(&mut ctx, args)
        };
        (result, collect.into_output())
    }

    #[test]
    fn print_separates_with_spaces_and_ends_with_newline() {
        let (result, output) = call(print, &[Object::Int(1), Object::Str("two".to_owned()), Object::Bool(true)]);
        assert!(matches!(result, Ok(Object::None)));
        assert_eq!(output, "1 two true\n");
    }

    #[test]
    fn len_handles_arrays_and_strings() {
        let (result, _) = call(len, &[Object::Array(vec![Object::Int(1), Object::Int(2)])]);
        assert_eq!(result.unwrap(), Object::Int(2));
        let (result, _) = call(len, &[Object::Str("abcd".to_owned())]);
        assert_eq!(result.unwrap(), Object::Int(4));
        let (result, _) = call(len, &[Object::Int(3)]);
        assert!(result.unwrap_err().contains("expected an array or string"));
    }

    #[test]
    fn assert_rejects_falsy_values() {
        assert!(call(assert_true, &[Object::Bool(true)]).0.is_ok());
        assert!(call(assert_true, &[Object::Int(7)]).0.is_ok());
        assert_eq!(call(assert_true, &[Object::Int(0)]).0.unwrap_err(), "assertion failed");
        assert_eq!(call(assert_true, &[Object::None]).0.unwrap_err(), "assertion failed");
    }

    #[test]
    fn type_of_names() {
        let (result, _) = call(type_of, &[Object::Float(1.5)]);
        assert_eq!(result.unwrap(), Object::Str("float".to_owned()));
        let (result, _) = call(type_of, &[Object::Closure]);
        assert_eq!(result.unwrap(), Object::Str("fn".to_owned()));
    }

    #[test]
    fn numeric_helpers() {
        assert_eq!(call(abs, &[Object::Int(-4)]).0.unwrap(), Object::Int(4));
        assert_eq!(call(abs, &[Object::Float(-2.5)]).0.unwrap(), Object::Float(2.5));
        assert_eq!(call(sqrt, &[Object::Int(9)]).0.unwrap(), Object::Float(3.0));
        assert_eq!(call(floor, &[Object::Float(2.75)]).0.unwrap(), Object::Float(2.0));
        assert_eq!(call(floor, &[Object::Int(3)]).0.unwrap(), Object::Int(3));
        assert!(call(sqrt, &[Object::Str("x".to_owned())]).0.is_err());
    }

    #[test]
    fn str_uses_display_formatting() {
        let (result, _) = call(to_str, &[Object::Array(vec![Object::Int(1), Object::Float(0.5)])]);
        assert_eq!(result.unwrap(), Object::Str("[1, 0.5]".to_owned()));
    }
}
