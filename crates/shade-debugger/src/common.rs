//! Built-in host library
//!
//! The minimal library every installed program gets: the `$$discard`
//! callback (routing the shader's discard signal back to the owning
//! debugger through the program's user-data handle) and the texture
//! sampler intrinsics backed by the [`Texture`] collaborator.

use crate::texture::Texture;
use crate::DebugHooks;
use shade_vm::{Library, Object, Program, Value};
use std::rc::Rc;

/// Name of the discard callback
pub const DISCARD_FN: &str = "$$discard";

/// Build the built-in library
pub fn common_library() -> Library {
    let mut lib = Library::new("common");

    lib.add(DISCARD_FN, |program: &Program, _: &mut Vec<Value>| {
        if let Some(data) = program.user_data() {
            if let Some(hooks) = data.downcast_ref::<DebugHooks>() {
                hooks.discarded.set(true);
            }
        }
        program.abort();
        Value::Null
    });

    // GLSL and HLSL sampler spellings share one implementation
    for name in ["texture", "texture2D", "texture3D", "tex2D"] {
        lib.add(name, |_: &Program, args: &mut Vec<Value>| sample(args, false));
    }
    lib.add("texelFetch", |_: &Program, args: &mut Vec<Value>| {
        sample(args, true)
    });

    lib
}

/// `texture(sampler, uv [, bias])` / `texelFetch(sampler, uv, lod)`
fn sample(args: &mut Vec<Value>, integer_coords: bool) -> Value {
    let Some(texture) = args.first().and_then(texture_of) else {
        return Value::Null;
    };

    let (u, v, w) = match args.get(1) {
        Some(Value::Object(o)) if o.is_numeric() => {
            let c = |i: usize| component(o, i);
            (c(0), c(1), c(2))
        }
        _ => (0.0, 0.0, 0.0),
    };
    let lod = args.get(2).and_then(scalar).unwrap_or(0.0);

    let rgba = if integer_coords {
        texture.texel_fetch(u as i32, v as i32, w as i32, lod as i32)
    } else {
        texture.sample(u, v, w, lod)
    };

    // Class spelling follows the coordinate argument's language family
    let class = match args.get(1) {
        Some(Value::Object(o)) if o.class.starts_with("float") => "float4",
        _ => "vec4",
    };
    Value::Object(Object::with_props(
        class,
        vec![
            ("x".to_string(), Value::F32(rgba.x)),
            ("y".to_string(), Value::F32(rgba.y)),
            ("z".to_string(), Value::F32(rgba.z)),
            ("w".to_string(), Value::F32(rgba.w)),
        ],
    ))
}

fn texture_of(value: &Value) -> Option<Rc<Texture>> {
    match value {
        Value::Object(o) => o
            .user
            .as_ref()
            .and_then(|u| u.clone().downcast::<Texture>().ok()),
        _ => None,
    }
}

fn component(obj: &Object, i: usize) -> f32 {
    obj.props()
        .get(i)
        .and_then(|(_, v)| scalar(v))
        .unwrap_or(0.0)
}

fn scalar(value: &Value) -> Option<f32> {
    match value.coerce(shade_vm::ValueKind::F32) {
        Ok(Value::F32(f)) => Some(f),
        _ => None,
    }
}
