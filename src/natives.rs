use crate::value::{Obj, ObjRef, Value, NULL_REF};
use crate::vm::Vm;

/// Register the built-in callables. Runs once at VM construction.
pub fn install(vm: &mut Vm) {
    vm.define_native("clock", clock);
    vm.define_native("toString", to_string);
    vm.define_native("getTypeName", get_type_name);
    vm.define_native("has", has);
    vm.define_native("get", get);
    vm.define_native("set", set);
    vm.define_native("size", size);
}

fn check_arity(vm: &mut Vm, args: &[Value], expected: usize) -> bool {
    if args.len() != expected {
        vm.native_error(format!("Expected {} arguments but got {}", expected, args.len()));
        return false;
    }
    true
}

fn as_string(vm: &Vm, v: Value) -> Option<ObjRef> {
    match v {
        Value::Obj(r) if r != NULL_REF && matches!(vm.heap.obj(r), Obj::String(_)) => Some(r),
        _ => None,
    }
}

fn clock(vm: &mut Vm, args: &[Value]) -> Value {
    if !check_arity(vm, args, 0) {
        return Value::null_obj();
    }
    Value::Number(vm.uptime())
}

fn to_string(vm: &mut Vm, args: &[Value]) -> Value {
    if !check_arity(vm, args, 1) {
        return Value::null_obj();
    }
    let s = vm.stringify(args[0]);
    Value::Obj(vm.intern(&s))
}

fn type_name_of(vm: &Vm, v: Value) -> String {
    let name = match v {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::Nil => "nil",
        Value::Obj(NULL_REF) => "null",
        Value::Obj(r) => match vm.heap.obj(r) {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "closure",
            Obj::Native(_) => "native",
            Obj::Array(_) => "array",
            Obj::Instance(instance) => {
                let class = vm.heap.class(instance.class);
                return vm.heap.string(class.name).to_string();
            }
            _ => "object",
        },
    };
    name.to_string()
}

fn get_type_name(vm: &mut Vm, args: &[Value]) -> Value {
    if !check_arity(vm, args, 1) {
        return Value::null_obj();
    }
    let name = type_name_of(vm, args[0]);
    Value::Obj(vm.intern(&name))
}

/// `has(obj, name)`: field presence. Non-instances and non-string names are
/// a plain `false`, never an error.
fn has(vm: &mut Vm, args: &[Value]) -> Value {
    if !check_arity(vm, args, 2) {
        return Value::null_obj();
    }
    let name = match as_string(vm, args[1]) {
        Some(r) => r,
        None => return Value::Bool(false),
    };
    Value::Bool(vm.get_property(args[0], name).is_some())
}

fn get(vm: &mut Vm, args: &[Value]) -> Value {
    if !check_arity(vm, args, 2) {
        return Value::null_obj();
    }
    let Some(name) = as_string(vm, args[1]) else {
        return vm.native_error("Field name must be a string.");
    };
    match vm.get_property(args[0], name) {
        Some(value) => value,
        None => {
            let msg = format!(
                "Undefined property '{}' of '{}'.",
                vm.heap.string(name),
                vm.stringify(args[0])
            );
            vm.native_error(msg)
        }
    }
}

fn set(vm: &mut Vm, args: &[Value]) -> Value {
    if !check_arity(vm, args, 3) {
        return Value::null_obj();
    }
    let instance = match args[0] {
        Value::Obj(r) if r != NULL_REF && matches!(vm.heap.obj(r), Obj::Instance(_)) => r,
        _ => return vm.native_error("Only instances have fields."),
    };
    let Some(name) = as_string(vm, args[1]) else {
        return vm.native_error("Field name must be a string.");
    };
    vm.heap.instance_mut(instance).fields.insert(name, args[2]);
    args[2]
}

fn size(vm: &mut Vm, args: &[Value]) -> Value {
    if !check_arity(vm, args, 1) {
        return Value::null_obj();
    }
    let len = match args[0] {
        Value::Obj(r) if r != NULL_REF => match vm.heap.obj(r) {
            Obj::String(s) => s.chars.len(),
            Obj::Array(a) => a.len(),
            _ => return vm.native_error("Expected a string or array."),
        },
        _ => return vm.native_error("Expected a string or array."),
    };
    Value::Number(len as f64)
}
