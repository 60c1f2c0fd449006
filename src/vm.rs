use std::io::Write;
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::compiler;
use crate::error::{InterpretError, RuntimeError, TraceFrame};
use crate::heap::Heap;
use crate::natives;
use crate::opcode::OpCode;
use crate::value::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, NativeFn, NativeObj, Obj,
    ObjRef, UpvalueObj, Value, NULL_REF,
};

pub const UINT8_COUNT: usize = u8::MAX as usize + 1;
pub const FRAMES_MAX: usize = 256;
pub const STACK_MAX: usize = FRAMES_MAX * UINT8_COUNT;

struct CallFrame {
    closure: ObjRef,
    /// The closure's function, cached at call time.
    function: ObjRef,
    ip: usize,
    base: usize,
}

pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: FxHashMap<ObjRef, Value>,
    /// Head of the open-upvalue list, descending by stack slot.
    open_upvalues: Option<ObjRef>,
    init_string: ObjRef,
    start: Instant,
    out: Box<dyn Write>,
    /// Message recorded by a native before it returns the null-object.
    pending_native_error: Option<String>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(std::io::stdout()))
    }

    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: FxHashMap::default(),
            open_upvalues: None,
            init_string,
            start: Instant::now(),
            out,
            pending_native_error: None,
        };
        natives::install(&mut vm);
        vm
    }

    /// Seconds since this VM was created; the `clock` native's epoch.
    pub fn uptime(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    // ------------------------------------------------------------------
    // Allocation. Collection happens before the new object exists, so a
    // fresh handle can be linked into reachable structure afterwards
    // without a collection racing in between.
    // ------------------------------------------------------------------

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    pub fn intern(&mut self, s: &str) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(s)
    }

    fn collect_garbage(&mut self) {
        let before = self.heap.log_collect_begin();

        for i in 0..self.stack.len() {
            let v = self.stack[i];
            self.heap.mark_value(v);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(r) = upvalue {
            self.heap.mark_object(r);
            upvalue = self.heap.upvalue(r).next;
        }
        let globals: Vec<(ObjRef, Value)> = self.globals.iter().map(|(&k, &v)| (k, v)).collect();
        for (name, value) in globals {
            self.heap.mark_object(name);
            self.heap.mark_value(value);
        }
        self.heap.mark_compiler_roots();
        self.heap.mark_object(self.init_string);

        self.heap.trace();
        self.heap.prune_strings();
        self.heap.sweep();

        self.heap.log_collect_end(before);
    }

    // ------------------------------------------------------------------
    // Entry point
    // ------------------------------------------------------------------

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compiler::compile(self, source).map_err(InterpretError::Compile)?;

        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ClosureObj { function, upvalues: vec![] }));
        self.pop();
        self.push(Value::Obj(closure));

        let result = self.call_value(Value::Obj(closure), 0).and_then(|_| self.run());
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset_stack();
                Err(InterpretError::Runtime(e))
            }
        }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        self.pending_native_error = None;
    }

    // ------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    fn runtime_error(&self, msg: impl Into<String>) -> RuntimeError {
        let mut trace = vec![];
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            // The ip sits one past the last byte read, and the line map is
            // per byte, so ip-1 names the instruction in flight.
            let line = function.chunk.lines.get(frame.ip.saturating_sub(1)).copied().unwrap_or(0);
            let name = function.name.map(|n| self.heap.string(n).to_string());
            trace.push(TraceFrame { line, name });
        }
        RuntimeError { message: msg.into(), trace }
    }

    /// For natives: record a failure message and hand back the null-object.
    pub fn native_error(&mut self, msg: impl Into<String>) -> Value {
        self.pending_native_error = Some(msg.into());
        Value::null_obj()
    }

    fn property_error(&self, name: ObjRef, value: Value) -> RuntimeError {
        self.runtime_error(format!(
            "Undefined property '{}' of '{}'.",
            self.heap.string(name),
            self.stringify(value)
        ))
    }

    // ------------------------------------------------------------------
    // Value protocols
    // ------------------------------------------------------------------

    /// nil, false, zero and the empty string are falsey.
    pub fn is_falsey(&self, v: Value) -> bool {
        match v {
            Value::Nil => true,
            Value::Bool(b) => !b,
            Value::Number(n) => n == 0.0,
            Value::Obj(r) if r != NULL_REF => {
                matches!(self.heap.obj(r), Obj::String(s) if s.chars.is_empty())
            }
            _ => false,
        }
    }

    fn is_string(&self, v: Value) -> bool {
        matches!(v, Value::Obj(r) if r != NULL_REF && matches!(self.heap.obj(r), Obj::String(_)))
    }

    pub fn stringify(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::Obj(NULL_REF) => "null".to_string(),
            Value::Obj(r) => match self.heap.obj(r) {
                Obj::String(s) => s.chars.clone(),
                Obj::Function(f) => self.stringify_function(f),
                Obj::Closure(c) => self.stringify_function(self.heap.function(c.function)),
                Obj::Native(_) => "<native fun>".to_string(),
                Obj::Upvalue(_) => "upvalue".to_string(),
                Obj::Class(c) => format!("<class {}>", self.heap.string(c.name)),
                Obj::Instance(i) => {
                    let class = self.heap.class(i.class);
                    format!("<{} instance at {:#x}>", self.heap.string(class.name), r)
                }
                Obj::BoundMethod(b) => {
                    let function = self.heap.closure(b.method).function;
                    let name = match self.heap.function(function).name {
                        Some(n) => self.heap.string(n).to_string(),
                        None => "<fun>".to_string(),
                    };
                    format!("<bound method {} of object '{}'>", name, self.stringify(b.receiver))
                }
                Obj::Array(a) => format!("<array of length {}>", a.len()),
            },
        }
    }

    fn stringify_function(&self, f: &FunctionObj) -> String {
        match f.name {
            Some(n) => format!("<fun {}>", self.heap.string(n)),
            None => "<script>".to_string(),
        }
    }

    /// Instance field lookup used by property access and the `has`/`get`
    /// natives. Methods are not fields.
    pub fn get_property(&self, obj: Value, name: ObjRef) -> Option<Value> {
        if let Value::Obj(r) = obj {
            if r != NULL_REF {
                if let Obj::Instance(instance) = self.heap.obj(r) {
                    return instance.fields.get(&name).copied();
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Natives
    // ------------------------------------------------------------------

    pub fn define_native(&mut self, name: &'static str, fun: NativeFn) {
        let name_ref = self.intern(name);
        // Keep the name reachable while the native object is allocated.
        self.push(Value::Obj(name_ref));
        let native = self.alloc(Obj::Native(NativeObj { name, fun }));
        self.globals.insert(name_ref, Value::Obj(native));
        self.pop();
    }

    // ------------------------------------------------------------------
    // Calls and dispatch helpers
    // ------------------------------------------------------------------

    fn call(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {} arguments but got {}", arity, argc)));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure, function, ip: 0, base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        if let Value::Obj(r) = callee {
            if r != NULL_REF {
                match self.heap.obj(r) {
                    Obj::BoundMethod(bound) => {
                        let receiver = bound.receiver;
                        let method = bound.method;
                        let top = self.stack.len();
                        self.stack[top - argc - 1] = receiver;
                        return self.call(method, argc);
                    }
                    Obj::Class(_) => {
                        let instance = self.alloc(Obj::Instance(InstanceObj {
                            class: r,
                            fields: FxHashMap::default(),
                        }));
                        let top = self.stack.len();
                        self.stack[top - argc - 1] = Value::Obj(instance);
                        let initializer = self.heap.class(r).methods.get(&self.init_string).copied();
                        return match initializer {
                            Some(Value::Obj(init)) => self.call(init, argc),
                            _ if argc != 0 => Err(self.runtime_error(format!(
                                "Expected 0 arguments to constructor but got {}.",
                                argc
                            ))),
                            _ => Ok(()),
                        };
                    }
                    Obj::Closure(_) => return self.call(r, argc),
                    Obj::Native(native) => {
                        let fun = native.fun;
                        let args_start = self.stack.len() - argc;
                        let args: Vec<Value> = self.stack[args_start..].to_vec();
                        let result = fun(self, &args);
                        self.stack.truncate(args_start - 1);
                        self.push(result);
                        if result.is_null_obj() {
                            let msg = self
                                .pending_native_error
                                .take()
                                .unwrap_or_else(|| "An error occurred.".to_string());
                            return Err(self.runtime_error(msg));
                        }
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    /// Field-shortcut dispatch: a field of the same name shadows the method
    /// and is called as a value.
    fn invoke(&mut self, name: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);

        let instance = match receiver {
            Value::Obj(r) if r != NULL_REF => match self.heap.obj(r) {
                Obj::Instance(_) => r,
                _ => return Err(self.runtime_error("Only instances have methods.")),
            },
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };

        if let Some(field) = self.heap.instance(instance).fields.get(&name).copied() {
            let top = self.stack.len();
            self.stack[top - argc - 1] = field;
            return self.call_value(field, argc);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        match self.heap.class(class).methods.get(&name).copied() {
            Some(Value::Obj(method)) => self.call(method, argc),
            _ => Err(self.property_error(name, self.peek(argc))),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        match self.heap.class(class).methods.get(&name).copied() {
            Some(Value::Obj(method)) => {
                let receiver = self.peek(0);
                let bound =
                    self.alloc(Obj::BoundMethod(BoundMethodObj { receiver, method }));
                self.pop();
                self.push(Value::Obj(bound));
                Ok(())
            }
            _ => Err(self.property_error(name, self.peek(0))),
        }
    }

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut cur = self.open_upvalues;
        while let Some(r) = cur {
            let location = self.heap.upvalue(r).location.expect("closed upvalue in open list");
            if location <= slot {
                break;
            }
            prev = Some(r);
            cur = self.heap.upvalue(r).next;
        }

        if let Some(r) = cur {
            if self.heap.upvalue(r).location == Some(slot) {
                return r;
            }
        }

        let created = self.alloc(Obj::Upvalue(UpvalueObj {
            location: Some(slot),
            closed: Value::Nil,
            next: cur,
        }));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(p) => self.heap.upvalue_mut(p).next = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `last`, moving the stack value
    /// into the upvalue's own storage.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(r) = self.open_upvalues {
            let location = self.heap.upvalue(r).location.expect("closed upvalue in open list");
            if location < last {
                break;
            }
            let value = self.stack[location];
            let next = self.heap.upvalue(r).next;
            let upvalue = self.heap.upvalue_mut(r);
            upvalue.closed = value;
            upvalue.location = None;
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }

    fn define_method(&mut self, name: ObjRef) {
        let method = self.peek(0);
        let class = match self.peek(1) {
            Value::Obj(r) => r,
            _ => unreachable!("method without a class beneath it"),
        };
        self.heap.class_mut(class).methods.insert(name, method);
        self.pop();
    }

    fn concatenate(&mut self) {
        let b = self.peek(0);
        let a = self.peek(1);
        let mut s = self.stringify(a);
        s.push_str(&self.stringify(b));
        // Interning can collect; both operands are still on the stack.
        let result = self.intern(&s);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    // ------------------------------------------------------------------
    // Bytecode reading
    // ------------------------------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let b = self.heap.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        b
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let idx = if long { self.read_u16() as usize } else { self.read_byte() as usize };
        let frame = self.frames.last().expect("no active frame");
        self.heap.function(frame.function).chunk.constants[idx]
    }

    fn read_string(&mut self, long: bool) -> ObjRef {
        match self.read_constant(long) {
            Value::Obj(r) => r,
            _ => unreachable!("constant is not a string"),
        }
    }

    fn frame_base(&self) -> usize {
        self.frames.last().expect("no active frame").base
    }

    fn jump(&mut self, offset: i64) {
        let frame = self.frames.last_mut().expect("no active frame");
        frame.ip = (frame.ip as i64 + offset) as usize;
    }

    fn pop_numbers(&mut self) -> Result<(f64, f64), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    // ------------------------------------------------------------------
    // Subscripts
    // ------------------------------------------------------------------

    fn subscript_index(&self, index: Value, len: usize, what: &str) -> Result<usize, RuntimeError> {
        let n = match index {
            Value::Number(n) => n,
            _ => return Err(self.runtime_error("Subscript index must be a number.")),
        };
        if n < 0.0 || n.fract() != 0.0 || n as usize >= len {
            return Err(self.runtime_error(format!("{} index out of range.", what)));
        }
        Ok(n as usize)
    }

    fn op_subscript(&mut self, argc: usize) -> Result<(), RuntimeError> {
        if argc != 1 {
            return Err(self.runtime_error("Subscripts take a single index."));
        }
        let index = self.peek(0);
        let target = self.peek(1);

        let r = match target {
            Value::Obj(r) if r != NULL_REF => r,
            _ => return Err(self.runtime_error("Only arrays and strings can be subscripted.")),
        };
        match self.heap.obj(r) {
            Obj::Array(a) => {
                let i = self.subscript_index(index, a.len(), "Array")?;
                let v = a[i];
                self.pop();
                self.pop();
                self.push(v);
                Ok(())
            }
            Obj::String(s) => {
                let bytes = s.chars.as_bytes();
                let i = self.subscript_index(index, bytes.len(), "String")?;
                let one = String::from_utf8_lossy(&bytes[i..i + 1]).into_owned();
                let result = self.intern(&one);
                self.pop();
                self.pop();
                self.push(Value::Obj(result));
                Ok(())
            }
            _ => Err(self.runtime_error("Only arrays and strings can be subscripted.")),
        }
    }

    fn op_subscript_assign(&mut self, argc: usize) -> Result<(), RuntimeError> {
        if argc != 1 {
            return Err(self.runtime_error("Subscripts take a single index."));
        }
        let value = self.peek(0);
        let index = self.peek(1);
        let target = self.peek(2);

        let r = match target {
            Value::Obj(r)
                if r != NULL_REF && matches!(self.heap.obj(r), Obj::Array(_)) => r,
            _ => return Err(self.runtime_error("Only arrays support subscript assignment.")),
        };
        let i = self.subscript_index(index, self.heap.array(r).len(), "Array")?;
        self.heap.array_mut(r)[i] = value;
        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Property access
    // ------------------------------------------------------------------

    fn op_get_property(&mut self, name: ObjRef) -> Result<(), RuntimeError> {
        let target = self.peek(0);
        if let Some(value) = self.get_property(target, name) {
            self.pop();
            self.push(value);
            return Ok(());
        }
        if let Value::Obj(r) = target {
            if r != NULL_REF {
                if let Obj::Instance(instance) = self.heap.obj(r) {
                    let class = instance.class;
                    return self.bind_method(class, name);
                }
            }
        }
        Err(self.runtime_error("Only instances have properties."))
    }

    fn op_set_property(&mut self, name: ObjRef) -> Result<(), RuntimeError> {
        let target = self.peek(1);
        let r = match target {
            Value::Obj(r)
                if r != NULL_REF && matches!(self.heap.obj(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have fields.")),
        };
        let value = self.peek(0);
        self.heap.instance_mut(r).fields.insert(name, value);
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "trace")]
            {
                let mut line = String::from("          ");
                for &v in &self.stack {
                    line.push_str(&format!("[ {} ]", self.stringify(v)));
                }
                eprintln!("{}", line);
                let frame = self.frames.last().expect("no active frame");
                crate::dis::disassemble_instruction(
                    &self.heap,
                    &self.heap.function(frame.function).chunk,
                    frame.ip,
                );
            }

            let op = OpCode::from_u8(self.read_byte());
            match op {
                OpCode::Constant | OpCode::ConstantLong => {
                    let v = self.read_constant(op == OpCode::ConstantLong);
                    self.push(v);
                }
                OpCode::ByteNum => {
                    let n = self.read_byte();
                    self.push(Value::Number(n as f64));
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Neq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Gt => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Bool(a > b));
                }
                OpCode::Lt => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Bool(a < b));
                }
                OpCode::Gte => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Bool(a >= b));
                }
                OpCode::Lte => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Bool(a <= b));
                }

                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if self.is_string(a) || self.is_string(b) {
                        self.concatenate();
                    } else if let (Value::Number(x), Value::Number(y)) = (a, b) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(x + y));
                    } else {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        );
                    }
                }
                OpCode::Subtract => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number(a - b));
                }
                OpCode::Multiply => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number(a * b));
                }
                OpCode::Divide => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number(a / b));
                }
                OpCode::ShiftLeft => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number((a as i64).wrapping_shl(b as i64 as u32) as f64));
                }
                OpCode::ShiftRight => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number((a as i64).wrapping_shr(b as i64 as u32) as f64));
                }
                OpCode::BitAnd => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number((a as i64 & b as i64) as f64));
                }
                OpCode::BitOr => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number((a as i64 | b as i64) as f64));
                }
                OpCode::BitXor => {
                    let (a, b) = self.pop_numbers()?;
                    self.push(Value::Number((a as i64 ^ b as i64) as f64));
                }

                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::Invert => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n - 1.0));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::Not => {
                    let v = self.pop();
                    let falsey = self.is_falsey(v);
                    self.push(Value::Bool(falsey));
                }

                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let name = self.read_string(op == OpCode::DefineGlobalLong);
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                    self.pop();
                }
                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let name = self.read_string(op == OpCode::GetGlobalLong);
                    match self.globals.get(&name).copied() {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                self.heap.string(name)
                            )))
                        }
                    }
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let name = self.read_string(op == OpCode::SetGlobalLong);
                    if !self.globals.contains_key(&name) {
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            self.heap.string(name)
                        )));
                    }
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let v = self.stack[self.frame_base() + slot];
                    self.push(v);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_base();
                    let v = self.peek(0);
                    self.stack[base + slot] = v;
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().expect("no active frame").closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let v = match self.heap.upvalue(upvalue).location {
                        Some(loc) => self.stack[loc],
                        None => self.heap.upvalue(upvalue).closed,
                    };
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().expect("no active frame").closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let v = self.peek(0);
                    match self.heap.upvalue(upvalue).location {
                        Some(loc) => self.stack[loc] = v,
                        None => self.heap.upvalue_mut(upvalue).closed = v,
                    }
                }

                OpCode::GetProperty | OpCode::GetPropertyLong => {
                    let name = self.read_string(op == OpCode::GetPropertyLong);
                    self.op_get_property(name)?;
                }
                OpCode::SetProperty | OpCode::SetPropertyLong => {
                    let name = self.read_string(op == OpCode::SetPropertyLong);
                    self.op_set_property(name)?;
                }

                OpCode::GetSuper | OpCode::GetSuperLong => {
                    let name = self.read_string(op == OpCode::GetSuperLong);
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("superclass slot is not a class"),
                    };
                    self.bind_method(superclass, name)?;
                }
                OpCode::SuperInvoke | OpCode::SuperInvokeLong => {
                    let name = self.read_string(op == OpCode::SuperInvokeLong);
                    let argc = self.read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("superclass slot is not a class"),
                    };
                    self.invoke_from_class(superclass, name, argc)?;
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as i64;
                    self.jump(offset);
                }
                OpCode::JumpBackwards => {
                    let offset = self.read_u16() as i64;
                    self.jump(-offset);
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as i64;
                    if self.is_falsey(self.peek(0)) {
                        self.jump(offset);
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as i64;
                    if !self.is_falsey(self.peek(0)) {
                        self.jump(offset);
                    }
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    self.call_value(self.peek(argc), argc)?;
                }
                OpCode::Invoke | OpCode::InvokeLong => {
                    let name = self.read_string(op == OpCode::InvokeLong);
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::Closure | OpCode::ClosureLong => {
                    let function = match self.read_constant(op == OpCode::ClosureLong) {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure constant is not a function"),
                    };
                    let count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc(Obj::Closure(ClosureObj {
                        function,
                        upvalues: Vec::with_capacity(count),
                    }));
                    // On the stack before its upvalues are wired, so a
                    // collection inside capture_upvalue sees it.
                    self.push(Value::Obj(closure));
                    for _ in 0..count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame_base() + index;
                            self.capture_upvalue(slot)
                        } else {
                            let enclosing = self.frames.last().expect("no active frame").closure;
                            self.heap.closure(enclosing).upvalues[index]
                        };
                        match self.heap.obj_mut(closure) {
                            Obj::Closure(c) => c.upvalues.push(upvalue),
                            _ => unreachable!(),
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frame_base();
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
                OpCode::ReturnNil => {
                    let base = self.frame_base();
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(Value::Nil);
                }

                OpCode::Subscript => {
                    let argc = self.read_byte() as usize;
                    self.op_subscript(argc)?;
                }
                OpCode::SubscriptAssign => {
                    let argc = self.read_byte() as usize;
                    self.op_subscript_assign(argc)?;
                }
                OpCode::NewArray => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let elements = self.stack[start..].to_vec();
                    // Elements stay on the stack across the allocation.
                    let array = self.alloc(Obj::Array(elements));
                    self.stack.truncate(start);
                    self.push(Value::Obj(array));
                }

                OpCode::Class | OpCode::ClassLong => {
                    let name = self.read_string(op == OpCode::ClassLong);
                    let class = self.alloc(Obj::Class(ClassObj {
                        name,
                        methods: FxHashMap::default(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1) {
                        Value::Obj(r)
                            if r != NULL_REF && matches!(self.heap.obj(r), Obj::Class(_)) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => unreachable!("inherit without a subclass on the stack"),
                    };
                    // Inheritance is a bulk copy; overriding re-defines the
                    // entry afterwards via Method.
                    let methods = self.heap.class(superclass).methods.clone();
                    self.heap.class_mut(subclass).methods.extend(methods);
                    self.pop();
                }
                OpCode::Method | OpCode::MethodLong => {
                    let name = self.read_string(op == OpCode::MethodLong);
                    self.define_method(name);
                }

                OpCode::Print => {
                    let v = self.pop();
                    let s = self.stringify(v);
                    let _ = writeln!(self.out, "{}", s);
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_vm() -> (Vm, SharedBuf) {
        let buf = SharedBuf::default();
        let vm = Vm::with_output(Box::new(buf.clone()));
        (vm, buf)
    }

    fn run(src: &str) -> (Result<(), InterpretError>, String) {
        let (mut vm, buf) = capture_vm();
        let result = vm.interpret(src);
        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        (result, out)
    }

    fn run_ok(src: &str) -> String {
        let (result, out) = run(src);
        if let Err(e) = result {
            panic!("unexpected error: {}", e);
        }
        out
    }

    fn runtime_message(src: &str) -> String {
        let (result, _) = run(src);
        match result {
            Err(InterpretError::Runtime(e)) => e.message,
            other => panic!("expected runtime error, got {:?}", other.map_err(|e| e.to_string())),
        }
    }

    #[test]
    fn interned_strings_compare_by_identity() {
        assert_eq!(run_ok("print \"a\" + \"b\" == \"ab\";"), "true\n");
        assert_eq!(run_ok("print \"a\" == \"b\";"), "false\n");
    }

    #[test]
    fn zero_and_empty_string_are_falsey() {
        assert_eq!(run_ok("if (0) print \"t\"; else print \"f\";"), "f\n");
        assert_eq!(run_ok("if (\"\") print \"t\"; else print \"f\";"), "f\n");
        assert_eq!(run_ok("if (\"x\") print \"t\"; else print \"f\";"), "t\n");
        assert_eq!(run_ok("print !nil;"), "true\n");
    }

    #[test]
    fn undefined_variable_reports_its_name() {
        assert_eq!(runtime_message("print missing;"), "Undefined variable 'missing'.");
        assert_eq!(runtime_message("missing = 1;"), "Undefined variable 'missing'.");
    }

    #[test]
    fn arity_mismatch_message() {
        assert_eq!(
            runtime_message("fun f(a) { return a; } f(1, 2);"),
            "Expected 1 arguments but got 2"
        );
    }

    #[test]
    fn runtime_error_trace_walks_frames() {
        let (result, _) = run("fun inner() { return 1 + nil; }\nfun outer() { return inner(); }\nouter();");
        let err = match result {
            Err(InterpretError::Runtime(e)) => e,
            _ => panic!("expected runtime error"),
        };
        assert_eq!(err.message, "Operands must be two numbers or two strings.");
        let names: Vec<Option<String>> = err.trace.iter().map(|f| f.name.clone()).collect();
        assert_eq!(
            names,
            vec![Some("inner".to_string()), Some("outer".to_string()), None]
        );
        assert_eq!(err.trace[0].line, 1);
        assert_eq!(err.trace[2].line, 3);
    }

    #[test]
    fn vm_is_reusable_after_an_error() {
        let (mut vm, buf) = capture_vm();
        assert!(vm.interpret("var kept = 41; print missing;").is_err());
        assert!(vm.interpret("print kept + 1;").is_ok());
        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(out, "42\n");
    }

    #[test]
    fn native_failure_uses_the_recorded_message() {
        assert_eq!(
            runtime_message("var a = [1]; get(a, \"x\");"),
            "Undefined property 'x' of '<array of length 1>'."
        );
    }

    #[test]
    fn stack_overflow_on_runaway_recursion() {
        assert_eq!(runtime_message("fun f() { return f(); } f();"), "Stack overflow.");
    }

    #[test]
    fn stress_collection_keeps_reachable_objects_alive() {
        let (mut vm, buf) = capture_vm();
        vm.heap.set_stress(true);
        vm.interpret(
            "var s = \"\";\n\
             for (var i = 0; i < 40; i = i + 1) { s = s + i + \",\"; }\n\
             print size(s);\n\
             var keep = [\"a\", \"b\", \"c\"];\n\
             print keep[0] + keep[1] + keep[2];",
        )
        .expect("stressed run failed");
        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        // 0..9 one byte + comma, 10..39 two bytes + comma.
        assert_eq!(out, "110\nabc\n");
    }

    #[test]
    fn collection_frees_unreachable_garbage() {
        let (mut vm, _buf) = capture_vm();
        let mut src = String::new();
        for i in 0..50 {
            writeln!(src, "var g{} = \"garbage-{}\" + \"-{}\";", i, i, i).unwrap();
            writeln!(src, "g{} = nil;", i).unwrap();
        }
        vm.interpret(&src).unwrap();
        let before = vm.heap.live_objects();
        vm.heap.set_stress(true);
        vm.interpret("print 1;").unwrap();
        assert!(vm.heap.live_objects() < before);
    }

    #[test]
    fn closed_upvalues_outlive_their_frame() {
        let out = run_ok(
            "fun counter() { var n = 0; fun bump() { n = n + 1; return n; } return bump; }\n\
             var c = counter();\n\
             c(); c();\n\
             print c();",
        );
        assert_eq!(out, "3\n");
    }

    #[test]
    fn sibling_closures_share_one_upvalue() {
        let out = run_ok(
            "var get; var set;\n\
             fun pair() {\n\
               var shared = 1;\n\
               fun g() { return shared; }\n\
               fun s(v) { shared = v; }\n\
               get = g; set = s;\n\
             }\n\
             pair();\n\
             set(99);\n\
             print get();",
        );
        assert_eq!(out, "99\n");
    }

    #[test]
    fn stack_is_empty_after_a_script_completes() {
        let (mut vm, _buf) = capture_vm();
        vm.interpret("var a = 1; { var b = 2; print a + b; } if (a) print a;").unwrap();
        assert_eq!(vm.stack.len(), 0);
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_none());
    }
}
