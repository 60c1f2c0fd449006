use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::opcode::OpCode;
use crate::value::{Obj, Value, NULL_REF};

fn value_text(heap: &Heap, v: Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format!("{}", n),
        Value::Obj(NULL_REF) => "null".to_string(),
        Value::Obj(r) => match heap.obj(r) {
            Obj::String(s) => s.chars.clone(),
            Obj::Function(f) => match f.name {
                Some(n) => format!("<fun {}>", heap.string(n)),
                None => "<script>".to_string(),
            },
            other => format!("<{}>", other.type_name()),
        },
    }
}

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) {
    eprintln!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset);
    }
}

pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    eprint!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        eprint!("   | ");
    } else {
        eprint!("{:4} ", chunk.lines[offset]);
    }

    use OpCode::*;
    let op = OpCode::from_u8(chunk.code[offset]);
    match op {
        Constant => constant_instruction("Constant", heap, chunk, offset, false),
        ConstantLong => constant_instruction("ConstantLong", heap, chunk, offset, true),
        ByteNum => byte_instruction("ByteNum", chunk, offset),

        Nil | True | False | Eq | Gt | Lt | Neq | Gte | Lte | Add | Subtract | Multiply
        | Divide | ShiftLeft | ShiftRight | BitOr | BitXor | BitAnd | Negate | Invert | Not
        | CloseUpvalue | Return | ReturnNil | Inherit | Print | Pop => {
            simple_instruction(op, offset)
        }

        DefineGlobal => constant_instruction("DefineGlobal", heap, chunk, offset, false),
        DefineGlobalLong => constant_instruction("DefineGlobalLong", heap, chunk, offset, true),
        GetGlobal => constant_instruction("GetGlobal", heap, chunk, offset, false),
        GetGlobalLong => constant_instruction("GetGlobalLong", heap, chunk, offset, true),
        SetGlobal => constant_instruction("SetGlobal", heap, chunk, offset, false),
        SetGlobalLong => constant_instruction("SetGlobalLong", heap, chunk, offset, true),

        GetLocal => byte_instruction("GetLocal", chunk, offset),
        SetLocal => byte_instruction("SetLocal", chunk, offset),
        GetUpvalue => byte_instruction("GetUpvalue", chunk, offset),
        SetUpvalue => byte_instruction("SetUpvalue", chunk, offset),

        GetProperty => constant_instruction("GetProperty", heap, chunk, offset, false),
        GetPropertyLong => constant_instruction("GetPropertyLong", heap, chunk, offset, true),
        SetProperty => constant_instruction("SetProperty", heap, chunk, offset, false),
        SetPropertyLong => constant_instruction("SetPropertyLong", heap, chunk, offset, true),

        GetSuper => constant_instruction("GetSuper", heap, chunk, offset, false),
        GetSuperLong => constant_instruction("GetSuperLong", heap, chunk, offset, true),
        SuperInvoke => invoke_instruction("SuperInvoke", heap, chunk, offset, false),
        SuperInvokeLong => invoke_instruction("SuperInvokeLong", heap, chunk, offset, true),

        Jump => jump_instruction("Jump", 1, chunk, offset),
        JumpBackwards => jump_instruction("JumpBackwards", -1, chunk, offset),
        JumpIfFalse => jump_instruction("JumpIfFalse", 1, chunk, offset),
        JumpIfTrue => jump_instruction("JumpIfTrue", 1, chunk, offset),

        Call => byte_instruction("Call", chunk, offset),
        Invoke => invoke_instruction("Invoke", heap, chunk, offset, false),
        InvokeLong => invoke_instruction("InvokeLong", heap, chunk, offset, true),
        Closure => closure_instruction("Closure", heap, chunk, offset, false),
        ClosureLong => closure_instruction("ClosureLong", heap, chunk, offset, true),

        Subscript => byte_instruction("Subscript", chunk, offset),
        SubscriptAssign => byte_instruction("SubscriptAssign", chunk, offset),
        NewArray => byte_instruction("NewArray", chunk, offset),

        Class => constant_instruction("Class", heap, chunk, offset, false),
        ClassLong => constant_instruction("ClassLong", heap, chunk, offset, true),
        Method => constant_instruction("Method", heap, chunk, offset, false),
        MethodLong => constant_instruction("MethodLong", heap, chunk, offset, true),
    }
}

fn simple_instruction(op: OpCode, offset: usize) -> usize {
    eprintln!("{:?}", op);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let operand = chunk.code[offset + 1];
    eprintln!("{:-16} {:4}", name, operand);
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = Chunk::read_u16(&chunk.code, offset + 1) as i32;
    eprintln!("{:-16} {:4} -> {}", name, offset, offset as i32 + 3 + sign * jump);
    offset + 3
}

fn read_index(chunk: &Chunk, offset: usize, long: bool) -> (usize, usize) {
    if long {
        (Chunk::read_u16(&chunk.code, offset + 1) as usize, offset + 3)
    } else {
        (chunk.code[offset + 1] as usize, offset + 2)
    }
}

fn constant_instruction(name: &str, heap: &Heap, chunk: &Chunk, offset: usize, long: bool) -> usize {
    let (idx, next) = read_index(chunk, offset, long);
    let text = match chunk.constants.get(idx) {
        Some(&v) => value_text(heap, v),
        None => "INVALID".to_string(),
    };
    eprintln!("{:-16} {:4} '{}'", name, idx, text);
    next
}

fn invoke_instruction(name: &str, heap: &Heap, chunk: &Chunk, offset: usize, long: bool) -> usize {
    let (idx, next) = read_index(chunk, offset, long);
    let argc = chunk.code[next];
    let text = match chunk.constants.get(idx) {
        Some(&v) => value_text(heap, v),
        None => "INVALID".to_string(),
    };
    eprintln!("{:-16} ({} args) {:4} '{}'", name, argc, idx, text);
    next + 1
}

fn closure_instruction(name: &str, heap: &Heap, chunk: &Chunk, offset: usize, long: bool) -> usize {
    let (idx, mut next) = read_index(chunk, offset, long);
    let function = match chunk.constants.get(idx) {
        Some(&v) => v,
        None => Value::Nil,
    };
    eprintln!("{:-16} {:4} {}", name, idx, value_text(heap, function));

    if let Value::Obj(r) = function {
        let upvalue_count = heap.function(r).upvalue_count;
        for _ in 0..upvalue_count {
            let is_local = chunk.code[next];
            let index = chunk.code[next + 1];
            eprintln!(
                "{:04}    |                     {} {}",
                next,
                if is_local != 0 { "local" } else { "upvalue" },
                index
            );
            next += 2;
        }
    }
    next
}
