// File: src/debug.rs
//
// Debug flags and the bytecode disassembler.
// Flags come from the FLAX_DEBUG environment variable or the --debug CLI
// option as a comma-separated, case-insensitive list. All debug output
// goes to stderr so it never mixes with program output.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::bytecode::{Chunk, OpCode};
use crate::heap::Heap;

pub const DF_SCANNING: u8 = 1 << 0;
pub const DF_CODE: u8 = 1 << 1;
pub const DF_TRACE: u8 = 1 << 2;
pub const DF_STRESS_GC: u8 = 1 << 3;
pub const DF_LOG_GC: u8 = 1 << 4;

static FLAGS: AtomicU8 = AtomicU8::new(0);

/// Parses a comma-separated flag list and enables the named flags.
/// Unknown names are ignored.
pub fn set_flags(settings: &str) {
    let mut flags = 0u8;
    for setting in settings.split(',') {
        match setting.trim().to_ascii_lowercase().as_str() {
            "scanning" => flags |= DF_SCANNING,
            "code" => flags |= DF_CODE,
            "trace" => flags |= DF_TRACE,
            "stress_gc" => flags |= DF_STRESS_GC,
            "log_gc" => flags |= DF_LOG_GC,
            _ => {}
        }
    }
    FLAGS.fetch_or(flags, Ordering::Relaxed);
}

pub fn enabled(flag: u8) -> bool {
    FLAGS.load(Ordering::Relaxed) & flag != 0
}

/// Prints every instruction in a chunk under a `== name ==` header.
pub fn disassemble_chunk(chunk: &Chunk, heap: &Heap, name: &str) {
    eprintln!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, heap, offset);
    }
}

/// Prints the instruction at `offset` on one line and returns the offset
/// of the next instruction.
pub fn disassemble_instruction(chunk: &Chunk, heap: &Heap, offset: usize) -> usize {
    eprint!("{:04} ", offset);

    // A single source line compiles to many instructions; print the line
    // only when it changes.
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        eprint!("   | ");
    } else {
        eprint!("{:4} ", chunk.lines[offset]);
    }

    let instruction = chunk.code[offset];
    let op = match OpCode::from_byte(instruction) {
        Some(op) => op,
        None => {
            eprintln!("unknown opcode {}", instruction);
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant => constant_instruction("CONSTANT", chunk, heap, offset),
        OpCode::Nil => simple_instruction("NIL", offset),
        OpCode::True => simple_instruction("TRUE", offset),
        OpCode::False => simple_instruction("FALSE", offset),
        OpCode::Pop => simple_instruction("POP", offset),
        OpCode::GetLocal => byte_instruction("GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction("SET_LOCAL", chunk, offset),
        OpCode::GetGlobal => constant_instruction("GET_GLOBAL", chunk, heap, offset),
        OpCode::DefineGlobal => constant_instruction("DEFINE_GLOBAL", chunk, heap, offset),
        OpCode::SetGlobal => constant_instruction("SET_GLOBAL", chunk, heap, offset),
        OpCode::GetUpvalue => byte_instruction("GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("SET_UPVALUE", chunk, offset),
        OpCode::GetProperty => constant_instruction("GET_PROPERTY", chunk, heap, offset),
        OpCode::SetProperty => constant_instruction("SET_PROPERTY", chunk, heap, offset),
        OpCode::GetSuper => constant_instruction("GET_SUPER", chunk, heap, offset),
        OpCode::Equal => simple_instruction("EQUAL", offset),
        OpCode::Greater => simple_instruction("GREATER", offset),
        OpCode::Less => simple_instruction("LESS", offset),
        OpCode::Add => simple_instruction("ADD", offset),
        OpCode::Subtract => simple_instruction("SUBTRACT", offset),
        OpCode::Multiply => simple_instruction("MULTIPLY", offset),
        OpCode::Divide => simple_instruction("DIVIDE", offset),
        OpCode::Not => simple_instruction("NOT", offset),
        OpCode::Negate => simple_instruction("NEGATE", offset),
        OpCode::Print => simple_instruction("PRINT", offset),
        OpCode::Jump => jump_instruction("JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("LOOP", -1, chunk, offset),
        OpCode::Call => byte_instruction("CALL", chunk, offset),
        OpCode::Invoke => invoke_instruction("INVOKE", chunk, heap, offset),
        OpCode::SuperInvoke => invoke_instruction("SUPER_INVOKE", chunk, heap, offset),
        OpCode::Closure => closure_instruction(chunk, heap, offset),
        OpCode::CloseUpvalue => simple_instruction("CLOSE_UPVALUE", offset),
        OpCode::Return => simple_instruction("RETURN", offset),
        OpCode::Class => constant_instruction("CLASS", chunk, heap, offset),
        OpCode::Inherit => simple_instruction("INHERIT", offset),
        OpCode::Method => constant_instruction("METHOD", chunk, heap, offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    eprintln!("{}", name);
    offset + 1
}

fn constant_instruction(name: &str, chunk: &Chunk, heap: &Heap, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let rendered = heap.value_to_string(chunk.constants[constant as usize]);
    eprintln!("{:<16} {:4} '{}'", name, constant, rendered);
    offset + 2
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    eprintln!("{:<16} {:4}", name, slot);
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
    let target = offset as i64 + 3 + sign as i64 * jump as i64;
    eprintln!("{:<16} {:4} -> {}", name, offset, target);
    offset + 3
}

fn invoke_instruction(name: &str, chunk: &Chunk, heap: &Heap, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    let rendered = heap.value_to_string(chunk.constants[constant as usize]);
    eprintln!("{:<16} ({} args) {:4} '{}'", name, arg_count, constant, rendered);
    offset + 3
}

/// `Closure` is variable-length: after the constant operand comes one
/// `(is_local, index)` byte pair per upvalue of the wrapped function.
fn closure_instruction(chunk: &Chunk, heap: &Heap, offset: usize) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset];
    offset += 1;
    let function_value = chunk.constants[constant as usize];
    eprintln!("{:<16} {:4} {}", "CLOSURE", constant, heap.value_to_string(function_value));

    let function = match function_value {
        crate::value::Value::Obj(r) => r,
        _ => return offset,
    };
    for _ in 0..heap.function(function).upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        eprintln!(
            "{:04}    |                     {} {}",
            offset,
            if is_local != 0 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }

    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_flag_parsing_is_case_insensitive() {
        set_flags("TRACE, Log_GC");
        assert!(enabled(DF_TRACE));
        assert!(enabled(DF_LOG_GC));
        assert!(!enabled(DF_STRESS_GC));
    }

    #[test]
    fn test_unknown_flags_ignored() {
        set_flags("bogus,,");
        // No panic, nothing new enabled by the bogus entries.
        assert!(!enabled(DF_SCANNING));
    }

    #[test]
    fn test_disassembler_strides_match_encoded_sizes() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let constant = chunk.add_constant(Value::Number(9.0)) as u8;

        chunk.write_op(OpCode::Constant, 1);
        chunk.write(constant, 1);
        chunk.write_op(OpCode::GetLocal, 1);
        chunk.write(0, 1);
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0, 1);
        chunk.write(4, 1);
        chunk.write_op(OpCode::Add, 2);
        chunk.write_op(OpCode::Return, 2);

        let mut offset = 0;
        let mut steps = Vec::new();
        while offset < chunk.len() {
            let next = disassemble_instruction(&chunk, &heap, offset);
            steps.push(next - offset);
            offset = next;
        }
        // One line per opcode, advancing by each opcode's encoded size.
        assert_eq!(steps, vec![2, 2, 3, 1, 1]);
        assert_eq!(offset, chunk.len());
    }

    #[test]
    fn test_disassembler_handles_invoke_stride() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let constant = chunk.add_constant(Value::Number(1.0)) as u8;
        chunk.write_op(OpCode::Invoke, 1);
        chunk.write(constant, 1);
        chunk.write(2, 1);
        assert_eq!(disassemble_instruction(&chunk, &heap, 0), 3);
    }
}
