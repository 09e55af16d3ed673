//! Bytecode disassembler
//!
//! Renders a chunk (or a single instruction) into readable text with
//! constants resolved inline. The compiler logs each finished function
//! through this, the VM's execution trace prints one instruction at a time,
//! and the CLI test battery dumps whole chunks.

use crate::chunk::{Chunk, OpCode};
use std::fmt::Write as _;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
        out.push('\n');
    }
    if !chunk.constants.is_empty() {
        let _ = writeln!(out, "-- constants --");
        for (index, constant) in chunk.constants.iter().enumerate() {
            let _ = writeln!(out, "  [{}] = {}", index, constant);
        }
    }
    out
}

/// Appends one decoded instruction to `out` and returns the offset of the
/// next one.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let Ok(op) = OpCode::try_from(chunk.code[offset]) else {
        let _ = write!(out, "Unknown opcode {}", chunk.code[offset]);
        return offset + 1;
    };

    match op {
        OpCode::Constant
        | OpCode::DefineGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::Class
        | OpCode::Method
        | OpCode::GetSuper => constant_instruction(chunk, op, offset, out),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(chunk, op, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(chunk, op, 1, offset, out),
        OpCode::Loop => jump_instruction(chunk, op, -1, offset, out),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(chunk, op, offset, out),
        OpCode::Closure => closure_instruction(chunk, offset, out),
        _ => {
            let _ = write!(out, "{:?}", op);
            offset + 1
        }
    }
}

fn constant_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let index = chunk.code[offset + 1];
    let _ = write!(
        out,
        "{:<16} {:4} '{}'",
        format!("{:?}", op),
        index,
        chunk.constants[index as usize]
    );
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = write!(out, "{:<16} {:4}", format!("{:?}", op), slot);
    offset + 2
}

fn jump_instruction(chunk: &Chunk, op: OpCode, sign: i64, offset: usize, out: &mut String) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as i64;
    let target = offset as i64 + 3 + sign * jump;
    let _ = write!(out, "{:<16} {:4} -> {}", format!("{:?}", op), offset, target);
    offset + 3
}

fn invoke_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let index = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    let _ = write!(
        out,
        "{:<16} ({} args) {:4} '{}'",
        format!("{:?}", op),
        arg_count,
        index,
        chunk.constants[index as usize]
    );
    offset + 3
}

// Variable-length: after the function constant comes one (is_local, index)
// byte pair per upvalue the function declares.
fn closure_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let index = chunk.code[offset + 1];
    let constant = chunk.constants[index as usize];
    let _ = write!(out, "{:<16} {:4} {}", "Closure", index, constant);
    let mut offset = offset + 2;
    let upvalue_count = constant.as_obj().as_function().upvalue_count;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset] != 0;
        let slot = chunk.code[offset + 1];
        let _ = write!(
            out,
            "\n{:04}      |                     {} {}",
            offset,
            if is_local { "local" } else { "upvalue" },
            slot
        );
        offset += 2;
    }
    offset
}
