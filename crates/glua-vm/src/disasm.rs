//! Human-readable renderings of compiled chunks and executing instructions.

use std::fmt::Write;

use glua_core::{Chunk, Value};

use crate::opcodes::{merge_bytes, Op};

/// Disassemble a whole chunk, one `offset | OpName operand` line per
/// instruction, under a banner naming the function.
pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    if name.is_empty() {
        writeln!(out, "---------- <script> ----------").unwrap();
    } else {
        writeln!(out, "---------- {name} ----------").unwrap();
    }

    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = instruction_at(chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }

    out.push('\n');
    out
}

/// One trace line for the instruction at `offset`, annotated with the
/// current operand stack.
pub fn trace_instruction(chunk: &Chunk, offset: usize, stack: &[Value]) -> String {
    let (text, _) = instruction_at(chunk, offset);
    let rendered: Vec<String> = stack.iter().map(Value::to_string).collect();
    format!("{text:<40} [{}]\n", rendered.join(", "))
}

/// Render the instruction at `offset` and return the offset of the next
/// one. Reading back the opcode and its operand length this way walks the
/// exact byte stream the emitter produced.
fn instruction_at(chunk: &Chunk, offset: usize) -> (String, usize) {
    let byte = chunk.code[offset];
    let Some(op) = Op::from_u8(byte) else {
        return (format!("{offset:04} | Unknown({byte})"), offset + 1);
    };

    let mut text = format!("{offset:04} | {:<16}", op.name());
    match op.operand_len() {
        1 => {
            let operand = chunk.code[offset + 1];
            write!(text, " {operand:<4}").unwrap();
            if matches!(op, Op::Constant | Op::GetGlobal | Op::SetGlobal) {
                if let Some(constant) = chunk.constants.get(operand as usize) {
                    write!(text, " ; {constant}").unwrap();
                }
            }
        }
        2 => {
            let a = chunk.code[offset + 1];
            let b = chunk.code[offset + 2];
            match op {
                Op::JumpIfFalse => {
                    let distance = merge_bytes(a, b);
                    let target = offset + 3 + distance;
                    write!(text, " {distance:<4} ; -> {target:04}").unwrap();
                }
                Op::Loop => {
                    let distance = merge_bytes(a, b);
                    let target = (offset + 3).saturating_sub(distance);
                    write!(text, " {distance:<4} ; -> {target:04}").unwrap();
                }
                _ => {
                    write!(text, " {a:<4} {b}").unwrap();
                }
            }
        }
        _ => {}
    }

    (text, offset + 1 + op.operand_len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, Mode};
    use glua_scanner::scan;

    fn chunk_for(source: &str) -> Chunk {
        let (tokens, errors) = scan(source);
        assert!(errors.is_empty());
        compile(&tokens, Mode::Script).unwrap().chunk
    }

    #[test]
    fn test_disassembly_walks_every_byte() {
        let chunk = chunk_for("global x = 1 while x < 10 do x = x + 1 end t = {1, [2] = 3}");

        // Walking opcode + operand lengths must reconstruct the exact
        // instruction stream: every byte consumed, none skipped.
        let mut offset = 0;
        let mut instructions = 0;
        while offset < chunk.code.len() {
            let op = Op::from_u8(chunk.code[offset]).expect("stream must decode cleanly");
            offset += 1 + op.operand_len();
            instructions += 1;
        }
        assert_eq!(offset, chunk.code.len());

        let dump = disassemble(&chunk, "");
        // One banner line, one line per instruction, one trailing blank.
        assert_eq!(dump.lines().count(), instructions + 2);
        assert!(dump.starts_with("---------- <script> ----------"));
    }

    #[test]
    fn test_constant_lines_show_the_value() {
        let chunk = chunk_for("x = 42");
        let dump = disassemble(&chunk, "main");
        assert!(dump.contains("OpConstant"));
        assert!(dump.contains("; 42"));
        assert!(dump.starts_with("---------- main ----------"));
    }

    #[test]
    fn test_jump_lines_show_the_target() {
        let chunk = chunk_for("while true do x = 1 end");
        let dump = disassemble(&chunk, "");

        for line in dump.lines() {
            if let Some(rest) = line.split_once("; -> ").map(|(_, rest)| rest) {
                let target: usize = rest.trim().parse().unwrap();
                assert!(target <= chunk.code.len());
            }
        }
    }

    #[test]
    fn test_trace_appends_the_stack() {
        let chunk = chunk_for("x = 1");
        let stack = vec![Value::Number(1.0), Value::string("s")];
        let line = trace_instruction(&chunk, 0, &stack);
        assert!(line.contains("[1, s]"));
    }
}
