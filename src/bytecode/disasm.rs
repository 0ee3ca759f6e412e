use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

use crate::bytecode::ir::{Constant, Page, Program};
use crate::bytecode::op::{Instruction, Op, RANGE_HAS_FROM, RANGE_HAS_TO, RANGE_INCLUSIVE, instructions};
use crate::lang::value::ValueType;
use crate::process::CallFlags;

/// Print disassembly of every page of a program
pub fn print_program(program: &Program) {
    println!("=== BYTECODE PROGRAM ===\n");
    print!("{}", disassemble_program(program));
}

pub fn disassemble_program(program: &Program) -> String {
    let mut output = String::new();

    for (index, page) in program.pages.iter().enumerate() {
        let _ = writeln!(output, "════════════════════════════════════════");
        let _ = writeln!(output, " [{}] {} (arity {})", index, page.name, page.arity);
        let _ = writeln!(
            output,
            " {} bytes, {} constants",
            page.code.len(),
            page.constants.len()
        );
        let _ = writeln!(output, "════════════════════════════════════════");
        output.push_str(&disassemble_to_string(page, Some(program)));
        output.push('\n');
    }

    output
}

/// Return disassembly of one page as a String. With the program at hand,
/// library calls are shown by name.
pub fn disassemble_to_string(page: &Page, program: Option<&Program>) -> String {
    let mut output = String::new();
    let jump_targets = collect_jump_targets(page);
    let mut last_line = None;

    for decoded in instructions(&page.code) {
        let instruction = match decoded {
            Ok(instruction) => instruction,
            Err((offset, byte)) => {
                let _ = writeln!(output, "{:04}   <bad opcode 0x{:02x}>", offset, byte);
                break;
            }
        };

        if jump_targets.contains(&instruction.offset) {
            output.push_str("      ┌──────────────────────────────────\n");
        }

        let line = page.line_at(instruction.offset);
        let line_column = match line {
            Some(n) if line != last_line => format!("{:>4}", n),
            _ => "   |".to_string(),
        };
        last_line = line;

        let marker = if jump_targets.contains(&instruction.offset) {
            "► "
        } else {
            "  "
        };
        let _ = writeln!(
            output,
            "{:04} {} {}{}",
            instruction.offset,
            line_column,
            marker,
            format_instruction(&instruction, page, program)
        );
    }

    output
}

fn collect_jump_targets(page: &Page) -> BTreeSet<usize> {
    instructions(&page.code)
        .filter_map(Result::ok)
        .filter_map(|instruction| instruction.jump_target())
        .collect()
}

/// `ForIter` becomes `FOR_ITER`.
fn op_name(op: Op) -> String {
    let mut name = String::new();
    for (i, c) in format!("{:?}", op).chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            name.push('_');
        }
        name.push(c.to_ascii_uppercase());
    }
    name
}

fn format_instruction(instruction: &Instruction<'_>, page: &Page, program: Option<&Program>) -> String {
    let name = format!("{:<14}", op_name(instruction.op));
    let constant = |key: u16| match page.constants.get(key) {
        Some(constant) => constant.to_string(),
        None => format!("<missing constant {}>", key),
    };

    let detail = match instruction.op {
        Op::Const => format!("{} ({})", instruction.word(0), constant(instruction.word(0))),
        Op::PopN | Op::Unwind | Op::Unpack => instruction.byte(0).to_string(),
        Op::Load | Op::Store => format!("slot {}", instruction.byte(0)),
        Op::LoadCapture | Op::StoreCapture | Op::CaptureOuter => {
            format!("capture {}", instruction.byte(0))
        }
        Op::MakeCell | Op::LoadCell | Op::StoreCell | Op::CaptureLocal => {
            format!("cell {}", instruction.byte(0))
        }
        Op::Cast => match ValueType::from_tag(instruction.byte(0)) {
            Some(to) => to.name().to_string(),
            None => format!("<bad type {}>", instruction.byte(0)),
        },
        Op::BuildList | Op::BuildTuple | Op::BuildDict | Op::BuildSet | Op::BuildString => {
            instruction.word(0).to_string()
        }
        Op::BuildStruct => constant(instruction.word(0)),
        Op::BuildRange => {
            let flags = instruction.byte(0);
            format!(
                "{}..{}{}",
                if flags & RANGE_HAS_FROM != 0 { "from" } else { "" },
                if flags & RANGE_INCLUSIVE != 0 { "=" } else { "" },
                if flags & RANGE_HAS_TO != 0 { "to" } else { "" },
            )
        }
        Op::MakeClosure => format!(
            "{} ({} captures)",
            constant(instruction.word(0)),
            instruction.byte(2)
        ),
        op if op.is_jump() => {
            let distance = instruction.word(0);
            let (sign, arrow) = if op == Op::JumpBackward {
                ('-', "↑")
            } else {
                ('+', "↓")
            };
            match instruction.jump_target() {
                Some(target) => format!("{}{} {} (→ {:04})", sign, distance, arrow, target),
                None => format!("{}{} {} (→ ????)", sign, distance, arrow),
            }
        }
        Op::Call | Op::RootCall | Op::MaybeRootCall => format!("{} args", instruction.byte(0)),
        Op::CallStd => {
            let key = instruction.word(0);
            let function = match (page.constants.get(key), program) {
                (Some(Constant::StdFunction(index)), Some(program)) => program
                    .library
                    .get(usize::from(*index))
                    .map(|entry| entry.name.clone())
                    .unwrap_or_else(|| constant(key)),
                _ => constant(key),
            };
            format!("{} ({} args)", function, instruction.byte(2))
        }
        Op::CallProgram | Op::RootCallProgram | Op::MaybeRootCallProgram => {
            let flags = CallFlags::from_bits(instruction.word(1));
            format!(
                "{} args, {} env [{}]",
                instruction.byte(0),
                instruction.byte(3),
                flags.names().join(" ")
            )
        }
        _ => String::new(),
    };

    if detail.is_empty() {
        name.trim_end().to_string()
    } else {
        format!("{}{}", name, detail)
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Print bytecode statistics
pub fn print_program_stats(program: &Program) {
    println!("=== BYTECODE STATISTICS ===\n");

    let bytes: usize = program.pages.iter().map(|page| page.code.len()).sum();
    println!("Pages:            {}", program.pages.len());
    println!("Library entries:  {}", program.library.len());
    println!("Code bytes:       {}", bytes);
    println!();

    let mut op_counts: HashMap<Op, usize> = HashMap::new();
    for page in &program.pages {
        for instruction in instructions(&page.code).filter_map(Result::ok) {
            *op_counts.entry(instruction.op).or_insert(0) += 1;
        }
    }
    let total: usize = op_counts.values().sum();

    println!("Op frequency:");
    let mut counts: Vec<_> = op_counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| (a.0 as u8).cmp(&(b.0 as u8))));

    for (op, count) in counts.iter().take(10) {
        let pct = (*count as f64 / total as f64) * 100.0;
        println!("  {:<14} {:>4} ({:>5.1}%)", op_name(*op), count, pct);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::Compiler;
    use crate::lang::node::Expr;
    use crate::lang::operator::BinaryOperation;

    #[test]
    fn test_op_names() {
        assert_eq!(op_name(Op::Add), "ADD");
        assert_eq!(op_name(Op::ForIter), "FOR_ITER");
        assert_eq!(op_name(Op::MaybeRootCallProgram), "MAYBE_ROOT_CALL_PROGRAM");
    }

    #[test]
    fn test_disassembly_shows_constants_and_jump_targets() {
        let ast = Expr::if_(
            Expr::bool(true).at(1),
            Expr::int(42).at(2),
            Some(Expr::string("no").at(3)),
        );
        let program = Compiler::new().compile_program(&ast).unwrap();
        let text = disassemble_to_string(&program.pages[0], Some(&program));

        assert!(text.contains("CONST"));
        assert!(text.contains("(42)"));
        assert!(text.contains("(\"no\")"));
        assert!(text.contains("POP_JUMP_IF_NOT"));
        assert!(text.contains("► "));
        assert!(text.contains("┌──"));
    }

    #[test]
    fn test_disassembly_of_program_lists_every_page() {
        let ast = Expr::block(vec![Expr::function(
            0,
            "double",
            &["n"],
            Expr::binary(Expr::var("n"), BinaryOperation::Multiply, Expr::int(2)),
        )]);
        let program = Compiler::new().compile_program(&ast).unwrap();
        let text = disassemble_program(&program);

        assert!(text.contains("[0] <main>"));
        assert!(text.contains("[1] double (arity 1)"));
        assert!(text.contains("LOAD          slot 0"));
    }

    #[test]
    fn test_bad_opcode_stops_disassembly() {
        let mut page = Page::new("broken", 0);
        page.code = vec![Op::Pop as u8, 0xfe, Op::Pop as u8];

        let text = disassemble_to_string(&page, None);
        assert!(text.contains("POP"));
        assert!(text.contains("<bad opcode 0xfe>"));
        assert_eq!(text.lines().count(), 2);
    }
}
