//! IR printer
//!
//! Human-readable dump of a generated module, used by `--emit-ir`.

use std::fmt::Write;

use crate::middle::ir::*;

/// Print an IR module to a string
pub fn print_ir(module: &IrModule) -> String {
    let mut out = String::new();

    writeln!(out, "; unit: {}", module.name).unwrap();
    writeln!(out, "; init: {}", module.init).unwrap();
    for entry in &module.entries {
        writeln!(out, "; entry: {}", entry).unwrap();
    }
    writeln!(out).unwrap();

    for s in &module.structs {
        write!(out, "struct %{} {{ ", s.name).unwrap();
        for (i, (name, ty)) in s.fields.iter().enumerate() {
            if i > 0 {
                write!(out, ", ").unwrap();
            }
            write!(out, "{}: {}", name, ty).unwrap();
        }
        writeln!(out, " }}").unwrap();
    }
    for g in &module.globals {
        writeln!(out, "global @{}: {}", g.name, g.ty).unwrap();
    }
    for e in &module.externs {
        let params: Vec<String> = e.params.iter().map(|t| t.to_string()).collect();
        writeln!(out, "extern {}({}) -> {}", e.name, params.join(", "), e.ret).unwrap();
    }
    if !(module.structs.is_empty() && module.globals.is_empty() && module.externs.is_empty()) {
        writeln!(out).unwrap();
    }

    for func in &module.functions {
        print_function(&mut out, func);
        writeln!(out).unwrap();
    }

    out
}

fn print_function(out: &mut String, func: &IrFunction) {
    let link = match func.linkage {
        Linkage::Exported => "export",
        Linkage::Internal => "intern",
    };
    write!(out, "{} fn {}(", link, func.name).unwrap();
    for (i, (name, ty)) in func.params.iter().enumerate() {
        if i > 0 {
            write!(out, ", ").unwrap();
        }
        write!(out, "{}: {}", name, ty).unwrap();
    }
    writeln!(out, ") -> {} {{", func.ret).unwrap();

    for block in &func.blocks {
        writeln!(out, "  {}.{}:", block.id.0, block.label).unwrap();
        for inst in &block.instructions {
            write!(out, "    ").unwrap();
            print_instruction(out, inst);
            writeln!(out).unwrap();
        }
        if let Some(term) = &block.terminator {
            write!(out, "    ").unwrap();
            print_terminator(out, term);
            writeln!(out).unwrap();
        }
    }

    writeln!(out, "}}").unwrap();
}

fn print_instruction(out: &mut String, inst: &Instruction) {
    match inst {
        Instruction::Alloca { dest, ty } => write!(out, "{} = alloca {}", dest, ty).unwrap(),
        Instruction::Load { dest, ptr, ty } => {
            write!(out, "{} = load {} {}", dest, ty, ptr).unwrap()
        }
        Instruction::Store { ptr, value, ty } => {
            write!(out, "store {} {} to {}", ty, value, ptr).unwrap()
        }
        Instruction::Bin {
            dest,
            op,
            ty,
            lhs,
            rhs,
        } => write!(out, "{} = {} {} {}, {}", dest, op, ty, lhs, rhs).unwrap(),
        Instruction::Cmp {
            dest,
            op,
            ty,
            lhs,
            rhs,
        } => write!(out, "{} = cmp {} {} {}, {}", dest, op, ty, lhs, rhs).unwrap(),
        Instruction::Neg { dest, ty, value } => {
            write!(out, "{} = neg {} {}", dest, ty, value).unwrap()
        }
        Instruction::Not { dest, value } => write!(out, "{} = not {}", dest, value).unwrap(),
        Instruction::Cast {
            dest,
            value,
            from,
            to,
        } => write!(out, "{} = cast {} {} to {}", dest, from, value, to).unwrap(),
        Instruction::FieldPtr {
            dest,
            base,
            strukt,
            index,
        } => write!(out, "{} = fieldptr %{} {}, {}", dest, strukt, base, index).unwrap(),
        Instruction::Call { dest, func, args } => {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            match dest {
                Some(d) => write!(out, "{} = call {}({})", d, func, args.join(", ")).unwrap(),
                None => write!(out, "call {}({})", func, args.join(", ")).unwrap(),
            }
        }
    }
}

fn print_terminator(out: &mut String, term: &Terminator) {
    match term {
        Terminator::Return(Some(v)) => write!(out, "ret {}", v).unwrap(),
        Terminator::Return(None) => write!(out, "ret void").unwrap(),
        Terminator::Jump(target) => write!(out, "jmp b{}", target.0).unwrap(),
        Terminator::Branch {
            cond,
            then_to,
            else_to,
        } => write!(out, "br {}, b{}, b{}", cond, then_to.0, else_to.0).unwrap(),
        Terminator::Unreachable => write!(out, "unreachable").unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::module::UnitManager;
    use crate::middle::ir_gen::generate;

    #[test]
    fn test_print_smoke() {
        let mut manager = UnitManager::new(Vec::new());
        let unit = manager
            .load_source("FUNC Int i = add(Int a, Int b) DO RETURN a + b END", "t")
            .unwrap();
        let module = generate(&unit).unwrap();
        let text = print_ir(&module);
        assert!(text.contains("export fn vdi_add_i_i"));
        assert!(text.contains("ret"));
    }
}
