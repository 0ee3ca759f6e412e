//! Scripting core of the elk shell: bytecode generation from the analyzed
//! AST, the stack machine that executes it, the runtime value model and
//! the bridge to external programs.

pub mod bytecode;
pub mod lang;
pub mod process;
pub mod runtime;

use crate::bytecode::{CompileError, Compiler, Program};
use crate::lang::node::Expr;
use crate::lang::value::Value;
use crate::runtime::{RuntimeResult, Vm};

/// Compile a whole script. The entry page is `pages[0]`.
pub fn compile(ast: &Expr) -> Result<Program, CompileError> {
    Compiler::new().compile_program(ast)
}

/// Execute the page at `entry` on a fresh machine with default limits.
pub fn execute(program: &Program, entry: u16) -> RuntimeResult<Value> {
    Vm::new().execute(program, entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::node::CallTarget;
    use crate::lang::operator::BinaryOperation;
    use crate::lang::std_fn::Library;

    #[test]
    fn test_compile_encode_decode_execute() {
        let library = Library::prelude();
        let len = std::sync::Arc::clone(library.get("len").unwrap());
        let ast = Expr::block(vec![
            Expr::let_("xs", Expr::list(vec![Expr::int(4), Expr::int(5)])),
            Expr::binary(
                Expr::call(CallTarget::Std(len), vec![Expr::var("xs")]),
                BinaryOperation::Add,
                Expr::index(Expr::var("xs"), Expr::int(1)),
            ),
        ]);

        let bytes = compile(&ast).unwrap().encode().unwrap();
        let mut program = Program::decode(&bytes).unwrap();
        program.bind(&library).unwrap();

        assert_eq!(execute(&program, 0).unwrap(), Value::Integer(7));
    }

    #[test]
    fn test_unbound_library_function_after_decode() {
        let library = Library::prelude();
        let len = std::sync::Arc::clone(library.get("len").unwrap());
        let ast = Expr::call(CallTarget::Std(len), vec![Expr::string("abc")]);

        let bytes = compile(&ast).unwrap().encode().unwrap();
        let program = Program::decode(&bytes).unwrap();

        let err = execute(&program, 0).unwrap_err();
        assert!(err.to_string().contains("unbound library function 'len'"));
    }
}
