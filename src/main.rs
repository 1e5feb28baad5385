use anyhow::Result;
use tapec::ast::{BinOp, Expr, Function, Program, Stmt};
use tapec::{CodeGen, Machine};

// Demo driver: build a program, compile it, show the annotated stream, run
// it on the tape machine.
fn main() -> Result<()> {
    env_logger::init();

    let program = Program {
        functions: vec![Function {
            name: "double".to_string(),
            params: vec!["n".to_string()],
            returns: true,
            body: vec![Stmt::Return(Expr::Binary(
                BinOp::Mul,
                Box::new(Expr::Var("n".to_string())),
                Box::new(Expr::Int(2)),
            ))],
        }],
        body: vec![
            Stmt::Print(Expr::Str("6 times 7 is ".to_string())),
            Stmt::IntDecl {
                name: "x".to_string(),
                init: Some(Expr::Binary(
                    BinOp::Mul,
                    Box::new(Expr::Int(6)),
                    Box::new(Expr::Int(7)),
                )),
            },
            Stmt::Print(Expr::Var("x".to_string())),
            Stmt::PrintChar(Expr::Int(10)),
            Stmt::Print(Expr::Str("double of 21 is ".to_string())),
            Stmt::IntDecl {
                name: "y".to_string(),
                init: Some(Expr::Call("double".to_string(), vec![Expr::Int(21)])),
            },
            Stmt::Print(Expr::Var("y".to_string())),
            Stmt::PrintChar(Expr::Int(10)),
            Stmt::Print(Expr::Str("counting: ".to_string())),
            Stmt::For {
                var: "i".to_string(),
                start: Expr::Int(0),
                stop: Expr::Int(4),
                step: Expr::Int(1),
                body: vec![
                    Stmt::Print(Expr::Var("i".to_string())),
                    Stmt::PrintChar(Expr::Int(32)),
                ],
            },
            Stmt::PrintChar(Expr::Int(10)),
        ],
    };

    let listing = CodeGen::new(&program).compile()?;
    let code = listing.program();
    println!("generated {} instructions\n", code.len());
    println!("{}", listing.annotated());

    let mut vm = Machine::new(&code)?;
    vm.run()?;
    println!("program output:");
    print!("{}", String::from_utf8_lossy(vm.output()));
    Ok(())
}
