use glua::Interpreter;
use glua_core::{ErrorChain, Value};
use glua_vm::Mode;

/// Evaluate in REPL mode so a trailing expression becomes the result.
pub fn eval(source: &str) -> Value {
    let mut interpreter = Interpreter::new(Mode::Repl);
    interpreter
        .eval(source)
        .unwrap_or_else(|e| panic!("eval failed for `{source}`: {e}"))
}

/// Run a whole program in script mode; every `assert` in it must hold.
pub fn run(source: &str) -> Value {
    let mut interpreter = Interpreter::new(Mode::Script);
    interpreter
        .eval(source)
        .unwrap_or_else(|e| panic!("script failed:\n{source}\n{e}"))
}

/// Evaluate expecting failure and hand back the error chain.
pub fn eval_err(source: &str) -> ErrorChain {
    let mut interpreter = Interpreter::new(Mode::Script);
    interpreter
        .eval(source)
        .err()
        .unwrap_or_else(|| panic!("expected errors for `{source}`"))
}

/// Generate one test per scripted expression.
///
/// ```ignore
/// script_tests! {
///     addition: "1 + 2" => Value::Number(3.0),
/// }
/// ```
#[macro_export]
macro_rules! script_tests {
    ($($name:ident : $source:expr => $expected:expr),* $(,)?) => {
        $(
            paste::paste! {
                #[test]
                fn [<test_ $name>]() {
                    let result = common::eval($source);
                    assert_eq!(result, $expected, "source: {}", $source);
                }
            }
        )*
    };
}
