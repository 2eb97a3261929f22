//! The embedding facade: source text in, value out.

use glua_core::{flags, ErrorChain, GluaError, Value};
use glua_scanner::dump_tokens;
use glua_vm::{compile, Mode, VM};

/// A persistent interpreter: one VM whose globals (and registered builtins)
/// survive across [`Interpreter::eval`] calls, which is what makes the REPL
/// a REPL.
pub struct Interpreter {
    vm: VM,
    mode: Mode,
}

impl Interpreter {
    pub fn new(mode: Mode) -> Self {
        Interpreter {
            vm: VM::new(),
            mode,
        }
    }

    /// Scan, compile and run one chunk of source. Scan errors abort before
    /// compilation, compile errors before execution.
    pub fn eval(&mut self, source: &str) -> Result<Value, ErrorChain> {
        let (tokens, errors) = glua_scanner::scan(source);
        if flags::PRINT_TOKENS {
            eprint!("{}", dump_tokens(&tokens));
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let function = compile(&tokens, self.mode)?;
        self.vm.interpret(function)
    }

    /// Expose a host function to scripts run by this interpreter.
    pub fn register_builtin(&mut self, name: &str, func: impl Fn(&[Value]) -> Value + 'static) {
        self.vm.register_builtin(name, func);
    }

    /// Forget accumulated errors so the next eval starts clean.
    pub fn clear_errors(&mut self) {
        self.vm.clear_errors();
    }
}

/// The process exit code for a failed run: scan errors are 1, compile
/// errors 2, runtime errors 3, anything else 4. (A failed `assert` exits
/// with 5 from inside the VM and never reaches this mapping.)
pub fn exit_code(errors: &ErrorChain) -> i32 {
    match errors.first() {
        Some(GluaError::Scan { .. }) => 1,
        Some(GluaError::Compile { .. }) => 2,
        Some(GluaError::Runtime { .. }) => 3,
        None => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        let mut scan = ErrorChain::new();
        scan.push(GluaError::scan("bad char", 1));
        assert_eq!(exit_code(&scan), 1);

        let mut compile = ErrorChain::new();
        compile.push(GluaError::compile("bad token", 1));
        assert_eq!(exit_code(&compile), 2);

        let mut runtime = ErrorChain::new();
        runtime.push(GluaError::runtime("bad value", 1));
        assert_eq!(exit_code(&runtime), 3);

        assert_eq!(exit_code(&ErrorChain::new()), 4);
    }

    #[test]
    fn test_exit_code_uses_first_error() {
        let mut chain = ErrorChain::new();
        chain.push(GluaError::compile("first", 1));
        chain.push(GluaError::runtime("second", 2));
        assert_eq!(exit_code(&chain), 2);
    }
}
