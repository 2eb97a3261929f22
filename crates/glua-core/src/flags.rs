//! Build-time debug switches.
//!
//! All diagnostic output goes to stderr so it never mixes with program
//! output. Flip a flag and rebuild; there is no runtime configuration.

/// Dump the token stream after scanning, one token per position with a
/// newline after every `;`.
pub const PRINT_TOKENS: bool = false;

/// Dump each parsed declaration as an indented tree before it is emitted.
pub const PRINT_AST: bool = false;

/// Disassemble every compiled function once compilation finishes.
pub const PRINT_BYTECODE: bool = false;

/// Trace every executed instruction along with the operand stack.
pub const TRACE_EXECUTION: bool = false;
