//! The bytecode virtual machine.
//!
//! One operand stack, a vector of call frames, a list of open upvalue cells
//! ordered by creation, and a globals map. The dispatch loop executes one
//! instruction at a time until the top-level frame returns or a runtime
//! error stops the program.

use std::rc::Rc;

use hashbrown::HashMap;

use glua_core::{flags, Builtin, Closure, ErrorChain, Function, GluaError, Table, UpvalueCell, Value};

use crate::disasm;
use crate::opcodes::{merge_bytes, Op};

struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    /// Stack index of the callee; locals live at `base + slot`.
    base: usize,
    /// Whether the caller expects every returned value.
    is_assignment: bool,
}

/// One bracketed assignment: all right-hand values are evaluated starting at
/// `base`, then each target consumes `stack[cursor]` in order.
struct AssignSlot {
    base: usize,
    cursor: usize,
}

pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<Rc<UpvalueCell>>,
    globals: HashMap<String, Value>,
    assign_slots: Vec<AssignSlot>,
    local_targets: Vec<usize>,
    errors: ErrorChain,
}

impl VM {
    pub fn new() -> Self {
        let mut vm = VM {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            open_upvalues: Vec::new(),
            globals: HashMap::new(),
            assign_slots: Vec::new(),
            local_targets: Vec::new(),
            errors: ErrorChain::new(),
        };
        vm.register_builtin("time", |_args| {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos() as f64)
                .unwrap_or(0.0);
            Value::Number(nanos)
        });
        vm
    }

    /// Expose a host function to glua code under `name`.
    pub fn register_builtin(&mut self, name: &str, func: impl Fn(&[Value]) -> Value + 'static) {
        self.globals
            .insert(name.to_string(), Value::Builtin(Rc::new(Builtin::new(name, func))));
    }

    /// Errors accumulated by the last run. The REPL clears these between
    /// lines; file mode leaves them for the exit-code mapping.
    pub fn errors(&self) -> &ErrorChain {
        &self.errors
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    /// Execute a compiled top-level function to completion.
    ///
    /// Globals persist across calls so a REPL can interpret one line at a
    /// time; everything else is reset first.
    pub fn interpret(&mut self, function: Function) -> Result<Value, ErrorChain> {
        // A failed previous run may have left captures aliasing the old
        // stack; close them before it goes away.
        self.close_upvalues(0);
        self.stack.clear();
        self.frames.clear();
        self.assign_slots.clear();
        self.local_targets.clear();

        let closure = Rc::new(Closure::new(function.chunk, &function.name));
        self.stack.push(Value::Closure(closure));
        if let Err(message) = self.call_value(0, false) {
            self.record_error(message);
            return Err(self.errors.clone());
        }

        let value = self.run();
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(self.errors.clone())
        }
    }

    // --- Dispatch ---

    fn run(&mut self) -> Value {
        loop {
            let offset = self.frame().ip;
            let byte = self.read_byte();
            let Some(op) = Op::from_u8(byte) else {
                return self.runtime_error(format!("Do not know how to perform: {byte}"));
            };

            if flags::TRACE_EXECUTION {
                let chunk = Rc::clone(&self.frame().closure.chunk);
                eprint!("{}", disasm::trace_instruction(&chunk, offset, &self.stack));
            }

            match op {
                Op::Assert => {
                    let value = self.pop();
                    if !value.as_boolean() {
                        std::process::exit(5);
                    }
                }

                Op::Pop => {
                    self.pop();
                }

                Op::Constant => {
                    let index = self.read_byte() as usize;
                    let value = self.frame().closure.chunk.constants[index].clone();
                    self.stack.push(value);
                }

                Op::Nil => self.stack.push(Value::Nil),
                Op::Zero => self.stack.push(Value::Number(0.0)),

                Op::Add => {
                    if !self.arithmetic("add", |a, b| a + b) {
                        return Value::Nil;
                    }
                }
                Op::Subtract => {
                    if !self.arithmetic("subtract", |a, b| a - b) {
                        return Value::Nil;
                    }
                }
                Op::Multiply => {
                    if !self.arithmetic("multiply", |a, b| a * b) {
                        return Value::Nil;
                    }
                }
                Op::Divide => {
                    if !self.arithmetic("divide", |a, b| a / b) {
                        return Value::Nil;
                    }
                }
                Op::Power => {
                    if !self.arithmetic("exponentiate", f64::powf) {
                        return Value::Nil;
                    }
                }

                Op::Negate => {
                    let value = self.pop();
                    match value.as_number() {
                        Some(n) => self.stack.push(Value::Number(-n)),
                        None => return self.runtime_error("Cannot negate a non-number"),
                    }
                }

                Op::Not => {
                    let value = self.pop();
                    self.stack.push(Value::Boolean(!value.as_boolean()));
                }

                Op::Equals => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::Boolean(a == b));
                }

                Op::Less => {
                    if !self.compare(|a, b| a < b) {
                        return Value::Nil;
                    }
                }
                Op::Greater => {
                    if !self.compare(|a, b| a > b) {
                        return Value::Nil;
                    }
                }

                // Both operands are already evaluated; these are strict.
                Op::And => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack
                        .push(Value::Boolean(a.as_boolean() && b.as_boolean()));
                }
                Op::Or => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack
                        .push(Value::Boolean(a.as_boolean() || b.as_boolean()));
                }

                Op::JumpIfFalse => {
                    let condition = self.pop();
                    if condition.as_boolean() {
                        self.frame_mut().ip += 2;
                    } else {
                        let upper = self.read_byte();
                        let lower = self.read_byte();
                        self.frame_mut().ip += merge_bytes(upper, lower);
                    }
                }

                Op::Loop => {
                    let upper = self.read_byte();
                    let lower = self.read_byte();
                    self.frame_mut().ip -= merge_bytes(upper, lower);
                }

                Op::GetGlobal => {
                    let index = self.read_byte() as usize;
                    let name = self.frame().closure.chunk.constants[index].clone();
                    let Some(name) = name.as_str() else {
                        return self.runtime_error("Global name must be a string");
                    };
                    let value = self.globals.get(name).cloned().unwrap_or(Value::Nil);
                    self.stack.push(value);
                }

                Op::SetGlobal => {
                    let index = self.read_byte() as usize;
                    let value = self.next_assign_value();
                    let name = self.frame().closure.chunk.constants[index].clone();
                    let Some(name) = name.as_str() else {
                        return self.runtime_error("Global name must be a string");
                    };
                    self.globals.insert(name.to_string(), value);
                }

                Op::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let index = self.frame().base + slot;
                    // Calls are not arity-checked, so a missing argument's
                    // slot may not exist; it reads as nil.
                    let value = self.stack.get(index).cloned().unwrap_or(Value::Nil);
                    self.stack.push(value);
                }

                Op::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.next_assign_value();
                    let index = self.frame().base + slot;
                    if index >= self.stack.len() {
                        self.stack.resize(index + 1, Value::Nil);
                    }
                    self.stack[index] = value;
                }

                Op::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let cell = Rc::clone(&self.frame().closure.upvalues.borrow()[index]);
                    let value = cell.get(&self.stack);
                    self.stack.push(value);
                }

                Op::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.next_assign_value();
                    let cell = Rc::clone(&self.frame().closure.upvalues.borrow()[index]);
                    cell.set(&mut self.stack, value);
                }

                Op::CreateUpvalue => {
                    let index = self.read_byte() as usize;
                    let is_local = self.read_byte() == 1;
                    let Some(closure) = self.peek().as_closure().map(Rc::clone) else {
                        return self.runtime_error("Can only capture variables into a function");
                    };

                    let cell = if is_local {
                        let absolute = self.frame().base + index;
                        self.capture_local(absolute)
                    } else {
                        Rc::clone(&self.frame().closure.upvalues.borrow()[index])
                    };
                    closure.upvalues.borrow_mut().push(cell);
                }

                Op::CloseUpvalues => {
                    let n = self.read_byte() as usize;
                    let threshold = self.frame().base + n;
                    self.close_upvalues(threshold);
                    self.stack.truncate(threshold);
                }

                Op::Closure => {
                    let proto = self.pop();
                    let Some(proto) = proto.as_closure() else {
                        return self.runtime_error("Can only instantiate a function");
                    };
                    self.stack.push(Value::Closure(Rc::new(proto.copy_of())));
                }

                Op::CreateTable => {
                    self.stack.push(Value::table(Table::new()));
                }

                Op::InsertTable => {
                    let value = self.pop();
                    let Some(table) = self.peek().as_table().map(Rc::clone) else {
                        return self.runtime_error("Cannot insert into a non-table");
                    };
                    table.borrow_mut().insert(value);
                }

                Op::SetTable => {
                    let value = self.next_assign_value();
                    let key = self.pop();
                    let target = self.pop();
                    let Some(table) = target.as_table() else {
                        return self.runtime_error("Cannot index a non-table");
                    };
                    if !table.borrow_mut().set(key, value.clone()) {
                        return self.runtime_error("Cannot set key <nil> in table.");
                    }
                    self.stack.push(value);
                }

                Op::InitTable => {
                    // Same contract as SetTable but the table stays on top;
                    // table literals chain entries this way.
                    let value = self.pop();
                    let key = self.pop();
                    let Some(table) = self.peek().as_table().map(Rc::clone) else {
                        return self.runtime_error("Cannot index a non-table");
                    };
                    if !table.borrow_mut().set(key, value) {
                        return self.runtime_error("Cannot set key <nil> in table.");
                    }
                }

                Op::GetTable => {
                    let key = self.pop();
                    let target = self.pop();
                    let Some(table) = target.as_table() else {
                        return self.runtime_error("Cannot index a non-table");
                    };
                    let value = table.borrow().get(&key);
                    self.stack.push(value);
                }

                Op::AssignStart => {
                    let base = self.stack.len();
                    self.assign_slots.push(AssignSlot { base, cursor: base });
                }

                Op::AssignCleanup => {
                    let slot = self.assign_slots.pop().unwrap();
                    self.stack.truncate(slot.base);
                }

                Op::LocalAllocate => {
                    let n = self.read_byte() as usize;
                    self.local_targets.push(self.stack.len() + n);
                }

                Op::LocalCleanup => {
                    let target = self.local_targets.pop().unwrap();
                    if target <= self.stack.len() {
                        self.stack.truncate(target);
                    } else {
                        // Fewer values than declared names: pad with nil.
                        self.stack.resize(target, Value::Nil);
                    }
                }

                Op::Call => {
                    let arity = self.read_byte() as usize;
                    let is_assignment = self.read_byte() == 1;
                    if let Err(message) = self.call_value(arity, is_assignment) {
                        return self.runtime_error(message);
                    }
                }

                Op::Return => {
                    let arity = self.read_byte() as usize;
                    self.return_from(arity);
                    if self.frames.is_empty() {
                        return self.pop();
                    }
                }
            }
        }
    }

    // --- Calls and returns ---

    fn call_value(&mut self, arity: usize, is_assignment: bool) -> Result<(), String> {
        let bottom = self.stack.len() - arity - 1;
        match self.stack[bottom].clone() {
            Value::Closure(closure) => {
                self.frames.push(CallFrame {
                    closure,
                    ip: 0,
                    base: bottom,
                    is_assignment,
                });
                if flags::TRACE_EXECUTION {
                    self.trace_frame();
                }
                Ok(())
            }
            Value::Builtin(builtin) => {
                // Builtins return exactly one value and never see the
                // frame machinery.
                let args: Vec<Value> = self.stack[bottom + 1..].to_vec();
                self.stack.truncate(bottom);
                let result = builtin.call(&args);
                self.stack.push(result);
                Ok(())
            }
            other => Err(format!("Can only call functions, got {}", other.type_name())),
        }
    }

    /// Unwind the current frame: capture the return values, close every
    /// capture of this frame's locals, drop the callee and its stack
    /// region, then push the results the caller asked for.
    fn return_from(&mut self, arity: usize) {
        let mut values = Vec::with_capacity(arity);
        for _ in 0..arity {
            values.push(self.pop());
        }
        values.reverse();

        let frame = self.frames.pop().unwrap();
        self.close_upvalues(frame.base);
        self.stack.truncate(frame.base);

        if frame.is_assignment {
            if values.is_empty() {
                self.stack.push(Value::Nil);
            } else {
                self.stack.extend(values);
            }
        } else {
            self.stack
                .push(values.into_iter().next().unwrap_or(Value::Nil));
        }

        if flags::TRACE_EXECUTION && !self.frames.is_empty() {
            self.trace_frame();
        }
    }

    // --- Upvalues ---

    /// Reuse the open cell for `absolute` if one exists so every capture of
    /// a local shares the same storage.
    fn capture_local(&mut self, absolute: usize) -> Rc<UpvalueCell> {
        for cell in &self.open_upvalues {
            if cell.stack_index() == Some(absolute) {
                return Rc::clone(cell);
            }
        }
        let cell = UpvalueCell::open(absolute);
        self.open_upvalues.push(Rc::clone(&cell));
        cell
    }

    /// Close every open cell aliasing a slot at or above `threshold`.
    fn close_upvalues(&mut self, threshold: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|cell| match cell.stack_index() {
            Some(index) if index >= threshold => {
                cell.close(stack);
                false
            }
            Some(_) => true,
            None => false,
        });
    }

    // --- Assignment cursors ---

    /// The next right-hand value for a target-consuming instruction.
    /// Reading past the evaluated region yields nil, which is how short
    /// right-hand sides pad their targets.
    fn next_assign_value(&mut self) -> Value {
        let slot = self.assign_slots.last_mut().unwrap();
        let index = slot.cursor;
        slot.cursor += 1;
        if index >= self.stack.len() {
            Value::Nil
        } else {
            self.stack[index].clone()
        }
    }

    // --- Stack and frame helpers ---

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.closure.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self) -> &Value {
        self.stack.last().unwrap()
    }

    fn arithmetic(&mut self, verb: &str, op: impl Fn(f64, f64) -> f64) -> bool {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.stack.push(Value::Number(op(a, b)));
                true
            }
            _ => {
                self.record_error(format!("Cannot {verb} two non-numbers"));
                false
            }
        }
    }

    fn compare(&mut self, op: impl Fn(f64, f64) -> bool) -> bool {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.stack.push(Value::Boolean(op(a, b)));
                true
            }
            _ => {
                self.record_error("Unable to compare two non-numbers");
                false
            }
        }
    }

    fn record_error(&mut self, message: impl Into<String>) {
        let line = self
            .frames
            .last()
            .and_then(|frame| {
                frame
                    .closure
                    .chunk
                    .lines
                    .get(frame.ip.saturating_sub(1))
                    .copied()
            })
            .unwrap_or(0);
        self.errors.push(GluaError::runtime(message, line));
    }

    fn runtime_error(&mut self, message: impl Into<String>) -> Value {
        self.record_error(message);
        Value::Nil
    }

    fn trace_frame(&self) {
        let name = &self.frame().closure.name;
        if name.is_empty() {
            eprintln!("========== <script> ==========");
        } else {
            eprintln!("========== {name} ==========");
        }
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}
