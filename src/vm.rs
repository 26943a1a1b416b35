// File: src/vm.rs
//
// Bytecode virtual machine for Flax.
// A stack machine dispatching over one-byte opcodes, with call frames,
// closures and upvalues, classes with single inheritance, and a global
// table shared with the compiler through the heap.

use once_cell::sync::Lazy;
use std::io::Write;
use std::time::Instant;

use crate::bytecode::OpCode;
use crate::compiler;
use crate::debug::{self, DF_TRACE};
use crate::errors::{InterpretError, RuntimeError, TraceFrame};
use crate::heap::{GcRoots, Heap};
use crate::object::{NativeFn, Obj, ObjRef, UpvalueLocation};
use crate::value::Value;

pub const FRAMES_MAX: usize = 64;
const UINT8_COUNT: usize = 256;
pub const STACK_MAX: usize = FRAMES_MAX * UINT8_COUNT;

/// Seconds-since-start reference for the `clock()` native. Forced at VM
/// construction so it measures from process start, not first call.
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

fn clock_native(_args: &[Value]) -> Value {
    Value::Number(START_TIME.elapsed().as_secs_f64())
}

/// One active call. `base` is the stack slot of the callee (or receiver),
/// which local slot numbering is relative to. `function` caches
/// `closure.function` to shorten the dispatch path.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub closure: ObjRef,
    pub function: ObjRef,
    pub ip: usize,
    pub base: usize,
}

/// What a callee turned out to be, copied out of the heap so dispatch can
/// mutate the VM freely.
enum Callee {
    Closure,
    Bound(Value, ObjRef),
    Class,
    Native(NativeFn),
    Other,
}

pub struct Vm<W: Write> {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Head of the open-upvalue list, sorted by descending stack slot.
    open_upvalues: Option<ObjRef>,
    output: W,
}

impl<W: Write> Vm<W> {
    pub fn new(output: W) -> Vm<W> {
        Lazy::force(&START_TIME);

        let mut vm = Vm {
            heap: Heap::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: None,
            output,
        };
        let init = vm.heap.intern("init", &GcRoots::NONE);
        vm.heap.init_string = Some(init);
        vm.define_native("clock", clock_native);
        vm
    }

    /// Compiles and runs a source string. The VM keeps its globals and
    /// interned strings afterwards, so a REPL can call this repeatedly.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function =
            compiler::compile(source, &mut self.heap).map_err(InterpretError::Compile)?;

        // The script function is pushed before the closure allocation so a
        // collection triggered by it still sees the function.
        self.push(Value::Obj(function));
        let roots = GcRoots {
            stack: &self.stack,
            frames: &self.frames,
            open_upvalues: self.open_upvalues,
        };
        let closure = self.heap.new_closure(function, &roots);
        self.pop();
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0).map_err(InterpretError::Runtime)?;

        self.run().map_err(InterpretError::Runtime)
    }

    /// The program's output sink; tests hand in a buffer and read it back.
    pub fn output(&self) -> &W {
        &self.output
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.intern(name, &GcRoots::NONE);
        // Pin both objects: allocating the native must not sweep the name,
        // and the table insert happens after both allocations.
        self.heap.push_temp(Value::Obj(name));
        let native = self.heap.new_native(function, &GcRoots::NONE);
        self.heap.push_temp(Value::Obj(native));
        let hash = self.heap.string(name).hash;
        self.heap.globals.set(name, hash, Value::Obj(native));
        self.heap.pop_temp();
        self.heap.pop_temp();
    }

    // ---- stack ----------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ---- code reading ---------------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let (function, ip) = {
            let frame = self.frames.last().expect("no call frame");
            (frame.function, frame.ip)
        };
        let byte = self.heap.function(function).chunk.code[ip];
        self.frames.last_mut().expect("no call frame").ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let function = self.frames.last().expect("no call frame").function;
        self.heap.function(function).chunk.constants[index]
    }

    /// Reads a constant operand that the compiler only ever emits as an
    /// interned string (variable and property names).
    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => panic!("constant operand is not a string"),
        }
    }

    // ---- errors ---------------------------------------------------------

    /// Builds the error report with a stack trace, innermost frame first,
    /// then resets the VM so a REPL can keep going.
    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let line = {
            let frame = self.frames.last().expect("no call frame");
            self.heap.function(frame.function).chunk.lines[frame.ip - 1]
        };

        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let frame_line = function.chunk.lines[frame.ip.saturating_sub(1)];
            let name = function.name.map(|n| self.heap.str_slice(n).to_string());
            trace.push(TraceFrame { line: frame_line, function: name });
        }

        self.reset_stack();
        RuntimeError { line, message, trace }
    }

    // ---- calls ----------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let kind = match callee {
            Value::Obj(r) => match self.heap.obj(r) {
                Obj::Closure(_) => Callee::Closure,
                Obj::BoundMethod(b) => Callee::Bound(b.receiver, b.method),
                Obj::Class(_) => Callee::Class,
                Obj::Native(n) => Callee::Native(n.function),
                _ => Callee::Other,
            },
            _ => Callee::Other,
        };

        match kind {
            Callee::Closure => {
                let closure = match callee {
                    Value::Obj(r) => r,
                    _ => unreachable!(),
                };
                self.call_closure(closure, arg_count)
            }
            Callee::Bound(receiver, method) => {
                // Slot zero of the new frame holds the receiver, where
                // `this` resolves.
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
            Callee::Class => self.call_class(callee, arg_count),
            Callee::Native(native) => {
                let start = self.stack.len() - arg_count;
                let result = native(&self.stack[start..]);
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Callee::Other => {
                Err(self.runtime_error("can only call functions and classes".to_string()))
            }
        }
    }

    fn call_class(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        let class = match callee {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };

        let roots = GcRoots {
            stack: &self.stack,
            frames: &self.frames,
            open_upvalues: self.open_upvalues,
        };
        let instance = self.heap.new_instance(class, &roots);
        let slot = self.stack.len() - arg_count - 1;
        self.stack[slot] = Value::Obj(instance);

        let init = self.heap.init_string.expect("init string not interned");
        let hash = self.heap.string(init).hash;
        match self.heap.class(class).methods.get(init, hash) {
            Some(Value::Obj(initializer)) => self.call_closure(initializer, arg_count),
            Some(_) => panic!("initializer is not a closure"),
            None if arg_count != 0 => Err(self
                .runtime_error(format!("expected 0 arguments but got {}", arg_count))),
            None => Ok(()),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "expected {} arguments but got {}",
                arity, arg_count
            )));
        }

        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("stack overflow".to_string()));
        }

        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        let instance = match receiver {
            Value::Obj(r) if self.heap.is_instance(r) => r,
            _ => return Err(self.runtime_error("only instances have methods".to_string())),
        };

        // A field shadows a method of the same name; it may hold any
        // callable.
        let hash = self.heap.string(name).hash;
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let hash = self.heap.string(name).hash;
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => self.call_closure(method, arg_count),
            _ => {
                let message =
                    format!("undefined property \"{}\"", self.heap.str_slice(name));
                Err(self.runtime_error(message))
            }
        }
    }

    /// Replaces the instance on top of the stack with the named method
    /// bound to it.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let hash = self.heap.string(name).hash;
        let method = match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => method,
            _ => {
                let message =
                    format!("undefined property \"{}\"", self.heap.str_slice(name));
                return Err(self.runtime_error(message));
            }
        };

        let receiver = self.peek(0);
        let roots = GcRoots {
            stack: &self.stack,
            frames: &self.frames,
            open_upvalues: self.open_upvalues,
        };
        let bound = self.heap.new_bound_method(receiver, method, &roots);
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // ---- upvalues -------------------------------------------------------

    fn open_location(&self, upvalue: ObjRef) -> usize {
        match self.heap.upvalue(upvalue).location {
            UpvalueLocation::Open(slot) => slot,
            UpvalueLocation::Closed(_) => panic!("closed upvalue in open list"),
        }
    }

    /// Finds or creates the open upvalue for a stack slot. The open list
    /// is kept sorted by descending slot, with at most one node per slot,
    /// so closures capturing the same variable share one upvalue.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(r) = current {
            if self.open_location(r) <= slot {
                break;
            }
            prev = Some(r);
            current = self.heap.upvalue(r).next;
        }

        if let Some(r) = current {
            if self.open_location(r) == slot {
                return r;
            }
        }

        let roots = GcRoots {
            stack: &self.stack,
            frames: &self.frames,
            open_upvalues: self.open_upvalues,
        };
        let created = self.heap.new_upvalue(slot, current, &roots);
        match prev {
            None => self.open_upvalues = Some(created),
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
        }
        created
    }

    /// Closes every open upvalue at or above `last`, moving the stack
    /// value into the upvalue itself.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(r) = self.open_upvalues {
            if self.open_location(r) < last {
                break;
            }
            let value = self.stack[self.open_location(r)];
            let upvalue = self.heap.upvalue_mut(r);
            upvalue.location = UpvalueLocation::Closed(value);
            self.open_upvalues = upvalue.next;
        }
    }

    // ---- dispatch -------------------------------------------------------

    fn trace_instruction(&self) {
        let mut rendered = String::from("          ");
        for &value in &self.stack {
            rendered.push_str(&format!("[ {} ]", self.heap.value_to_string(value)));
        }
        eprintln!("{}", rendered);

        let frame = self.frames.last().expect("no call frame");
        let chunk = &self.heap.function(frame.function).chunk;
        debug::disassemble_instruction(chunk, &self.heap, frame.ip);
    }

    fn binary_number_op(
        &mut self,
        op: impl FnOnce(f64, f64) -> Value,
    ) -> Result<(), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("operands must be numbers".to_string())),
        }
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if debug::enabled(DF_TRACE) {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => panic!("unknown opcode {}", byte),
            };

            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no call frame").base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("no call frame").base;
                    // Assignment is an expression: the value stays on the
                    // stack.
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    match self.heap.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message = format!(
                                "undefined variable \"{}\"",
                                self.heap.str_slice(name)
                            );
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    self.heap.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    // Assigning an undefined global is an error: undo the
                    // binding the set just created.
                    if self.heap.globals.set(name, hash, value) {
                        self.heap.globals.delete(name, hash);
                        let message =
                            format!("undefined variable \"{}\"", self.heap.str_slice(name));
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().expect("no call frame").closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue).location {
                        UpvalueLocation::Open(stack_slot) => self.stack[stack_slot],
                        UpvalueLocation::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().expect("no call frame").closure;
                    let upvalue = self.heap.closure(closure).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).location {
                        UpvalueLocation::Open(stack_slot) => {
                            self.stack[stack_slot] = value;
                        }
                        UpvalueLocation::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).location =
                                UpvalueLocation::Closed(value);
                        }
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let instance = match self.peek(0) {
                        Value::Obj(r) if self.heap.is_instance(r) => r,
                        _ => {
                            return Err(self.runtime_error(
                                "only instances have properties".to_string(),
                            ))
                        }
                    };

                    let hash = self.heap.string(name).hash;
                    if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        // No field: fall back to binding a method.
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let instance = match self.peek(1) {
                        Value::Obj(r) if self.heap.is_instance(r) => r,
                        _ => {
                            return Err(self
                                .runtime_error("only instances have fields".to_string()))
                        }
                    };

                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);

                    // Pop value and instance, leave the assigned value.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => panic!("superclass slot is not a class"),
                    };
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    self.binary_number_op(|a, b| Value::Bool(a > b))?;
                }
                OpCode::Less => {
                    self.binary_number_op(|a, b| Value::Bool(a < b))?;
                }
                OpCode::Add => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Obj(a), Value::Obj(b))
                            if self.heap.is_string(a) && self.heap.is_string(b) =>
                        {
                            self.concatenate(a, b);
                        }
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a + b));
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "operands must be two numbers or two strings".to_string(),
                            ))
                        }
                    }
                }
                OpCode::Subtract => {
                    self.binary_number_op(|a, b| Value::Number(a - b))?;
                }
                OpCode::Multiply => {
                    self.binary_number_op(|a, b| Value::Number(a * b))?;
                }
                OpCode::Divide => {
                    self.binary_number_op(|a, b| Value::Number(a / b))?;
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    match self.peek(0) {
                        Value::Number(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        _ => {
                            return Err(self
                                .runtime_error("operand must be a number".to_string()))
                        }
                    }
                }
                OpCode::Print => {
                    let value = self.pop();
                    let rendered = self.heap.value_to_string(value);
                    let _ = writeln!(self.output, "{}", rendered);
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("no call frame").ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("no call frame").ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("no call frame").ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = match self.pop() {
                        Value::Obj(r) => r,
                        _ => panic!("superclass slot is not a class"),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(r) => r,
                        _ => panic!("closure constant is not a function"),
                    };

                    let roots = GcRoots {
                        stack: &self.stack,
                        frames: &self.frames,
                        open_upvalues: self.open_upvalues,
                    };
                    let closure = self.heap.new_closure(function, &roots);
                    self.push(Value::Obj(closure));

                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let (frame_base, frame_closure) = {
                        let frame = self.frames.last().expect("no call frame");
                        (frame.base, frame.closure)
                    };
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            self.capture_upvalue(frame_base + index)
                        } else {
                            // Re-export of an upvalue the enclosing
                            // function already captured.
                            self.heap.closure(frame_closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no call frame");
                    self.close_upvalues(frame.base);

                    if self.frames.is_empty() {
                        // Pop the script closure; a successful run leaves
                        // the stack empty.
                        self.pop();
                        return Ok(());
                    }

                    self.stack.truncate(frame.base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let roots = GcRoots {
                        stack: &self.stack,
                        frames: &self.frames,
                        open_upvalues: self.open_upvalues,
                    };
                    let class = self.heap.new_class(name, &roots);
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1) {
                        Value::Obj(r) if self.heap.is_class(r) => r,
                        _ => {
                            return Err(self
                                .runtime_error("superclass must be a class".to_string()))
                        }
                    };
                    let subclass = match self.peek(0) {
                        Value::Obj(r) => r,
                        _ => panic!("subclass slot is not a class"),
                    };

                    // Copy now, before the subclass's own methods are
                    // defined, so overrides win.
                    let methods: Vec<_> = self.heap.class(superclass).methods.iter().collect();
                    for (key, hash, value) in methods {
                        self.heap.class_mut(subclass).methods.set(key, hash, value);
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Obj(r) => r,
                        _ => panic!("method target is not a class"),
                    };
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
            }
        }
    }

    fn concatenate(&mut self, a: ObjRef, b: ObjRef) {
        let mut chars =
            String::with_capacity(self.heap.str_slice(a).len() + self.heap.str_slice(b).len());
        chars.push_str(self.heap.str_slice(a));
        chars.push_str(self.heap.str_slice(b));

        // Operands stay on the stack (peeked, not popped) until the result
        // exists, keeping them rooted across the allocation.
        let roots = GcRoots {
            stack: &self.stack,
            frames: &self.frames,
            open_upvalues: self.open_upvalues,
        };
        let result = self.heap.take_string(chars, &roots);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{EX_DATAERR, EX_SOFTWARE};

    fn run(source: &str) -> (String, Result<(), InterpretError>) {
        let mut vm = Vm::new(Vec::new());
        let result = vm.interpret(source);
        let output = String::from_utf8(vm.output.clone()).expect("non-utf8 output");
        (output, result)
    }

    fn run_ok(source: &str) -> String {
        let (output, result) = run(source);
        if let Err(e) = result {
            panic!("unexpected error: {}", e);
        }
        output
    }

    fn run_err(source: &str) -> InterpretError {
        let (_, result) = run(source);
        result.expect_err("expected an error")
    }

    #[test]
    fn test_print_arithmetic() {
        assert_eq!(run_ok("print 1 + 2;"), "3\n");
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(run_ok("print 1 + 2 * 3 - 4 / 2;"), "5\n");
        assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
        assert_eq!(run_ok("print -2 * 3;"), "-6\n");
    }

    #[test]
    fn test_comparisons_and_equality() {
        assert_eq!(run_ok("print 1 < 2;"), "true\n");
        assert_eq!(run_ok("print 2 <= 2;"), "true\n");
        assert_eq!(run_ok("print 3 > 4;"), "false\n");
        assert_eq!(run_ok("print 1 == 1;"), "true\n");
        assert_eq!(run_ok("print 1 != 1;"), "false\n");
        assert_eq!(run_ok("print nil == nil;"), "true\n");
        assert_eq!(run_ok("print nil == false;"), "false\n");
    }

    #[test]
    fn test_not_and_falseness() {
        assert_eq!(run_ok("print !nil;"), "true\n");
        assert_eq!(run_ok("print !false;"), "true\n");
        assert_eq!(run_ok("print !0;"), "false\n");
        assert_eq!(run_ok("print !\"\";"), "false\n");
    }

    #[test]
    fn test_interned_strings_compare_equal() {
        assert_eq!(run_ok("var a = \"hi\"; var b = \"hi\"; print a == b;"), "true\n");
    }

    #[test]
    fn test_concatenation() {
        assert_eq!(run_ok("print \"a\" + \"b\" + \"c\";"), "abc\n");
        // Concatenation results are interned like any other string.
        assert_eq!(
            run_ok("var a = \"ab\" + \"c\"; var b = \"a\" + \"bc\"; print a == b;"),
            "true\n"
        );
    }

    #[test]
    fn test_globals_define_and_assign() {
        assert_eq!(run_ok("var a = 1; a = a + 1; print a;"), "2\n");
        assert_eq!(run_ok("var a; print a;"), "nil\n");
    }

    #[test]
    fn test_locals_and_shadowing() {
        assert_eq!(
            run_ok("var a = \"outer\"; { var a = \"inner\"; print a; } print a;"),
            "inner\nouter\n"
        );
    }

    #[test]
    fn test_if_else() {
        assert_eq!(run_ok("if (1 < 2) print \"then\"; else print \"else\";"), "then\n");
        assert_eq!(run_ok("if (nil) print \"then\"; else print \"else\";"), "else\n");
    }

    #[test]
    fn test_and_or_short_circuit() {
        assert_eq!(run_ok("print true and 7;"), "7\n");
        assert_eq!(run_ok("print false and 7;"), "false\n");
        assert_eq!(run_ok("print false or \"fallback\";"), "fallback\n");
        assert_eq!(run_ok("print 1 or 2;"), "1\n");
    }

    #[test]
    fn test_while_loop() {
        assert_eq!(
            run_ok("var i = 0; while (i < 3) { print i; i = i + 1; }"),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn test_for_loop() {
        assert_eq!(run_ok("for (var i = 0; i < 3; i = i + 1) print i;"), "0\n1\n2\n");
    }

    #[test]
    fn test_for_loop_with_partial_clauses() {
        // Initializer and increment are both optional.
        assert_eq!(
            run_ok("var i = 0; for (; i < 2;) { print i; i = i + 1; }"),
            "0\n1\n"
        );
    }

    #[test]
    fn test_functions_and_returns() {
        assert_eq!(run_ok("fun add(a, b) { return a + b; } print add(2, 3);"), "5\n");
        assert_eq!(run_ok("fun f() {} print f();"), "nil\n");
        assert_eq!(run_ok("fun f() { return; } print f();"), "nil\n");
        assert_eq!(run_ok("fun f() {} print f;"), "<fn f>\n");
    }

    #[test]
    fn test_recursion() {
        assert_eq!(
            run_ok("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"),
            "55\n"
        );
    }

    #[test]
    fn test_counter_closure() {
        assert_eq!(
            run_ok(
                "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
                 var c = make(); print c(); print c(); print c();"
            ),
            "1\n2\n3\n"
        );
    }

    #[test]
    fn test_closures_share_captured_variable() {
        assert_eq!(
            run_ok(
                "fun make() { var x = 0; fun get() { return x; } fun set(v) { x = v; } \
                 set(9); print get(); } \
                 make();"
            ),
            "9\n"
        );
    }

    #[test]
    fn test_independent_counters() {
        assert_eq!(
            run_ok(
                "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
                 var a = make(); var b = make(); print a(); print a(); print b();"
            ),
            "1\n2\n1\n"
        );
    }

    #[test]
    fn test_classes_fields_and_methods() {
        assert_eq!(
            run_ok(
                "class Point { init(x, y) { this.x = x; this.y = y; } \
                 sum() { return this.x + this.y; } } \
                 var p = Point(3, 4); print p.sum(); print p.x;"
            ),
            "7\n3\n"
        );
    }

    #[test]
    fn test_class_and_instance_rendering() {
        assert_eq!(run_ok("class A {} print A; print A();"), "A\nA instance\n");
    }

    #[test]
    fn test_bound_method_keeps_receiver() {
        assert_eq!(
            run_ok(
                "class A { m() { return this.x; } } var a = A(); a.x = 5; \
                 var m = a.m; print m();"
            ),
            "5\n"
        );
    }

    #[test]
    fn test_field_shadows_method_in_invoke() {
        assert_eq!(
            run_ok(
                "fun g() { print \"field\"; } class A { g() { print \"method\"; } } \
                 var a = A(); a.g = g; a.g();"
            ),
            "field\n"
        );
    }

    #[test]
    fn test_inherited_method() {
        assert_eq!(
            run_ok("class A { greet() { print \"a\"; } } class B < A {} B().greet();"),
            "a\n"
        );
    }

    #[test]
    fn test_super_call() {
        assert_eq!(
            run_ok(
                "class A { m() { print \"A\"; } } \
                 class B < A { m() { super.m(); print \"B\"; } } \
                 B().m();"
            ),
            "A\nB\n"
        );
    }

    #[test]
    fn test_super_method_resolution_is_static() {
        assert_eq!(
            run_ok(
                "class A { f() { print \"A.f\"; } } \
                 class B < A { f() { print \"B.f\"; } g() { super.f(); } } \
                 class C < B {} \
                 C().g();"
            ),
            "A.f\n"
        );
    }

    #[test]
    fn test_initializer_returns_receiver() {
        assert_eq!(
            run_ok("class A { init() { this.x = 1; } } print A().x;"),
            "1\n"
        );
    }

    #[test]
    fn test_clock_native() {
        assert_eq!(run_ok("print clock() >= 0;"), "true\n");
        assert_eq!(run_ok("var t = clock(); print t <= clock();"), "true\n");
    }

    #[test]
    fn test_stack_empty_after_success() {
        let mut vm = Vm::new(Vec::new());
        vm.interpret("fun f(n) { return n * 2; } print f(21);").expect("run failed");
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_none());
    }

    #[test]
    fn test_undefined_variable_error() {
        let err = run_err("print a;");
        assert!(err.to_string().contains("undefined variable"));
        assert_eq!(err.exit_code(), EX_SOFTWARE);
    }

    #[test]
    fn test_assign_undefined_global_error() {
        let err = run_err("b = 1;");
        assert!(err.to_string().contains("undefined variable \"b\""));
    }

    #[test]
    fn test_add_mixed_types_error() {
        let err = run_err("1 + \"x\";");
        assert!(err.to_string().contains("operands must be two numbers or two strings"));
        assert_eq!(err.exit_code(), EX_SOFTWARE);
    }

    #[test]
    fn test_local_self_initializer_is_compile_error() {
        let err = run_err("{ var a = a; }");
        assert!(err.to_string().contains("can't read local variable in its own initializer"));
        assert_eq!(err.exit_code(), EX_DATAERR);
    }

    #[test]
    fn test_arity_mismatch_error() {
        let err = run_err("fun f(a) {} f(1, 2);");
        assert!(err.to_string().contains("expected 1 arguments but got 2"));
    }

    #[test]
    fn test_class_without_init_rejects_arguments() {
        let err = run_err("class A {} A(1);");
        assert!(err.to_string().contains("expected 0 arguments but got 1"));
    }

    #[test]
    fn test_stack_overflow() {
        let err = run_err("fun f() { f(); } f();");
        assert!(err.to_string().contains("stack overflow"));
    }

    #[test]
    fn test_call_non_callable_error() {
        let err = run_err("var x = 1; x();");
        assert!(err.to_string().contains("can only call functions and classes"));
    }

    #[test]
    fn test_negate_non_number_error() {
        let err = run_err("print -\"s\";");
        assert!(err.to_string().contains("operand must be a number"));
    }

    #[test]
    fn test_compare_non_numbers_error() {
        let err = run_err("print 1 < \"2\";");
        assert!(err.to_string().contains("operands must be numbers"));
    }

    #[test]
    fn test_undefined_property_error() {
        let err = run_err("class A {} var a = A(); print a.missing;");
        assert!(err.to_string().contains("undefined property \"missing\""));
    }

    #[test]
    fn test_property_on_non_instance_error() {
        let err = run_err("var x = 1; print x.y;");
        assert!(err.to_string().contains("only instances have properties"));
    }

    #[test]
    fn test_method_on_non_instance_error() {
        let err = run_err("var x = 1; x.m();");
        assert!(err.to_string().contains("only instances have methods"));
    }

    #[test]
    fn test_inherit_from_non_class_error() {
        let err = run_err("var NotAClass = 1; class B < NotAClass {}");
        assert!(err.to_string().contains("superclass must be a class"));
    }

    #[test]
    fn test_runtime_error_includes_trace() {
        let err = run_err("fun inner() { return 1 + nil; } fun outer() { inner(); } outer();");
        let rendered = err.to_string();
        assert!(rendered.contains("RuntimeError"));
        assert!(rendered.contains("in inner()"));
        assert!(rendered.contains("in outer()"));
        assert!(rendered.contains("in script"));
    }

    #[test]
    fn test_vm_reusable_after_runtime_error() {
        let mut vm = Vm::new(Vec::new());
        assert!(vm.interpret("print missing;").is_err());
        // The stack was reset; the session keeps working and keeps its
        // globals.
        vm.interpret("var a = 1;").expect("second run failed");
        vm.interpret("print a;").expect("third run failed");
        assert_eq!(String::from_utf8(vm.output.clone()).unwrap(), "1\n");
    }

    #[test]
    fn test_globals_persist_across_interprets() {
        let mut vm = Vm::new(Vec::new());
        vm.interpret("var counter = 10;").expect("first run failed");
        vm.interpret("counter = counter + 1; print counter;").expect("second run failed");
        assert_eq!(String::from_utf8(vm.output.clone()).unwrap(), "11\n");
    }

    #[test]
    fn test_collection_reclaims_temporaries() {
        let mut vm = Vm::new(Vec::new());
        vm.interpret(
            "var s = \"\"; for (var i = 0; i < 50; i = i + 1) { s = s + \"x\"; }",
        )
        .expect("run failed");

        let before = vm.heap.object_count();
        vm.heap.collect(&GcRoots::NONE);
        let after = vm.heap.object_count();
        // The 49 intermediate strings are unreachable and get swept; the
        // final one is still bound to the global.
        assert!(after < before, "expected {} < {}", after, before);

        vm.interpret("print s == s;").expect("post-gc run failed");
        assert_eq!(String::from_utf8(vm.output.clone()).unwrap(), "true\n");
    }
}
