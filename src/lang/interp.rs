//! Tree-walking interpreter for the taught language.
//!
//! Untrusted code runs under a recursion-depth cap and a fuel budget, and
//! performs all I/O through the [`Io`] trait, so the caller decides what
//! `print` and `input` mean (streamed events in the worker, captured
//! buffers during grading).

use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use super::ast::{
    BinOp, BoolOpKind, CmpOp, Expr, FuncDef, Program, Span, Stmt, Target, UnaryOp,
};
use super::trace::Tracer;
use super::value::Value;

pub type Namespace = HashMap<String, Value>;

/// Output channel tags seen by [`Io`] implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutStream {
    Stdout,
    /// Echo of a consumed input line.
    Input,
}

/// Why a blocking input read did not produce a line.
#[derive(Debug, Clone)]
pub enum ReadError {
    /// The run was aborted from outside.
    Interrupted,
    /// A scripted input source ran dry.
    Exhausted(String),
}

/// The interpreter's only window to the outside world.
pub trait Io {
    fn write(&mut self, stream: OutStream, text: &str);
    /// Block until a line of input is available. Implementations echo the
    /// consumed line themselves (as an `Input` stream write) so the echo
    /// format stays under their control.
    fn read_line(&mut self) -> Result<String, ReadError>;
}

/// Interpreter resource limits.
#[derive(Debug, Clone)]
pub struct ExecLimits {
    pub max_depth: usize,
    pub fuel: u64,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            max_depth: 100,
            fuel: 500_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Name,
    Type,
    Attribute,
    Index,
    Key,
    Value,
    ZeroDivision,
    Recursion,
    Fuel,
    Interrupted,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Name => "NameError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Value => "ValueError",
            ErrorKind::ZeroDivision => "ZeroDivisionError",
            ErrorKind::Recursion => "RecursionError",
            ErrorKind::Fuel => "TimeoutError",
            ErrorKind::Interrupted => "KeyboardInterrupt",
        }
    }
}

/// One frame of a structured traceback: where execution was in a function
/// and what its variables held at that moment.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub function: String,
    pub line: u32,
    pub source_line: String,
    pub locals: Vec<(String, String)>,
}

/// A runtime failure with its traceback. Frames are collected innermost
/// first while unwinding.
#[derive(Debug, Clone, Error)]
#[error("{}: {}", .kind.name(), .message)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    pub frames: Vec<FrameInfo>,
    /// The offending name, for did-you-mean enrichment.
    pub subject: Option<String>,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
            frames: Vec::new(),
            subject: None,
        }
    }

    /// Render the classic multi-line traceback text, outermost frame
    /// first, with variable snapshots under each source line.
    pub fn traceback_text(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in self.frames.iter().rev() {
            out.push_str(&format!(
                "  File \"my_program\", line {}, in {}\n",
                frame.line, frame.function
            ));
            if !frame.source_line.is_empty() {
                out.push_str(&format!("    {}\n", frame.source_line.trim()));
            }
            for (name, value) in &frame.locals {
                out.push_str(&format!("      {} = {}\n", name, value));
            }
        }
        out.push_str(&format!("{}: {}\n", self.kind.name(), self.message));
        out
    }
}

pub struct Interp<'a> {
    io: &'a mut dyn Io,
    tracer: Option<&'a mut dyn Tracer>,
    limits: ExecLimits,
    fuel: u64,
    depth: usize,
    line: u32,
    lines: Vec<String>,
    pub globals: Namespace,
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

impl<'a> Interp<'a> {
    pub fn new(source: &str, io: &'a mut dyn Io, limits: ExecLimits) -> Self {
        Self {
            io,
            tracer: None,
            fuel: limits.fuel,
            limits,
            depth: 0,
            line: 0,
            lines: source.split('\n').map(str::to_string).collect(),
            globals: Namespace::new(),
        }
    }

    pub fn set_tracer(&mut self, tracer: &'a mut dyn Tracer) {
        self.tracer = Some(tracer);
    }

    /// Execute a program against the current globals. With `echo_exprs`
    /// (shell mode), values of top-level expression statements are
    /// printed in `repr` form, like an interactive console.
    pub fn run(&mut self, program: &Program, echo_exprs: bool) -> Result<(), RunError> {
        self.run_stmts(&program.body, echo_exprs)
    }

    /// Execute a statement sequence at module level (used for compiled
    /// submission bodies, which are re-run per invocation).
    pub fn run_stmts(&mut self, body: &[Stmt], echo_exprs: bool) -> Result<(), RunError> {
        match self.exec_block(body, None, echo_exprs) {
            Ok(_) => Ok(()),
            Err(mut err) => {
                let frame = self.frame_info("<module>", None);
                err.frames.push(frame);
                Err(err)
            }
        }
    }

    fn frame_info(&self, function: &str, locals: Option<&Namespace>) -> FrameInfo {
        FrameInfo {
            function: function.to_string(),
            line: self.line,
            source_line: self
                .lines
                .get(self.line.saturating_sub(1) as usize)
                .cloned()
                .unwrap_or_default(),
            locals: self.snapshot(locals),
        }
    }

    fn charge(&mut self, span: Span) -> Result<(), RunError> {
        if self.fuel == 0 {
            return Err(RunError::new(
                ErrorKind::Fuel,
                "the program ran for too long",
                span,
            ));
        }
        self.fuel -= 1;
        Ok(())
    }

    fn exec_block(
        &mut self,
        body: &[Stmt],
        mut locals: Option<&mut Namespace>,
        echo: bool,
    ) -> Result<Flow, RunError> {
        for stmt in body {
            match self.exec_stmt(stmt, locals.as_deref_mut(), echo)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(
        &mut self,
        stmt: &Stmt,
        mut locals: Option<&mut Namespace>,
        echo: bool,
    ) -> Result<Flow, RunError> {
        let span = stmt.span();
        self.line = span.line;
        self.charge(span)?;

        if self.tracer.is_some() {
            let snapshot = self.snapshot(locals.as_deref());
            if let Some(tracer) = self.tracer.as_deref_mut() {
                tracer.on_statement(span.line, &snapshot);
            }
        }

        match stmt {
            Stmt::Assign { target, value, .. } => {
                let value = self.eval(value, locals.as_deref_mut())?;
                self.assign(target, value, locals)?;
                Ok(Flow::Normal)
            }
            Stmt::AugAssign {
                target, op, value, ..
            } => {
                let rhs = self.eval(value, locals.as_deref_mut())?;
                let current = self.load_target(target, locals.as_deref_mut(), span)?;
                let combined = self.binop(*op, current, rhs, span)?;
                self.assign(target, combined, locals)?;
                Ok(Flow::Normal)
            }
            Stmt::Expr { value, .. } => {
                let result = self.eval(value, locals.as_deref_mut())?;
                if echo && locals.is_none() && !matches!(result, Value::None) {
                    let text = format!("{}\n", result.repr());
                    self.io.write(OutStream::Stdout, &text);
                }
                Ok(Flow::Normal)
            }
            Stmt::If {
                branches, orelse, ..
            } => {
                for (test, body) in branches {
                    if self.eval(test, locals.as_deref_mut())?.truthy() {
                        return self.exec_block(body, locals, echo);
                    }
                }
                self.exec_block(orelse, locals, echo)
            }
            Stmt::While { test, body, .. } => {
                loop {
                    self.charge(span)?;
                    if !self.eval(test, locals.as_deref_mut())?.truthy() {
                        break;
                    }
                    match self.exec_block(body, locals.as_deref_mut(), echo)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                var, iter, body, ..
            } => {
                let iterable = self.eval(iter, locals.as_deref_mut())?;
                let items = self.iterate(iterable, span)?;
                for item in items {
                    self.charge(span)?;
                    self.store(var, item, locals.as_deref_mut());
                    match self.exec_block(body, locals.as_deref_mut(), echo)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::FuncDef(def) => {
                self.store(&def.name, Value::Func(Rc::new(def.clone())), locals);
                Ok(Flow::Normal)
            }
            Stmt::Return { value, .. } => {
                let result = match value {
                    Some(expr) => self.eval(expr, locals)?,
                    None => Value::None,
                };
                Ok(Flow::Return(result))
            }
            Stmt::Break { .. } => Ok(Flow::Break),
            Stmt::Continue { .. } => Ok(Flow::Continue),
            Stmt::Pass { .. } => Ok(Flow::Normal),
        }
    }

    fn snapshot(&self, locals: Option<&Namespace>) -> Vec<(String, String)> {
        let ns = locals.unwrap_or(&self.globals);
        let mut bindings: Vec<(String, String)> = ns
            .iter()
            .filter(|(_, value)| !matches!(value, Value::Func(_)))
            .map(|(name, value)| (name.clone(), repr_short(value)))
            .collect();
        bindings.sort();
        bindings
    }

    fn assign(
        &mut self,
        target: &Target,
        value: Value,
        mut locals: Option<&mut Namespace>,
    ) -> Result<(), RunError> {
        match target {
            Target::Name(name) => {
                self.store(name, value, locals);
                Ok(())
            }
            Target::Subscript {
                value: container,
                index,
            } => {
                let span = container.span();
                let container = self.eval(container, locals.as_deref_mut())?;
                let index = self.eval(index, locals)?;
                self.set_index(container, index, value, span)
            }
        }
    }

    fn load_target(
        &mut self,
        target: &Target,
        mut locals: Option<&mut Namespace>,
        span: Span,
    ) -> Result<Value, RunError> {
        match target {
            Target::Name(name) => self.load(name, locals.as_deref(), span),
            Target::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(container, locals.as_deref_mut())?;
                let index = self.eval(index, locals)?;
                self.get_index(container, index, span)
            }
        }
    }

    fn store(&mut self, name: &str, value: Value, locals: Option<&mut Namespace>) {
        match locals {
            Some(ns) => {
                ns.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    fn load(
        &self,
        name: &str,
        locals: Option<&Namespace>,
        span: Span,
    ) -> Result<Value, RunError> {
        if let Some(ns) = locals {
            if let Some(value) = ns.get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        let mut err = RunError::new(
            ErrorKind::Name,
            format!("name '{}' is not defined", name),
            span,
        );
        err.subject = Some(name.to_string());
        Err(err)
    }

    fn eval(
        &mut self,
        expr: &Expr,
        mut locals: Option<&mut Namespace>,
    ) -> Result<Value, RunError> {
        let value = self.eval_inner(expr, locals.as_deref_mut())?;
        if self.tracer.is_some() && !expr.is_literal() {
            let repr = value.repr();
            if let Some(tracer) = self.tracer.as_deref_mut() {
                tracer.on_expression(expr.span(), &repr);
            }
        }
        Ok(value)
    }

    fn eval_inner(
        &mut self,
        expr: &Expr,
        mut locals: Option<&mut Namespace>,
    ) -> Result<Value, RunError> {
        match expr {
            Expr::None { .. } => Ok(Value::None),
            Expr::Bool { value, .. } => Ok(Value::Bool(*value)),
            Expr::Int { value, .. } => Ok(Value::Int(*value)),
            Expr::Str { value, .. } => Ok(Value::Str(value.clone())),
            Expr::Name { id, span } => self.load(id, locals.as_deref(), *span),
            Expr::List { items, .. } => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, locals.as_deref_mut())?);
                }
                Ok(Value::list(values))
            }
            Expr::Map { items, .. } => {
                let mut pairs = Vec::with_capacity(items.len());
                for (key, value) in items {
                    let key = self.eval(key, locals.as_deref_mut())?;
                    let value = self.eval(value, locals.as_deref_mut())?;
                    match pairs.iter_mut().find(|slot: &&mut (Value, Value)| slot.0 == key) {
                        Some(slot) => slot.1 = value,
                        None => pairs.push((key, value)),
                    }
                }
                Ok(Value::map(pairs))
            }
            Expr::BinOp {
                op,
                left,
                right,
                span,
            } => {
                let left = self.eval(left, locals.as_deref_mut())?;
                let right = self.eval(right, locals)?;
                self.binop(*op, left, right, *span)
            }
            Expr::UnaryOp { op, operand, span } => {
                let value = self.eval(operand, locals)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(n) => Ok(Value::Int(-n)),
                        other => Err(RunError::new(
                            ErrorKind::Type,
                            format!("bad operand type for unary -: '{}'", other.type_name()),
                            *span,
                        )),
                    },
                }
            }
            Expr::BoolOp {
                op, left, right, ..
            } => {
                let left = self.eval(left, locals.as_deref_mut())?;
                match op {
                    BoolOpKind::And => {
                        if left.truthy() {
                            self.eval(right, locals)
                        } else {
                            Ok(left)
                        }
                    }
                    BoolOpKind::Or => {
                        if left.truthy() {
                            Ok(left)
                        } else {
                            self.eval(right, locals)
                        }
                    }
                }
            }
            Expr::Compare {
                op,
                left,
                right,
                span,
            } => {
                let left = self.eval(left, locals.as_deref_mut())?;
                let right = self.eval(right, locals)?;
                self.compare(*op, left, right, *span)
            }
            Expr::Call {
                func, args, span, ..
            } => self.eval_call(func, args, *span, locals),
            Expr::Attribute { span, .. } => Err(RunError::new(
                ErrorKind::Attribute,
                "attributes can only be used in method calls",
                *span,
            )),
            Expr::Subscript {
                value,
                index,
                span,
            } => {
                let container = self.eval(value, locals.as_deref_mut())?;
                let index = self.eval(index, locals)?;
                self.get_index(container, index, *span)
            }
        }
    }

    fn eval_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        span: Span,
        mut locals: Option<&mut Namespace>,
    ) -> Result<Value, RunError> {
        // Method call: obj.attr(args)
        if let Expr::Attribute { value, attr, .. } = func {
            let object = self.eval(value, locals.as_deref_mut())?;
            let args = self.eval_args(args, locals)?;
            return self.call_method(object, attr, args, span);
        }

        // Named call: user function first, then builtins.
        if let Expr::Name { id, .. } = func {
            let bound = match locals.as_deref() {
                Some(ns) => ns.get(id).cloned(),
                None => None,
            }
            .or_else(|| self.globals.get(id).cloned());

            return match bound {
                Some(Value::Func(def)) => {
                    let args = self.eval_args(args, locals)?;
                    self.call_function(&def, args, span)
                }
                Some(other) => Err(RunError::new(
                    ErrorKind::Type,
                    format!("'{}' object is not callable", other.type_name()),
                    span,
                )),
                None => {
                    let args = self.eval_args(args, locals)?;
                    self.call_builtin(id, args, span)
                }
            };
        }

        let callee = self.eval(func, locals.as_deref_mut())?;
        match callee {
            Value::Func(def) => {
                let args = self.eval_args(args, locals)?;
                self.call_function(&def, args, span)
            }
            other => Err(RunError::new(
                ErrorKind::Type,
                format!("'{}' object is not callable", other.type_name()),
                span,
            )),
        }
    }

    fn eval_args(
        &mut self,
        args: &[Expr],
        mut locals: Option<&mut Namespace>,
    ) -> Result<Vec<Value>, RunError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, locals.as_deref_mut())?);
        }
        Ok(values)
    }

    /// Call a user-defined function with positional arguments.
    pub fn call_function(
        &mut self,
        def: &Rc<FuncDef>,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, RunError> {
        if args.len() != def.params.len() {
            return Err(RunError::new(
                ErrorKind::Type,
                format!(
                    "{}() takes {} arguments but {} were given",
                    def.name,
                    def.params.len(),
                    args.len()
                ),
                span,
            ));
        }
        if self.depth >= self.limits.max_depth {
            return Err(RunError::new(
                ErrorKind::Recursion,
                "maximum recursion depth exceeded",
                span,
            ));
        }

        self.depth += 1;
        let saved_line = self.line;
        let mut frame_locals: Namespace = def
            .params
            .iter()
            .cloned()
            .zip(args)
            .collect();
        let result = self.exec_block(&def.body, Some(&mut frame_locals), false);
        self.depth -= 1;

        let outcome = match result {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(Value::None),
            Err(mut err) => {
                err.frames.push(self.frame_info(&def.name, Some(&frame_locals)));
                Err(err)
            }
        };
        self.line = saved_line;
        outcome
    }

    fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, RunError> {
        match name {
            "print" => {
                let text = args
                    .iter()
                    .map(Value::str_value)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.io.write(OutStream::Stdout, &format!("{}\n", text));
                Ok(Value::None)
            }
            "input" => {
                if args.len() > 1 {
                    return Err(self.arg_count_error("input", "at most 1", args.len(), span));
                }
                if let Some(prompt) = args.first() {
                    self.io.write(OutStream::Stdout, &prompt.str_value());
                }
                match self.io.read_line() {
                    Ok(line) => Ok(Value::Str(line)),
                    Err(ReadError::Interrupted) => Err(RunError::new(
                        ErrorKind::Interrupted,
                        "execution interrupted",
                        span,
                    )),
                    Err(ReadError::Exhausted(message)) => {
                        Err(RunError::new(ErrorKind::Value, message, span))
                    }
                }
            }
            "len" => {
                let [arg] = one_arg("len", args, span)?;
                match &arg {
                    Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                    Value::List(items) => Ok(Value::Int(items.borrow().len() as i64)),
                    Value::Map(items) => Ok(Value::Int(items.borrow().len() as i64)),
                    other => Err(RunError::new(
                        ErrorKind::Type,
                        format!("object of type '{}' has no len()", other.type_name()),
                        span,
                    )),
                }
            }
            "range" => {
                let (start, stop) = match args.len() {
                    1 => (0, int_arg("range", &args[0], span)?),
                    2 => (
                        int_arg("range", &args[0], span)?,
                        int_arg("range", &args[1], span)?,
                    ),
                    n => return Err(self.arg_count_error("range", "1 or 2", n, span)),
                };
                let size = stop.checked_sub(start).unwrap_or(i64::MAX);
                if size > 1_000_000 {
                    return Err(RunError::new(
                        ErrorKind::Value,
                        "range() result is too large",
                        span,
                    ));
                }
                Ok(Value::list((start..stop).map(Value::Int).collect()))
            }
            "str" => {
                let [arg] = one_arg("str", args, span)?;
                Ok(Value::Str(arg.str_value()))
            }
            "int" => {
                let [arg] = one_arg("int", args, span)?;
                match &arg {
                    Value::Int(n) => Ok(Value::Int(*n)),
                    Value::Bool(b) => Ok(Value::Int(*b as i64)),
                    Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        RunError::new(
                            ErrorKind::Value,
                            format!("invalid literal for int(): {}", quote(s)),
                            span,
                        )
                    }),
                    other => Err(RunError::new(
                        ErrorKind::Type,
                        format!("int() argument must be a string or a number, not '{}'", other.type_name()),
                        span,
                    )),
                }
            }
            "sum" => {
                let [arg] = one_arg("sum", args, span)?;
                match &arg {
                    Value::List(items) => {
                        let mut total = 0i64;
                        for item in items.borrow().iter() {
                            match item {
                                Value::Int(n) => {
                                    total = total.checked_add(*n).ok_or_else(|| {
                                        RunError::new(ErrorKind::Value, "integer overflow", span)
                                    })?;
                                }
                                other => {
                                    return Err(RunError::new(
                                        ErrorKind::Type,
                                        format!(
                                            "unsupported operand type(s) for +: 'int' and '{}'",
                                            other.type_name()
                                        ),
                                        span,
                                    ));
                                }
                            }
                        }
                        Ok(Value::Int(total))
                    }
                    other => Err(RunError::new(
                        ErrorKind::Type,
                        format!("'{}' object is not iterable", other.type_name()),
                        span,
                    )),
                }
            }
            "assert_equal" => {
                if args.len() != 2 {
                    return Err(self.arg_count_error("assert_equal", "2", args.len(), span));
                }
                let (actual, expected) = (&args[0], &args[1]);
                let text = if actual == expected {
                    "OK\n".to_string()
                } else {
                    format!("Error! {} != {}\n", actual.repr(), expected.repr())
                };
                self.io.write(OutStream::Stdout, &text);
                Ok(Value::None)
            }
            _ => {
                let mut err = RunError::new(
                    ErrorKind::Name,
                    format!("name '{}' is not defined", name),
                    span,
                );
                err.subject = Some(name.to_string());
                Err(err)
            }
        }
    }

    fn arg_count_error(&self, name: &str, wanted: &str, got: usize, span: Span) -> RunError {
        RunError::new(
            ErrorKind::Type,
            format!("{}() takes {} arguments but {} were given", name, wanted, got),
            span,
        )
    }

    fn call_method(
        &mut self,
        object: Value,
        attr: &str,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, RunError> {
        match (&object, attr) {
            (Value::List(items), "append") => {
                let [arg] = one_arg("append", args, span)?;
                items.borrow_mut().push(arg);
                Ok(Value::None)
            }
            (Value::Str(s), "upper") => Ok(Value::Str(s.to_uppercase())),
            (Value::Str(s), "lower") => Ok(Value::Str(s.to_lowercase())),
            (Value::Str(sep), "join") => {
                let [arg] = one_arg("join", args, span)?;
                match &arg {
                    Value::List(items) => {
                        let mut parts = Vec::with_capacity(items.borrow().len());
                        for item in items.borrow().iter() {
                            match item {
                                Value::Str(s) => parts.push(s.clone()),
                                other => {
                                    return Err(RunError::new(
                                        ErrorKind::Type,
                                        format!(
                                            "sequence item: expected str instance, {} found",
                                            other.type_name()
                                        ),
                                        span,
                                    ));
                                }
                            }
                        }
                        Ok(Value::Str(parts.join(sep.as_str())))
                    }
                    other => Err(RunError::new(
                        ErrorKind::Type,
                        format!("can only join a list, not '{}'", other.type_name()),
                        span,
                    )),
                }
            }
            (Value::Str(s), "split") => match args.len() {
                0 => Ok(Value::list(
                    s.split_whitespace().map(Value::str).collect(),
                )),
                1 => match &args[0] {
                    Value::Str(sep) if !sep.is_empty() => {
                        Ok(Value::list(s.split(sep.as_str()).map(Value::str).collect()))
                    }
                    Value::Str(_) => {
                        Err(RunError::new(ErrorKind::Value, "empty separator", span))
                    }
                    other => Err(RunError::new(
                        ErrorKind::Type,
                        format!("separator must be a string, not '{}'", other.type_name()),
                        span,
                    )),
                },
                n => Err(self.arg_count_error("split", "at most 1", n, span)),
            },
            (object, attr) => Err(RunError::new(
                ErrorKind::Attribute,
                format!(
                    "'{}' object has no attribute '{}'",
                    object.type_name(),
                    attr
                ),
                span,
            )),
        }
    }

    fn binop(&self, op: BinOp, left: Value, right: Value, span: Span) -> Result<Value, RunError> {
        let type_error = |left: &Value, right: &Value| {
            RunError::new(
                ErrorKind::Type,
                format!(
                    "unsupported operand type(s) for {}: '{}' and '{}'",
                    op.symbol(),
                    left.type_name(),
                    right.type_name()
                ),
                span,
            )
        };
        match op {
            BinOp::Add => match (&left, &right) {
                (Value::Int(a), Value::Int(b)) => checked(a.checked_add(*b), span),
                (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
                (Value::List(a), Value::List(b)) => {
                    let mut items = a.borrow().clone();
                    items.extend(b.borrow().iter().cloned());
                    Ok(Value::list(items))
                }
                _ => Err(type_error(&left, &right)),
            },
            BinOp::Sub => match (&left, &right) {
                (Value::Int(a), Value::Int(b)) => checked(a.checked_sub(*b), span),
                _ => Err(type_error(&left, &right)),
            },
            BinOp::Mul => match (&left, &right) {
                (Value::Int(a), Value::Int(b)) => checked(a.checked_mul(*b), span),
                (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
                    Ok(Value::Str(s.repeat((*n).max(0) as usize)))
                }
                (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) => {
                    let items = items.borrow();
                    let mut result = Vec::new();
                    for _ in 0..(*n).max(0) {
                        result.extend(items.iter().cloned());
                    }
                    Ok(Value::list(result))
                }
                _ => Err(type_error(&left, &right)),
            },
            BinOp::Div | BinOp::FloorDiv => match (&left, &right) {
                (Value::Int(_), Value::Int(0)) => Err(RunError::new(
                    ErrorKind::ZeroDivision,
                    "integer division or modulo by zero",
                    span,
                )),
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.div_euclid(*b))),
                _ => Err(type_error(&left, &right)),
            },
            BinOp::Mod => match (&left, &right) {
                (Value::Int(_), Value::Int(0)) => Err(RunError::new(
                    ErrorKind::ZeroDivision,
                    "integer division or modulo by zero",
                    span,
                )),
                (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.rem_euclid(*b))),
                _ => Err(type_error(&left, &right)),
            },
        }
    }

    fn compare(&self, op: CmpOp, left: Value, right: Value, span: Span) -> Result<Value, RunError> {
        match op {
            CmpOp::Eq => Ok(Value::Bool(left == right)),
            CmpOp::NotEq => Ok(Value::Bool(left != right)),
            CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
                let ordering = match (&left, &right) {
                    (Value::Int(a), Value::Int(b)) => a.cmp(b),
                    (Value::Str(a), Value::Str(b)) => a.cmp(b),
                    _ => {
                        return Err(RunError::new(
                            ErrorKind::Type,
                            format!(
                                "'{}' not supported between instances of '{}' and '{}'",
                                op.symbol(),
                                left.type_name(),
                                right.type_name()
                            ),
                            span,
                        ));
                    }
                };
                let result = match op {
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::LtE => ordering.is_le(),
                    CmpOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                Ok(Value::Bool(result))
            }
            CmpOp::In | CmpOp::NotIn => {
                let contains = match &right {
                    Value::List(items) => items.borrow().iter().any(|item| *item == left),
                    Value::Map(items) => items.borrow().iter().any(|(key, _)| *key == left),
                    Value::Str(haystack) => match &left {
                        Value::Str(needle) => haystack.contains(needle.as_str()),
                        other => {
                            return Err(RunError::new(
                                ErrorKind::Type,
                                format!(
                                    "'in <string>' requires string as left operand, not '{}'",
                                    other.type_name()
                                ),
                                span,
                            ));
                        }
                    },
                    other => {
                        return Err(RunError::new(
                            ErrorKind::Type,
                            format!("argument of type '{}' is not iterable", other.type_name()),
                            span,
                        ));
                    }
                };
                Ok(Value::Bool(contains ^ (op == CmpOp::NotIn)))
            }
        }
    }

    fn iterate(&self, value: Value, span: Span) -> Result<Vec<Value>, RunError> {
        match &value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            Value::Map(items) => Ok(items.borrow().iter().map(|(k, _)| k.clone()).collect()),
            other => Err(RunError::new(
                ErrorKind::Type,
                format!("'{}' object is not iterable", other.type_name()),
                span,
            )),
        }
    }

    fn get_index(&self, container: Value, index: Value, span: Span) -> Result<Value, RunError> {
        match (&container, &index) {
            (Value::List(items), Value::Int(i)) => {
                let items = items.borrow();
                let idx = resolve_index(*i, items.len()).ok_or_else(|| {
                    RunError::new(ErrorKind::Index, "list index out of range", span)
                })?;
                Ok(items[idx].clone())
            }
            (Value::Str(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = resolve_index(*i, chars.len()).ok_or_else(|| {
                    RunError::new(ErrorKind::Index, "string index out of range", span)
                })?;
                Ok(Value::Str(chars[idx].to_string()))
            }
            (Value::Map(items), key) => {
                let items = items.borrow();
                items
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| RunError::new(ErrorKind::Key, key.repr(), span))
            }
            (container, index) => Err(RunError::new(
                ErrorKind::Type,
                format!(
                    "'{}' indices must be integers, not '{}'",
                    container.type_name(),
                    index.type_name()
                ),
                span,
            )),
        }
    }

    fn set_index(
        &self,
        container: Value,
        index: Value,
        value: Value,
        span: Span,
    ) -> Result<(), RunError> {
        match (&container, &index) {
            (Value::List(items), Value::Int(i)) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let idx = resolve_index(*i, len).ok_or_else(|| {
                    RunError::new(ErrorKind::Index, "list assignment index out of range", span)
                })?;
                items[idx] = value;
                Ok(())
            }
            (Value::Map(items), key) => {
                let mut items = items.borrow_mut();
                if let Some(slot) = items.iter_mut().find(|(k, _)| k == key) {
                    slot.1 = value;
                } else {
                    items.push((index, value));
                }
                Ok(())
            }
            (container, _) => Err(RunError::new(
                ErrorKind::Type,
                format!(
                    "'{}' object does not support item assignment",
                    container.type_name()
                ),
                span,
            )),
        }
    }
}

fn checked(value: Option<i64>, span: Span) -> Result<Value, RunError> {
    value
        .map(Value::Int)
        .ok_or_else(|| RunError::new(ErrorKind::Value, "integer overflow", span))
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { len + index } else { index };
    if (0..len).contains(&idx) {
        Some(idx as usize)
    } else {
        None
    }
}

fn one_arg(name: &str, args: Vec<Value>, span: Span) -> Result<[Value; 1], RunError> {
    let count = args.len();
    args.try_into().map_err(|_| {
        RunError::new(
            ErrorKind::Type,
            format!("{}() takes 1 argument but {} were given", name, count),
            span,
        )
    })
}

fn int_arg(name: &str, value: &Value, span: Span) -> Result<i64, RunError> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(RunError::new(
            ErrorKind::Type,
            format!(
                "{}() argument must be an integer, not '{}'",
                name,
                other.type_name()
            ),
            span,
        )),
    }
}

fn repr_short(value: &Value) -> String {
    let repr = value.repr();
    if repr.chars().count() > 100 {
        let truncated: String = repr.chars().take(100).collect();
        format!("{}...", truncated)
    } else {
        repr
    }
}

fn quote(s: &str) -> String {
    Value::Str(s.to_string()).repr()
}

#[cfg(test)]
mod tests {
    use super::super::parse_program;
    use super::*;

    /// Io that captures output and serves scripted input lines.
    pub struct TestIo {
        pub output: String,
        pub inputs: Vec<String>,
        cursor: usize,
    }

    impl TestIo {
        pub fn new(inputs: &[&str]) -> Self {
            Self {
                output: String::new(),
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                cursor: 0,
            }
        }
    }

    impl Io for TestIo {
        fn write(&mut self, _stream: OutStream, text: &str) {
            self.output.push_str(text);
        }

        fn read_line(&mut self) -> Result<String, ReadError> {
            if self.cursor < self.inputs.len() {
                let line = self.inputs[self.cursor].clone();
                self.cursor += 1;
                Ok(line)
            } else {
                Err(ReadError::Interrupted)
            }
        }
    }

    fn run(source: &str) -> String {
        let mut io = TestIo::new(&[]);
        let program = parse_program(source).unwrap();
        let mut interp = Interp::new(source, &mut io, ExecLimits::default());
        interp.run(&program, false).unwrap();
        io.output
    }

    fn run_err(source: &str) -> RunError {
        let mut io = TestIo::new(&[]);
        let program = parse_program(source).unwrap();
        let mut interp = Interp::new(source, &mut io, ExecLimits::default());
        interp.run(&program, false).unwrap_err()
    }

    #[test]
    fn test_arithmetic_and_print() {
        assert_eq!(run("print(1 + 2 * 3)"), "7\n");
        assert_eq!(run("print(7 // 2, 7 % 2)"), "3 1\n");
        assert_eq!(run("print(-5)"), "-5\n");
    }

    #[test]
    fn test_for_loop_sum() {
        let source = "total = 0\nfor x in [1, 2, 3]:\n    total += x\nprint(total)";
        assert_eq!(run(source), "6\n");
    }

    #[test]
    fn test_while_and_if() {
        let source = "n = 0\nwhile n < 5:\n    n += 1\n    if n == 3:\n        continue\n    print(n)";
        assert_eq!(run(source), "1\n2\n4\n5\n");
    }

    #[test]
    fn test_function_call_and_return() {
        let source = "def double(x):\n    return x * 2\nprint(double(21))";
        assert_eq!(run(source), "42\n");
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(run("print('a b c'.split())"), "['a', 'b', 'c']\n");
        assert_eq!(run("print(', '.join(['x', 'y']))"), "x, y\n");
        assert_eq!(run("print('abc'.upper())"), "ABC\n");
    }

    #[test]
    fn test_list_aliasing() {
        let source = "a = [1]\nb = a\nb.append(2)\nprint(a)";
        assert_eq!(run(source), "[1, 2]\n");
    }

    #[test]
    fn test_map_operations() {
        let source = "d = {'a': 1}\nd['b'] = 2\nprint(d['a'] + d['b'])\nprint('a' in d)";
        assert_eq!(run(source), "3\nTrue\n");
    }

    #[test]
    fn test_shell_echo() {
        let source = "1 + 2";
        let mut io = TestIo::new(&[]);
        let program = parse_program(source).unwrap();
        let mut interp = Interp::new(source, &mut io, ExecLimits::default());
        interp.run(&program, true).unwrap();
        assert_eq!(io.output, "3\n");
    }

    #[test]
    fn test_input_builtin() {
        let source = "name = input('Who? ')\nprint('Hello ' + name)";
        let mut io = TestIo::new(&["Alice"]);
        let program = parse_program(source).unwrap();
        let mut interp = Interp::new(source, &mut io, ExecLimits::default());
        interp.run(&program, false).unwrap();
        assert_eq!(io.output, "Who? Hello Alice\n");
    }

    #[test]
    fn test_name_error_has_traceback() {
        let err = run_err("x = 1\nprint(y)");
        assert_eq!(err.kind, ErrorKind::Name);
        assert_eq!(err.subject.as_deref(), Some("y"));
        assert_eq!(err.frames.len(), 1);
        assert_eq!(err.frames[0].function, "<module>");
        assert_eq!(err.frames[0].line, 2);
        assert!(err.traceback_text().contains("NameError: name 'y' is not defined"));
        assert!(err.traceback_text().contains("x = 1"));
    }

    #[test]
    fn test_error_inside_function_has_two_frames() {
        let err = run_err("def broken(a):\n    return a + 'x'\nbroken(1)");
        assert_eq!(err.kind, ErrorKind::Type);
        assert_eq!(err.frames.len(), 2);
        assert_eq!(err.frames[0].function, "broken");
        assert_eq!(err.frames[1].function, "<module>");
        assert!(err.frames[0]
            .locals
            .contains(&("a".to_string(), "1".to_string())));
    }

    #[test]
    fn test_recursion_limit() {
        let err = run_err("def f():\n    return f()\nf()");
        assert_eq!(err.kind, ErrorKind::Recursion);
    }

    #[test]
    fn test_fuel_limit_stops_infinite_loop() {
        let source = "while True:\n    pass";
        let mut io = TestIo::new(&[]);
        let program = parse_program(source).unwrap();
        let limits = ExecLimits {
            max_depth: 100,
            fuel: 10_000,
        };
        let mut interp = Interp::new(source, &mut io, limits);
        let err = interp.run(&program, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fuel);
    }

    #[test]
    fn test_zero_division() {
        assert_eq!(run_err("print(1 // 0)").kind, ErrorKind::ZeroDivision);
    }

    #[test]
    fn test_index_errors() {
        assert_eq!(run_err("[1, 2][5]").kind, ErrorKind::Index);
        assert_eq!(run_err("{'a': 1}['b']").kind, ErrorKind::Key);
        assert_eq!(run("print([1, 2, 3][-1])"), "3\n");
    }

    #[test]
    fn test_assert_equal_builtin() {
        assert_eq!(run("assert_equal(1 + 1, 2)"), "OK\n");
        assert_eq!(run("assert_equal(3, 4)"), "Error! 3 != 4\n");
    }

    #[test]
    fn test_globals_visible_in_functions() {
        let source = "base = 10\ndef bump(x):\n    return base + x\nprint(bump(5))";
        assert_eq!(run(source), "15\n");
    }

    #[test]
    fn test_locals_do_not_leak() {
        let err = run_err("def f():\n    secret = 1\nf()\nprint(secret)");
        assert_eq!(err.kind, ErrorKind::Name);
    }

    #[test]
    fn test_interrupted_input() {
        let source = "input()";
        let mut io = TestIo::new(&[]);
        let program = parse_program(source).unwrap();
        let mut interp = Interp::new(source, &mut io, ExecLimits::default());
        let err = interp.run(&program, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Interrupted);
    }
}
