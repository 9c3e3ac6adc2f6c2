//! Tree-walking evaluator for the sandbox language.
//!
//! Scopes live in an arena indexed by `usize`; closures capture the index of their defining
//! scope. Scopes created by a call or block are released when it finishes unless a closure
//! was created meanwhile. Every evaluated node costs one step; the wall clock and the abort
//! token are polled every [`DEADLINE_POLL_INTERVAL`] steps.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Instant;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use super::ast::*;
use super::value::{Function, JsRegExp, JsValue};
use super::{SandboxError, SandboxLimits, builtins, methods};

/// Largest array the sandbox will materialise.
pub(crate) const MAX_ARRAY_LENGTH: usize = 1 << 22;
/// Largest string, in bytes, the sandbox will build.
pub(crate) const MAX_STRING_LENGTH: usize = 1 << 24;

const DEADLINE_POLL_INTERVAL: u64 = 1024;

/// Non-local exits. `Throw` can be caught by `try`; `Fatal` always unwinds to the host.
pub(crate) enum Abrupt {
    Throw(JsValue),
    Fatal(SandboxError),
}

impl From<SandboxError> for Abrupt {
    fn from(error: SandboxError) -> Self {
        Abrupt::Fatal(error)
    }
}

pub(crate) type Eval<T = JsValue> = Result<T, Abrupt>;

enum Completion {
    Normal,
    Return(JsValue),
    Break,
    Continue,
}

struct Binding {
    value: JsValue,
    mutable: bool,
}

struct Scope {
    vars: HashMap<String, Binding>,
    parent: Option<usize>,
}

enum Tracked {
    Array(Weak<RefCell<Vec<JsValue>>>),
    Object(Weak<RefCell<IndexMap<String, JsValue>>>),
}

pub(crate) struct Interpreter {
    scopes: Vec<Scope>,
    scope: usize,
    closures_created: usize,
    limits: SandboxLimits,
    steps: u64,
    started: Instant,
    depth: usize,
    heap: Vec<Tracked>,
    abort: Option<CancellationToken>,
}

impl Interpreter {
    pub(crate) fn new(limits: SandboxLimits, abort: Option<CancellationToken>) -> Self {
        let mut interpreter = Self {
            scopes: vec![Scope {
                vars: HashMap::new(),
                parent: None,
            }],
            scope: 0,
            closures_created: 0,
            limits,
            steps: 0,
            started: Instant::now(),
            depth: 0,
            heap: Vec::new(),
            abort,
        };
        for (name, value) in builtins::globals(&mut interpreter) {
            interpreter.declare(name, value, false);
        }
        interpreter
    }

    /// Evaluates `expr`, which must produce a function, and calls it with `args`.
    pub(crate) fn run_function(&mut self, expr: &Expr, args: &[JsonValue]) -> Result<JsValue, Abrupt> {
        let callee = self.eval(expr)?;
        if !callee.is_function() {
            return Err(Abrupt::Fatal(SandboxError::NotAFunction));
        }
        let args = args.iter().map(|arg| self.import_json(arg)).collect();
        self.call_function(&callee, args)
    }

    // ---- budget ----

    fn tick(&mut self) -> Eval<()> {
        self.charge(1)
    }

    /// Charges `steps` against the budget; bulk builtins charge per element.
    pub(crate) fn charge(&mut self, steps: usize) -> Eval<()> {
        let before = self.steps;
        self.steps = self.steps.saturating_add(steps as u64);
        if self.steps > self.limits.max_steps {
            return Err(Abrupt::Fatal(SandboxError::StepBudgetExceeded {
                max_steps: self.limits.max_steps,
            }));
        }
        if before / DEADLINE_POLL_INTERVAL != self.steps / DEADLINE_POLL_INTERVAL {
            if self.abort.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(Abrupt::Fatal(SandboxError::Cancelled));
            }
            if self.started.elapsed() > self.limits.timeout {
                return Err(Abrupt::Fatal(SandboxError::Timeout {
                    timeout_ms: self.limits.timeout.as_millis() as u64,
                }));
            }
        }
        Ok(())
    }

    // ---- allocation ----

    pub(crate) fn array(&mut self, items: Vec<JsValue>) -> JsValue {
        let value = JsValue::new_array(items);
        if let JsValue::Array(items) = &value {
            self.heap.push(Tracked::Array(Rc::downgrade(items)));
        }
        value
    }

    pub(crate) fn object(&mut self, entries: IndexMap<String, JsValue>) -> JsValue {
        let value = JsValue::new_object(entries);
        if let JsValue::Object(entries) = &value {
            self.heap.push(Tracked::Object(Rc::downgrade(entries)));
        }
        value
    }

    pub(crate) fn import_json(&mut self, json: &JsonValue) -> JsValue {
        match json {
            JsonValue::Array(items) => {
                let items = items.iter().map(|item| self.import_json(item)).collect();
                self.array(items)
            }
            JsonValue::Object(map) => {
                let entries = map
                    .iter()
                    .map(|(key, value)| (key.clone(), self.import_json(value)))
                    .collect();
                self.object(entries)
            }
            scalar => JsValue::from_json(scalar),
        }
    }

    /// Builds a string value, enforcing the length cap.
    pub(crate) fn string(&mut self, text: String) -> Eval {
        if text.len() > MAX_STRING_LENGTH {
            return self.throw_error("RangeError", "Invalid string length");
        }
        Ok(JsValue::from(text))
    }

    pub(crate) fn error_value(&mut self, name: &str, message: impl Into<String>) -> JsValue {
        let mut entries = IndexMap::new();
        entries.insert("name".to_string(), JsValue::from(name));
        entries.insert("message".to_string(), JsValue::from(message.into()));
        self.object(entries)
    }

    pub(crate) fn throw_error<T>(&mut self, name: &str, message: impl Into<String>) -> Eval<T> {
        Err(Abrupt::Throw(self.error_value(name, message)))
    }

    // ---- scopes ----

    fn push_scope(&mut self, parent: usize) -> usize {
        self.scopes.push(Scope {
            vars: HashMap::new(),
            parent: Some(parent),
        });
        self.scopes.len() - 1
    }

    fn with_scope<T>(&mut self, parent: usize, run: impl FnOnce(&mut Self) -> T) -> T {
        let mark = self.scopes.len();
        let closures = self.closures_created;
        let saved = self.scope;
        self.scope = self.push_scope(parent);
        let result = run(self);
        self.scope = saved;
        if self.closures_created == closures {
            self.scopes.truncate(mark);
        }
        result
    }

    fn declare(&mut self, name: &str, value: JsValue, mutable: bool) {
        self.scopes[self.scope]
            .vars
            .insert(name.to_string(), Binding { value, mutable });
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        let mut current = Some(self.scope);
        while let Some(index) = current {
            let scope = &self.scopes[index];
            if let Some(binding) = scope.vars.get(name) {
                return Some(binding);
            }
            current = scope.parent;
        }
        None
    }

    fn read_variable(&mut self, name: &str) -> Eval {
        match self.lookup(name) {
            Some(binding) => Ok(binding.value.clone()),
            None => self.throw_error("ReferenceError", format!("{name} is not defined")),
        }
    }

    fn write_variable(&mut self, name: &str, value: JsValue) -> Eval<()> {
        let mut current = Some(self.scope);
        while let Some(index) = current {
            if let Some(binding) = self.scopes[index].vars.get_mut(name) {
                if !binding.mutable {
                    return self.throw_error("TypeError", "Assignment to constant variable.");
                }
                binding.value = value;
                return Ok(());
            }
            current = self.scopes[index].parent;
        }
        self.throw_error("ReferenceError", format!("{name} is not defined"))
    }

    fn closure(&mut self, def: &Rc<FunctionDef>) -> JsValue {
        self.closures_created += 1;
        JsValue::Function(Rc::new(Function::Closure {
            def: Rc::clone(def),
            scope: self.scope,
        }))
    }

    // ---- properties ----

    pub(crate) fn get_property(&mut self, target: &JsValue, key: &str) -> Eval {
        let value = match target {
            JsValue::Undefined | JsValue::Null => {
                return self.throw_error(
                    "TypeError",
                    format!("Cannot read properties of {} (reading '{key}')", target.kind_name()),
                );
            }
            JsValue::Array(items) => {
                let items = items.borrow();
                if key == "length" {
                    JsValue::Number(items.len() as f64)
                } else {
                    array_index(key)
                        .and_then(|index| items.get(index).cloned())
                        .unwrap_or(JsValue::Undefined)
                }
            }
            JsValue::String(text) => {
                if key == "length" {
                    JsValue::Number(text.chars().count() as f64)
                } else {
                    array_index(key)
                        .and_then(|index| text.chars().nth(index))
                        .map(|ch| JsValue::from(ch.to_string()))
                        .unwrap_or(JsValue::Undefined)
                }
            }
            JsValue::Object(entries) => entries.borrow().get(key).cloned().unwrap_or(JsValue::Undefined),
            JsValue::Function(function) => match function.as_ref() {
                Function::Native { name, members, .. } => match key {
                    "name" => JsValue::from(*name),
                    _ => members.get(key).cloned().unwrap_or(JsValue::Undefined),
                },
                Function::Closure { def, .. } => match key {
                    "name" => JsValue::from(def.name.as_deref().unwrap_or("")),
                    "length" => JsValue::Number(def.params.iter().filter(|p| !p.rest && p.default.is_none()).count() as f64),
                    _ => JsValue::Undefined,
                },
            },
            JsValue::RegExp(regexp) => match key {
                "source" => JsValue::from(regexp.source.as_str()),
                "flags" => JsValue::from(regexp.flags.as_str()),
                "global" => JsValue::Bool(regexp.is_global()),
                "lastIndex" => JsValue::Number(0.0),
                _ => JsValue::Undefined,
            },
            JsValue::Bool(_) | JsValue::Number(_) | JsValue::Date(_) => JsValue::Undefined,
        };
        Ok(value)
    }

    pub(crate) fn set_property(&mut self, target: &JsValue, key: &str, value: JsValue) -> Eval<()> {
        match target {
            JsValue::Undefined | JsValue::Null => self.throw_error(
                "TypeError",
                format!("Cannot set properties of {} (setting '{key}')", target.kind_name()),
            ),
            JsValue::Array(items) => {
                if key == "length" {
                    let length = value.to_number();
                    if length < 0.0 || length.fract() != 0.0 || length > MAX_ARRAY_LENGTH as f64 {
                        return self.throw_error("RangeError", "Invalid array length");
                    }
                    self.charge(length as usize)?;
                    items.borrow_mut().resize(length as usize, JsValue::Undefined);
                } else if let Some(index) = array_index(key) {
                    if index >= MAX_ARRAY_LENGTH {
                        return self.throw_error("RangeError", "Invalid array length");
                    }
                    let length = items.borrow().len();
                    if index >= length {
                        self.charge(index - length)?;
                    }
                    let mut items = items.borrow_mut();
                    if index >= items.len() {
                        items.resize(index + 1, JsValue::Undefined);
                    }
                    items[index] = value;
                }
                Ok(())
            }
            JsValue::Object(entries) => {
                entries.borrow_mut().insert(key.to_string(), value);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn member_key(&mut self, property: &MemberKey) -> Eval<String> {
        match property {
            MemberKey::Static(name) => Ok(name.clone()),
            MemberKey::Computed(expr) => Ok(self.eval(expr)?.to_property_key()),
        }
    }

    /// Elements of an iterable value (arrays and strings).
    pub(crate) fn iterate(&mut self, value: &JsValue) -> Eval<Vec<JsValue>> {
        match value {
            JsValue::Array(items) => Ok(items.borrow().clone()),
            JsValue::String(text) => Ok(text.chars().map(|ch| JsValue::from(ch.to_string())).collect()),
            other => {
                let description = describe_value(other);
                self.throw_error("TypeError", format!("{description} is not iterable"))
            }
        }
    }

    // ---- calls ----

    pub(crate) fn call_function(&mut self, callee: &JsValue, args: Vec<JsValue>) -> Eval {
        let JsValue::Function(function) = callee else {
            let description = describe_value(callee);
            return self.throw_error("TypeError", format!("{description} is not a function"));
        };
        if self.depth >= self.limits.max_call_depth {
            return Err(Abrupt::Fatal(SandboxError::CallDepthExceeded {
                max_depth: self.limits.max_call_depth,
            }));
        }
        self.depth += 1;
        let result = match function.as_ref() {
            Function::Native { call, .. } => call(self, args),
            Function::Closure { def, scope } => {
                let (def, scope) = (Rc::clone(def), *scope);
                self.with_scope(scope, |this| this.run_closure(&def, callee, args))
            }
        };
        self.depth -= 1;
        result
    }

    fn run_closure(&mut self, def: &FunctionDef, callee: &JsValue, args: Vec<JsValue>) -> Eval {
        if let Some(name) = &def.name {
            self.declare(name, callee.clone(), true);
        }
        self.bind_params(&def.params, args)?;
        match &def.body {
            FunctionBody::Expression(expr) => self.eval(expr),
            FunctionBody::Block(statements) => match self.exec_statements(statements)? {
                Completion::Return(value) => Ok(value),
                _ => Ok(JsValue::Undefined),
            },
        }
    }

    fn bind_params(&mut self, params: &[Param], args: Vec<JsValue>) -> Eval<()> {
        for (index, param) in params.iter().enumerate() {
            let value = if param.rest {
                let rest = args.get(index..).map(<[JsValue]>::to_vec).unwrap_or_default();
                self.array(rest)
            } else {
                args.get(index).cloned().unwrap_or(JsValue::Undefined)
            };
            let value = match (&value, &param.default) {
                (JsValue::Undefined, Some(default)) => self.eval(default)?,
                _ => value,
            };
            self.bind_pattern(&param.pattern, value, true)?;
        }
        Ok(())
    }

    fn bind_pattern(&mut self, pattern: &Pattern, value: JsValue, mutable: bool) -> Eval<()> {
        match pattern {
            Pattern::Identifier(name) => {
                self.declare(name, value, mutable);
                Ok(())
            }
            Pattern::Object { properties, rest } => {
                if value.is_nullish() {
                    let kind = value.kind_name();
                    return self.throw_error("TypeError", format!("Cannot destructure '{kind}' as it is {kind}."));
                }
                let mut used = Vec::with_capacity(properties.len());
                for property in properties {
                    let key = match &property.key {
                        PropertyKey::Static(name) => name.clone(),
                        PropertyKey::Computed(expr) => self.eval(expr)?.to_property_key(),
                    };
                    let mut member = self.get_property(&value, &key)?;
                    if let (JsValue::Undefined, Some(default)) = (&member, &property.default) {
                        member = self.eval(default)?;
                    }
                    self.bind_pattern(&property.value, member, mutable)?;
                    used.push(key);
                }
                if let Some(rest) = rest {
                    let remaining = match &value {
                        JsValue::Object(entries) => entries
                            .borrow()
                            .iter()
                            .filter(|(key, _)| !used.contains(key))
                            .map(|(key, value)| (key.clone(), value.clone()))
                            .collect(),
                        _ => IndexMap::new(),
                    };
                    let remaining = self.object(remaining);
                    self.declare(rest, remaining, mutable);
                }
                Ok(())
            }
            Pattern::Array { elements, rest } => {
                let items = self.iterate(&value)?;
                for (index, element) in elements.iter().enumerate() {
                    let Some(element) = element else {
                        continue;
                    };
                    let mut item = items.get(index).cloned().unwrap_or(JsValue::Undefined);
                    if let (JsValue::Undefined, Some(default)) = (&item, &element.default) {
                        item = self.eval(default)?;
                    }
                    self.bind_pattern(&element.pattern, item, mutable)?;
                }
                if let Some(rest) = rest {
                    let remaining = items.get(elements.len()..).map(<[JsValue]>::to_vec).unwrap_or_default();
                    let remaining = self.array(remaining);
                    self.bind_pattern(rest, remaining, mutable)?;
                }
                Ok(())
            }
        }
    }

    fn eval_arguments(&mut self, elements: &[Element]) -> Eval<Vec<JsValue>> {
        let mut values = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                Element::Item(expr) => values.push(self.eval(expr)?),
                Element::Spread(expr) => {
                    let spread = self.eval(expr)?;
                    values.extend(self.iterate(&spread)?);
                }
            }
        }
        if values.len() > MAX_ARRAY_LENGTH {
            return self.throw_error("RangeError", "Invalid array length");
        }
        Ok(values)
    }

    // ---- expressions ----

    pub(crate) fn eval(&mut self, expr: &Expr) -> Eval {
        self.tick()?;
        match expr {
            Expr::Number(value) => Ok(JsValue::Number(*value)),
            Expr::String(value) => Ok(JsValue::from(value.as_str())),
            Expr::Bool(value) => Ok(JsValue::Bool(*value)),
            Expr::Null => Ok(JsValue::Null),
            Expr::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Expr(expr) => out.push_str(&self.eval(expr)?.to_display_string()),
                    }
                    if out.len() > MAX_STRING_LENGTH {
                        return self.throw_error("RangeError", "Invalid string length");
                    }
                }
                Ok(JsValue::from(out))
            }
            Expr::Regex { pattern, flags } => match JsRegExp::new(pattern, flags) {
                Ok(regexp) => Ok(JsValue::RegExp(Rc::new(regexp))),
                Err(error) => {
                    self.throw_error("SyntaxError", format!("Invalid regular expression: /{pattern}/: {error}"))
                }
            },
            Expr::Identifier(name) => self.read_variable(name),
            Expr::Array(elements) => {
                let items = self.eval_arguments(elements)?;
                Ok(self.array(items))
            }
            Expr::Object(properties) => self.eval_object(properties),
            Expr::Function(def) => Ok(self.closure(def)),
            Expr::Unary(op, argument) => self.eval_unary(*op, argument),
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let old = self.eval(target)?.to_number();
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.assign_to(target, JsValue::Number(new))?;
                Ok(JsValue::Number(if *prefix { new } else { old }))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, &left, &right)
            }
            Expr::Logical(op, left, right) => {
                let left = self.eval(left)?;
                if short_circuits(*op, &left) {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Conditional(test, consequent, alternate) => {
                if self.eval(test)?.truthy() {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
            Expr::Assign { op, target, value } => self.eval_assign(*op, target, value),
            Expr::Member { .. } | Expr::Call { .. } => Ok(self.eval_chain(expr)?.unwrap_or(JsValue::Undefined)),
            Expr::New { callee, args } => {
                let callee_value = self.eval(callee)?;
                let args = self.eval_arguments(args)?;
                let construct = match &callee_value {
                    JsValue::Function(function) => match function.as_ref() {
                        Function::Native { construct, .. } => *construct,
                        Function::Closure { .. } => None,
                    },
                    _ => None,
                };
                match construct {
                    Some(construct) => construct(self, args),
                    None => {
                        let description = describe_value(&callee_value);
                        self.throw_error("TypeError", format!("{description} is not a constructor"))
                    }
                }
            }
        }
    }

    /// Evaluates member and call chains; `None` means an optional link short-circuited.
    fn eval_chain(&mut self, expr: &Expr) -> Eval<Option<JsValue>> {
        match expr {
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let Some(target) = self.eval_chain(object)? else {
                    return Ok(None);
                };
                if *optional && target.is_nullish() {
                    return Ok(None);
                }
                let key = self.member_key(property)?;
                self.get_property(&target, &key).map(Some)
            }
            Expr::Call { callee, args, optional } => {
                if let Expr::Member {
                    object,
                    property,
                    optional: member_optional,
                } = callee.as_ref()
                {
                    let Some(target) = self.eval_chain(object)? else {
                        return Ok(None);
                    };
                    if *member_optional && target.is_nullish() {
                        return Ok(None);
                    }
                    let key = self.member_key(property)?;
                    let args = self.eval_arguments(args)?;
                    return self.call_method(&target, &key, args, *optional);
                }
                let Some(function) = self.eval_chain(callee)? else {
                    return Ok(None);
                };
                if *optional && function.is_nullish() {
                    return Ok(None);
                }
                let args = self.eval_arguments(args)?;
                self.call_function(&function, args).map(Some)
            }
            other => self.eval(other).map(Some),
        }
    }

    fn call_method(&mut self, target: &JsValue, key: &str, args: Vec<JsValue>, optional: bool) -> Eval<Option<JsValue>> {
        let own = match target {
            JsValue::Object(entries) => entries.borrow().get(key).cloned(),
            _ => None,
        };
        if own.is_none()
            && let Some(method) = methods::lookup(target, key)
        {
            return method(self, target, args).map(Some);
        }
        let function = match own {
            Some(function) => function,
            None => self.get_property(target, key)?,
        };
        if optional && function.is_nullish() {
            return Ok(None);
        }
        if !function.is_function() {
            let description = describe_value(target);
            return self.throw_error("TypeError", format!("{description}.{key} is not a function"));
        }
        self.call_function(&function, args).map(Some)
    }

    fn eval_object(&mut self, properties: &[Property]) -> Eval {
        let mut entries = IndexMap::with_capacity(properties.len());
        for property in properties {
            match property {
                Property::KeyValue(key, value) => {
                    let key = match key {
                        PropertyKey::Static(name) => name.clone(),
                        PropertyKey::Computed(expr) => self.eval(expr)?.to_property_key(),
                    };
                    let value = self.eval(value)?;
                    entries.insert(key, value);
                }
                Property::Spread(expr) => match self.eval(expr)? {
                    JsValue::Object(source) => {
                        for (key, value) in source.borrow().iter() {
                            entries.insert(key.clone(), value.clone());
                        }
                    }
                    JsValue::Array(items) => {
                        for (index, value) in items.borrow().iter().enumerate() {
                            entries.insert(index.to_string(), value.clone());
                        }
                    }
                    JsValue::String(text) => {
                        for (index, ch) in text.chars().enumerate() {
                            entries.insert(index.to_string(), JsValue::from(ch.to_string()));
                        }
                    }
                    _ => {}
                },
            }
        }
        Ok(self.object(entries))
    }

    fn eval_unary(&mut self, op: UnaryOp, argument: &Expr) -> Eval {
        match op {
            UnaryOp::TypeOf => {
                if let Expr::Identifier(name) = argument
                    && self.lookup(name).is_none()
                {
                    return Ok(JsValue::from("undefined"));
                }
                let value = self.eval(argument)?;
                Ok(JsValue::from(value.type_of()))
            }
            UnaryOp::Delete => {
                if let Expr::Member { object, property, .. } = argument {
                    let target = self.eval(object)?;
                    let key = self.member_key(property)?;
                    match &target {
                        JsValue::Object(entries) => {
                            entries.borrow_mut().shift_remove(&key);
                        }
                        JsValue::Array(items) => {
                            if let Some(index) = array_index(&key)
                                && let Some(slot) = items.borrow_mut().get_mut(index)
                            {
                                *slot = JsValue::Undefined;
                            }
                        }
                        _ => {}
                    }
                }
                Ok(JsValue::Bool(true))
            }
            _ => {
                let value = self.eval(argument)?;
                Ok(match op {
                    UnaryOp::Not => JsValue::Bool(!value.truthy()),
                    UnaryOp::Negate => JsValue::Number(-value.to_number()),
                    UnaryOp::Plus => JsValue::Number(value.to_number()),
                    UnaryOp::BitNot => JsValue::Number(f64::from(!to_int32(value.to_number()))),
                    _ => JsValue::Undefined,
                })
            }
        }
    }

    fn eval_assign(&mut self, op: AssignOp, target: &Expr, value: &Expr) -> Eval {
        let value = match op {
            AssignOp::Assign => self.eval(value)?,
            AssignOp::Compound(binary) => {
                let current = self.eval(target)?;
                let right = self.eval(value)?;
                self.binary(binary, &current, &right)?
            }
            AssignOp::Logical(logical) => {
                let current = self.eval(target)?;
                if short_circuits(logical, &current) {
                    return Ok(current);
                }
                self.eval(value)?
            }
        };
        self.assign_to(target, value.clone())?;
        Ok(value)
    }

    fn assign_to(&mut self, target: &Expr, value: JsValue) -> Eval<()> {
        match target {
            Expr::Identifier(name) => self.write_variable(name, value),
            Expr::Member { object, property, .. } => {
                let object = self.eval(object)?;
                let key = self.member_key(property)?;
                self.set_property(&object, &key, value)
            }
            _ => self.throw_error("SyntaxError", "Invalid left-hand side in assignment"),
        }
    }

    pub(crate) fn binary(&mut self, op: BinaryOp, left: &JsValue, right: &JsValue) -> Eval {
        let number = |value: f64| Ok(JsValue::Number(value));
        match op {
            BinaryOp::Add => {
                if left.concatenates() || right.concatenates() {
                    let mut text = left.to_display_string();
                    text.push_str(&right.to_display_string());
                    self.string(text)
                } else {
                    number(left.to_number() + right.to_number())
                }
            }
            BinaryOp::Sub => number(left.to_number() - right.to_number()),
            BinaryOp::Mul => number(left.to_number() * right.to_number()),
            BinaryOp::Div => number(left.to_number() / right.to_number()),
            BinaryOp::Rem => number(left.to_number() % right.to_number()),
            BinaryOp::Pow => {
                let (base, exponent) = (left.to_number(), right.to_number());
                if exponent.is_nan() || (base.abs() == 1.0 && exponent.is_infinite()) {
                    number(f64::NAN)
                } else {
                    number(base.powf(exponent))
                }
            }
            BinaryOp::Eq => Ok(JsValue::Bool(left.loose_equals(right))),
            BinaryOp::NotEq => Ok(JsValue::Bool(!left.loose_equals(right))),
            BinaryOp::StrictEq => Ok(JsValue::Bool(left.strict_equals(right))),
            BinaryOp::StrictNotEq => Ok(JsValue::Bool(!left.strict_equals(right))),
            BinaryOp::Lt => Ok(JsValue::Bool(left.compare(right) == Some(Ordering::Less))),
            BinaryOp::Gt => Ok(JsValue::Bool(left.compare(right) == Some(Ordering::Greater))),
            BinaryOp::LtEq => Ok(JsValue::Bool(matches!(
                left.compare(right),
                Some(Ordering::Less | Ordering::Equal)
            ))),
            BinaryOp::GtEq => Ok(JsValue::Bool(matches!(
                left.compare(right),
                Some(Ordering::Greater | Ordering::Equal)
            ))),
            BinaryOp::In => {
                let key = left.to_property_key();
                match right {
                    JsValue::Object(entries) => Ok(JsValue::Bool(entries.borrow().contains_key(&key))),
                    JsValue::Array(items) => Ok(JsValue::Bool(
                        key == "length" || array_index(&key).is_some_and(|index| index < items.borrow().len()),
                    )),
                    other => {
                        let description = describe_value(other);
                        self.throw_error(
                            "TypeError",
                            format!("Cannot use 'in' operator to search for '{key}' in {description}"),
                        )
                    }
                }
            }
            BinaryOp::BitAnd => number(f64::from(to_int32(left.to_number()) & to_int32(right.to_number()))),
            BinaryOp::BitOr => number(f64::from(to_int32(left.to_number()) | to_int32(right.to_number()))),
            BinaryOp::BitXor => number(f64::from(to_int32(left.to_number()) ^ to_int32(right.to_number()))),
        }
    }

    // ---- statements ----

    fn exec_statements(&mut self, statements: &[Stmt]) -> Eval<Completion> {
        for statement in statements {
            if let Stmt::FunctionDecl(def) = statement
                && let Some(name) = &def.name
            {
                let function = self.closure(def);
                self.declare(name, function, true);
            }
        }
        for statement in statements {
            match self.exec(statement)? {
                Completion::Normal => {}
                abrupt => return Ok(abrupt),
            }
        }
        Ok(Completion::Normal)
    }

    fn exec_block(&mut self, statements: &[Stmt]) -> Eval<Completion> {
        self.with_scope(self.scope, |this| this.exec_statements(statements))
    }

    fn exec(&mut self, statement: &Stmt) -> Eval<Completion> {
        self.tick()?;
        match statement {
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Completion::Normal)
            }
            Stmt::VarDecl { kind, declarations } => {
                for (pattern, init) in declarations {
                    let value = match init {
                        Some(init) => self.eval(init)?,
                        None => JsValue::Undefined,
                    };
                    self.bind_pattern(pattern, value, *kind != DeclKind::Const)?;
                }
                Ok(Completion::Normal)
            }
            Stmt::FunctionDecl(_) | Stmt::Empty => Ok(Completion::Normal),
            Stmt::Return(argument) => {
                let value = match argument {
                    Some(argument) => self.eval(argument)?,
                    None => JsValue::Undefined,
                };
                Ok(Completion::Return(value))
            }
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test)?.truthy() {
                    self.exec(consequent)
                } else if let Some(alternate) = alternate {
                    self.exec(alternate)
                } else {
                    Ok(Completion::Normal)
                }
            }
            Stmt::Block(statements) => self.exec_block(statements),
            Stmt::For {
                init,
                test,
                update,
                body,
            } => self.with_scope(self.scope, |this| {
                if let Some(init) = init {
                    this.exec(init)?;
                }
                loop {
                    if let Some(test) = test
                        && !this.eval(test)?.truthy()
                    {
                        break;
                    }
                    match this.exec(body)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                    if let Some(update) = update {
                        this.eval(update)?;
                    }
                }
                Ok(Completion::Normal)
            }),
            Stmt::ForOf {
                kind,
                pattern,
                iterable,
                body,
            } => {
                let iterable = self.eval(iterable)?;
                let items = self.iterate(&iterable)?;
                self.exec_each(items, *kind, pattern, body)
            }
            Stmt::ForIn {
                kind,
                pattern,
                object,
                body,
            } => {
                let keys: Vec<JsValue> = match self.eval(object)? {
                    JsValue::Object(entries) => entries.borrow().keys().map(|key| JsValue::from(key.as_str())).collect(),
                    JsValue::Array(items) => (0..items.borrow().len()).map(|index| JsValue::from(index.to_string())).collect(),
                    JsValue::String(text) => (0..text.chars().count()).map(|index| JsValue::from(index.to_string())).collect(),
                    _ => Vec::new(),
                };
                self.exec_each(keys, *kind, pattern, body)
            }
            Stmt::While { test, body } => {
                while self.eval(test)?.truthy() {
                    match self.exec(body)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                }
                Ok(Completion::Normal)
            }
            Stmt::DoWhile { body, test } => {
                loop {
                    match self.exec(body)? {
                        Completion::Break => break,
                        Completion::Return(value) => return Ok(Completion::Return(value)),
                        Completion::Normal | Completion::Continue => {}
                    }
                    if !self.eval(test)?.truthy() {
                        break;
                    }
                }
                Ok(Completion::Normal)
            }
            Stmt::Switch { discriminant, cases } => {
                let discriminant = self.eval(discriminant)?;
                let mut start = None;
                for (index, case) in cases.iter().enumerate() {
                    if let Some(test) = &case.test
                        && self.eval(test)?.strict_equals(&discriminant)
                    {
                        start = Some(index);
                        break;
                    }
                }
                let start = start.or_else(|| cases.iter().position(|case| case.test.is_none()));
                let Some(start) = start else {
                    return Ok(Completion::Normal);
                };
                self.with_scope(self.scope, |this| {
                    for case in &cases[start..] {
                        match this.exec_statements(&case.body)? {
                            Completion::Normal => {}
                            Completion::Break => break,
                            abrupt => return Ok(abrupt),
                        }
                    }
                    Ok(Completion::Normal)
                })
            }
            Stmt::Break => Ok(Completion::Break),
            Stmt::Continue => Ok(Completion::Continue),
            Stmt::Throw(argument) => {
                let value = self.eval(argument)?;
                Err(Abrupt::Throw(value))
            }
            Stmt::Try {
                block,
                param,
                handler,
                finalizer,
            } => {
                let mut result = self.exec_block(block);
                if let Err(Abrupt::Throw(thrown)) = &result
                    && let Some(handler) = handler
                {
                    let thrown = thrown.clone();
                    result = self.with_scope(self.scope, |this| {
                        if let Some(param) = param {
                            this.bind_pattern(param, thrown, true)?;
                        }
                        this.exec_statements(handler)
                    });
                }
                if matches!(result, Err(Abrupt::Fatal(_))) {
                    return result;
                }
                match finalizer {
                    Some(finalizer) => match self.exec_block(finalizer)? {
                        Completion::Normal => result,
                        abrupt => Ok(abrupt),
                    },
                    None => result,
                }
            }
        }
    }

    fn exec_each(&mut self, items: Vec<JsValue>, kind: DeclKind, pattern: &Pattern, body: &Stmt) -> Eval<Completion> {
        for item in items {
            let completion = self.with_scope(self.scope, |this| {
                this.bind_pattern(pattern, item, kind != DeclKind::Const)?;
                this.exec(body)
            })?;
            match completion {
                Completion::Break => break,
                Completion::Return(value) => return Ok(Completion::Return(value)),
                Completion::Normal | Completion::Continue => {}
            }
        }
        Ok(Completion::Normal)
    }
}

impl Drop for Interpreter {
    /// Breaks reference cycles between arrays and objects built during evaluation.
    fn drop(&mut self) {
        for tracked in self.heap.drain(..) {
            match tracked {
                Tracked::Array(items) => {
                    if let Some(items) = items.upgrade() {
                        items.borrow_mut().clear();
                    }
                }
                Tracked::Object(entries) => {
                    if let Some(entries) = entries.upgrade() {
                        entries.borrow_mut().clear();
                    }
                }
            }
        }
    }
}

fn short_circuits(op: LogicalOp, left: &JsValue) -> bool {
    match op {
        LogicalOp::And => !left.truthy(),
        LogicalOp::Or => left.truthy(),
        LogicalOp::Nullish => !left.is_nullish(),
    }
}

/// Parses canonical array indices ("0", "17"; not "01" or "-1").
pub(crate) fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

pub(crate) fn to_int32(value: f64) -> i32 {
    if !value.is_finite() {
        return 0;
    }
    (value.trunc() % 4_294_967_296.0) as i64 as u32 as i32
}

/// Short description of a value for error messages.
pub(crate) fn describe_value(value: &JsValue) -> String {
    match value {
        JsValue::String(text) => format!("\"{text}\""),
        JsValue::Array(_) => "array".to_string(),
        JsValue::Object(_) => "object".to_string(),
        other => other.to_display_string(),
    }
}
