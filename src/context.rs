use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::datum::Datum;
use crate::error::WeftError;
use crate::template::TemplateNode;

pub type NativeFunction = Rc<dyn Fn(&mut EvalContext, &[Datum]) -> Result<Datum, WeftError>>;
// A method mutates a value slot owned by the evaluation context, so it
// cannot also receive the context itself.
pub type Method = Rc<dyn Fn(&mut Datum, &[Datum]) -> Result<Datum, WeftError>>;
pub type Filter = Rc<dyn Fn(&str) -> String>;

// ── Callables ──────────────────────────────────────────────────────

/// A `#function` or `#block` body, shared between the AST node that
/// declared it and every call site that resolved it.
pub struct FunctionDef {
    pub name: String,
    pub offset: usize,
    pub arg_names: Vec<String>,
    pub children: Vec<TemplateNode>,
    pub super_function: Option<Callable>,
    pub is_block: bool,
}

/// What a call expression dispatches to after post-processing: either a
/// host-registered closure or a template-defined function.
#[derive(Clone)]
pub enum Callable {
    Native(NativeFunction),
    Template(Rc<RefCell<FunctionDef>>),
}

impl Callable {
    pub fn call(
        &self,
        ctx: &mut EvalContext,
        args: &[Datum],
        offset: usize,
    ) -> Result<Datum, WeftError> {
        match self {
            Callable::Native(f) => f(ctx, args).map_err(|e| e.or_at(offset)),
            Callable::Template(def) => call_template_function(def, ctx, args, offset),
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Native(_) => f.write_str("<native function>"),
            Callable::Template(def) => write!(f, "<function {}>", def.borrow().name),
        }
    }
}

fn call_template_function(
    def: &Rc<RefCell<FunctionDef>>,
    ctx: &mut EvalContext,
    args: &[Datum],
    offset: usize,
) -> Result<Datum, WeftError> {
    // A shared borrow so that recursive calls can borrow again.
    let def = def.borrow();

    if args.len() != def.arg_names.len() {
        return Err(WeftError::invalid_operation(
            format!(
                "Expecting {} arguments for {}(), got {}",
                def.arg_names.len(),
                def.name,
                args.len()
            ),
            offset,
        ));
    }

    let output_start = ctx.output_size();
    ctx.push_scope();
    for (name, value) in def.arg_names.iter().zip(args) {
        ctx.declare_local(name, value.clone());
    }
    let result = crate::template::evaluate_children(&def.children, ctx);
    ctx.pop_scope();
    let value = result?;

    if value.is_break() || value.is_continue() {
        return Err(WeftError::invalid_operation(
            "#break or #continue outside of a loop",
            offset,
        ));
    }
    if value.is_undefined() {
        // Normal completion; the body's output stays.
        return Ok(Datum::undefined());
    }
    if def.is_block {
        return Err(WeftError::invalid_operation(
            format!("#return is not allowed inside #block {}", def.name),
            offset,
        ));
    }
    // A #return value; discard whatever the body wrote.
    ctx.set_output_size(output_start);
    Ok(value)
}

// ── User-facing context ────────────────────────────────────────────

/// Host-side configuration for an evaluation: global values plus the
/// function, method, and filter registries.
#[derive(Default)]
pub struct Context {
    globals: BTreeMap<String, Datum>,
    functions: BTreeMap<String, NativeFunction>,
    methods: BTreeMap<String, Method>,
    filters: BTreeMap<String, Filter>,
}

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    /// Set a global value visible to every expression in the template.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Datum>) {
        self.globals.insert(name.into(), value.into());
    }

    pub fn register_function<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut EvalContext, &[Datum]) -> Result<Datum, WeftError> + 'static,
    {
        self.functions.insert(name.into(), Rc::new(f));
    }

    pub fn register_method<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut Datum, &[Datum]) -> Result<Datum, WeftError> + 'static,
    {
        self.methods.insert(name.into(), Rc::new(f));
    }

    pub fn register_filter<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&str) -> String + 'static,
    {
        self.filters.insert(name.into(), Rc::new(f));
    }
}

// ── Post-process context ───────────────────────────────────────────

/// Name-to-callable resolution tables used by the one-time post-process
/// walk, plus the `super` stack that wires function overrides together.
pub struct PostProcessContext {
    functions: BTreeMap<String, Callable>,
    methods: BTreeMap<String, Method>,
    filters: BTreeMap<String, Filter>,
    super_stack: Vec<Option<Callable>>,
}

impl PostProcessContext {
    pub fn new(context: &Context) -> PostProcessContext {
        let mut functions = BTreeMap::new();
        for (name, f) in builtin_functions() {
            functions.insert(name.to_string(), Callable::Native(f));
        }
        for (name, f) in &context.functions {
            functions.insert(name.clone(), Callable::Native(f.clone()));
        }

        let mut methods = BTreeMap::new();
        for (name, m) in builtin_methods() {
            methods.insert(name.to_string(), m);
        }
        for (name, m) in &context.methods {
            methods.insert(name.clone(), m.clone());
        }

        PostProcessContext {
            functions,
            methods,
            filters: context.filters.clone(),
            super_stack: Vec::new(),
        }
    }

    pub fn get_function(&self, name: &str) -> Option<Callable> {
        if name == "super" {
            self.super_stack.last().cloned().flatten()
        } else {
            self.functions.get(name).cloned()
        }
    }

    /// Bind a template function, returning whatever the name was bound to
    /// before; the prior binding becomes the new function's `super`.
    pub fn set_function(&mut self, name: &str, callable: Callable) -> Option<Callable> {
        self.functions.insert(name.to_string(), callable)
    }

    pub fn push_super(&mut self, prior: Option<Callable>) {
        self.super_stack.push(prior);
    }

    pub fn pop_super(&mut self) {
        self.super_stack.pop();
    }

    pub fn get_method(&self, name: &str) -> Option<Method> {
        self.methods.get(name).cloned()
    }

    pub fn get_filter(&self, name: &str) -> Option<Filter> {
        self.filters.get(name).cloned()
    }
}

// ── Evaluation context ─────────────────────────────────────────────

struct LoopInfo {
    count: usize,
    size: Option<usize>,
}

/// Mutable state of one evaluation run: the scope stack, the loop stack,
/// and the output buffer with its disable counter.
pub struct EvalContext {
    globals: BTreeMap<String, Datum>,
    scopes: Vec<BTreeMap<String, Datum>>,
    loops: Vec<LoopInfo>,
    output: String,
    output_disable_count: usize,
}

impl EvalContext {
    pub fn new(context: &Context) -> EvalContext {
        EvalContext {
            globals: context.globals.clone(),
            scopes: vec![BTreeMap::new()],
            loops: Vec::new(),
            output: String::new(),
            output_disable_count: 0,
        }
    }

    // ── Output ─────────────────────────────────────────────────────

    pub fn write(&mut self, text: &str) {
        if self.output_disable_count == 0 {
            self.output.push_str(text);
        }
    }

    pub fn output_size(&self) -> usize {
        self.output.len()
    }

    pub fn set_output_size(&mut self, size: usize) {
        self.output.truncate(size);
    }

    pub fn disable_output(&mut self) {
        self.output_disable_count += 1;
    }

    pub fn enable_output(&mut self) {
        self.output_disable_count = self.output_disable_count.saturating_sub(1);
    }

    pub fn into_output(self) -> String {
        self.output
    }

    // ── Scopes ─────────────────────────────────────────────────────

    pub fn push_scope(&mut self) {
        self.scopes.push(BTreeMap::new());
    }

    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Create or overwrite a binding in the innermost scope, shadowing
    /// any outer binding of the same name.
    pub fn declare_local(&mut self, name: &str, value: Datum) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    /// Resolve a name: loop variables first, then local scopes innermost
    /// out, then globals.
    pub fn get(&self, name: &str, offset: usize) -> Result<Datum, WeftError> {
        if name.starts_with('$') {
            return self.get_loop_variable(name, offset);
        }
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        Err(WeftError::name_not_found(
            format!("Could not find name '{}'", name),
            offset,
        ))
    }

    /// Resolve a name to a mutable storage slot, creating an undefined
    /// binding in the innermost scope when the name is new.
    pub fn get_mut_or_create(
        &mut self,
        name: &str,
        offset: usize,
    ) -> Result<&mut Datum, WeftError> {
        if name.starts_with('$') {
            return Err(WeftError::invalid_operation(
                format!("Can not assign to loop variable '{}'", name),
                offset,
            ));
        }

        enum Slot {
            Scope(usize),
            Global,
            Create,
        }

        let slot = if let Some(i) = self.scopes.iter().rposition(|s| s.contains_key(name)) {
            Slot::Scope(i)
        } else if self.globals.contains_key(name) {
            Slot::Global
        } else {
            Slot::Create
        };

        match slot {
            Slot::Scope(i) => Ok(self.scopes[i]
                .entry(name.to_string())
                .or_insert_with(Datum::undefined)),
            Slot::Global => Ok(self
                .globals
                .entry(name.to_string())
                .or_insert_with(Datum::undefined)),
            Slot::Create => match self.scopes.last_mut() {
                Some(scope) => Ok(scope
                    .entry(name.to_string())
                    .or_insert_with(Datum::undefined)),
                None => Err(WeftError::invalid_operation(
                    format!("No active scope to bind '{}'", name),
                    offset,
                )),
            },
        }
    }

    // ── Loops ──────────────────────────────────────────────────────

    pub fn loop_push(&mut self, count: usize, size: Option<usize>) {
        self.loops.push(LoopInfo { count, size });
    }

    pub fn loop_pop(&mut self) {
        self.loops.pop();
    }

    // `$i` reads the innermost loop; each extra `$` walks one loop
    // further out.
    fn get_loop_variable(&self, name: &str, offset: usize) -> Result<Datum, WeftError> {
        let dollars = name.bytes().take_while(|&b| b == b'$').count();
        let rest = &name[dollars..];

        let Some(index) = self.loops.len().checked_sub(dollars) else {
            return Err(WeftError::invalid_operation(
                format!("Loop variable '{}' used outside of a loop", name),
                offset,
            ));
        };
        let info = &self.loops[index];

        match rest {
            "i" | "count" => Ok(Datum::from(info.count)),
            "first" => Ok(Datum::from(info.count == 0)),
            "size" | "length" => match info.size {
                Some(size) => Ok(Datum::from(size)),
                None => Err(WeftError::invalid_operation(
                    format!("Loop size is not known for '{}'", name),
                    offset,
                )),
            },
            "last" => match info.size {
                Some(size) => Ok(Datum::from(info.count + 1 == size)),
                None => Err(WeftError::invalid_operation(
                    format!("Loop size is not known for '{}'", name),
                    offset,
                )),
            },
            _ => Err(WeftError::invalid_operation(
                format!("Unknown loop variable '{}'", name),
                offset,
            )),
        }
    }
}

// ── Builtins ───────────────────────────────────────────────────────

fn expect_arguments(name: &str, args: &[Datum], count: usize) -> Result<(), WeftError> {
    if args.len() != count {
        let plural = if count == 1 { "argument" } else { "arguments" };
        return Err(WeftError::invalid_operation(
            format!(
                "Expecting {} {} for {}() function, got {}",
                count,
                plural,
                name,
                args.len()
            ),
            0,
        ));
    }
    Ok(())
}

fn builtin_functions() -> Vec<(&'static str, NativeFunction)> {
    vec![
        (
            "float",
            Rc::new(|_: &mut EvalContext, args: &[Datum]| {
                expect_arguments("float", args, 1)?;
                let value = args[0].to_float().map_err(|e| WeftError::new(e.kind, e.message, 0))?;
                Ok(Datum::from(value))
            }) as NativeFunction,
        ),
        (
            "integer",
            Rc::new(|_: &mut EvalContext, args: &[Datum]| {
                expect_arguments("integer", args, 1)?;
                let value = args[0]
                    .to_integer()
                    .map_err(|e| WeftError::new(e.kind, e.message, 0))?;
                Ok(Datum::from(value))
            }) as NativeFunction,
        ),
        (
            "string",
            Rc::new(|_: &mut EvalContext, args: &[Datum]| {
                expect_arguments("string", args, 1)?;
                Ok(Datum::from(args[0].to_string()))
            }) as NativeFunction,
        ),
        (
            "boolean",
            Rc::new(|_: &mut EvalContext, args: &[Datum]| {
                expect_arguments("boolean", args, 1)?;
                Ok(Datum::from(args[0].truthy()))
            }) as NativeFunction,
        ),
        (
            "size",
            Rc::new(|_: &mut EvalContext, args: &[Datum]| {
                expect_arguments("size", args, 1)?;
                let size = args[0].size().map_err(|e| WeftError::new(e.kind, e.message, 0))?;
                Ok(Datum::from(size))
            }) as NativeFunction,
        ),
        (
            "keys",
            Rc::new(|_: &mut EvalContext, args: &[Datum]| {
                expect_arguments("keys", args, 1)?;
                let Some(map) = args[0].as_map() else {
                    return Err(WeftError::type_mismatch(
                        format!("Expecting a map for keys(), got {}", args[0].type_name()),
                        0,
                    ));
                };
                Ok(Datum::from(map.keys().cloned().collect::<Vec<_>>()))
            }) as NativeFunction,
        ),
        (
            "values",
            Rc::new(|_: &mut EvalContext, args: &[Datum]| {
                expect_arguments("values", args, 1)?;
                let Some(map) = args[0].as_map() else {
                    return Err(WeftError::type_mismatch(
                        format!("Expecting a map for values(), got {}", args[0].type_name()),
                        0,
                    ));
                };
                Ok(Datum::from(map.values().cloned().collect::<Vec<_>>()))
            }) as NativeFunction,
        ),
        (
            "items",
            Rc::new(|_: &mut EvalContext, args: &[Datum]| {
                expect_arguments("items", args, 1)?;
                let Some(map) = args[0].as_map() else {
                    return Err(WeftError::type_mismatch(
                        format!("Expecting a map for items(), got {}", args[0].type_name()),
                        0,
                    ));
                };
                let items = map
                    .iter()
                    .map(|(k, v)| Datum::from(vec![k.clone(), v.clone()]))
                    .collect::<Vec<_>>();
                Ok(Datum::from(items))
            }) as NativeFunction,
        ),
        (
            "sort",
            Rc::new(|_: &mut EvalContext, args: &[Datum]| {
                expect_arguments("sort", args, 1)?;
                let Some(vector) = args[0].as_vector() else {
                    return Err(WeftError::type_mismatch(
                        format!("Expecting a vector for sort(), got {}", args[0].type_name()),
                        0,
                    ));
                };
                let mut sorted = vector.clone();
                sorted.sort();
                Ok(Datum::from(sorted))
            }) as NativeFunction,
        ),
    ]
}

fn vector_push(self_value: &mut Datum, args: &[Datum]) -> Result<Datum, WeftError> {
    expect_arguments("append", args, 1)?;
    let Some(vector) = self_value.as_vector_mut() else {
        return Err(WeftError::type_mismatch(
            format!(
                "Expecting a vector for append(), got {}",
                self_value.type_name()
            ),
            0,
        ));
    };
    vector.push(args[0].clone());
    Ok(Datum::undefined())
}

fn builtin_methods() -> Vec<(&'static str, Method)> {
    vec![
        (
            "append",
            Rc::new(|self_value: &mut Datum, args: &[Datum]| vector_push(self_value, args))
                as Method,
        ),
        (
            "push",
            Rc::new(|self_value: &mut Datum, args: &[Datum]| vector_push(self_value, args))
                as Method,
        ),
        (
            "pop",
            Rc::new(|self_value: &mut Datum, args: &[Datum]| {
                expect_arguments("pop", args, 0)?;
                let Some(vector) = self_value.as_vector_mut() else {
                    return Err(WeftError::type_mismatch(
                        format!(
                            "Expecting a vector for pop(), got {}",
                            self_value.type_name()
                        ),
                        0,
                    ));
                };
                match vector.pop() {
                    Some(value) => Ok(value),
                    None => Err(WeftError::invalid_operation("pop() on an empty vector", 0)),
                }
            }) as Method,
        ),
    ]
}
