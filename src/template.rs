use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::path::Path;
use std::rc::Rc;

use crate::context::{Callable, Context, EvalContext, FunctionDef, PostProcessContext};
use crate::datum::Datum;
use crate::error::WeftError;
use crate::expression::{find_end_of_expression, parse_expression, Expression};
use crate::tokenizer::{tokenize, TokenKind};
use crate::Loader;

const MAX_INCLUDE_DEPTH: usize = 128;

// ── AST ────────────────────────────────────────────────────────────

pub enum TemplateNode {
    Text {
        text: String,
    },
    Placeholder {
        offset: usize,
        expression: Expression,
    },
    ExpressionStatement {
        offset: usize,
        expression: Expression,
    },
    If {
        offset: usize,
        branches: Vec<(Expression, Vec<TemplateNode>)>,
        else_children: Option<Vec<TemplateNode>>,
    },
    While {
        offset: usize,
        condition: Expression,
        children: Vec<TemplateNode>,
    },
    DoWhile {
        offset: usize,
        condition: Expression,
        children: Vec<TemplateNode>,
    },
    For {
        offset: usize,
        target: Expression,
        list: Expression,
        children: Vec<TemplateNode>,
        else_children: Option<Vec<TemplateNode>>,
    },
    Function(Rc<RefCell<FunctionDef>>),
    Break {
        offset: usize,
    },
    Continue {
        offset: usize,
    },
    Return {
        offset: usize,
        expression: Expression,
    },
    // An included template, inlined at parse time.
    Include {
        file: String,
        children: Vec<TemplateNode>,
    },
}

/// Evaluate a child list in order. The first `break`, `continue`, or
/// `#return` value short-circuits; `undefined` means normal completion.
pub(crate) fn evaluate_children(
    children: &[TemplateNode],
    ctx: &mut EvalContext,
) -> Result<Datum, WeftError> {
    for child in children {
        let value = child.evaluate(ctx)?;
        if !value.is_undefined() {
            return Ok(value);
        }
    }
    Ok(Datum::undefined())
}

fn evaluate_with_output_disabled(
    expression: &Expression,
    ctx: &mut EvalContext,
) -> Result<Datum, WeftError> {
    ctx.disable_output();
    let result = expression.evaluate(ctx);
    ctx.enable_output();
    result
}

impl TemplateNode {
    // ── Post-processing ────────────────────────────────────────────

    fn post_process(&mut self, ppctx: &mut PostProcessContext) -> Result<(), WeftError> {
        match self {
            TemplateNode::Text { .. }
            | TemplateNode::Break { .. }
            | TemplateNode::Continue { .. } => Ok(()),
            TemplateNode::Placeholder { expression, .. }
            | TemplateNode::ExpressionStatement { expression, .. }
            | TemplateNode::Return { expression, .. } => expression.post_process(ppctx),
            TemplateNode::If {
                branches,
                else_children,
                ..
            } => {
                for (condition, children) in branches {
                    condition.post_process(ppctx)?;
                    post_process_children(children, ppctx)?;
                }
                if let Some(children) = else_children {
                    post_process_children(children, ppctx)?;
                }
                Ok(())
            }
            TemplateNode::While {
                condition, children, ..
            }
            | TemplateNode::DoWhile {
                condition, children, ..
            } => {
                condition.post_process(ppctx)?;
                post_process_children(children, ppctx)
            }
            TemplateNode::For {
                target,
                list,
                children,
                else_children,
                ..
            } => {
                target.post_process(ppctx)?;
                list.post_process(ppctx)?;
                post_process_children(children, ppctx)?;
                if let Some(children) = else_children {
                    post_process_children(children, ppctx)?;
                }
                Ok(())
            }
            TemplateNode::Function(def) => {
                // Register under the name, capturing the prior binding as
                // `super`; the body sees that binding while it is walked.
                let name = def.borrow().name.clone();
                let prior = ppctx.set_function(&name, Callable::Template(def.clone()));
                def.borrow_mut().super_function = prior.clone();
                ppctx.push_super(prior);
                let result = post_process_children(&mut def.borrow_mut().children, ppctx);
                ppctx.pop_super();
                result
            }
            TemplateNode::Include { file, children } => {
                post_process_children(children, ppctx).map_err(|e| e.in_file(file))
            }
        }
    }

    // ── Evaluation ─────────────────────────────────────────────────

    fn evaluate(&self, ctx: &mut EvalContext) -> Result<Datum, WeftError> {
        match self {
            TemplateNode::Text { text } => {
                ctx.write(text);
                Ok(Datum::undefined())
            }
            TemplateNode::Placeholder { expression, .. } => {
                let snapshot = ctx.output_size();
                let value = expression.evaluate(ctx)?;
                if value.is_break() || value.is_continue() {
                    return Ok(value);
                }
                if !value.is_undefined() {
                    // A value escaping from a #return; replace anything
                    // the call may have written.
                    ctx.set_output_size(snapshot);
                    ctx.write(&value.to_string());
                }
                Ok(Datum::undefined())
            }
            TemplateNode::ExpressionStatement { expression, .. } => {
                let value = evaluate_with_output_disabled(expression, ctx)?;
                if value.is_break() || value.is_continue() {
                    return Ok(value);
                }
                Ok(Datum::undefined())
            }
            TemplateNode::If {
                branches,
                else_children,
                ..
            } => {
                for (condition, children) in branches {
                    if evaluate_with_output_disabled(condition, ctx)?.truthy() {
                        return evaluate_children(children, ctx);
                    }
                }
                if let Some(children) = else_children {
                    return evaluate_children(children, ctx);
                }
                Ok(Datum::undefined())
            }
            TemplateNode::While {
                condition, children, ..
            } => self.evaluate_loop(condition, children, false, ctx),
            TemplateNode::DoWhile {
                condition, children, ..
            } => self.evaluate_loop(condition, children, true, ctx),
            TemplateNode::For {
                target,
                list,
                children,
                else_children,
                ..
            } => {
                let value = evaluate_with_output_disabled(list, ctx)?;
                let Some(items) = value.as_vector() else {
                    return Err(WeftError::invalid_operation(
                        format!("Expecting a vector for #for, got {}", value.type_name()),
                        list.offset,
                    ));
                };

                if items.is_empty() {
                    if let Some(children) = else_children {
                        return evaluate_children(children, ctx);
                    }
                    return Ok(Datum::undefined());
                }

                let size = items.len();
                let snapshot = ctx.output_size();
                for (index, item) in items.iter().enumerate() {
                    let item = item.clone();
                    *target.evaluate_lvalue(ctx)? = item;
                    ctx.loop_push(index, Some(size));
                    let result = evaluate_children(children, ctx);
                    ctx.loop_pop();
                    let child_value = result?;
                    if child_value.is_break() {
                        break;
                    }
                    if child_value.is_continue() || child_value.is_undefined() {
                        continue;
                    }
                    // A #return escapes the loop and takes its output
                    // with it.
                    ctx.set_output_size(snapshot);
                    return Ok(child_value);
                }
                Ok(Datum::undefined())
            }
            TemplateNode::Function(_) => Ok(Datum::undefined()),
            TemplateNode::Break { .. } => Ok(Datum::break_value()),
            TemplateNode::Continue { .. } => Ok(Datum::continue_value()),
            TemplateNode::Return { expression, .. } => {
                evaluate_with_output_disabled(expression, ctx)
            }
            TemplateNode::Include { file, children } => {
                evaluate_children(children, ctx).map_err(|e| e.in_file(file))
            }
        }
    }

    fn evaluate_loop(
        &self,
        condition: &Expression,
        children: &[TemplateNode],
        run_body_first: bool,
        ctx: &mut EvalContext,
    ) -> Result<Datum, WeftError> {
        let snapshot = ctx.output_size();
        let mut count = 0usize;
        loop {
            if !(run_body_first && count == 0)
                && !evaluate_with_output_disabled(condition, ctx)?.truthy()
            {
                return Ok(Datum::undefined());
            }
            ctx.loop_push(count, None);
            let result = evaluate_children(children, ctx);
            ctx.loop_pop();
            let value = result?;
            if value.is_break() {
                return Ok(Datum::undefined());
            }
            if !value.is_continue() && !value.is_undefined() {
                ctx.set_output_size(snapshot);
                return Ok(value);
            }
            count += 1;
        }
    }
}

fn post_process_children(
    children: &mut [TemplateNode],
    ppctx: &mut PostProcessContext,
) -> Result<(), WeftError> {
    for child in children {
        child.post_process(ppctx)?;
    }
    Ok(())
}

// ── Display ────────────────────────────────────────────────────────

fn fmt_children(f: &mut fmt::Formatter<'_>, children: &[TemplateNode]) -> fmt::Result {
    for child in children {
        write!(f, "{}", child)?;
    }
    Ok(())
}

impl fmt::Display for TemplateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateNode::Text { text } => write!(f, "<text {}>", text),
            TemplateNode::Placeholder { expression, .. } => {
                write!(f, "<placeholder {}>", expression)
            }
            TemplateNode::ExpressionStatement { expression, .. } => {
                write!(f, "<expression {}>", expression)
            }
            TemplateNode::If {
                branches,
                else_children,
                ..
            } => {
                write!(f, "<if ")?;
                for (i, (condition, children)) in branches.iter().enumerate() {
                    if i > 0 {
                        write!(f, "elif ")?;
                    }
                    write!(f, "{}", condition)?;
                    fmt_children(f, children)?;
                }
                if let Some(children) = else_children {
                    write!(f, "else ")?;
                    fmt_children(f, children)?;
                }
                write!(f, ">")
            }
            TemplateNode::While {
                condition, children, ..
            } => {
                write!(f, "<while {}", condition)?;
                fmt_children(f, children)?;
                write!(f, ">")
            }
            TemplateNode::DoWhile {
                condition, children, ..
            } => {
                write!(f, "<do ")?;
                fmt_children(f, children)?;
                write!(f, "{}>", condition)
            }
            TemplateNode::For {
                target,
                list,
                children,
                else_children,
                ..
            } => {
                write!(f, "<for {}: {}", target, list)?;
                fmt_children(f, children)?;
                if let Some(children) = else_children {
                    write!(f, "else ")?;
                    fmt_children(f, children)?;
                }
                write!(f, ">")
            }
            TemplateNode::Function(def) => {
                let def = def.borrow();
                if def.is_block {
                    write!(f, "<block {}", def.name)?;
                } else {
                    write!(f, "<function {}({})", def.name, def.arg_names.join(","))?;
                }
                fmt_children(f, &def.children)?;
                write!(f, ">")
            }
            TemplateNode::Break { .. } => write!(f, "<break>"),
            TemplateNode::Continue { .. } => write!(f, "<continue>"),
            TemplateNode::Return { expression, .. } => write!(f, "<return {}>", expression),
            TemplateNode::Include { children, .. } => {
                write!(f, "<top ")?;
                fmt_children(f, children)?;
                write!(f, ">")
            }
        }
    }
}

impl fmt::Debug for TemplateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ── Template ───────────────────────────────────────────────────────

/// A parsed template; post-processing runs implicitly before the first
/// evaluation, or explicitly via [`Template::post_process`].
pub struct Template {
    file: String,
    root: Vec<TemplateNode>,
    post_processed: bool,
}

impl Template {
    /// Resolve function, method, and filter references throughout the
    /// tree and wire the `super` chain of overriding functions.
    pub fn post_process(&mut self, context: &Context) -> Result<(), WeftError> {
        let mut ppctx = PostProcessContext::new(context);
        for node in &mut self.root {
            node.post_process(&mut ppctx)
                .map_err(|e| attach_file(e, &self.file))?;
        }
        self.post_processed = true;
        Ok(())
    }

    /// Run the template and return the produced text.
    pub fn evaluate(&mut self, context: &Context) -> Result<String, WeftError> {
        if !self.post_processed {
            self.post_process(context)?;
        }
        let mut ctx = EvalContext::new(context);
        let value = evaluate_children(&self.root, &mut ctx)
            .map_err(|e| attach_file(e, &self.file))?;
        if value.is_break() || value.is_continue() {
            return Err(WeftError::invalid_operation(
                "#break or #continue outside of a loop",
                0,
            ));
        }
        if !value.is_undefined() {
            return Err(WeftError::invalid_operation(
                "#return outside of a function",
                0,
            ));
        }
        Ok(ctx.into_output())
    }
}

fn attach_file(error: WeftError, file: &str) -> WeftError {
    if file.is_empty() {
        error
    } else {
        error.in_file(file)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<top ")?;
        fmt_children(f, &self.root)?;
        write!(f, ">")
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ── Parser ─────────────────────────────────────────────────────────

// What a statement line opens; `current` is the container under
// construction and completed builders pop back onto it.
enum Builder {
    Top {
        children: Vec<TemplateNode>,
    },
    If {
        offset: usize,
        branches: Vec<(Expression, Vec<TemplateNode>)>,
        current: Vec<TemplateNode>,
        else_children: Option<Vec<TemplateNode>>,
    },
    While {
        offset: usize,
        condition: Expression,
        children: Vec<TemplateNode>,
    },
    Do {
        offset: usize,
        children: Vec<TemplateNode>,
    },
    For {
        offset: usize,
        target: Expression,
        list: Expression,
        children: Vec<TemplateNode>,
        else_children: Option<Vec<TemplateNode>>,
    },
    Function {
        offset: usize,
        name: String,
        arg_names: Vec<String>,
        children: Vec<TemplateNode>,
        is_block: bool,
    },
}

impl Builder {
    fn offset(&self) -> usize {
        match self {
            Builder::Top { .. } => 0,
            Builder::If { offset, .. }
            | Builder::While { offset, .. }
            | Builder::Do { offset, .. }
            | Builder::For { offset, .. }
            | Builder::Function { offset, .. } => *offset,
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            Builder::Top { .. } => "top",
            Builder::If { .. } => "#if",
            Builder::While { .. } => "#while",
            Builder::Do { .. } => "#do",
            Builder::For { .. } => "#for",
            Builder::Function { is_block: false, .. } => "#function",
            Builder::Function { is_block: true, .. } => "#block",
        }
    }

    fn active_children(&mut self) -> &mut Vec<TemplateNode> {
        match self {
            Builder::Top { children }
            | Builder::While { children, .. }
            | Builder::Do { children, .. }
            | Builder::Function { children, .. } => children,
            Builder::If {
                current,
                else_children,
                ..
            } => match else_children {
                Some(children) => children,
                None => current,
            },
            Builder::For {
                children,
                else_children,
                ..
            } => match else_children {
                Some(children) => children,
                None => children,
            },
        }
    }
}

pub(crate) struct TemplateParser<'a> {
    loader: Option<&'a dyn Loader>,
    // Files currently being parsed, outermost first; used for relative
    // path resolution, the depth cap, and cycle detection.
    files: Vec<String>,
}

impl<'a> TemplateParser<'a> {
    pub(crate) fn new(loader: Option<&'a dyn Loader>) -> TemplateParser<'a> {
        TemplateParser {
            loader,
            files: Vec::new(),
        }
    }

    pub(crate) fn parse(&mut self, file: &str, source: &str) -> Result<Template, WeftError> {
        self.files.push(file.to_string());
        let result = self.parse_source(source);
        self.files.pop();
        let root = result.map_err(|e| attach_file(e, file))?;
        Ok(Template {
            file: file.to_string(),
            root,
            post_processed: false,
        })
    }

    fn parse_source(&mut self, source: &str) -> Result<Vec<TemplateNode>, WeftError> {
        let mut current = Builder::Top {
            children: Vec::new(),
        };
        let mut stack: Vec<Builder> = Vec::new();
        let mut text = String::new();
        let mut i = 0usize;

        while i < source.len() {
            let Some(c) = source[i..].chars().next() else {
                break;
            };
            match c {
                '$' => match source[i + 1..].chars().next() {
                    Some('{') => {
                        flush_text(&mut text, &mut current);
                        let rest = &source[i + 2..];
                        let Some(end) = find_end_of_expression(rest, "}") else {
                            return Err(WeftError::parse("Unterminated ${...} placeholder", i));
                        };
                        let expression = parse_expression(&rest[..end], i + 2)?;
                        current.active_children().push(TemplateNode::Placeholder {
                            offset: i,
                            expression,
                        });
                        i += 2 + end + 1;
                    }
                    Some(next) => {
                        // A lone '$' stays literal together with the byte
                        // after it.
                        text.push('$');
                        text.push(next);
                        i += 1 + next.len_utf8();
                    }
                    None => {
                        text.push('$');
                        i += 1;
                    }
                },
                '\\' => match source[i + 1..].chars().next() {
                    Some('\n') => i += 2,
                    Some('\r') => {
                        i += 2;
                        if source[i..].starts_with('\n') {
                            i += 1;
                        }
                    }
                    Some(next) => {
                        text.push('\\');
                        text.push(next);
                        i += 1 + next.len_utf8();
                    }
                    None => {
                        text.push('\\');
                        i += 1;
                    }
                },
                '#' => {
                    i = self.parse_statement(source, i, &mut text, &mut current, &mut stack)?;
                }
                _ => {
                    text.push(c);
                    i += c.len_utf8();
                }
            }
        }

        flush_text(&mut text, &mut current);
        left_align(current.active_children());
        if !stack.is_empty() || !matches!(current, Builder::Top { .. }) {
            return Err(WeftError::parse(
                format!("Missing #end for {}", current.keyword()),
                current.offset(),
            ));
        }
        match current {
            Builder::Top { children } => Ok(children),
            _ => Ok(Vec::new()),
        }
    }

    // Dispatch one `#`-line. Returns the scan position after the
    // statement (past its terminating newline).
    fn parse_statement(
        &mut self,
        source: &str,
        offset: usize,
        text: &mut String,
        current: &mut Builder,
        stack: &mut Vec<Builder>,
    ) -> Result<usize, WeftError> {
        let line_end = source[offset..]
            .find('\n')
            .map(|p| offset + p)
            .unwrap_or(source.len());
        let rest = &source[offset + 1..line_end];
        let after_line = if line_end < source.len() {
            line_end + 1
        } else {
            line_end
        };

        // `##expr` and `# expr` are expression statements.
        if let Some(expr_text) = rest.strip_prefix('#') {
            self.begin_statement(text, current);
            let expression = parse_expression(expr_text, offset + 2)?;
            current
                .active_children()
                .push(TemplateNode::ExpressionStatement { offset, expression });
            return Ok(after_line);
        }
        if rest.starts_with(' ') || rest.starts_with('\t') {
            self.begin_statement(text, current);
            let expression = parse_expression(rest, offset + 1)?;
            current
                .active_children()
                .push(TemplateNode::ExpressionStatement { offset, expression });
            return Ok(after_line);
        }

        let keyword_len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphabetic())
            .count();
        let keyword = &rest[..keyword_len];
        let argument = &rest[keyword_len..];
        let argument_base = offset + 1 + keyword_len;

        if !matches!(
            keyword,
            "end"
                | "if"
                | "elif"
                | "else"
                | "for"
                | "while"
                | "do"
                | "function"
                | "block"
                | "break"
                | "continue"
                | "return"
                | "include"
        ) {
            // Not a statement; '#' and the byte after it stay literal.
            text.push('#');
            match source[offset + 1..].chars().next() {
                Some(next) => {
                    text.push(next);
                    return Ok(offset + 1 + next.len_utf8());
                }
                None => return Ok(offset + 1),
            }
        }

        self.begin_statement(text, current);
        match keyword {
            "if" => {
                let condition = parse_expression(argument, argument_base)?;
                stack.push(mem::replace(
                    current,
                    Builder::If {
                        offset,
                        // The open branch's children collect in `current`
                        // and move here when #elif/#else/#end closes it.
                        branches: vec![(condition, Vec::new())],
                        current: Vec::new(),
                        else_children: None,
                    },
                ));
            }
            "elif" => {
                let condition = parse_expression(argument, argument_base)?;
                let Builder::If {
                    branches,
                    current: active,
                    else_children: None,
                    ..
                } = current
                else {
                    return Err(WeftError::parse("#elif without a matching #if", offset));
                };
                if let Some((_, children)) = branches.last_mut() {
                    *children = mem::take(active);
                }
                branches.push((condition, Vec::new()));
            }
            "else" => match current {
                Builder::If {
                    branches,
                    current: active,
                    else_children,
                    ..
                } => {
                    if else_children.is_some() {
                        return Err(WeftError::parse("#else after #else", offset));
                    }
                    if let Some((_, children)) = branches.last_mut() {
                        *children = mem::take(active);
                    }
                    *else_children = Some(Vec::new());
                }
                Builder::For { else_children, .. } => {
                    if else_children.is_some() {
                        return Err(WeftError::parse("#else after #else", offset));
                    }
                    *else_children = Some(Vec::new());
                }
                _ => {
                    return Err(WeftError::parse(
                        "#else without a matching #if or #for",
                        offset,
                    ))
                }
            },
            "end" => {
                let Some(parent) = stack.pop() else {
                    return Err(WeftError::parse("#end without a matching statement", offset));
                };
                let finished = mem::replace(current, parent);
                let node = finish_builder(finished, offset)?;
                current.active_children().push(node);
            }
            "for" => {
                let Some(colon) = find_end_of_expression(argument, ":") else {
                    return Err(WeftError::parse("Expecting ':' in #for", offset));
                };
                let target = parse_expression(&argument[..colon], argument_base)?;
                let list =
                    parse_expression(&argument[colon + 1..], argument_base + colon + 1)?;
                stack.push(mem::replace(
                    current,
                    Builder::For {
                        offset,
                        target,
                        list,
                        children: Vec::new(),
                        else_children: None,
                    },
                ));
            }
            "while" => {
                let condition = parse_expression(argument, argument_base)?;
                if matches!(current, Builder::Do { .. }) {
                    // `#while` terminates an open `#do`.
                    let Some(parent) = stack.pop() else {
                        return Err(WeftError::parse("#while without a matching #do", offset));
                    };
                    let finished = mem::replace(current, parent);
                    let Builder::Do {
                        offset: do_offset,
                        children,
                    } = finished
                    else {
                        return Err(WeftError::parse("#while without a matching #do", offset));
                    };
                    current.active_children().push(TemplateNode::DoWhile {
                        offset: do_offset,
                        condition,
                        children,
                    });
                } else {
                    stack.push(mem::replace(
                        current,
                        Builder::While {
                            offset,
                            condition,
                            children: Vec::new(),
                        },
                    ));
                }
            }
            "do" => {
                stack.push(mem::replace(
                    current,
                    Builder::Do {
                        offset,
                        children: Vec::new(),
                    },
                ));
            }
            "function" | "block" => {
                let is_block = keyword == "block";
                let (name, arg_names) =
                    parse_call_form(argument, argument_base, is_block)?;
                stack.push(mem::replace(
                    current,
                    Builder::Function {
                        offset,
                        name,
                        arg_names,
                        children: Vec::new(),
                        is_block,
                    },
                ));
            }
            "break" => current
                .active_children()
                .push(TemplateNode::Break { offset }),
            "continue" => current
                .active_children()
                .push(TemplateNode::Continue { offset }),
            "return" => {
                let expression = parse_expression(argument, argument_base)?;
                current
                    .active_children()
                    .push(TemplateNode::Return { offset, expression });
            }
            "include" => {
                let node = self.parse_include(argument, argument_base, offset)?;
                current.active_children().push(node);
            }
            _ => {}
        }
        Ok(after_line)
    }

    // Flush pending text and left-align: a statement strips the spaces
    // and tabs of its own indentation from the text before it, back to
    // the preceding newline.
    fn begin_statement(&self, text: &mut String, current: &mut Builder) {
        flush_text(text, current);
        left_align(current.active_children());
    }

    fn parse_include(
        &mut self,
        argument: &str,
        argument_base: usize,
        offset: usize,
    ) -> Result<TemplateNode, WeftError> {
        let mut expression = parse_expression(argument, argument_base)?;

        // The path expression runs against throwaway contexts; it may
        // not reference template state.
        let empty = Context::new();
        expression
            .post_process(&PostProcessContext::new(&empty))
            .map_err(|e| WeftError::include(e.message, offset))?;
        let mut ctx = EvalContext::new(&empty);
        let path_value = expression
            .evaluate(&mut ctx)
            .map_err(|e| WeftError::include(e.message, offset))?;
        let Some(path) = path_value.as_string() else {
            return Err(WeftError::include(
                format!(
                    "Expecting a string for the #include path, got {}",
                    path_value.type_name()
                ),
                offset,
            ));
        };

        let resolved = match self.files.last() {
            Some(parent) => resolve_relative(parent, &path),
            None => path.clone(),
        };

        if self.files.len() >= MAX_INCLUDE_DEPTH {
            return Err(WeftError::include(
                format!("Include depth exceeds {}", MAX_INCLUDE_DEPTH),
                offset,
            ));
        }
        if self.files.contains(&resolved) {
            return Err(WeftError::include(
                format!("Include cycle through '{}'", resolved),
                offset,
            ));
        }
        let Some(loader) = self.loader else {
            return Err(WeftError::include(
                format!("No loader available to include '{}'", resolved),
                offset,
            ));
        };
        let source = loader
            .load(&resolved)
            .map_err(|message| WeftError::include(message, offset))?;

        self.files.push(resolved.clone());
        let result = self.parse_source(&source);
        self.files.pop();
        let children = result.map_err(|e| e.in_file(&resolved))?;

        Ok(TemplateNode::Include {
            file: resolved,
            children,
        })
    }
}

fn flush_text(text: &mut String, current: &mut Builder) {
    if !text.is_empty() {
        current.active_children().push(TemplateNode::Text {
            text: mem::take(text),
        });
    }
}

// Strip the trailing run of spaces and tabs from the last text child,
// but only when the run reaches back to a newline or to the start of
// the text; indentation after other characters on the line stays.
fn left_align(children: &mut [TemplateNode]) {
    if let Some(TemplateNode::Text { text }) = children.last_mut() {
        let kept = text.trim_end_matches(|c| c == ' ' || c == '\t').len();
        if kept < text.len() && (kept == 0 || text[..kept].ends_with('\n')) {
            text.truncate(kept);
        }
    }
}

fn finish_builder(builder: Builder, end_offset: usize) -> Result<TemplateNode, WeftError> {
    match builder {
        Builder::If {
            offset,
            mut branches,
            current,
            else_children,
        } => {
            if else_children.is_none() {
                if let Some((_, children)) = branches.last_mut() {
                    *children = current;
                }
            }
            Ok(TemplateNode::If {
                offset,
                branches,
                else_children,
            })
        }
        Builder::While {
            offset,
            condition,
            children,
        } => Ok(TemplateNode::While {
            offset,
            condition,
            children,
        }),
        Builder::Do { .. } => Err(WeftError::parse(
            "Expecting #while to end a #do",
            end_offset,
        )),
        Builder::For {
            offset,
            target,
            list,
            children,
            else_children,
        } => Ok(TemplateNode::For {
            offset,
            target,
            list,
            children,
            else_children,
        }),
        Builder::Function {
            offset,
            name,
            arg_names,
            children,
            is_block,
        } => Ok(TemplateNode::Function(Rc::new(RefCell::new(FunctionDef {
            name,
            offset,
            arg_names,
            children,
            super_function: None,
            is_block,
        })))),
        Builder::Top { .. } => Err(WeftError::parse(
            "#end without a matching statement",
            end_offset,
        )),
    }
}

// `#function name(a, b)` supplies name and argument names; `#block name`
// is name-only.
fn parse_call_form(
    argument: &str,
    base: usize,
    is_block: bool,
) -> Result<(String, Vec<String>), WeftError> {
    let tokens = tokenize(argument);
    let mut index = 0;

    let name = match tokens.first() {
        Some(token) if token.kind == TokenKind::Name => {
            index += 1;
            token.value.clone()
        }
        _ => {
            return Err(WeftError::parse(
                if is_block {
                    "Expecting a name after #block"
                } else {
                    "Expecting a name after #function"
                },
                base,
            ))
        }
    };

    if is_block {
        match tokens.get(index) {
            Some(token) if token.kind == TokenKind::End => return Ok((name, Vec::new())),
            _ => {
                return Err(WeftError::parse(
                    "Unexpected text after #block name",
                    base,
                ))
            }
        }
    }

    match tokens.get(index) {
        Some(token) if token.is_operator("(") => index += 1,
        _ => {
            return Err(WeftError::parse(
                "Expecting '(' after the #function name",
                base,
            ))
        }
    }

    let mut arg_names = Vec::new();
    loop {
        match tokens.get(index) {
            Some(token) if token.is_operator(")") => {
                index += 1;
                break;
            }
            Some(token) if token.kind == TokenKind::Name => {
                arg_names.push(token.value.clone());
                index += 1;
                match tokens.get(index) {
                    Some(token) if token.is_operator(",") => index += 1,
                    Some(token) if token.is_operator(")") => {}
                    _ => {
                        return Err(WeftError::parse(
                            "Expecting ',' or ')' in the #function argument list",
                            base,
                        ))
                    }
                }
            }
            _ => {
                return Err(WeftError::parse(
                    "Expecting an argument name in the #function argument list",
                    base,
                ))
            }
        }
    }

    match tokens.get(index) {
        Some(token) if token.kind == TokenKind::End => Ok((name, arg_names)),
        _ => Err(WeftError::parse(
            "Unexpected text after the #function argument list",
            base,
        )),
    }
}

fn resolve_relative(parent: &str, include: &str) -> String {
    let dir = Path::new(parent).parent().unwrap_or_else(|| Path::new(""));
    dir.join(include).to_string_lossy().into_owned()
}
