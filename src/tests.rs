use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::context::{Context, EvalContext, PostProcessContext};
use crate::datum::{Datum, DATUM_MAX_INT, DATUM_MIN_INT};
use crate::error::{ErrorKind, Position, WeftError};
use crate::expression::{find_end_of_expression, parse_expression};
use crate::tokenizer::{tokenize, TokenKind};
use crate::{parse_template, parse_template_from_loader, parse_template_with_loader, MapLoader};

// ── Shared fixture runners ─────────────────────────────────────────

/// Embed fixture files at compile time.
const RENDER_FIXTURES: &str = include_str!("../test-data/fixtures/render.json");
const TREE_FIXTURES: &str = include_str!("../test-data/fixtures/trees.json");

/// Convert a serde_json::Value (fixture "globals" format) to a Datum.
fn json_to_datum(value: &serde_json::Value) -> Datum {
    match value {
        serde_json::Value::Null => Datum::null(),
        serde_json::Value::Bool(b) => Datum::from(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Datum::from(i),
            None => Datum::from(n.as_f64().unwrap()),
        },
        serde_json::Value::String(s) => Datum::from(s.as_str()),
        serde_json::Value::Array(items) => {
            Datum::from(items.iter().map(json_to_datum).collect::<Vec<_>>())
        }
        serde_json::Value::Object(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                map.insert(Datum::from(key.as_str()), json_to_datum(value));
            }
            Datum::from(map)
        }
    }
}

fn fixture_context(fixture: &serde_json::Value) -> Context {
    let mut context = Context::new();
    if let Some(globals) = fixture.get("globals").and_then(|g| g.as_object()) {
        for (key, value) in globals {
            context.set(key.as_str(), json_to_datum(value));
        }
    }
    context
}

#[test]
fn fixture_render() {
    let fixtures: Vec<serde_json::Value> = serde_json::from_str(RENDER_FIXTURES).unwrap();

    for fixture in &fixtures {
        let name = fixture["name"].as_str().unwrap();
        let template = fixture["template"].as_str().unwrap();
        let expected = fixture["expected"].as_str().unwrap();
        let context = fixture_context(fixture);

        let mut parsed = parse_template("fixture", template)
            .unwrap_or_else(|e| panic!("Fixture '{}': parse failed: {}", name, e));
        let output = parsed
            .evaluate(&context)
            .unwrap_or_else(|e| panic!("Fixture '{}': evaluate failed: {}", name, e));
        assert_eq!(output, expected, "Fixture '{}'", name);
    }
}

#[test]
fn fixture_trees() {
    let fixtures: Vec<serde_json::Value> = serde_json::from_str(TREE_FIXTURES).unwrap();

    for fixture in &fixtures {
        let name = fixture["name"].as_str().unwrap();
        let template = fixture["template"].as_str().unwrap();
        let expected = fixture["tree"].as_str().unwrap();

        let parsed = parse_template("fixture", template)
            .unwrap_or_else(|e| panic!("Fixture '{}': parse failed: {}", name, e));
        assert_eq!(parsed.to_string(), expected, "Fixture '{}'", name);
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn render(template: &str) -> String {
    let mut parsed = parse_template("test", template).unwrap();
    parsed.evaluate(&Context::new()).unwrap()
}

fn render_err(template: &str) -> WeftError {
    match parse_template("test", template) {
        Ok(mut parsed) => parsed.evaluate(&Context::new()).unwrap_err(),
        Err(e) => e,
    }
}

fn tree(template: &str) -> String {
    parse_template("test", template).unwrap().to_string()
}

fn eval_expr_with(text: &str, context: &Context) -> Datum {
    let mut expression = parse_expression(text, 0).unwrap();
    expression
        .post_process(&PostProcessContext::new(context))
        .unwrap();
    expression.evaluate(&mut EvalContext::new(context)).unwrap()
}

fn eval_expr(text: &str) -> Datum {
    eval_expr_with(text, &Context::new())
}

fn eval_expr_err(text: &str) -> WeftError {
    let context = Context::new();
    let mut expression = match parse_expression(text, 0) {
        Ok(e) => e,
        Err(e) => return e,
    };
    if let Err(e) = expression.post_process(&PostProcessContext::new(&context)) {
        return e;
    }
    expression
        .evaluate(&mut EvalContext::new(&context))
        .unwrap_err()
}

fn hash_of(value: &Datum) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn int(v: i64) -> Datum {
    Datum::from(v)
}

// ── Datum ──────────────────────────────────────────────────────────

#[test]
fn integer_round_trip() {
    for v in [
        0,
        1,
        -1,
        42,
        -42,
        1 << 40,
        -(1 << 40),
        DATUM_MIN_INT,
        DATUM_MAX_INT,
    ] {
        assert_eq!(Datum::from(v).as_integer(), Some(v), "value {}", v);
    }
}

#[test]
fn integer_wraps_past_52_bits() {
    assert_eq!(
        Datum::from(DATUM_MAX_INT + 1).as_integer(),
        Some(DATUM_MIN_INT)
    );
    assert_eq!(
        Datum::from(DATUM_MIN_INT - 1).as_integer(),
        Some(DATUM_MAX_INT)
    );
}

#[test]
fn float_round_trip_and_nan() {
    for v in [0.5, -3.25, 1e300, f64::INFINITY, f64::NEG_INFINITY] {
        assert_eq!(Datum::from(v).as_float(), Some(v), "value {}", v);
    }
    assert!(Datum::from(f64::NAN).is_undefined());
}

#[test]
fn string_round_trip() {
    // Both sides of the inline-storage limit of six bytes.
    for s in ["", "a", "ab", "abcdef", "abcdefg", "a longer string"] {
        assert_eq!(Datum::from(s).as_string().as_deref(), Some(s));
    }
    assert_eq!(Datum::from("abc").size().unwrap(), 3);
}

#[test]
fn numeric_equality_and_hash() {
    let i = int(5);
    let f = Datum::from(5.0);
    assert_eq!(i, f);
    assert_eq!(hash_of(&i), hash_of(&f));

    assert_eq!(Datum::from("abc"), Datum::from("abc"));
    assert_eq!(Datum::undefined(), Datum::undefined());
    assert_ne!(int(5), Datum::from("5"));
}

#[test]
fn mixed_type_ordering() {
    let mut map = BTreeMap::new();
    map.insert(Datum::from("k"), int(1));

    let expected = vec![
        Datum::undefined(),
        Datum::null(),
        Datum::from(false),
        Datum::from(true),
        int(1),
        Datum::from(2.5),
        Datum::from("a"),
        Datum::from(vec![int(1)]),
        Datum::from(map),
    ];
    let mut shuffled: Vec<Datum> = expected.iter().rev().cloned().collect();
    shuffled.sort();
    assert_eq!(shuffled, expected);
}

#[test]
fn datum_arithmetic() {
    assert_eq!(int(2).add(&int(3)).unwrap(), int(5));
    assert_eq!(int(2).add(&Datum::from(0.5)).unwrap(), Datum::from(2.5));
    assert_eq!(
        Datum::from("a").add(&Datum::from("b")).unwrap(),
        Datum::from("ab")
    );
    assert_eq!(int(7).div(&int(2)).unwrap(), int(3));
    assert_eq!(Datum::from(7.0).div(&int(2)).unwrap(), Datum::from(3.5));
    assert_eq!(int(7).rem(&int(3)).unwrap(), int(1));
    assert_eq!(int(5).neg().unwrap(), int(-5));
    assert_eq!(int(0).bit_not().unwrap(), int(-1));

    let vectors = Datum::from(vec![int(1)])
        .add(&Datum::from(vec![int(2)]))
        .unwrap();
    assert_eq!(vectors, Datum::from(vec![int(1), int(2)]));

    let mut lhs = BTreeMap::new();
    lhs.insert(Datum::from("a"), int(1));
    lhs.insert(Datum::from("b"), int(1));
    let mut rhs = BTreeMap::new();
    rhs.insert(Datum::from("b"), int(2));
    let merged = Datum::from(lhs).add(&Datum::from(rhs)).unwrap();
    assert_eq!(merged.index(&Datum::from("a")).unwrap(), int(1));
    assert_eq!(merged.index(&Datum::from("b")).unwrap(), int(2));
}

#[test]
fn division_by_zero() {
    let err = int(7).div(&int(0)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    let err = int(7).rem(&int(0)).unwrap_err();
    assert_eq!(err.message, "Modulo by zero.");
}

#[test]
fn datum_shifts() {
    assert_eq!(int(1).shl(&int(3)).unwrap(), int(8));
    assert_eq!(int(-8).shr(&int(1)).unwrap(), int(-4));
    // A negative amount reverses the direction.
    assert_eq!(int(8).shl(&int(-1)).unwrap(), int(4));
    assert_eq!(int(1).shr(&int(-3)).unwrap(), int(8));
    // Shifting everything out: logical left, arithmetic right.
    assert_eq!(int(1).shl(&int(70)).unwrap(), int(0));
    assert_eq!(int(-1).shr(&int(70)).unwrap(), int(-1));
}

#[test]
fn datum_bitwise() {
    assert_eq!(int(6).bit_and(&int(3)).unwrap(), int(2));
    assert_eq!(int(6).bit_or(&int(3)).unwrap(), int(7));
    assert_eq!(int(6).bit_xor(&int(3)).unwrap(), int(5));
    let err = Datum::from("a").bit_and(&int(1)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
}

#[test]
fn datum_display_and_repr() {
    assert_eq!(Datum::from(1.0).to_string(), "1.0");
    assert_eq!(Datum::from(2.5).to_string(), "2.5");
    assert_eq!(int(42).to_string(), "42");
    assert_eq!(Datum::from(true).to_string(), "true");
    assert_eq!(Datum::from("raw").to_string(), "raw");
    assert_eq!(Datum::from("a\nb").repr_string(), "\"a\\nb\"");

    let v = Datum::from(vec![int(1), Datum::from("a")]);
    assert_eq!(v.to_string(), "[1, \"a\"]");
    let mut map = BTreeMap::new();
    map.insert(Datum::from("k"), int(1));
    assert_eq!(Datum::from(map).to_string(), "{\"k\": 1}");
}

#[test]
fn datum_truthiness() {
    for falsy in [
        Datum::undefined(),
        Datum::null(),
        Datum::from(false),
        int(0),
        Datum::from(0.0),
        Datum::from(""),
        Datum::from(Vec::<Datum>::new()),
        Datum::from(BTreeMap::new()),
    ] {
        assert!(!falsy.truthy(), "{:?}", falsy);
    }
    for truthy in [Datum::from(true), int(-1), Datum::from("x")] {
        assert!(truthy.truthy(), "{:?}", truthy);
    }
}

#[test]
fn datum_coercions() {
    assert_eq!(int(3).to_float().unwrap(), 3.0);
    assert_eq!(Datum::from(true).to_integer().unwrap(), 1);
    assert_eq!(Datum::from("42").to_integer().unwrap(), 42);
    assert_eq!(Datum::from(3.9).to_integer().unwrap(), 3);
    let err = Datum::from(BTreeMap::new()).to_float().unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
}

#[test]
fn vector_indexing() {
    let v = Datum::from(vec![int(10), int(20), int(30)]);
    assert_eq!(v.index(&int(0)).unwrap(), int(10));
    assert_eq!(v.index(&int(-1)).unwrap(), int(30));
    assert_eq!(
        v.index(&int(3)).unwrap_err().kind,
        ErrorKind::InvalidOperation
    );

    // A write at one past the end appends.
    let mut v = Datum::from(vec![int(10)]);
    *v.index_mut(&int(1)).unwrap() = int(20);
    assert_eq!(v, Datum::from(vec![int(10), int(20)]));
}

#[test]
fn map_indexing() {
    let mut map = BTreeMap::new();
    map.insert(Datum::from("a"), int(1));
    let mut m = Datum::from(map);
    assert_eq!(m.index(&Datum::from("a")).unwrap(), int(1));
    assert_eq!(
        m.index(&Datum::from("b")).unwrap_err().kind,
        ErrorKind::NameNotFound
    );

    *m.index_mut(&Datum::from("b")).unwrap() = int(2);
    assert_eq!(m.index(&Datum::from("b")).unwrap(), int(2));
}

// ── Tokenizer ──────────────────────────────────────────────────────

#[test]
fn tokenize_names() {
    let tokens = tokenize("$i _x abc9");
    assert_eq!(tokens.len(), 4);
    for (token, value) in tokens.iter().zip(["$i", "_x", "abc9"]) {
        assert_eq!(token.kind, TokenKind::Name);
        assert_eq!(token.value, value);
    }
    assert_eq!(tokens[3].kind, TokenKind::End);
    assert_eq!(tokens[3].to_string(), "<end>");
}

#[test]
fn tokenize_integers() {
    let tokens = tokenize("0 42 0x1f 1'000 1_000");
    let values: Vec<&str> = tokens[..5].iter().map(|t| t.value.as_str()).collect();
    assert_eq!(values, ["0", "42", "0x1f", "1000", "1000"]);
    for token in &tokens[..5] {
        assert_eq!(token.kind, TokenKind::IntegerLiteral, "{}", token.value);
    }
}

#[test]
fn tokenize_floats() {
    let tokens = tokenize("3.25 1e-5");
    assert_eq!(tokens[0].kind, TokenKind::FloatLiteral);
    assert_eq!(tokens[0].value, "3.25");
    assert_eq!(tokens[1].kind, TokenKind::FloatLiteral);
    assert_eq!(tokens[1].value, "1e-5");

    // Without a following exponent the minus is a separate operator.
    let tokens = tokenize("1.5-2");
    assert_eq!(tokens[0].value, "1.5");
    assert!(tokens[1].is_operator("-"));
    assert_eq!(tokens[2].value, "2");
}

#[test]
fn tokenize_strings() {
    let tokens = tokenize("\"a\\nb\"");
    assert_eq!(tokens[0].kind, TokenKind::StringLiteral);
    assert_eq!(tokens[0].value, "a\nb");

    assert_eq!(tokenize("\"open")[0].kind, TokenKind::ErrorEOTInString);
    assert_eq!(tokenize("\"a\nb\"")[0].kind, TokenKind::ErrorLFInString);
}

#[test]
fn tokenize_comments() {
    for source in ["a // c\nb", "a /* c */ b", "a # c\nb"] {
        let tokens = tokenize(source);
        assert_eq!(tokens[0].value, "a", "{:?}", source);
        assert_eq!(tokens[1].value, "b", "{:?}", source);
        assert_eq!(tokens[2].kind, TokenKind::End, "{:?}", source);
    }
    assert_eq!(
        tokenize("/* open")[0].kind,
        TokenKind::ErrorEOTInBlockComment
    );
}

#[test]
fn tokenize_operators() {
    let tokens = tokenize("<=> <<= == != <= && ++ ? : .");
    let expected = ["<=>", "<<=", "==", "!=", "<=", "&&", "++", "?", ":", "."];
    for (token, op) in tokens.iter().zip(expected) {
        assert!(token.is_operator(op), "got {:?}", token.value);
    }
}

#[test]
fn tokenize_offsets() {
    let tokens = tokenize("ab + cd");
    assert_eq!(tokens[0].offset, 0);
    assert_eq!(tokens[1].offset, 3);
    assert_eq!(tokens[2].offset, 5);
}

#[test]
fn tokenize_invalid_character() {
    assert_eq!(tokenize("`")[0].kind, TokenKind::ErrorInvalidCharacter);
}

#[test]
fn token_captures_cover_the_input() {
    // Outside of strings, comments, and digit separators every input
    // byte is either captured into some token value or whitespace.
    for source in ["a + b", "foo(1, 2)", "x<<=2 ? y : z", "[-8 >> 1, 3.25]"] {
        let captured: usize = tokenize(source).iter().map(|t| t.value.len()).sum();
        let whitespace = source.chars().filter(|c| c.is_whitespace()).count();
        assert_eq!(captured + whitespace, source.len(), "{:?}", source);
    }
}

#[test]
fn concatenation_only_merges_tokens() {
    // Joining two sources can fuse tokens at the seam but never split
    // them, so the joined count never exceeds the two separate counts
    // (with the first End token dropped).
    let pairs = [("a", "b"), ("1.", "5"), ("<", "<"), ("foo ", "(2)"), ("x +", " y")];
    for (s1, s2) in pairs {
        let joined = tokenize(&format!("{}{}", s1, s2)).len();
        let separate = tokenize(s1).len() - 1 + tokenize(s2).len();
        assert!(
            joined <= separate,
            "{:?} + {:?}: {} > {}",
            s1,
            s2,
            joined,
            separate
        );
    }
}

// ── Expressions ────────────────────────────────────────────────────

#[test]
fn expression_precedence() {
    assert_eq!(eval_expr("2 + 3 * 4"), int(14));
    assert_eq!(eval_expr("(2 + 3) * 4"), int(20));
    assert_eq!(eval_expr("-(2 + 3)"), int(-5));
    assert_eq!(eval_expr("2 < 3 == 1 < 2"), Datum::from(true));
}

#[test]
fn expression_unary() {
    assert_eq!(eval_expr("!0"), Datum::from(true));
    assert_eq!(eval_expr("!\"x\""), Datum::from(false));
    assert_eq!(eval_expr("~0"), int(-1));
}

#[test]
fn expression_ternary() {
    assert_eq!(eval_expr("1 ? 2 : 3"), int(2));
    assert_eq!(eval_expr("0 ? 2 : 3"), int(3));
}

#[test]
fn expression_spaceship() {
    assert_eq!(eval_expr("\"a\" <=> \"b\""), int(-1));
    assert_eq!(eval_expr("5 <=> 5.0"), int(0));
}

#[test]
fn expression_assignment_yields_value() {
    assert_eq!(eval_expr("(x = 5) + x"), int(10));
}

#[test]
fn expression_increment() {
    let mut context = Context::new();
    context.set("x", 4i64);
    assert_eq!(eval_expr_with("++x", &context), int(5));
    assert_eq!(eval_expr_with("--x", &context), int(3));
}

#[test]
fn expression_literals_and_indexing() {
    assert_eq!(eval_expr("[1, 2, 3][1 + 1]"), int(3));
    assert_eq!(eval_expr("{\"a\": 41}[\"a\"] + 1"), int(42));
    assert_eq!(eval_expr("{\"a\": 2}.a"), int(2));
    assert_eq!(eval_expr("null"), Datum::null());
    assert_eq!(eval_expr("undefined"), Datum::undefined());
}

#[test]
fn expression_short_circuit() {
    // The operand itself is the result, and the skipped side is never
    // evaluated.
    assert_eq!(eval_expr("0 || 7"), int(7));
    assert_eq!(eval_expr("2 || boom"), int(2));
    assert_eq!(eval_expr("0 && boom"), int(0));
    assert_eq!(eval_expr("2 && 9"), int(9));
}

#[test]
fn expression_unknown_function() {
    let err = eval_expr_err("nope(1)");
    assert_eq!(err.kind, ErrorKind::ParseError);
    assert_eq!(err.message, "Could not find function nope()");
}

#[test]
fn expression_unknown_name() {
    let err = eval_expr_err("missing + 1");
    assert_eq!(err.kind, ErrorKind::NameNotFound);
    assert_eq!(err.message, "Could not find name 'missing'");
}

#[test]
fn expression_registered_function() {
    let mut context = Context::new();
    context.register_function("twice", |_, args| {
        args[0]
            .add(&args[0])
            .map_err(|e| WeftError::new(e.kind, e.message, 0))
    });
    assert_eq!(eval_expr_with("twice(21)", &context), int(42));
}

#[test]
fn expression_registered_filter() {
    let mut context = Context::new();
    context.register_filter("upper", |s| s.to_uppercase());
    assert_eq!(
        eval_expr_with("\"abc\" ! upper", &context),
        Datum::from("ABC")
    );
    let err = eval_expr_err("\"abc\" ! nope");
    assert_eq!(err.kind, ErrorKind::ParseError);
}

#[test]
fn expression_member_assignment() {
    let mut context = Context::new();
    let mut map = BTreeMap::new();
    map.insert(Datum::from("a"), int(1));
    context.set("m", Datum::from(map));

    let pp = PostProcessContext::new(&context);
    let mut ctx = EvalContext::new(&context);

    let mut assign = parse_expression("m.a = 7", 0).unwrap();
    assign.post_process(&pp).unwrap();
    assign.evaluate(&mut ctx).unwrap();

    let mut read = parse_expression("m.a", 0).unwrap();
    read.post_process(&pp).unwrap();
    assert_eq!(read.evaluate(&mut ctx).unwrap(), int(7));
}

#[test]
fn expression_trailing_tokens() {
    let err = eval_expr_err("1 2");
    assert_eq!(err.kind, ErrorKind::ParseError);
}

#[test]
fn expression_end_scan() {
    assert_eq!(find_end_of_expression("a + b} rest", "}"), Some(5));
    // Nested brackets hide the terminator.
    assert_eq!(find_end_of_expression("{\"a\": 1}}", "}"), Some(8));
    assert_eq!(find_end_of_expression("f(a, b)} x", "}"), Some(7));
    assert_eq!(find_end_of_expression("a + b", "}"), None);
}

// ── Templates ──────────────────────────────────────────────────────

#[test]
fn include_renders_inline() {
    let mut loader = MapLoader::new();
    loader.insert("inner.weft", "baz\n");
    let mut parsed = parse_template_with_loader(
        "outer.weft",
        "foo\n#include \"inner.weft\"\nbar\n",
        &loader,
    )
    .unwrap();
    assert_eq!(
        parsed.to_string(),
        "<top <text foo\n><top <text baz\n>><text bar\n>>"
    );
    assert_eq!(parsed.evaluate(&Context::new()).unwrap(), "foo\nbaz\nbar\n");
}

#[test]
fn include_missing_file() {
    let loader = MapLoader::new();
    let err =
        parse_template_with_loader("outer.weft", "#include \"nope.weft\"\n", &loader).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IncludeError);
}

#[test]
fn include_cycle() {
    let mut loader = MapLoader::new();
    loader.insert("a.weft", "#include \"b.weft\"\n");
    loader.insert("b.weft", "#include \"a.weft\"\n");
    let err = parse_template_from_loader("a.weft", &loader).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IncludeError);
    assert!(err.message.contains("cycle"), "{}", err.message);
}

#[test]
fn break_outside_loop() {
    let err = render_err("#break\n");
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    assert_eq!(err.message, "#break or #continue outside of a loop");
}

#[test]
fn return_outside_function() {
    let err = render_err("#return 1\n");
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    assert_eq!(err.message, "#return outside of a function");
}

#[test]
fn break_escaping_a_function_body() {
    let err = render_err("#function f()\n#break\n#end\n${f()}");
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    assert_eq!(err.message, "#break or #continue outside of a loop");
}

#[test]
fn return_inside_a_block() {
    let err = render_err("#block b\n#return 1\n#end\n${b()}");
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    assert!(
        err.message.contains("#return is not allowed inside #block"),
        "{}",
        err.message
    );
}

#[test]
fn function_arity_mismatch() {
    let err = render_err("#function f(a)\n#end\n${f()}");
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    assert_eq!(err.message, "Expecting 1 arguments for f(), got 0");
}

#[test]
fn builtin_arity_mismatch() {
    let err = render_err("${size()}");
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    assert_eq!(
        err.message,
        "Expecting 1 argument for size() function, got 0"
    );
}

#[test]
fn for_over_a_non_vector() {
    let err = render_err("#for x: 42\nb\n#end\n");
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    assert_eq!(err.message, "Expecting a vector for #for, got int");
}

#[test]
fn assigning_a_loop_variable() {
    let err = render_err("#for x: [1]\n# $i = 2\n#end\n");
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    assert!(
        err.message.contains("Can not assign to loop variable"),
        "{}",
        err.message
    );
}

#[test]
fn loop_variable_outside_a_loop() {
    let err = render_err("${$i}");
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
}

#[test]
fn unterminated_placeholder() {
    let err = render_err("${a + b");
    assert_eq!(err.kind, ErrorKind::ParseError);
}

#[test]
fn missing_end() {
    let err = render_err("#if x\n");
    assert_eq!(err.kind, ErrorKind::ParseError);
    assert_eq!(err.message, "Missing #end for #if");
}

#[test]
fn stray_end() {
    let err = render_err("#end\n");
    assert_eq!(err.kind, ErrorKind::ParseError);
    assert_eq!(err.message, "#end without a matching statement");
}

#[test]
fn else_after_else() {
    let err = render_err("#if x\n#else\n#else\n#end\n");
    assert_eq!(err.kind, ErrorKind::ParseError);
}

#[test]
fn do_ended_without_while() {
    let err = render_err("#do\nx\n#end\n");
    assert_eq!(err.kind, ErrorKind::ParseError);
    assert_eq!(err.message, "Expecting #while to end a #do");
}

#[test]
fn for_without_colon() {
    let err = render_err("#for x [1]\n#end\n");
    assert_eq!(err.kind, ErrorKind::ParseError);
    assert_eq!(err.message, "Expecting ':' in #for");
}

#[test]
fn missing_name_reports_name_not_found() {
    let err = render_err("${missing}");
    assert_eq!(err.kind, ErrorKind::NameNotFound);
    assert_eq!(err.message, "Could not find name 'missing'");
}

#[test]
fn empty_vector_pop() {
    let err = render_err("# v = []\n${v.pop()}\n");
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    assert_eq!(err.message, "pop() on an empty vector");
}

#[test]
fn block_body_renders_at_the_call_site() {
    let mut parsed = parse_template("test", "#block title\nDefault\n#end\n[${title()}]").unwrap();
    assert_eq!(parsed.evaluate(&Context::new()).unwrap(), "[Default\n]");
}

#[test]
fn undefined_values_compare_equal() {
    let mut context = Context::new();
    context.set("a", Datum::undefined());
    context.set("b", Datum::undefined());
    let mut parsed = parse_template("test", "${a == b}").unwrap();
    assert_eq!(parsed.evaluate(&context).unwrap(), "true");
}

#[test]
fn include_without_trailing_newline() {
    let mut loader = MapLoader::new();
    loader.insert("child.tmpl", "X");
    let mut parsed =
        parse_template_with_loader("root.tmpl", "#include \"child.tmpl\"\n", &loader).unwrap();
    assert_eq!(parsed.evaluate(&Context::new()).unwrap(), "X");
}

#[test]
fn mid_line_statement_keeps_text_spacing() {
    // Indentation is stripped only when the statement sits on its own
    // line; after other text the spacing belongs to the output.
    assert_eq!(render("a  #if true\nb\n#end\n"), "a  b\n");
    assert_eq!(
        tree("a  #if true\nb\n#end\n"),
        "<top <text a  ><if true<text b\n>>>"
    );
}

#[test]
fn trailing_indentation_is_stripped_at_end_of_input() {
    assert_eq!(render("#if true\nA\n#end\n  "), "A\n");
    assert_eq!(render("#if true\nA\n#end\nb  "), "A\nb  ");
}

#[test]
fn template_display_smoke() {
    assert_eq!(tree("x\n"), "<top <text x\n>>");
    assert_eq!(tree("${1 + 2}"), "<top <placeholder (1 + 2)>>");
    assert_eq!(render("x\n"), "x\n");
}

#[test]
fn error_positions() {
    assert_eq!(
        Position::of("ab\ncd", 4),
        Position {
            line: 1,
            column: 1,
            offset: 4
        }
    );

    let source = "line one\n${1 / 0}\n";
    let err = render_err(source);
    assert_eq!(err.kind, ErrorKind::InvalidOperation);
    assert_eq!(Position::of(source, err.offset).line, 1);
}

#[test]
fn error_display_carries_the_file() {
    let err = render_err("${missing}");
    let rendered = err.to_string();
    assert!(rendered.starts_with("test:"), "{}", rendered);
    assert!(rendered.contains("Could not find name"), "{}", rendered);
}
