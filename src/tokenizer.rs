use std::fmt;
use std::sync::LazyLock;

// ── Tokens ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    NotAssigned,
    Name,
    IntegerLiteral,
    FloatLiteral,
    StringLiteral,
    Operator,
    End,
    ErrorInvalidCharacter,
    ErrorEOTInBlockComment,
    ErrorEOTInString,
    ErrorLFInString,
}

/// A token: `(kind, captured value, byte offset where capture started)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub offset: usize,
}

impl Token {
    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.value == op
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::ErrorInvalidCharacter
                | TokenKind::ErrorEOTInBlockComment
                | TokenKind::ErrorEOTInString
                | TokenKind::ErrorLFInString
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::End => write!(f, "<end>"),
            TokenKind::StringLiteral => write!(f, "\"{}\"", self.value),
            _ => write!(f, "{}", self.value),
        }
    }
}

// ── Transition table ───────────────────────────────────────────────

// One 256-entry sub-table per state. Each entry carries the character to
// append on Capture (possibly a translation, e.g. '\n' from a "\\n"
// escape), the next state, an action bitmask, and the token kind emitted
// on Found.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum State {
    Initial = 0,
    Name,
    MinusOrPlus,
    Zero,
    Dot,
    Number,
    HexNumber,
    Float,
    FloatExponent,
    String,
    StringEscape,
    Slash,
    LineComment,
    BlockComment,
    BlockCommentMaybeEnd,
    OperatorFirstChar,
    OperatorSecondChar,
    OperatorThirdChar,
}

const NR_STATES: usize = 18;

const IDLE: u8 = 0x0;
const CAPTURE: u8 = 0x1; // append the entry's char to the capture buffer
const START: u8 = 0x2; // begin capturing at the current offset
const READ: u8 = 0x4; // advance the input by one byte
const FOUND: u8 = 0x8; // emit a token from the capture buffer

#[derive(Clone, Copy)]
struct Transition {
    ch: u8,
    next: State,
    action: u8,
    kind: TokenKind,
}

impl Transition {
    fn new(ch: u8) -> Transition {
        Transition {
            ch,
            next: State::Initial,
            action: IDLE,
            kind: TokenKind::NotAssigned,
        }
    }
}

fn offset_of(state: State, c: u8) -> usize {
    ((state as usize) << 8) | c as usize
}

fn is_name_first(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$'
}

fn is_name_next(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

type SubTable = [Transition; 256];

fn sub_table(f: impl Fn(u8, &mut Transition)) -> SubTable {
    let mut r = [Transition::new(0); 256];
    for i in 0..256usize {
        let c = i as u8;
        let mut t = Transition::new(c);
        f(c, &mut t);
        r[i] = t;
    }
    r
}

fn table_initial() -> SubTable {
    sub_table(|c, t| {
        if c == 0 {
            t.action = FOUND;
            t.kind = TokenKind::End;
        } else if is_name_first(c) {
            t.next = State::Name;
            t.action = READ | CAPTURE | START;
        } else if c == b'-' || c == b'+' {
            t.next = State::MinusOrPlus;
            t.action = READ | CAPTURE | START;
        } else if c == b'0' {
            t.next = State::Zero;
            t.action = READ | CAPTURE | START;
        } else if c.is_ascii_digit() {
            t.next = State::Number;
            t.action = READ | CAPTURE | START;
        } else if c == b'.' {
            t.next = State::Dot;
            t.action = READ | CAPTURE | START;
        } else if c == b'"' {
            t.next = State::String;
            t.action = READ | START;
        } else if c == b' ' || c == b'\t' || c == b'\r' || c == b'\n' || c == b'\x0c' {
            t.action = READ;
        } else if c == b'#' {
            t.next = State::LineComment;
            t.action = READ;
        } else if c == b'/' {
            t.next = State::Slash;
            t.action = READ | CAPTURE | START;
        } else {
            t.next = State::OperatorFirstChar;
        }
    })
}

fn table_name() -> SubTable {
    sub_table(|c, t| {
        if is_name_next(c) {
            t.next = State::Name;
            t.action = READ | CAPTURE;
        } else {
            t.action = FOUND;
            t.kind = TokenKind::Name;
        }
    })
}

// A '-' or '+' is always an operator; negative literals are formed by the
// parser's unary minus so that `n-1` subtracts.
fn table_minus_or_plus() -> SubTable {
    sub_table(|_, t| {
        t.next = State::OperatorSecondChar;
    })
}

fn table_zero() -> SubTable {
    sub_table(|c, t| {
        if c == b'x' || c == b'X' {
            t.next = State::HexNumber;
            t.action = READ | CAPTURE;
        } else if matches!(c, b'o' | b'O' | b'b' | b'B' | b'd' | b'D') {
            t.next = State::Number;
            t.action = READ | CAPTURE;
        } else {
            t.next = State::Number;
        }
    })
}

fn table_dot() -> SubTable {
    sub_table(|c, t| {
        if c.is_ascii_digit() {
            t.next = State::Float;
        } else {
            t.action = FOUND;
            t.kind = TokenKind::Operator;
        }
    })
}

fn table_number() -> SubTable {
    sub_table(|c, t| {
        if c.is_ascii_digit() {
            t.next = State::Number;
            t.action = READ | CAPTURE;
        } else if c == b'_' || c == b'\'' {
            // Digit separators are consumed but never captured.
            t.next = State::Number;
            t.action = READ;
        } else if c == b'.' {
            t.next = State::Float;
            t.action = READ | CAPTURE;
        } else if c == b'e' || c == b'E' {
            t.next = State::FloatExponent;
            t.action = READ | CAPTURE;
        } else {
            t.action = FOUND;
            t.kind = TokenKind::IntegerLiteral;
        }
    })
}

fn table_hex_number() -> SubTable {
    sub_table(|c, t| {
        if c.is_ascii_hexdigit() {
            t.next = State::HexNumber;
            t.action = READ | CAPTURE;
        } else if c == b'_' || c == b'\'' {
            t.next = State::HexNumber;
            t.action = READ;
        } else {
            t.action = FOUND;
            t.kind = TokenKind::IntegerLiteral;
        }
    })
}

fn table_float() -> SubTable {
    sub_table(|c, t| {
        if c.is_ascii_digit() {
            t.next = State::Float;
            t.action = READ | CAPTURE;
        } else if c == b'_' || c == b'\'' {
            t.next = State::Float;
            t.action = READ;
        } else if c == b'e' || c == b'E' {
            t.next = State::FloatExponent;
            t.action = READ | CAPTURE;
        } else {
            t.action = FOUND;
            t.kind = TokenKind::FloatLiteral;
        }
    })
}

// Directly after the 'e' an exponent sign is still part of the literal.
fn table_float_exponent() -> SubTable {
    sub_table(|c, t| {
        if c.is_ascii_digit() || c == b'-' || c == b'+' {
            t.next = State::Float;
            t.action = READ | CAPTURE;
        } else {
            t.action = FOUND;
            t.kind = TokenKind::FloatLiteral;
        }
    })
}

fn table_string() -> SubTable {
    sub_table(|c, t| {
        if c == 0 {
            t.action = FOUND;
            t.kind = TokenKind::ErrorEOTInString;
        } else if c == b'\n' || c == b'\r' {
            t.action = FOUND;
            t.kind = TokenKind::ErrorLFInString;
        } else if c == b'\\' {
            t.next = State::StringEscape;
            t.action = READ;
        } else if c == b'"' {
            t.action = FOUND | READ;
            t.kind = TokenKind::StringLiteral;
        } else {
            t.next = State::String;
            t.action = READ | CAPTURE;
        }
    })
}

fn table_string_escape() -> SubTable {
    sub_table(|c, t| {
        if c == 0 {
            t.action = FOUND;
            t.kind = TokenKind::ErrorEOTInString;
            return;
        }
        t.ch = match c {
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'v' => 0x0b,
            c => c,
        };
        t.next = State::String;
        t.action = READ | CAPTURE;
    })
}

fn table_slash() -> SubTable {
    sub_table(|c, t| {
        if c == b'/' {
            t.next = State::LineComment;
            t.action = READ;
        } else if c == b'*' {
            t.next = State::BlockComment;
            t.action = READ;
        } else {
            t.next = State::OperatorSecondChar;
        }
    })
}

fn table_line_comment() -> SubTable {
    sub_table(|c, t| {
        if c == 0 {
            t.next = State::Initial;
        } else if c == b'\n' || c == b'\r' {
            t.next = State::Initial;
            t.action = READ;
        } else {
            t.next = State::LineComment;
            t.action = READ;
        }
    })
}

fn table_block_comment() -> SubTable {
    sub_table(|c, t| {
        if c == 0 {
            t.action = FOUND;
            t.kind = TokenKind::ErrorEOTInBlockComment;
        } else if c == b'*' {
            t.next = State::BlockCommentMaybeEnd;
            t.action = READ;
        } else {
            t.next = State::BlockComment;
            t.action = READ;
        }
    })
}

fn table_block_comment_maybe_end() -> SubTable {
    sub_table(|c, t| {
        if c == 0 {
            t.action = FOUND;
            t.kind = TokenKind::ErrorEOTInBlockComment;
        } else if c == b'/' {
            t.next = State::Initial;
            t.action = READ;
        } else if c == b'*' {
            t.next = State::BlockCommentMaybeEnd;
            t.action = READ;
        } else {
            t.next = State::BlockComment;
            t.action = READ;
        }
    })
}

fn table_operator_first_char() -> SubTable {
    sub_table(|c, t| {
        match c {
            // Single-character operators.
            b'.' | b';' | b',' | b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'?' | b'@'
            | b'$' | b'~' => {
                t.action = FOUND | READ | CAPTURE | START;
                t.kind = TokenKind::Operator;
            }
            // Operators that may continue with a second character.
            b'!' | b'<' | b'>' | b'=' | b'+' | b'-' | b'*' | b'%' | b'/' | b'|' | b'&'
            | b'^' | b':' => {
                t.next = State::OperatorSecondChar;
                t.action = READ | CAPTURE | START;
            }
            _ => {
                t.action = FOUND | READ | CAPTURE | START;
                t.kind = TokenKind::ErrorInvalidCharacter;
            }
        }
    })
}

fn table_operator_second_char() -> SubTable {
    sub_table(|c, t| match c {
        // Possible three-character operators: <=>, <<=, >>=.
        b'=' | b'<' | b'>' => {
            t.next = State::OperatorThirdChar;
            t.action = READ | CAPTURE;
        }
        b'-' | b'+' | b'*' | b'&' | b'|' | b'^' => {
            t.action = FOUND | READ | CAPTURE;
            t.kind = TokenKind::Operator;
        }
        _ => {
            t.action = FOUND;
            t.kind = TokenKind::Operator;
        }
    })
}

fn table_operator_third_char() -> SubTable {
    sub_table(|c, t| match c {
        b'>' | b'=' => {
            t.action = FOUND | READ | CAPTURE;
            t.kind = TokenKind::Operator;
        }
        _ => {
            t.action = FOUND;
            t.kind = TokenKind::Operator;
        }
    })
}

fn build_table() -> Vec<Transition> {
    let mut r = Vec::with_capacity(NR_STATES * 256);
    r.extend_from_slice(&table_initial());
    r.extend_from_slice(&table_name());
    r.extend_from_slice(&table_minus_or_plus());
    r.extend_from_slice(&table_zero());
    r.extend_from_slice(&table_dot());
    r.extend_from_slice(&table_number());
    r.extend_from_slice(&table_hex_number());
    r.extend_from_slice(&table_float());
    r.extend_from_slice(&table_float_exponent());
    r.extend_from_slice(&table_string());
    r.extend_from_slice(&table_string_escape());
    r.extend_from_slice(&table_slash());
    r.extend_from_slice(&table_line_comment());
    r.extend_from_slice(&table_block_comment());
    r.extend_from_slice(&table_block_comment_maybe_end());
    r.extend_from_slice(&table_operator_first_char());
    r.extend_from_slice(&table_operator_second_char());
    r.extend_from_slice(&table_operator_third_char());
    optimize_table(&mut r);
    r
}

// Repeatedly replace every idle entry with the entry it would transition
// to, so that the run loop never visits a state that does no work. The
// table is loop-free for idle entries, so this reaches a fixed point.
fn optimize_table(table: &mut [Transition]) {
    for _ in 0..10 {
        let mut changed = false;
        for i in 0..table.len() {
            if table[i].action == IDLE {
                let replacement = table[offset_of(table[i].next, (i & 0xff) as u8)];
                if replacement.action != IDLE {
                    table[i] = replacement;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

static TRANSITION_TABLE: LazyLock<Vec<Transition>> = LazyLock::new(build_table);

// ── Run loop ───────────────────────────────────────────────────────

pub struct Tokenizer<'a> {
    bytes: &'a [u8],
    state: State,
    index: usize,
    capture_offset: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(text: &'a str) -> Tokenizer<'a> {
        Tokenizer {
            bytes: text.as_bytes(),
            state: State::Initial,
            index: 0,
            capture_offset: 0,
        }
    }

    pub fn next_token(&mut self) -> Token {
        let table = &*TRANSITION_TABLE;
        let mut capture: Vec<u8> = Vec::new();

        let transition = loop {
            if self.index == self.bytes.len() {
                // Simulate one final NUL lookup so the in-flight token is
                // closed, or an End token is emitted from Initial.
                if self.state == State::Initial {
                    self.capture_offset = self.index;
                    capture.clear();
                }
                let transition = table[offset_of(self.state, 0)];
                self.state = transition.next;
                break transition;
            }

            let transition = table[offset_of(self.state, self.bytes[self.index])];
            if transition.action & START != 0 {
                self.capture_offset = self.index;
                capture.clear();
            }
            if transition.action & CAPTURE != 0 {
                capture.push(transition.ch);
            }
            if transition.action & READ != 0 {
                self.index += 1;
            }
            self.state = transition.next;

            if transition.action & FOUND != 0 {
                break transition;
            }
        };

        Token {
            kind: transition.kind,
            value: String::from_utf8_lossy(&capture).into_owned(),
            offset: self.capture_offset,
        }
    }

    pub fn tokens(mut self) -> Vec<Token> {
        let mut r = Vec::new();
        loop {
            let token = self.next_token();
            let is_end = token.kind == TokenKind::End;
            r.push(token);
            if is_end {
                break;
            }
        }
        r
    }
}

/// Tokenize a complete source string; the last token is always `End`.
pub fn tokenize(text: &str) -> Vec<Token> {
    Tokenizer::new(text).tokens()
}
