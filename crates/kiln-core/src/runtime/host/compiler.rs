//! Program build for the host runtime.
//!
//! The host runtime does not generate code. A build checks that the source is
//! well formed (comments, literals, balanced delimiters, preprocessor
//! directives), discovers the `__kernel` entry points and their parameter
//! lists, and binds each one to a host implementation. Problems are reported
//! in a clang-style build log.

use std::collections::HashSet;
use std::fmt::Write as _;

use super::library::KernelLibrary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamKind {
    /// `__global` or `__constant` pointer, bound to a memory object.
    Global,
    /// `__local` pointer, bound by size.
    Local,
    /// Plain value; the size is known for built-in types.
    Scalar(Option<usize>),
}

#[derive(Debug, Clone)]
pub(crate) struct ParamDecl {
    pub(crate) name: String,
    pub(crate) kind: ParamKind,
}

#[derive(Debug, Clone)]
pub(crate) struct KernelDecl {
    pub(crate) name: String,
    pub(crate) params: Vec<ParamDecl>,
}

#[derive(Debug)]
pub(crate) struct Compiled {
    pub(crate) kernels: Vec<KernelDecl>,
    pub(crate) log: String,
}

#[derive(Debug)]
pub(crate) enum CompileError {
    /// The option string was rejected before compiling.
    Options(String),
    /// Compilation failed; the payload is the build log.
    Failed(String),
}

pub(crate) fn compile(source: &str, options: &str, library: &KernelLibrary) -> Result<Compiled, CompileError> {
    let opts = BuildOptions::parse(options).map_err(CompileError::Options)?;
    let mut diag = Diagnostics::new(source, &opts);

    let mut code = source.as_bytes().to_vec();
    strip_comments(&mut code, &mut diag);
    preprocess(&mut code, &mut diag);
    if diag.errors == 0 {
        check_delimiters(&code, &mut diag);
    }

    let mut kernels = Vec::new();
    if diag.errors == 0 {
        let tokens = tokenize(&code);
        kernels = find_kernels(&tokens, &mut diag);
        bind_kernels(&kernels, &tokens, library, &mut diag);
    }

    let (ok, log) = diag.finish();
    if ok {
        Ok(Compiled { kernels, log })
    } else {
        Err(CompileError::Failed(log))
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BuildOptions {
    defines: Vec<String>,
    warnings_as_errors: bool,
    suppress_warnings: bool,
}

impl BuildOptions {
    fn parse(options: &str) -> Result<Self, String> {
        let mut opts = BuildOptions::default();
        let mut words = options.split_whitespace();
        while let Some(word) = words.next() {
            match word {
                "-D" => opts.defines.push(words.next().ok_or("-D requires an argument")?.to_string()),
                "-I" => {
                    words.next().ok_or("-I requires an argument")?;
                }
                "-Werror" => opts.warnings_as_errors = true,
                "-w" => opts.suppress_warnings = true,
                w if w.starts_with("-D") => opts.defines.push(w[2..].to_string()),
                w if w.starts_with("-I") || w.starts_with("-cl-") => {}
                other => return Err(format!("unrecognized build option '{}'", other)),
            }
        }
        Ok(opts)
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

struct Diagnostics<'s> {
    lines: Vec<&'s str>,
    line_starts: Vec<usize>,
    errors: usize,
    warnings: usize,
    warnings_as_errors: bool,
    suppress_warnings: bool,
    text: String,
}

impl<'s> Diagnostics<'s> {
    fn new(source: &'s str, opts: &BuildOptions) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(source.bytes().enumerate().filter(|(_, b)| *b == b'\n').map(|(i, _)| i + 1));
        Self {
            lines: source.split('\n').collect(),
            line_starts,
            errors: 0,
            warnings: 0,
            warnings_as_errors: opts.warnings_as_errors,
            suppress_warnings: opts.suppress_warnings,
            text: String::new(),
        }
    }

    /// 1-based line and column of a byte offset.
    fn position(&self, offset: usize) -> (usize, usize) {
        let line = self.line_starts.partition_point(|&start| start <= offset);
        let start = self.line_starts[line.saturating_sub(1)];
        (line.max(1), offset - start + 1)
    }

    fn error(&mut self, offset: usize, message: impl AsRef<str>) {
        self.errors += 1;
        self.emit("error", offset, message.as_ref());
    }

    fn warning(&mut self, offset: usize, message: impl AsRef<str>) {
        if self.warnings_as_errors {
            self.error(offset, message);
        } else if !self.suppress_warnings {
            self.warnings += 1;
            self.emit("warning", offset, message.as_ref());
        }
    }

    fn note(&mut self, offset: usize, message: &str) {
        self.emit("note", offset, message);
    }

    fn emit(&mut self, level: &str, offset: usize, message: &str) {
        let (line, col) = self.position(offset);
        let _ = writeln!(self.text, "<source>:{}:{}: {}: {}", line, col, level, message);
        if let Some(src) = self.lines.get(line - 1) {
            let _ = writeln!(self.text, "{}", src.trim_end_matches('\r'));
            let _ = writeln!(self.text, "{}^", " ".repeat(col - 1));
        }
    }

    fn finish(mut self) -> (bool, String) {
        let plural = |n: usize| if n == 1 { "" } else { "s" };
        match (self.warnings, self.errors) {
            (0, 0) => {}
            (w, 0) => {
                let _ = writeln!(self.text, "{} warning{} generated.", w, plural(w));
            }
            (0, e) => {
                let _ = writeln!(self.text, "{} error{} generated.", e, plural(e));
            }
            (w, e) => {
                let _ = writeln!(self.text, "{} warning{} and {} error{} generated.", w, plural(w), e, plural(e));
            }
        }
        (self.errors == 0, self.text)
    }
}

// ---------------------------------------------------------------------------
// Lexical passes
// ---------------------------------------------------------------------------

/// Byte length of a string or character literal starting at `start`, or
/// `None` when it is not terminated on its line.
fn literal_len(code: &[u8], start: usize) -> Option<usize> {
    let quote = code[start];
    let mut i = start + 1;
    while i < code.len() {
        match code[i] {
            b'\\' => i += 2,
            b'\n' => return None,
            c if c == quote => return Some(i + 1 - start),
            _ => i += 1,
        }
    }
    None
}

/// Blank out comments in place, keeping newlines so offsets stay valid.
fn strip_comments(code: &mut [u8], diag: &mut Diagnostics<'_>) {
    let mut i = 0;
    while i < code.len() {
        match (code[i], code.get(i + 1)) {
            (b'"' | b'\'', _) => match literal_len(code, i) {
                Some(len) => i += len,
                None => {
                    let quote = code[i] as char;
                    diag.error(i, format!("missing terminating {} character", quote));
                    i += 1;
                }
            },
            (b'/', Some(b'/')) => {
                while i < code.len() && code[i] != b'\n' {
                    code[i] = b' ';
                    i += 1;
                }
            }
            (b'/', Some(b'*')) => {
                let start = i;
                let end = code[i + 2..].windows(2).position(|w| w == b"*/").map(|p| i + 2 + p + 2);
                let end = match end {
                    Some(end) => end,
                    None => {
                        diag.error(start, "unterminated /* comment");
                        code.len()
                    }
                };
                for b in &mut code[start..end] {
                    if *b != b'\n' {
                        *b = b' ';
                    }
                }
                i = end;
            }
            _ => i += 1,
        }
    }
}

const DIRECTIVES: &[&str] = &[
    "define", "undef", "if", "ifdef", "ifndef", "elif", "else", "endif", "include", "pragma", "line", "error",
    "warning",
];

/// Check and blank preprocessor lines. Conditional blocks are not evaluated.
fn preprocess(code: &mut [u8], diag: &mut Diagnostics<'_>) {
    let mut start = 0;
    let mut continued = false;
    while start < code.len() {
        let end = code[start..].iter().position(|&b| b == b'\n').map_or(code.len(), |p| start + p);
        let line = &code[start..end];
        let trimmed_at = line.iter().position(|b| !b.is_ascii_whitespace());
        let is_directive = continued || trimmed_at.map_or(false, |p| line[p] == b'#');

        if is_directive {
            if !continued {
                if let Some(hash) = trimmed_at {
                    directive(line, start, start + hash, diag);
                }
            }
            continued = line.iter().rev().find(|b| !b.is_ascii_whitespace()) == Some(&b'\\');
            for b in &mut code[start..end] {
                *b = b' ';
            }
        }
        start = end + 1;
    }
}

fn directive(line: &[u8], line_start: usize, hash: usize, diag: &mut Diagnostics<'_>) {
    let text = String::from_utf8_lossy(&line[hash - line_start + 1..]);
    let text = text.trim_start();
    let name: String = text.chars().take_while(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
    let rest = text[name.len()..].trim();
    match name.as_str() {
        "" => {}
        "error" => diag.error(hash, rest),
        "warning" => diag.warning(hash, rest),
        "define" if rest.is_empty() => diag.error(hash, "macro name missing"),
        n if DIRECTIVES.contains(&n) => {}
        _ => diag.error(hash, "invalid preprocessing directive"),
    }
}

fn check_delimiters(code: &[u8], diag: &mut Diagnostics<'_>) {
    let mut stack: Vec<(u8, usize)> = Vec::new();
    let mut i = 0;
    while i < code.len() {
        let c = code[i];
        match c {
            b'"' | b'\'' => {
                i += literal_len(code, i).unwrap_or(1);
                continue;
            }
            b'(' | b'[' | b'{' => stack.push((c, i)),
            b')' | b']' | b'}' => {
                let open = match c {
                    b')' => b'(',
                    b']' => b'[',
                    _ => b'{',
                };
                match stack.pop() {
                    Some((o, _)) if o == open => {}
                    Some((o, at)) => {
                        diag.error(i, format!("expected '{}'", closing(o)));
                        diag.note(at, &format!("to match this '{}'", o as char));
                        return;
                    }
                    None => {
                        diag.error(i, format!("extraneous closing '{}'", c as char));
                        return;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    if let Some((o, at)) = stack.pop() {
        diag.error(code.len(), format!("expected '{}'", closing(o)));
        diag.note(at, &format!("to match this '{}'", o as char));
    }
}

fn closing(open: u8) -> char {
    match open {
        b'(' => ')',
        b'[' => ']',
        _ => '}',
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Punct(u8),
    Other,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    at: usize,
}

impl Token {
    fn is_ident(&self, name: &str) -> bool {
        matches!(&self.tok, Tok::Ident(s) if s == name)
    }

    fn is_punct(&self, c: u8) -> bool {
        self.tok == Tok::Punct(c)
    }
}

fn tokenize(code: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < code.len() {
        let c = code[i];
        if c.is_ascii_whitespace() {
            i += 1;
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < code.len() && (code[i].is_ascii_alphanumeric() || code[i] == b'_') {
                i += 1;
            }
            let ident = String::from_utf8_lossy(&code[start..i]).into_owned();
            tokens.push(Token { tok: Tok::Ident(ident), at: start });
        } else if c.is_ascii_digit() {
            let start = i;
            while i < code.len() && (code[i].is_ascii_alphanumeric() || code[i] == b'.') {
                i += 1;
            }
            tokens.push(Token { tok: Tok::Other, at: start });
        } else if c == b'"' || c == b'\'' {
            tokens.push(Token { tok: Tok::Other, at: i });
            i += literal_len(code, i).unwrap_or(1);
        } else {
            tokens.push(Token { tok: Tok::Punct(c), at: i });
            i += 1;
        }
    }
    tokens
}

// ---------------------------------------------------------------------------
// Kernel discovery
// ---------------------------------------------------------------------------

/// Skip `__attribute__((...))` groups starting at `i`.
fn skip_attributes(tokens: &[Token], mut i: usize) -> usize {
    while tokens.get(i).map_or(false, |t| t.is_ident("__attribute__")) {
        i += 1;
        if tokens.get(i).map_or(false, |t| t.is_punct(b'(')) {
            i = matching(tokens, i).map_or(tokens.len(), |close| close + 1);
        }
    }
    i
}

/// Index of the token closing the group opened at `open`.
fn matching(tokens: &[Token], open: usize) -> Option<usize> {
    let (o, c) = match tokens[open].tok {
        Tok::Punct(b'(') => (b'(', b')'),
        Tok::Punct(b'{') => (b'{', b'}'),
        _ => return None,
    };
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        if t.is_punct(o) {
            depth += 1;
        } else if t.is_punct(c) {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

fn find_kernels(tokens: &[Token], diag: &mut Diagnostics<'_>) -> Vec<KernelDecl> {
    let mut kernels: Vec<KernelDecl> = Vec::new();
    let mut seen = HashSet::new();
    let mut i = 0;
    while i < tokens.len() {
        if !(tokens[i].is_ident("__kernel") || tokens[i].is_ident("kernel")) {
            i += 1;
            continue;
        }
        let at_qualifier = tokens[i].at;
        i = skip_attributes(tokens, i + 1);

        match tokens.get(i) {
            Some(t) if t.is_ident("void") => i += 1,
            Some(t) => {
                diag.error(t.at, "kernel must have void return type");
                i += 1;
                continue;
            }
            None => {
                diag.error(at_qualifier, "expected kernel declaration");
                break;
            }
        }
        i = skip_attributes(tokens, i);

        let (name, name_at) = match tokens.get(i) {
            Some(Token { tok: Tok::Ident(name), at }) => (name.clone(), *at),
            Some(t) => {
                diag.error(t.at, "expected kernel name");
                i += 1;
                continue;
            }
            None => {
                diag.error(at_qualifier, "expected kernel name");
                break;
            }
        };
        i += 1;

        let open = match tokens.get(i) {
            Some(t) if t.is_punct(b'(') => i,
            _ => {
                diag.error(name_at, "expected '(' after kernel name");
                continue;
            }
        };
        let close = match matching(tokens, open) {
            Some(close) => close,
            None => break,
        };
        let params = parse_params(&tokens[open + 1..close], tokens[open].at, diag);
        i = close + 1;

        match tokens.get(i) {
            Some(t) if t.is_punct(b';') => {
                i += 1;
            }
            Some(t) if t.is_punct(b'{') => {
                if !seen.insert(name.clone()) {
                    diag.error(name_at, format!("redefinition of '{}'", name));
                } else {
                    kernels.push(KernelDecl { name, params });
                }
                i = matching(tokens, i).map_or(tokens.len(), |close| close + 1);
            }
            Some(t) => {
                diag.error(t.at, "expected function body after kernel declarator");
                i += 1;
            }
            None => diag.error(tokens[close].at, "expected function body after kernel declarator"),
        }
    }
    kernels
}

const QUALIFIERS: &[&str] = &["const", "volatile", "restrict", "__restrict", "__private", "private"];
const GLOBAL_SPACES: &[&str] = &["__global", "global", "__constant", "constant"];
const LOCAL_SPACES: &[&str] = &["__local", "local"];

fn parse_params(tokens: &[Token], open_at: usize, diag: &mut Diagnostics<'_>) -> Vec<ParamDecl> {
    if tokens.is_empty() || (tokens.len() == 1 && tokens[0].is_ident("void")) {
        return Vec::new();
    }

    let mut groups: Vec<&[Token]> = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, t) in tokens.iter().enumerate() {
        match t.tok {
            Tok::Punct(b'(') | Tok::Punct(b'[') => depth += 1,
            Tok::Punct(b')') | Tok::Punct(b']') => depth = depth.saturating_sub(1),
            Tok::Punct(b',') if depth == 0 => {
                groups.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    groups.push(&tokens[start..]);

    let mut params = Vec::with_capacity(groups.len());
    for group in groups {
        let Some(first) = group.first() else {
            diag.error(open_at, "expected parameter declarator");
            continue;
        };
        let idents: Vec<&str> = group
            .iter()
            .filter_map(|t| match &t.tok {
                Tok::Ident(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        let pointer = group.iter().any(|t| t.is_punct(b'*') || t.is_punct(b'['));
        let global = idents.iter().any(|s| GLOBAL_SPACES.contains(s));
        let local = idents.iter().any(|s| LOCAL_SPACES.contains(s));
        let name = if idents.len() > 1 { idents[idents.len() - 1] } else { "" };

        let kind = match (pointer, global, local) {
            (true, true, false) => ParamKind::Global,
            (true, false, true) => ParamKind::Local,
            (true, false, false) => {
                diag.error(first.at, "kernel pointer arguments must point to addrSpace global, local, or constant");
                continue;
            }
            (true, true, true) => {
                diag.error(first.at, "conflicting address space qualifiers");
                continue;
            }
            (false, false, false) => {
                let ty: Vec<&str> = idents
                    .iter()
                    .take(idents.len().saturating_sub(if name.is_empty() { 0 } else { 1 }))
                    .filter(|s| !QUALIFIERS.contains(s))
                    .copied()
                    .collect();
                ParamKind::Scalar(scalar_size(&ty.join(" ")))
            }
            (false, _, _) => {
                diag.error(first.at, "address space qualifier on a non-pointer kernel argument");
                continue;
            }
        };
        params.push(ParamDecl { name: name.to_string(), kind });
    }
    params
}

/// Size in bytes of an OpenCL C built-in scalar or vector type.
fn scalar_size(ty: &str) -> Option<usize> {
    let base = |t: &str| -> Option<usize> {
        Some(match t {
            "bool" | "char" | "uchar" | "signed char" | "unsigned char" => 1,
            "short" | "ushort" | "unsigned short" | "half" => 2,
            "int" | "uint" | "unsigned" | "unsigned int" | "float" => 4,
            "long" | "ulong" | "unsigned long" | "double" | "size_t" | "ptrdiff_t" | "intptr_t" | "uintptr_t" => 8,
            _ => return None,
        })
    };
    if let Some(size) = base(ty) {
        return Some(size);
    }
    let digits = ty.len() - ty.bytes().rev().take_while(u8::is_ascii_digit).count();
    let (elem, width) = ty.split_at(digits);
    let lanes = match width {
        "2" => 2,
        "3" | "4" => 4,
        "8" => 8,
        "16" => 16,
        _ => return None,
    };
    base(elem).map(|size| size * lanes)
}

fn bind_kernels(kernels: &[KernelDecl], tokens: &[Token], library: &KernelLibrary, diag: &mut Diagnostics<'_>) {
    if kernels.is_empty() {
        let at = tokens.first().map_or(0, |t| t.at);
        diag.error(at, "program contains no kernel definitions");
        return;
    }
    for kernel in kernels {
        if !library.contains(&kernel.name) {
            let at = tokens
                .iter()
                .find(|t| t.is_ident(&kernel.name))
                .map_or(0, |t| t.at);
            diag.error(at, format!("kernel '{}' has no host implementation", kernel.name));
        }
    }
}
