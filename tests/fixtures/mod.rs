//! Hand-assembled grammars for the end-to-end parser tests: each one is a
//! small LR table plus a character-level lex function.

#![allow(dead_code)]

use std::sync::Arc;

use arbor::{
    ExternalScanner, ExternalScannerDef, Language, LanguageBuilder, LexerRef, ParseAction,
    ScannerError, Subtree, Symbol, EOF_SYMBOL,
};

pub fn shift(state: u16) -> ParseAction {
    ParseAction::Shift {
        state,
        extra: false,
        repetition: false,
    }
}

pub fn reduce(symbol: Symbol, child_count: u16) -> ParseAction {
    ParseAction::Reduce {
        symbol,
        child_count,
        dynamic_precedence: 0,
        production_id: 0,
    }
}

pub fn reduce_with(
    symbol: Symbol,
    child_count: u16,
    dynamic_precedence: i32,
    production_id: u16,
) -> ParseAction {
    ParseAction::Reduce {
        symbol,
        child_count,
        dynamic_precedence,
        production_id,
    }
}

/// A lex function recognizing single-character tokens from a fixed map.
pub fn char_lexer(
    tokens: Vec<(char, Symbol)>,
) -> impl Fn(&mut LexerRef<'_, '_>, u16) -> bool + 'static {
    move |lexer, _state| {
        while lexer.lookahead() == i32::from(b' ') {
            lexer.advance(true);
        }
        if lexer.eof() {
            lexer.mark_end();
            lexer.set_result(EOF_SYMBOL);
            return true;
        }
        for &(ch, symbol) in &tokens {
            if lexer.lookahead() == ch as i32 {
                lexer.advance(false);
                lexer.mark_end();
                lexer.set_result(symbol);
                return true;
            }
        }
        false
    }
}

/// The leaves of a tree in source order.
pub fn leaves(tree: &Subtree) -> Vec<Subtree> {
    let mut result = Vec::new();
    let mut stack = vec![tree.clone()];
    while let Some(tree) = stack.pop() {
        if tree.child_count() == 0 {
            result.push(tree);
        } else {
            stack.extend(tree.children().iter().rev().cloned());
        }
    }
    result
}

/// Find the first descendant satisfying a predicate.
pub fn find_node(tree: &Subtree, predicate: impl Fn(&Subtree) -> bool) -> Option<Subtree> {
    let mut stack = vec![tree.clone()];
    while let Some(tree) = stack.pop() {
        if predicate(&tree) {
            return Some(tree);
        }
        stack.extend(tree.children().iter().rev().cloned());
    }
    None
}

// ---------------------------------------------------------------------------
// pair: S -> a b
// ---------------------------------------------------------------------------

pub struct PairGrammar {
    pub language: Language,
    pub a: Symbol,
    pub b: Symbol,
    pub rule: Symbol,
}

pub fn pair_language() -> PairGrammar {
    let mut builder = LanguageBuilder::new("pair");
    let a = builder.token("a");
    let b = builder.token("b");
    let rule = builder.non_terminal("pair");
    let language = builder
        .add_action(1, a, shift(2))
        .add_action(2, b, shift(3))
        .add_action(3, EOF_SYMBOL, reduce(rule, 2))
        .add_goto(1, rule, 4)
        .add_action(4, EOF_SYMBOL, ParseAction::Accept)
        .lex_with(char_lexer(vec![('a', a), ('b', b)]))
        .build();
    PairGrammar {
        language,
        a,
        b,
        rule,
    }
}

// ---------------------------------------------------------------------------
// triple: S -> A B C;  A -> a;  B -> b;  C -> c
// ---------------------------------------------------------------------------

pub struct TripleGrammar {
    pub language: Language,
    pub a: Symbol,
    pub b: Symbol,
    pub c: Symbol,
    pub s: Symbol,
}

pub fn triple_language() -> TripleGrammar {
    let mut builder = LanguageBuilder::new("triple");
    let a = builder.token("a");
    let b = builder.token("b");
    let c = builder.token("c");
    let s = builder.non_terminal("S");
    let rule_a = builder.non_terminal("A");
    let rule_b = builder.non_terminal("B");
    let rule_c = builder.non_terminal("C");
    let language = builder
        .add_action(1, a, shift(2))
        .add_goto(1, rule_a, 3)
        .add_goto(1, s, 9)
        .add_action(2, b, reduce(rule_a, 1))
        .add_action(3, b, shift(4))
        .add_goto(3, rule_b, 5)
        .add_action(4, c, reduce(rule_b, 1))
        .add_action(5, c, shift(6))
        .add_goto(5, rule_c, 7)
        .add_action(6, EOF_SYMBOL, reduce(rule_c, 1))
        .add_action(7, EOF_SYMBOL, reduce(s, 3))
        .add_action(9, EOF_SYMBOL, ParseAction::Accept)
        .lex_with(char_lexer(vec![('a', a), ('b', b), ('c', c)]))
        .build();
    TripleGrammar {
        language,
        a,
        b,
        c,
        s,
    }
}

// ---------------------------------------------------------------------------
// ambig: E -> x (dynamic precedence 0) | x (dynamic precedence 5)
// ---------------------------------------------------------------------------

pub struct AmbigGrammar {
    pub language: Language,
    pub x: Symbol,
    pub expr: Symbol,
}

pub fn ambig_language() -> AmbigGrammar {
    let mut builder = LanguageBuilder::new("ambig");
    let x = builder.token("x");
    let expr = builder.non_terminal("expr");
    let language = builder
        .add_action(1, x, shift(2))
        .add_goto(1, expr, 3)
        .add_actions(
            2,
            EOF_SYMBOL,
            [reduce_with(expr, 1, 0, 1), reduce_with(expr, 1, 5, 2)],
        )
        .add_action(3, EOF_SYMBOL, ParseAction::Accept)
        .lex_with(char_lexer(vec![('x', x)]))
        .build();
    AmbigGrammar { language, x, expr }
}

// ---------------------------------------------------------------------------
// repeat: S -> _repeat;  _repeat -> _repeat a | a   (hidden repetition)
// ---------------------------------------------------------------------------

pub struct RepeatGrammar {
    pub language: Language,
    pub a: Symbol,
    pub s: Symbol,
    pub repeat: Symbol,
}

pub fn repeat_language() -> RepeatGrammar {
    let mut builder = LanguageBuilder::new("repeat");
    let a = builder.token("a");
    let s = builder.non_terminal("S");
    let repeat = builder.hidden_non_terminal("_repeat");
    let language = builder
        .add_action(1, a, shift(2))
        .add_goto(1, repeat, 3)
        .add_goto(1, s, 6)
        .add_action(2, a, reduce(repeat, 1))
        .add_action(2, EOF_SYMBOL, reduce(repeat, 1))
        .add_action(3, a, shift(4))
        .add_action(3, EOF_SYMBOL, reduce(s, 1))
        .add_action(4, a, reduce_with(repeat, 2, 0, 1))
        .add_action(4, EOF_SYMBOL, reduce_with(repeat, 2, 0, 1))
        .add_action(6, EOF_SYMBOL, ParseAction::Accept)
        .lex_with(char_lexer(vec![('a', a)]))
        .build();
    RepeatGrammar {
        language,
        a,
        s,
        repeat,
    }
}

// ---------------------------------------------------------------------------
// conflict: S -> x y | E y;  E -> x   (forked by a reduce+shift entry)
// ---------------------------------------------------------------------------

pub struct ConflictGrammar {
    pub language: Language,
    pub x: Symbol,
    pub y: Symbol,
    pub s: Symbol,
    pub e: Symbol,
}

pub fn conflict_language() -> ConflictGrammar {
    let mut builder = LanguageBuilder::new("conflict");
    let x = builder.token("x");
    let y = builder.token("y");
    let s = builder.non_terminal("S");
    let e = builder.non_terminal("E");
    let language = builder
        // On `y` after `x`, the reduce forks a version into the E
        // interpretation while the shift keeps the raw-x interpretation
        // alive. Both then shift `y` into the same state, forcing a stack
        // merge with two distinct links.
        .add_action(1, x, shift(2))
        .add_goto(1, e, 3)
        .add_goto(1, s, 6)
        .add_actions(2, y, [reduce(e, 1), shift(4)])
        .add_action(3, y, shift(4))
        .add_action(4, EOF_SYMBOL, reduce(s, 2))
        .add_action(6, EOF_SYMBOL, ParseAction::Accept)
        .lex_with(char_lexer(vec![('x', x), ('y', y)]))
        .build();
    ConflictGrammar {
        language,
        x,
        y,
        s,
        e,
    }
}

// ---------------------------------------------------------------------------
// hash: S -> hashes a, where `hashes` comes from an external scanner
// ---------------------------------------------------------------------------

pub struct HashGrammar {
    pub language: Language,
    pub hashes: Symbol,
    pub a: Symbol,
    pub s: Symbol,
}

struct HashScanner {
    tokens_scanned: u8,
    fail: bool,
}

impl ExternalScanner for HashScanner {
    fn scan(
        &mut self,
        lexer: &mut LexerRef<'_, '_>,
        valid_tokens: &[bool],
    ) -> Result<bool, ScannerError> {
        if self.fail {
            return Err(ScannerError("hash scanner failure".to_string()));
        }
        if !valid_tokens.first().copied().unwrap_or(false) {
            return Ok(false);
        }
        if lexer.lookahead() != i32::from(b'#') {
            return Ok(false);
        }
        while lexer.lookahead() == i32::from(b'#') {
            lexer.advance(false);
        }
        lexer.mark_end();
        lexer.set_result(0);
        self.tokens_scanned += 1;
        Ok(true)
    }

    fn serialize(&mut self, buffer: &mut [u8]) -> usize {
        buffer[0] = self.tokens_scanned;
        1
    }

    fn deserialize(&mut self, buffer: &[u8]) {
        self.tokens_scanned = buffer.first().copied().unwrap_or(0);
    }
}

pub fn hash_language(fail: bool) -> HashGrammar {
    let mut builder = LanguageBuilder::new("hash");
    let hashes = builder.token("hashes");
    let a = builder.token("a");
    let s = builder.non_terminal("S");
    let language = builder
        .add_action(1, hashes, shift(2))
        .add_action(2, a, shift(3))
        .add_action(3, EOF_SYMBOL, reduce(s, 2))
        .add_goto(1, s, 4)
        .add_action(4, EOF_SYMBOL, ParseAction::Accept)
        .lex_mode(1, 0, 1)
        .lex_with(char_lexer(vec![('a', a)]))
        .external_scanner(ExternalScannerDef {
            symbol_map: vec![hashes],
            states: vec![vec![], vec![true]],
            create: Arc::new(move || {
                Box::new(HashScanner {
                    tokens_scanned: 0,
                    fail,
                }) as Box<dyn ExternalScanner>
            }),
        })
        .build();
    HashGrammar {
        language,
        hashes,
        a,
        s,
    }
}

// ---------------------------------------------------------------------------
// keyword: S -> "if" word, with keyword extraction through a word token
// ---------------------------------------------------------------------------

pub struct KeywordGrammar {
    pub language: Language,
    pub word: Symbol,
    pub keyword: Symbol,
    pub s: Symbol,
}

pub fn keyword_language() -> KeywordGrammar {
    let mut builder = LanguageBuilder::new("keyword");
    let word = builder.token("word");
    let keyword = builder.anonymous_token("if");
    let s = builder.non_terminal("S");

    let language = builder
        .add_action(1, keyword, shift(2))
        .add_action(2, word, shift(3))
        .add_action(3, EOF_SYMBOL, reduce(s, 2))
        .add_goto(1, s, 4)
        .add_action(4, EOF_SYMBOL, ParseAction::Accept)
        .lex_with(move |lexer, _state| {
            while lexer.lookahead() == i32::from(b' ') {
                lexer.advance(true);
            }
            if lexer.eof() {
                lexer.mark_end();
                lexer.set_result(EOF_SYMBOL);
                return true;
            }
            if !(97..=122).contains(&lexer.lookahead()) {
                return false;
            }
            while (97..=122).contains(&lexer.lookahead()) {
                lexer.advance(false);
            }
            lexer.mark_end();
            lexer.set_result(word);
            true
        })
        .keyword_lex_with(word, move |lexer, _state| {
            for ch in [b'i', b'f'] {
                if lexer.lookahead() != i32::from(ch) {
                    return false;
                }
                lexer.advance(false);
            }
            lexer.mark_end();
            lexer.set_result(keyword);
            true
        })
        .build();
    KeywordGrammar {
        language,
        word,
        keyword,
        s,
    }
}
