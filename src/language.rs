//! The compiled parse-table contract.
//!
//! A [`Language`] bundles everything the engine consults at parse time: the
//! action table, the goto table, per-state lex modes, reserved words, the
//! keyword-capture token, the internal lex functions, and an optional
//! external-scanner definition. Languages are immutable and cheap to clone;
//! the parser holds one per configured grammar.
//!
//! Tables are assembled with [`LanguageBuilder`], the crate's analogue of a
//! generated parser's static tables.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::error_costs::ERROR_STATE;
use crate::lexer::LexerRef;

pub type Symbol = u16;
pub type StateId = u16;

/// The end-of-input symbol. Symbol zero by convention, like the tables the
/// engine was designed around.
pub const EOF_SYMBOL: Symbol = 0;
/// The builtin symbol for error subtrees produced by recovery.
pub const ERROR_SYMBOL: Symbol = u16::MAX;
/// The builtin symbol wrapping runs of skipped tokens during recovery.
pub const ERROR_REPEAT_SYMBOL: Symbol = ERROR_SYMBOL - 1;

/// Sentinel lex state meaning "perform no lookahead": the parser is at the
/// end of a non-terminal extra and must take the fixed reduction stored at
/// the EOF entry instead of lexing.
pub const LEX_STATE_NONE: u16 = u16::MAX;

pub const LANGUAGE_VERSION: u32 = 15;
pub const MIN_COMPATIBLE_LANGUAGE_VERSION: u32 = 13;

// ---------------------------------------------------------------------------
// Table types
// ---------------------------------------------------------------------------

/// How a state drives the lexer: which internal lex state to run, and which
/// external-scanner state (zero meaning "no external tokens are valid here").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LexerMode {
    pub lex_state: u16,
    pub external_lex_state: u16,
}

/// One entry in a state's action list for a lookahead symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseAction {
    Shift {
        state: StateId,
        extra: bool,
        repetition: bool,
    },
    Reduce {
        symbol: Symbol,
        child_count: u16,
        dynamic_precedence: i32,
        production_id: u16,
    },
    Accept,
    Recover,
}

/// The actions for a `(state, symbol)` pair plus the per-entry reusable bit
/// consulted by incremental node reuse.
#[derive(Clone, Copy, Debug)]
pub struct TableEntry<'a> {
    pub actions: &'a [ParseAction],
    pub reusable: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SymbolMetadata {
    pub visible: bool,
    pub named: bool,
}

#[derive(Clone, Debug, Default)]
struct ActionEntry {
    actions: Vec<ParseAction>,
    reusable: bool,
}

// ---------------------------------------------------------------------------
// External scanners
// ---------------------------------------------------------------------------

/// A fatal failure signalled by an external scanner. Aborts the parse; the
/// parser releases its partial state on reset.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("external scanner error: {0}")]
pub struct ScannerError(pub String);

/// Grammar-supplied hooks for tokens the table-driven lexer cannot produce.
///
/// One scanner instance lives on the parser for the duration of a parse (and
/// across parses, until reset). Scanner state is carried between tokens by
/// `serialize`/`deserialize` through a fixed-size buffer owned by the parser;
/// implementations must not assume the buffer outlives a single call.
pub trait ExternalScanner {
    /// Attempt to scan one token. `valid_tokens[i]` tells whether external
    /// token `i` is acceptable in the current parse state. On success the
    /// lexer's result symbol holds the *external token index*, which the
    /// engine maps through [`ExternalScannerDef::symbol_map`].
    fn scan(
        &mut self,
        lexer: &mut LexerRef<'_, '_>,
        valid_tokens: &[bool],
    ) -> Result<bool, ScannerError>;

    /// Write the scanner's state into `buffer`, returning the length used.
    fn serialize(&mut self, buffer: &mut [u8]) -> usize;

    /// Restore state previously produced by `serialize`. An empty buffer
    /// restores the initial state.
    fn deserialize(&mut self, buffer: &[u8]);
}

/// The external-scanner portion of a language definition.
pub struct ExternalScannerDef {
    /// Maps an external token index (the scanner's `result` space) to the
    /// grammar symbol it produces.
    pub symbol_map: Vec<Symbol>,
    /// Valid-token masks indexed by external lex state. Index zero is unused
    /// (external lex state zero means "no external tokens").
    pub states: Vec<Vec<bool>>,
    /// Creates the scanner payload owned by the parser.
    pub create: Arc<dyn Fn() -> Box<dyn ExternalScanner>>,
}

// ---------------------------------------------------------------------------
// Language
// ---------------------------------------------------------------------------

pub(crate) type LexFn = Arc<dyn Fn(&mut LexerRef<'_, '_>, u16) -> bool>;

struct LanguageData {
    name: String,
    abi_version: u32,
    token_count: u32,
    symbol_names: Vec<String>,
    symbol_metadata: Vec<SymbolMetadata>,
    lex_modes: Vec<LexerMode>,
    entries: FxHashMap<(StateId, Symbol), ActionEntry>,
    nonterminal_states: FxHashMap<(StateId, Symbol), StateId>,
    reserved_words: FxHashSet<(StateId, Symbol)>,
    keyword_capture_token: Option<Symbol>,
    lex_fn: LexFn,
    keyword_lex_fn: Option<LexFn>,
    external_scanner: Option<ExternalScannerDef>,
}

/// An immutable, cheaply-cloneable parse table handle.
#[derive(Clone)]
pub struct Language {
    data: Arc<LanguageData>,
}

impl Language {
    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn abi_version(&self) -> u32 {
        self.data.abi_version
    }

    /// Number of terminal symbols, including EOF. Symbols below this value
    /// are tokens; symbols at or above it are non-terminals.
    pub fn token_count(&self) -> u32 {
        self.data.token_count
    }

    pub fn state_count(&self) -> usize {
        self.data.lex_modes.len()
    }

    pub fn symbol_name(&self, symbol: Symbol) -> &str {
        match symbol {
            ERROR_SYMBOL => "ERROR",
            ERROR_REPEAT_SYMBOL => "_ERROR_REPEAT",
            _ => self
                .data
                .symbol_names
                .get(symbol as usize)
                .map(String::as_str)
                .unwrap_or("?"),
        }
    }

    pub fn symbol_metadata(&self, symbol: Symbol) -> SymbolMetadata {
        match symbol {
            ERROR_SYMBOL => SymbolMetadata {
                visible: true,
                named: true,
            },
            ERROR_REPEAT_SYMBOL => SymbolMetadata::default(),
            _ => self
                .data
                .symbol_metadata
                .get(symbol as usize)
                .copied()
                .unwrap_or_default(),
        }
    }

    /// The actions and reusable bit for a `(state, symbol)` pair. Builtin
    /// error symbols never have table entries.
    pub fn table_entry(&self, state: StateId, symbol: Symbol) -> TableEntry<'_> {
        if symbol == ERROR_SYMBOL || symbol == ERROR_REPEAT_SYMBOL {
            return TableEntry {
                actions: &[],
                reusable: false,
            };
        }
        match self.data.entries.get(&(state, symbol)) {
            Some(entry) => TableEntry {
                actions: &entry.actions,
                reusable: entry.reusable,
            },
            None => TableEntry {
                actions: &[],
                reusable: false,
            },
        }
    }

    pub fn actions(&self, state: StateId, symbol: Symbol) -> &[ParseAction] {
        self.table_entry(state, symbol).actions
    }

    pub fn has_actions(&self, state: StateId, symbol: Symbol) -> bool {
        !self.actions(state, symbol).is_empty()
    }

    pub fn has_reduce_action(&self, state: StateId, symbol: Symbol) -> bool {
        matches!(
            self.actions(state, symbol).first(),
            Some(ParseAction::Reduce { .. })
        )
    }

    /// The successor state for a symbol: the goto table for non-terminals,
    /// the final shift action for terminals.
    pub fn next_state(&self, state: StateId, symbol: Symbol) -> StateId {
        if symbol == ERROR_SYMBOL || symbol == ERROR_REPEAT_SYMBOL {
            return ERROR_STATE;
        }
        if (symbol as u32) < self.data.token_count {
            match self.actions(state, symbol).last() {
                Some(ParseAction::Shift {
                    state: next, extra, ..
                }) => {
                    if *extra {
                        state
                    } else {
                        *next
                    }
                }
                _ => 0,
            }
        } else {
            self.data
                .nonterminal_states
                .get(&(state, symbol))
                .copied()
                .unwrap_or(0)
        }
    }

    pub fn lex_mode_for_state(&self, state: StateId) -> LexerMode {
        self.data
            .lex_modes
            .get(state as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_reserved_word(&self, state: StateId, symbol: Symbol) -> bool {
        self.data.reserved_words.contains(&(state, symbol))
    }

    pub fn keyword_capture_token(&self) -> Option<Symbol> {
        self.data.keyword_capture_token
    }

    pub fn external_scanner(&self) -> Option<&ExternalScannerDef> {
        self.data.external_scanner.as_ref()
    }

    pub(crate) fn lex_fn(&self) -> LexFn {
        Arc::clone(&self.data.lex_fn)
    }

    pub(crate) fn keyword_lex_fn(&self) -> Option<LexFn> {
        self.data.keyword_lex_fn.as_ref().map(Arc::clone)
    }
}

impl std::fmt::Debug for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Language")
            .field("name", &self.data.name)
            .field("abi_version", &self.data.abi_version)
            .field("token_count", &self.data.token_count)
            .field("state_count", &self.data.lex_modes.len())
            .finish()
    }
}

/// Rejection reasons for [`crate::Parser::set_language`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum LanguageError {
    #[error("incompatible language version {0}; expected {MIN_COMPATIBLE_LANGUAGE_VERSION} through {LANGUAGE_VERSION}")]
    IncompatibleVersion(u32),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Language`] table by hand.
///
/// Declare all tokens before the first non-terminal; symbol ids are assigned
/// in declaration order, with EOF fixed at symbol zero. Unspecified lex modes
/// default to `{ lex_state: 0, external_lex_state: 0 }`, and the error state
/// is automatically given `Recover` entries for every token that has no
/// explicit entry there.
pub struct LanguageBuilder {
    name: String,
    abi_version: u32,
    symbol_names: Vec<String>,
    symbol_metadata: Vec<SymbolMetadata>,
    token_count: Option<u32>,
    lex_modes: FxHashMap<StateId, LexerMode>,
    entries: FxHashMap<(StateId, Symbol), ActionEntry>,
    nonterminal_states: FxHashMap<(StateId, Symbol), StateId>,
    reserved_words: FxHashSet<(StateId, Symbol)>,
    keyword_capture_token: Option<Symbol>,
    lex_fn: Option<LexFn>,
    keyword_lex_fn: Option<LexFn>,
    external_scanner: Option<ExternalScannerDef>,
    max_state: StateId,
}

impl LanguageBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        LanguageBuilder {
            name: name.into(),
            abi_version: LANGUAGE_VERSION,
            symbol_names: vec!["end".to_string()],
            symbol_metadata: vec![SymbolMetadata::default()],
            token_count: None,
            lex_modes: FxHashMap::default(),
            entries: FxHashMap::default(),
            nonterminal_states: FxHashMap::default(),
            reserved_words: FxHashSet::default(),
            keyword_capture_token: None,
            lex_fn: None,
            keyword_lex_fn: None,
            external_scanner: None,
            max_state: 1,
        }
    }

    pub fn abi_version(mut self, version: u32) -> Self {
        self.abi_version = version;
        self
    }

    fn add_symbol(&mut self, name: &str, metadata: SymbolMetadata) -> Symbol {
        let symbol = self.symbol_names.len() as Symbol;
        self.symbol_names.push(name.to_string());
        self.symbol_metadata.push(metadata);
        symbol
    }

    /// Declare a named, visible token.
    pub fn token(&mut self, name: &str) -> Symbol {
        assert!(
            self.token_count.is_none(),
            "tokens must be declared before non-terminals"
        );
        self.add_symbol(
            name,
            SymbolMetadata {
                visible: true,
                named: true,
            },
        )
    }

    /// Declare a visible but unnamed token (punctuation, keywords).
    pub fn anonymous_token(&mut self, name: &str) -> Symbol {
        assert!(
            self.token_count.is_none(),
            "tokens must be declared before non-terminals"
        );
        self.add_symbol(
            name,
            SymbolMetadata {
                visible: true,
                named: false,
            },
        )
    }

    /// Declare a named, visible non-terminal. Finalizes the token count.
    pub fn non_terminal(&mut self, name: &str) -> Symbol {
        self.token_count
            .get_or_insert(self.symbol_names.len() as u32);
        self.add_symbol(
            name,
            SymbolMetadata {
                visible: true,
                named: true,
            },
        )
    }

    /// Declare an invisible non-terminal (hidden rules, repetition helpers).
    pub fn hidden_non_terminal(&mut self, name: &str) -> Symbol {
        self.token_count
            .get_or_insert(self.symbol_names.len() as u32);
        self.add_symbol(name, SymbolMetadata::default())
    }

    fn note_state(&mut self, state: StateId) {
        if state > self.max_state {
            self.max_state = state;
        }
    }

    pub fn add_actions(
        mut self,
        state: StateId,
        symbol: Symbol,
        actions: impl IntoIterator<Item = ParseAction>,
    ) -> Self {
        self.note_state(state);
        let actions: Vec<ParseAction> = actions.into_iter().collect();
        for action in &actions {
            if let ParseAction::Shift { state: next, .. } = action {
                self.note_state(*next);
            }
        }
        let entry = self.entries.entry((state, symbol)).or_default();
        entry.actions.extend(actions);
        entry.reusable = true;
        self
    }

    pub fn add_action(self, state: StateId, symbol: Symbol, action: ParseAction) -> Self {
        self.add_actions(state, symbol, [action])
    }

    /// Clear the reusable bit on an entry added with `add_actions`.
    pub fn mark_unreusable(mut self, state: StateId, symbol: Symbol) -> Self {
        if let Some(entry) = self.entries.get_mut(&(state, symbol)) {
            entry.reusable = false;
        }
        self
    }

    pub fn add_goto(mut self, state: StateId, symbol: Symbol, next_state: StateId) -> Self {
        self.note_state(state);
        self.note_state(next_state);
        self.nonterminal_states.insert((state, symbol), next_state);
        self
    }

    pub fn lex_mode(mut self, state: StateId, lex_state: u16, external_lex_state: u16) -> Self {
        self.note_state(state);
        self.lex_modes.insert(
            state,
            LexerMode {
                lex_state,
                external_lex_state,
            },
        );
        self
    }

    pub fn reserved_word(mut self, state: StateId, symbol: Symbol) -> Self {
        self.reserved_words.insert((state, symbol));
        self
    }

    pub fn lex_with(mut self, f: impl Fn(&mut LexerRef<'_, '_>, u16) -> bool + 'static) -> Self {
        self.lex_fn = Some(Arc::new(f));
        self
    }

    pub fn keyword_lex_with(
        mut self,
        capture_token: Symbol,
        f: impl Fn(&mut LexerRef<'_, '_>, u16) -> bool + 'static,
    ) -> Self {
        self.keyword_capture_token = Some(capture_token);
        self.keyword_lex_fn = Some(Arc::new(f));
        self
    }

    pub fn external_scanner(mut self, def: ExternalScannerDef) -> Self {
        self.external_scanner = Some(def);
        self
    }

    pub fn build(self) -> Language {
        let token_count = self.token_count.unwrap_or(self.symbol_names.len() as u32);
        let mut entries = self.entries;

        // Every token recovers in the error state unless the grammar says
        // otherwise.
        for symbol in 0..token_count as Symbol {
            entries.entry((ERROR_STATE, symbol)).or_insert(ActionEntry {
                actions: vec![ParseAction::Recover],
                reusable: false,
            });
        }

        let mut lex_modes = vec![LexerMode::default(); self.max_state as usize + 1];
        for (state, mode) in self.lex_modes {
            lex_modes[state as usize] = mode;
        }

        let lex_fn: LexFn = match self.lex_fn {
            Some(lex_fn) => lex_fn,
            None => Arc::new(|lexer, _state| {
                if lexer.eof() {
                    lexer.mark_end();
                    lexer.set_result(EOF_SYMBOL);
                    true
                } else {
                    false
                }
            }),
        };

        Language {
            data: Arc::new(LanguageData {
                name: self.name,
                abi_version: self.abi_version,
                token_count,
                symbol_names: self.symbol_names,
                symbol_metadata: self.symbol_metadata,
                lex_modes,
                entries,
                nonterminal_states: self.nonterminal_states,
                reserved_words: self.reserved_words,
                keyword_capture_token: self.keyword_capture_token,
                lex_fn,
                keyword_lex_fn: self.keyword_lex_fn,
                external_scanner: self.external_scanner,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_token_language() -> (Language, Symbol, Symbol, Symbol) {
        let mut builder = LanguageBuilder::new("pairs");
        let a = builder.token("a");
        let b = builder.token("b");
        let rule = builder.non_terminal("pair");
        let language = builder
            .add_action(
                1,
                a,
                ParseAction::Shift {
                    state: 2,
                    extra: false,
                    repetition: false,
                },
            )
            .add_action(
                2,
                b,
                ParseAction::Shift {
                    state: 3,
                    extra: false,
                    repetition: false,
                },
            )
            .add_action(
                3,
                EOF_SYMBOL,
                ParseAction::Reduce {
                    symbol: rule,
                    child_count: 2,
                    dynamic_precedence: 0,
                    production_id: 0,
                },
            )
            .add_goto(1, rule, 4)
            .add_action(4, EOF_SYMBOL, ParseAction::Accept)
            .build();
        (language, a, b, rule)
    }

    #[test]
    fn next_state_follows_shifts_and_gotos() {
        let (language, a, b, rule) = two_token_language();
        assert_eq!(language.next_state(1, a), 2);
        assert_eq!(language.next_state(2, b), 3);
        assert_eq!(language.next_state(1, rule), 4);
        assert_eq!(language.next_state(2, a), 0);
    }

    #[test]
    fn error_state_recovers_on_every_token() {
        let (language, a, b, _) = two_token_language();
        for symbol in [EOF_SYMBOL, a, b] {
            assert_eq!(
                language.actions(ERROR_STATE, symbol),
                &[ParseAction::Recover]
            );
        }
    }

    #[test]
    fn builtin_symbols_have_no_entries() {
        let (language, ..) = two_token_language();
        assert!(language.actions(1, ERROR_SYMBOL).is_empty());
        assert_eq!(language.symbol_name(ERROR_SYMBOL), "ERROR");
        assert!(language.symbol_metadata(ERROR_SYMBOL).named);
    }

    #[test]
    fn token_count_freezes_at_first_non_terminal() {
        let (language, ..) = two_token_language();
        assert_eq!(language.token_count(), 3);
    }
}
