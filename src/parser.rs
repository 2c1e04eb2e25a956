//! The parser driver: the advance loop, action dispatch, incremental node
//! reuse, error recovery, stack condensation, and the orchestration of a
//! whole parse including cancellation and resumption.
//!
//! Control flow is expressed as explicit loops over tagged actions rather
//! than mutual recursion, so cancellation checks stay cheap and the
//! rebalancing pass can be suspended and resumed across `parse` calls.

use std::io::{self, Write as _};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error_costs::{
    ERROR_COST_PER_SKIPPED_CHAR, ERROR_COST_PER_SKIPPED_LINE, ERROR_COST_PER_SKIPPED_TREE,
    ERROR_STATE,
};
use crate::language::{
    ExternalScanner, Language, LanguageError, ParseAction, ScannerError, StateId, Symbol,
    TableEntry, EOF_SYMBOL, ERROR_REPEAT_SYMBOL, ERROR_SYMBOL, LANGUAGE_VERSION, LEX_STATE_NONE,
    MIN_COMPATIBLE_LANGUAGE_VERSION,
};
use crate::length::Length;
use crate::lexer::{IncludedRangesError, Lexer, LexerRef, LogType, Logger, TextInput};
use crate::ranges::{self, Range};
use crate::reduce_action::{ReduceAction, ReduceActionSet};
use crate::reusable_node::ReusableNode;
use crate::stack::{Stack, StackVersion};
use crate::subtree::{
    self, external_scanner_state_eq, remove_trailing_extras, Subtree, SubtreePool,
    TREE_STATE_NONE,
};
use crate::tree::Tree;

const MAX_VERSION_COUNT: usize = 6;
const MAX_VERSION_COUNT_OVERFLOW: usize = 4;
const MAX_SUMMARY_DEPTH: u32 = 16;
const MAX_COST_DIFFERENCE: u32 = 18 * ERROR_COST_PER_SKIPPED_TREE;
const OP_COUNT_PER_TIMEOUT_CHECK: u32 = 100;
const SERIALIZATION_BUFFER_SIZE: usize = 1024;

macro_rules! log {
    ($self_:expr, $($arg:tt)*) => {{
        tracing::trace!(target: "arbor::parse", $($arg)*);
        if $self_.lexer.logger.is_some() || $self_.dot_graph_output.is_some() {
            let message = format!($($arg)*);
            $self_.log_event(&message);
        }
    }};
}

/// Why a parse returned without a tree.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no language has been assigned to the parser")]
    NoLanguage,
    /// The parse was cancelled by the cancellation flag, the timeout, or the
    /// progress callback. Parser state is preserved: calling `parse` again
    /// with the same language and input resumes where it left off.
    #[error("the parse was cancelled")]
    Cancelled,
    /// The external scanner signalled a fatal failure; partial state has
    /// been released.
    #[error(transparent)]
    Scanner(#[from] ScannerError),
}

/// Snapshot handed to the progress callback.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParseState {
    pub current_byte_offset: u32,
    pub has_error: bool,
}

/// Per-call options for [`Parser::parse_with_options`].
#[derive(Default)]
pub struct ParseOptions<'a> {
    /// Invoked periodically; returning `true` cancels the parse.
    pub progress_callback: Option<&'a mut dyn FnMut(&ParseState) -> bool>,
}

struct ParseSession<'a, 'i, 'p> {
    input: &'a mut (dyn TextInput + 'i),
    progress_callback: Option<&'a mut (dyn FnMut(&ParseState) -> bool + 'p)>,
    deadline: Option<Instant>,
    parse_state: ParseState,
}

enum Interrupted {
    Cancelled,
    Scanner(ScannerError),
}

impl From<ScannerError> for Interrupted {
    fn from(error: ScannerError) -> Self {
        Interrupted::Scanner(error)
    }
}

struct TokenCache {
    token: Option<Subtree>,
    last_external_token: Option<Subtree>,
    byte_index: u32,
}

#[derive(Clone, Copy)]
struct ErrorStatus {
    cost: u32,
    node_count: u32,
    dynamic_precedence: i32,
    is_in_error: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ErrorComparison {
    TakeLeft,
    PreferLeft,
    None,
    PreferRight,
    TakeRight,
}

fn compare_versions(a: ErrorStatus, b: ErrorStatus) -> ErrorComparison {
    if !a.is_in_error && b.is_in_error {
        return if a.cost < b.cost {
            ErrorComparison::TakeLeft
        } else {
            ErrorComparison::PreferLeft
        };
    }
    if a.is_in_error && !b.is_in_error {
        return if b.cost < a.cost {
            ErrorComparison::TakeRight
        } else {
            ErrorComparison::PreferRight
        };
    }
    if a.cost < b.cost {
        return if (b.cost - a.cost) * (1 + a.node_count) > MAX_COST_DIFFERENCE {
            ErrorComparison::TakeLeft
        } else {
            ErrorComparison::PreferLeft
        };
    }
    if b.cost < a.cost {
        return if (a.cost - b.cost) * (1 + b.node_count) > MAX_COST_DIFFERENCE {
            ErrorComparison::TakeRight
        } else {
            ErrorComparison::PreferRight
        };
    }
    if a.dynamic_precedence > b.dynamic_precedence {
        return ErrorComparison::PreferLeft;
    }
    if b.dynamic_precedence > a.dynamic_precedence {
        return ErrorComparison::PreferRight;
    }
    ErrorComparison::None
}

/// An incremental, error-recovering GLR parser instance.
///
/// A parser is configured with a [`Language`] and then asked to parse text,
/// optionally against the tree from a previous parse. One parser owns one
/// graph-structured stack, one external-scanner payload, and the state
/// needed to resume a cancelled parse.
pub struct Parser {
    lexer: Lexer,
    stack: Stack,
    pool: SubtreePool,
    language: Option<Language>,
    reduce_actions: ReduceActionSet,
    finished_tree: Option<Subtree>,
    token_cache: TokenCache,
    reusable_node: ReusableNode,
    scanner: Option<Box<dyn ExternalScanner>>,
    scanner_buffer: Vec<u8>,
    accept_count: usize,
    operation_count: u32,
    old_tree: Option<Subtree>,
    included_range_differences: Vec<Range>,
    included_range_difference_index: usize,
    has_error: bool,
    canceled_balancing: bool,
    balance_worklist: Vec<Vec<u32>>,
    dot_graph_output: Option<Box<dyn io::Write>>,
    cancellation_flag: Option<Arc<AtomicUsize>>,
    timeout_micros: Option<u64>,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            lexer: Lexer::new(),
            stack: Stack::new(),
            pool: SubtreePool::new(),
            language: None,
            reduce_actions: ReduceActionSet::default(),
            finished_tree: None,
            token_cache: TokenCache {
                token: None,
                last_external_token: None,
                byte_index: 0,
            },
            reusable_node: ReusableNode::new(),
            scanner: None,
            scanner_buffer: vec![0; SERIALIZATION_BUFFER_SIZE],
            accept_count: 0,
            operation_count: 0,
            old_tree: None,
            included_range_differences: Vec::new(),
            included_range_difference_index: 0,
            has_error: false,
            canceled_balancing: false,
            balance_worklist: Vec::new(),
            dot_graph_output: None,
            cancellation_flag: None,
            timeout_micros: None,
        }
    }

    // -- configuration ------------------------------------------------------

    pub fn language(&self) -> Option<&Language> {
        self.language.as_ref()
    }

    pub fn set_language(&mut self, language: &Language) -> Result<(), LanguageError> {
        self.reset();
        self.language = None;
        let version = language.abi_version();
        if !(MIN_COMPATIBLE_LANGUAGE_VERSION..=LANGUAGE_VERSION).contains(&version) {
            return Err(LanguageError::IncompatibleVersion(version));
        }
        self.language = Some(language.clone());
        Ok(())
    }

    pub fn set_logger(&mut self, logger: Option<Logger>) {
        self.lexer.logger = logger;
    }

    /// Stream DOT graphs of the stack and trees to `output` as the parse
    /// proceeds.
    pub fn print_dot_graphs(&mut self, output: Option<Box<dyn io::Write>>) {
        self.dot_graph_output = output;
    }

    pub fn set_included_ranges(&mut self, ranges: &[Range]) -> Result<(), IncludedRangesError> {
        self.lexer.set_included_ranges(ranges)
    }

    pub fn included_ranges(&self) -> &[Range] {
        self.lexer.included_ranges()
    }

    /// Legacy cooperative-cancellation word: a nonzero value cancels the
    /// parse at the next check. Prefer [`ParseOptions::progress_callback`].
    pub fn set_cancellation_flag(&mut self, flag: Option<Arc<AtomicUsize>>) {
        self.cancellation_flag = flag;
    }

    /// Legacy wall-clock budget per `parse` call, in microseconds; zero
    /// disables it. Prefer [`ParseOptions::progress_callback`].
    pub fn set_timeout_micros(&mut self, timeout: u64) {
        self.timeout_micros = (timeout > 0).then_some(timeout);
    }

    /// Discard all parse state, including resume state from a cancelled
    /// parse and the external scanner payload.
    pub fn reset(&mut self) {
        self.scanner = None;
        self.old_tree = None;
        self.reusable_node.clear();
        self.lexer.reset(Length::ZERO);
        self.stack.clear();
        self.set_cached_token(0, None, None);
        self.finished_tree = None;
        self.accept_count = 0;
        self.has_error = false;
        self.canceled_balancing = false;
        self.balance_worklist.clear();
    }

    // -- parsing entry points -----------------------------------------------

    pub fn parse(
        &mut self,
        text: impl AsRef<[u8]>,
        old_tree: Option<&Tree>,
    ) -> Result<Tree, ParseError> {
        let mut input: &[u8] = text.as_ref();
        self.parse_with_options(&mut input, old_tree, ParseOptions::default())
    }

    pub fn parse_with(
        &mut self,
        input: &mut dyn TextInput,
        old_tree: Option<&Tree>,
    ) -> Result<Tree, ParseError> {
        self.parse_with_options(input, old_tree, ParseOptions::default())
    }

    pub fn parse_with_options(
        &mut self,
        input: &mut dyn TextInput,
        old_tree: Option<&Tree>,
        options: ParseOptions<'_>,
    ) -> Result<Tree, ParseError> {
        let language = self.language.clone().ok_or(ParseError::NoLanguage)?;
        let deadline = self
            .timeout_micros
            .map(|micros| Instant::now() + Duration::from_micros(micros));
        let mut session = ParseSession {
            input,
            progress_callback: options.progress_callback,
            deadline,
            parse_state: ParseState::default(),
        };

        self.lexer.prepare_for_input();
        self.included_range_differences.clear();
        self.included_range_difference_index = 0;
        self.operation_count = 0;

        if self.has_outstanding_parse() {
            log!(self, "resume_parsing");
            if self.canceled_balancing {
                return self.finish_parse(&mut session, &language);
            }
        } else {
            if let Some(def) = language.external_scanner() {
                self.scanner = Some((def.create)());
            }
            match old_tree {
                Some(tree) => {
                    let root = tree.root_subtree();
                    self.included_range_differences = ranges::symmetric_difference(
                        tree.included_ranges(),
                        self.lexer.included_ranges(),
                    );
                    self.reusable_node.reset(root.clone());
                    self.old_tree = Some(root);
                    log!(self, "parse_after_edit");
                    self.log_tree(&language);
                    for i in 0..self.included_range_differences.len() {
                        let range = self.included_range_differences[i];
                        log!(
                            self,
                            "different_included_range {} - {}",
                            range.start_byte,
                            range.end_byte
                        );
                    }
                }
                None => {
                    self.reusable_node.clear();
                    log!(self, "new_parse");
                }
            }
        }

        let mut position = 0u32;
        let mut last_position = 0u32;
        loop {
            let mut version: StackVersion = 0;
            let mut version_count;
            loop {
                version_count = self.stack.version_count();
                if version >= version_count {
                    break;
                }
                let allow_node_reuse = version_count == 1;
                while self.stack.is_active(version) {
                    log!(
                        self,
                        "process version:{}, version_count:{}, state:{}, row:{}, col:{}",
                        version,
                        self.stack.version_count(),
                        self.stack.state(version),
                        self.stack.position(version).extent.row,
                        self.stack.position(version).extent.column
                    );

                    match self.advance(&mut session, &language, version, allow_node_reuse) {
                        Ok(()) => {}
                        Err(Interrupted::Cancelled) => return Err(ParseError::Cancelled),
                        Err(Interrupted::Scanner(error)) => {
                            self.reset();
                            return Err(ParseError::Scanner(error));
                        }
                    }
                    self.log_stack(&language);

                    position = self.stack.position(version).bytes;
                    if position > last_position || (version > 0 && position == last_position) {
                        last_position = position;
                        break;
                    }
                }
                version += 1;
            }

            // Re-rank the versions, pruning any that are clearly worse.
            let min_error_cost = self.condense_stack(&language);

            // A finished tree that beats every live version ends the parse.
            // Clearing the stack drops its references into the finished tree
            // so rebalancing can mutate nodes in place.
            if let Some(finished) = &self.finished_tree {
                if finished.error_cost() < min_error_cost {
                    self.stack.clear();
                    break;
                }
            }

            while self.included_range_difference_index < self.included_range_differences.len() {
                let range = self.included_range_differences[self.included_range_difference_index];
                if range.end_byte <= position {
                    self.included_range_difference_index += 1;
                } else {
                    break;
                }
            }

            if version_count == 0 {
                break;
            }
        }

        self.finish_parse(&mut session, &language)
    }

    fn finish_parse(
        &mut self,
        session: &mut ParseSession<'_, '_, '_>,
        language: &Language,
    ) -> Result<Tree, ParseError> {
        debug_assert!(self.finished_tree.is_some());
        if self.balance_subtree(session).is_err() {
            self.canceled_balancing = true;
            return Err(ParseError::Cancelled);
        }
        self.canceled_balancing = false;
        log!(self, "done");
        self.log_tree(language);

        let root = self.finished_tree.take().ok_or(ParseError::Cancelled)?;
        let tree = Tree::new(
            root,
            language.clone(),
            self.lexer.included_ranges().to_vec(),
        );
        self.reset();
        Ok(tree)
    }

    fn has_outstanding_parse(&mut self) -> bool {
        self.canceled_balancing
            || self.scanner.is_some()
            || self.stack.state(0) != 1
            || self.stack.node_count_since_error(0) != 0
    }

    // -- logging ------------------------------------------------------------

    fn log_event(&mut self, message: &str) {
        self.lexer.log(LogType::Parse, message);
        if let Some(out) = self.dot_graph_output.as_mut() {
            let escaped = message.replace('\\', "\\\\").replace('"', "\\\"");
            let _ = writeln!(out, "graph {{\nlabel=\"{escaped}\"\n}}\n");
        }
    }

    fn log_stack(&mut self, language: &Language) {
        if let Some(out) = self.dot_graph_output.as_mut() {
            self.stack.print_dot_graph(language, out);
            let _ = writeln!(out);
        }
    }

    fn log_tree(&mut self, language: &Language) {
        if let Some(out) = self.dot_graph_output.as_mut() {
            if let Some(tree) = &self.finished_tree {
                subtree::print_dot_graph(tree, language, out);
                let _ = writeln!(out);
            } else if let Some(tree) = &self.old_tree {
                subtree::print_dot_graph(tree, language, out);
                let _ = writeln!(out);
            }
        }
    }

    // -- cancellation -------------------------------------------------------

    /// Count `operations` units of work and, at every check interval, poll
    /// the cancellation flag, the deadline, and the progress callback.
    /// Returns false when the parse should stop.
    fn check_progress(
        &mut self,
        session: &mut ParseSession<'_, '_, '_>,
        position: Option<u32>,
        operations: u32,
    ) -> bool {
        self.operation_count += operations;
        if self.operation_count >= OP_COUNT_PER_TIMEOUT_CHECK {
            self.operation_count = 0;
        }
        if let Some(position) = position {
            session.parse_state.current_byte_offset = position;
            session.parse_state.has_error = self.has_error;
        }
        if self.operation_count == 0 {
            if let Some(flag) = &self.cancellation_flag {
                if flag.load(Ordering::Relaxed) != 0 {
                    return false;
                }
            }
            if let Some(deadline) = session.deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            if let Some(callback) = session.progress_callback.as_mut() {
                if callback(&session.parse_state) {
                    return false;
                }
            }
        }
        true
    }

    // -- version comparison -------------------------------------------------

    fn version_status(&mut self, version: StackVersion) -> ErrorStatus {
        let mut cost = self.stack.error_cost(version);
        let is_paused = self.stack.is_paused(version);
        if is_paused {
            cost += ERROR_COST_PER_SKIPPED_TREE;
        }
        ErrorStatus {
            cost,
            node_count: self.stack.node_count_since_error(version),
            dynamic_precedence: self.stack.dynamic_precedence(version),
            is_in_error: is_paused || self.stack.state(version) == ERROR_STATE,
        }
    }

    /// Would committing to `cost` on this version be wasted work because
    /// some other version (or the finished tree) is already doing better?
    fn better_version_exists(
        &mut self,
        version: StackVersion,
        is_in_error: bool,
        cost: u32,
    ) -> bool {
        if let Some(finished) = &self.finished_tree {
            if finished.error_cost() <= cost {
                return true;
            }
        }

        let position = self.stack.position(version);
        let status = ErrorStatus {
            cost,
            is_in_error,
            dynamic_precedence: self.stack.dynamic_precedence(version),
            node_count: self.stack.node_count_since_error(version),
        };

        for i in 0..self.stack.version_count() {
            if i == version
                || !self.stack.is_active(i)
                || self.stack.position(i).bytes < position.bytes
            {
                continue;
            }
            let status_i = self.version_status(i);
            match compare_versions(status, status_i) {
                ErrorComparison::TakeRight => return true,
                ErrorComparison::PreferRight => {
                    if self.stack.can_merge(i, version) {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    // -- external scanner ---------------------------------------------------

    fn external_scanner_scan(
        &mut self,
        session: &mut ParseSession<'_, '_, '_>,
        language: &Language,
        external_lex_state: u16,
    ) -> Result<bool, ScannerError> {
        let Some(def) = language.external_scanner() else {
            return Ok(false);
        };
        let valid_tokens = def
            .states
            .get(external_lex_state as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let Parser { lexer, scanner, .. } = self;
        let Some(scanner) = scanner.as_mut() else {
            return Ok(false);
        };
        let mut cursor = LexerRef::new(lexer, &mut *session.input);
        scanner.scan(&mut cursor, valid_tokens)
    }

    fn external_scanner_serialize(&mut self) -> usize {
        let Some(scanner) = self.scanner.as_mut() else {
            return 0;
        };
        let length = scanner.serialize(&mut self.scanner_buffer);
        debug_assert!(length <= SERIALIZATION_BUFFER_SIZE);
        length
    }

    fn external_scanner_deserialize(&mut self, external_token: Option<&Subtree>) {
        let bytes = external_token.map_or(&[] as &[u8], |token| token.external_scanner_state());
        if let Some(scanner) = self.scanner.as_mut() {
            scanner.deserialize(bytes);
        }
    }

    // -- lexing and token reuse ---------------------------------------------

    fn can_reuse_first_leaf(
        &self,
        language: &Language,
        state: StateId,
        tree: &Subtree,
        entry: &TableEntry<'_>,
    ) -> bool {
        let leaf_symbol = tree.leaf_symbol();
        let current_lex_mode = language.lex_mode_for_state(state);
        let leaf_lex_mode = language.lex_mode_for_state(tree.leaf_parse_state());

        // At the end of a non-terminal extra the parser consults the fixed
        // reduction at the EOF entry instead of a lookahead; nothing can be
        // reused there.
        if current_lex_mode.lex_state == LEX_STATE_NONE {
            return false;
        }

        // A token created in a state with the same lookahead set is reusable.
        if !entry.actions.is_empty()
            && leaf_lex_mode == current_lex_mode
            && (Some(leaf_symbol) != language.keyword_capture_token()
                || (!tree.is_keyword() && tree.parse_state() == state))
        {
            return true;
        }

        // Empty tokens are not reusable in states with different lookaheads.
        if tree.size().bytes == 0 && leaf_symbol != EOF_SYMBOL {
            return false;
        }

        current_lex_mode.external_lex_state == 0 && entry.reusable
    }

    fn lex(
        &mut self,
        session: &mut ParseSession<'_, '_, '_>,
        language: &Language,
        version: StackVersion,
        parse_state: StateId,
    ) -> Result<Option<Subtree>, Interrupted> {
        let mut lex_mode = language.lex_mode_for_state(parse_state);
        if lex_mode.lex_state == LEX_STATE_NONE {
            log!(self, "no_lookahead_after_non_terminal_extra");
            return Ok(None);
        }

        let start_position = self.stack.position(version);
        let external_token = self.stack.last_external_token(version);

        let mut found_external_token = false;
        let mut error_mode = parse_state == ERROR_STATE;
        let mut skipped_error = false;
        let mut first_error_character = 0i32;
        let mut error_start_position = Length::ZERO;
        let mut error_end_position = Length::ZERO;
        let mut lookahead_end_byte = 0u32;
        let mut external_state_len = 0usize;
        let mut external_state_changed = false;
        self.lexer.reset(start_position);

        loop {
            let current_position = self.lexer.current_position;

            if lex_mode.external_lex_state != 0 {
                log!(
                    self,
                    "lex_external state:{}, row:{}, column:{}",
                    lex_mode.external_lex_state,
                    current_position.extent.row,
                    current_position.extent.column
                );
                {
                    let mut cursor = LexerRef::new(&mut self.lexer, &mut *session.input);
                    cursor.start();
                }
                self.external_scanner_deserialize(external_token.as_ref());
                let mut found_token = self
                    .external_scanner_scan(session, language, lex_mode.external_lex_state)
                    .map_err(Interrupted::Scanner)?;
                self.lexer.finish(&mut lookahead_end_byte);

                if found_token {
                    external_state_len = self.external_scanner_serialize();
                    let previous_state = external_token
                        .as_ref()
                        .map_or(&[] as &[u8], |token| token.external_scanner_state());
                    external_state_changed =
                        previous_state != &self.scanner_buffer[..external_state_len];

                    // An empty external token that did not change the scanner
                    // state could recur forever; reject it unless progress is
                    // otherwise assured.
                    if self.lexer.token_end_position.bytes <= current_position.bytes
                        && !external_state_changed
                    {
                        let symbol = self.map_external_symbol(language);
                        let next_parse_state = language.next_state(parse_state, symbol);
                        let token_is_extra = next_parse_state == parse_state;
                        if error_mode
                            || !self.stack.has_advanced_since_error(version)
                            || token_is_extra
                        {
                            log!(
                                self,
                                "ignore_empty_external_token symbol:{}",
                                language.symbol_name(symbol)
                            );
                            found_token = false;
                        }
                    }
                }

                if found_token {
                    found_external_token = true;
                    break;
                }

                self.lexer.reset(current_position);
            }

            log!(
                self,
                "lex_internal state:{}, row:{}, column:{}",
                lex_mode.lex_state,
                current_position.extent.row,
                current_position.extent.column
            );
            let found_token = {
                let lex_fn = language.lex_fn();
                let mut cursor = LexerRef::new(&mut self.lexer, &mut *session.input);
                cursor.start();
                lex_fn(&mut cursor, lex_mode.lex_state)
            };
            self.lexer.finish(&mut lookahead_end_byte);
            if found_token {
                break;
            }

            // Retry once in the error state's lex mode, which accepts every
            // token, before giving up and skipping characters.
            if !error_mode {
                error_mode = true;
                lex_mode = language.lex_mode_for_state(ERROR_STATE);
                self.lexer.reset(start_position);
                continue;
            }

            if !skipped_error {
                log!(self, "skip_unrecognized_character");
                skipped_error = true;
                error_start_position = self.lexer.token_start_position;
                error_end_position = self.lexer.token_start_position;
                first_error_character = self.lexer.lookahead;
            }

            if self.lexer.current_position.bytes == error_end_position.bytes {
                if self.lexer.at_eof() {
                    self.lexer.result_symbol = ERROR_SYMBOL;
                    break;
                }
                let mut cursor = LexerRef::new(&mut self.lexer, &mut *session.input);
                cursor.advance(false);
            }
            error_end_position = self.lexer.current_position;
        }

        let result = if skipped_error {
            let padding = error_start_position - start_position;
            let size = error_end_position - error_start_position;
            let lookahead_bytes = lookahead_end_byte.saturating_sub(error_end_position.bytes);
            self.pool.new_error_leaf(
                first_error_character,
                padding,
                size,
                lookahead_bytes,
                parse_state,
                language,
            )
        } else {
            let mut symbol = self.lexer.result_symbol;
            let padding = self.lexer.token_start_position - start_position;
            let size = self.lexer.token_end_position - self.lexer.token_start_position;
            let lookahead_bytes =
                lookahead_end_byte.saturating_sub(self.lexer.token_end_position.bytes);
            let mut is_keyword = false;

            if found_external_token {
                symbol = self.map_external_symbol(language);
            } else if Some(symbol) == language.keyword_capture_token() && symbol != 0 {
                // Re-lex with the keyword scanner; adopt its symbol only when
                // it covers exactly the same bytes and is valid here.
                let end_byte = self.lexer.token_end_position.bytes;
                let token_start = self.lexer.token_start_position;
                self.lexer.reset(token_start);
                if let Some(keyword_lex_fn) = language.keyword_lex_fn() {
                    is_keyword = {
                        let mut cursor = LexerRef::new(&mut self.lexer, &mut *session.input);
                        cursor.start();
                        keyword_lex_fn(&mut cursor, 0)
                    };
                    if is_keyword
                        && self.lexer.token_end_position.bytes == end_byte
                        && (language.has_actions(parse_state, self.lexer.result_symbol)
                            || language.is_reserved_word(parse_state, self.lexer.result_symbol))
                    {
                        symbol = self.lexer.result_symbol;
                    }
                }
            }

            let mut leaf = self.pool.new_leaf(
                symbol,
                padding,
                size,
                lookahead_bytes,
                parse_state,
                found_external_token,
                is_keyword,
                language,
            );
            if found_external_token {
                leaf.set_external_state(
                    &self.scanner_buffer[..external_state_len],
                    external_state_changed,
                );
            }
            leaf
        };

        log!(
            self,
            "lexed_lookahead sym:{}, size:{}",
            language.symbol_name(result.symbol()),
            result.total_size().bytes
        );
        Ok(Some(result))
    }

    fn map_external_symbol(&self, language: &Language) -> Symbol {
        match language.external_scanner() {
            Some(def) => def
                .symbol_map
                .get(self.lexer.result_symbol as usize)
                .copied()
                .unwrap_or(self.lexer.result_symbol),
            None => self.lexer.result_symbol,
        }
    }

    fn get_cached_token(
        &mut self,
        language: &Language,
        state: StateId,
        position: u32,
        last_external_token: Option<&Subtree>,
    ) -> Option<Subtree> {
        let token = self.token_cache.token.clone()?;
        if self.token_cache.byte_index == position
            && external_scanner_state_eq(
                self.token_cache.last_external_token.as_ref(),
                last_external_token,
            )
        {
            let entry = language.table_entry(state, token.symbol());
            if self.can_reuse_first_leaf(language, state, &token, &entry) {
                return Some(token);
            }
        }
        None
    }

    fn set_cached_token(
        &mut self,
        byte_index: u32,
        last_external_token: Option<Subtree>,
        token: Option<Subtree>,
    ) {
        self.token_cache.token = token;
        self.token_cache.byte_index = byte_index;
        self.token_cache.last_external_token = last_external_token;
    }

    fn has_included_range_difference(&self, start_byte: u32, end_byte: u32) -> bool {
        ranges::intersects(
            &self.included_range_differences,
            self.included_range_difference_index,
            start_byte,
            end_byte,
        )
    }

    /// Find a subtree of the previous tree that can stand in for the next
    /// lookahead at the current position.
    fn reuse_node(
        &mut self,
        language: &Language,
        version: StackVersion,
        state: &mut StateId,
        position: u32,
        last_external_token: Option<&Subtree>,
    ) -> Option<Subtree> {
        loop {
            let result = self.reusable_node.tree()?;
            let byte_offset = self.reusable_node.byte_offset();
            let mut end_byte_offset = byte_offset + result.total_bytes();

            // Do not reuse an EOF node if the included ranges array has
            // changes later on in the file.
            if result.is_eof() {
                end_byte_offset = u32::MAX;
            }

            if byte_offset > position {
                log!(
                    self,
                    "before_reusable_node symbol:{}",
                    language.symbol_name(result.symbol())
                );
                return None;
            }

            if byte_offset < position {
                log!(
                    self,
                    "past_reusable_node symbol:{}",
                    language.symbol_name(result.symbol())
                );
                if end_byte_offset <= position || !self.reusable_node.descend() {
                    self.reusable_node.advance();
                }
                continue;
            }

            if !external_scanner_state_eq(
                self.reusable_node.last_external_token.as_ref(),
                last_external_token,
            ) {
                log!(
                    self,
                    "reusable_node_has_different_external_scanner_state symbol:{}",
                    language.symbol_name(result.symbol())
                );
                self.reusable_node.advance();
                continue;
            }

            let reason = if result.has_changes() {
                Some("has_changes")
            } else if result.is_error() {
                Some("is_error")
            } else if result.is_missing() {
                Some("is_missing")
            } else if result.is_fragile() {
                Some("is_fragile")
            } else if self.has_included_range_difference(byte_offset, end_byte_offset) {
                Some("contains_different_included_range")
            } else {
                None
            };

            if let Some(reason) = reason {
                log!(
                    self,
                    "cant_reuse_node_{} tree:{}",
                    reason,
                    language.symbol_name(result.symbol())
                );
                if !self.reusable_node.descend() {
                    self.reusable_node.advance();
                    self.breakdown_top_of_stack(language, version);
                    *state = self.stack.state(version);
                }
                continue;
            }

            let leaf_symbol = result.leaf_symbol();
            let entry = language.table_entry(*state, leaf_symbol);
            if !self.can_reuse_first_leaf(language, *state, &result, &entry) {
                log!(
                    self,
                    "cant_reuse_node symbol:{}, first_leaf_symbol:{}",
                    language.symbol_name(result.symbol()),
                    language.symbol_name(leaf_symbol)
                );
                self.reusable_node.advance_past_leaf();
                return None;
            }

            log!(
                self,
                "reuse_node symbol:{}",
                language.symbol_name(result.symbol())
            );
            return Some(result);
        }
    }

    // -- stack surgery ------------------------------------------------------

    /// Replace the reused subtree on top of the stack with its children,
    /// recomputing their states. Returns whether anything was broken down.
    fn breakdown_top_of_stack(&mut self, language: &Language, version: StackVersion) -> bool {
        let mut did_break_down = false;
        let mut pending = false;

        loop {
            let pop = self.stack.pop_pending(version);
            if pop.is_empty() {
                break;
            }

            did_break_down = true;
            pending = false;
            for slice in pop {
                let mut state = self.stack.state(slice.version);
                let mut subtrees = slice.subtrees.into_iter();
                let Some(parent) = subtrees.next() else {
                    continue;
                };

                let children: Vec<Subtree> = parent.children().to_vec();
                for child in children {
                    pending = child.child_count() > 0;
                    if child.is_error() {
                        state = ERROR_STATE;
                    } else if !child.extra() {
                        state = language.next_state(state, child.symbol());
                    }
                    self.stack.push(slice.version, Some(child), pending, state);
                }

                for tree in subtrees {
                    self.stack.push(slice.version, Some(tree), false, state);
                }

                log!(
                    self,
                    "breakdown_top_of_stack tree:{}",
                    language.symbol_name(parent.symbol())
                );
                self.log_stack(language);
            }

            if !pending {
                break;
            }
        }

        did_break_down
    }

    /// When a reused interior node cannot be shifted whole, descend into it
    /// until reaching a subtree whose recorded state matches.
    fn breakdown_lookahead(
        &mut self,
        language: &Language,
        lookahead: &mut Subtree,
        state: StateId,
    ) {
        let mut did_descend = false;
        loop {
            let Some(current) = self.reusable_node.tree() else {
                break;
            };
            if current.child_count() == 0 || current.parse_state() == state {
                break;
            }
            log!(
                self,
                "state_mismatch sym:{}",
                language.symbol_name(current.symbol())
            );
            self.reusable_node.descend();
            did_descend = true;
        }

        if did_descend {
            if let Some(tree) = self.reusable_node.tree() {
                *lookahead = tree;
            }
        }
    }

    // -- tree selection -----------------------------------------------------

    /// Decide between two finished candidates for the same span: smaller
    /// error cost, then higher dynamic precedence, then the deterministic
    /// structural order. Returns true when the right tree should replace the
    /// left.
    fn select_tree(&mut self, language: &Language, left: Option<&Subtree>, right: &Subtree) -> bool {
        let Some(left) = left else {
            return true;
        };

        if right.error_cost() < left.error_cost() {
            log!(
                self,
                "select_smaller_error symbol:{}, over_symbol:{}",
                language.symbol_name(right.symbol()),
                language.symbol_name(left.symbol())
            );
            return true;
        }
        if left.error_cost() < right.error_cost() {
            log!(
                self,
                "select_smaller_error symbol:{}, over_symbol:{}",
                language.symbol_name(left.symbol()),
                language.symbol_name(right.symbol())
            );
            return false;
        }

        if right.dynamic_precedence() > left.dynamic_precedence() {
            log!(
                self,
                "select_higher_precedence symbol:{}, prec:{}, over_symbol:{}, other_prec:{}",
                language.symbol_name(right.symbol()),
                right.dynamic_precedence(),
                language.symbol_name(left.symbol()),
                left.dynamic_precedence()
            );
            return true;
        }
        if left.dynamic_precedence() > right.dynamic_precedence() {
            log!(
                self,
                "select_higher_precedence symbol:{}, prec:{}, over_symbol:{}, other_prec:{}",
                language.symbol_name(left.symbol()),
                left.dynamic_precedence(),
                language.symbol_name(right.symbol()),
                right.dynamic_precedence()
            );
            return false;
        }

        if left.error_cost() > 0 {
            return true;
        }

        match subtree::compare(left, right) {
            -1 => {
                log!(
                    self,
                    "select_earlier symbol:{}, over_symbol:{}",
                    language.symbol_name(left.symbol()),
                    language.symbol_name(right.symbol())
                );
                false
            }
            1 => {
                log!(
                    self,
                    "select_earlier symbol:{}, over_symbol:{}",
                    language.symbol_name(right.symbol()),
                    language.symbol_name(left.symbol())
                );
                true
            }
            _ => {
                log!(
                    self,
                    "select_existing symbol:{}, over_symbol:{}",
                    language.symbol_name(left.symbol()),
                    language.symbol_name(right.symbol())
                );
                false
            }
        }
    }

    /// Choose between the current parent and an alternative child
    /// arrangement produced by a different pop path.
    fn select_children(
        &mut self,
        language: &Language,
        left: &Subtree,
        children: &[Subtree],
    ) -> bool {
        let scratch = self
            .pool
            .new_node(left.symbol(), children.to_vec(), 0, language);
        self.select_tree(language, Some(left), &scratch)
    }

    // -- shift / reduce / accept --------------------------------------------

    fn shift(&mut self, version: StackVersion, state: StateId, lookahead: Subtree, extra: bool) {
        let mut lookahead = lookahead;
        let is_leaf = lookahead.child_count() == 0;
        if extra != lookahead.extra() && is_leaf {
            lookahead.make_mut().extra = extra;
        }

        let last_external = if lookahead.has_external_tokens() {
            lookahead.last_external_token()
        } else {
            None
        };
        let has_external = lookahead.has_external_tokens();
        self.stack.push(version, Some(lookahead), !is_leaf, state);
        if has_external {
            self.stack.set_last_external_token(version, last_external);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn reduce(
        &mut self,
        language: &Language,
        version: StackVersion,
        symbol: Symbol,
        count: u32,
        dynamic_precedence: i32,
        production_id: u16,
        is_fragile: bool,
        end_of_non_terminal_extra: bool,
    ) -> Option<StackVersion> {
        let initial_version_count = self.stack.version_count();
        let mut pop = self.stack.pop_count(version, count);
        let pop_slice_count = pop.len();
        let mut removed_version_count = 0;
        let halted_version_count = self.stack.halted_version_count();

        let mut i = 0;
        while i < pop.len() {
            let original_version = pop[i].version;
            let slice_version = original_version - removed_version_count;

            // Hard cap on the number of in-flight versions; drop this slice
            // and any siblings sharing its origin.
            if slice_version > MAX_VERSION_COUNT + MAX_VERSION_COUNT_OVERFLOW + halted_version_count
            {
                log!(self, "aborting reduce with too many versions");
                self.stack.remove_version(slice_version);
                removed_version_count += 1;
                while i + 1 < pop.len() && pop[i + 1].version == original_version {
                    i += 1;
                }
                i += 1;
                continue;
            }

            let mut children = std::mem::take(&mut pop[i].subtrees);
            let mut trailing_extras = remove_trailing_extras(&mut children);
            let mut parent = self.pool.new_node(symbol, children, production_id, language);

            // Multiple pop paths reached the same version: keep whichever
            // child arrangement the selection rule prefers.
            while i + 1 < pop.len() && pop[i + 1].version == original_version {
                i += 1;
                let mut next_children = std::mem::take(&mut pop[i].subtrees);
                let next_trailing_extras = remove_trailing_extras(&mut next_children);
                if self.select_children(language, &parent, &next_children) {
                    trailing_extras = next_trailing_extras;
                    parent = self
                        .pool
                        .new_node(symbol, next_children, production_id, language);
                }
            }

            let state = self.stack.state(slice_version);
            let next_state = language.next_state(state, symbol);
            {
                let data = parent.make_mut();
                if end_of_non_terminal_extra && next_state == state {
                    data.extra = true;
                }
                if is_fragile || pop_slice_count > 1 || initial_version_count > 1 {
                    data.fragile_left = true;
                    data.fragile_right = true;
                    data.parse_state = TREE_STATE_NONE;
                } else {
                    data.parse_state = state;
                }
            }
            parent.add_dynamic_precedence(dynamic_precedence);

            self.stack
                .push(slice_version, Some(parent), false, next_state);
            for extra in trailing_extras {
                self.stack.push(slice_version, Some(extra), false, next_state);
            }

            for j in 0..slice_version {
                if j == version {
                    continue;
                }
                if self.stack.merge(j, slice_version) {
                    removed_version_count += 1;
                    break;
                }
            }

            i += 1;
        }

        if self.stack.version_count() > initial_version_count {
            Some(initial_version_count)
        } else {
            None
        }
    }

    fn accept(&mut self, language: &Language, version: StackVersion, lookahead: Subtree) {
        debug_assert!(lookahead.is_eof());
        self.stack.push(version, Some(lookahead), false, 1);

        let mut pop = self.stack.pop_all(version);
        let first_version = pop.first().map(|slice| slice.version);
        for slice in &mut pop {
            let mut trees = std::mem::take(&mut slice.subtrees);

            // Fold the topmost non-extra subtree so that the trailing extras
            // and the EOF token become its children.
            let mut root = None;
            for j in (0..trees.len()).rev() {
                if !trees[j].extra() {
                    let tree = trees[j].clone();
                    let children: Vec<Subtree> = tree.children().to_vec();
                    trees.splice(j..j + 1, children);
                    root = Some(self.pool.new_node(
                        tree.symbol(),
                        trees,
                        tree.production_id(),
                        language,
                    ));
                    break;
                }
            }
            let Some(root) = root else {
                continue;
            };

            self.accept_count += 1;

            match self.finished_tree.take() {
                Some(finished) => {
                    if self.select_tree(language, Some(&finished), &root) {
                        self.finished_tree = Some(root);
                    } else {
                        self.finished_tree = Some(finished);
                    }
                }
                None => self.finished_tree = Some(root),
            }
        }

        if let Some(first_version) = first_version {
            self.stack.remove_version(first_version);
        }
        self.stack.halt(version);
    }

    // -- error recovery -----------------------------------------------------

    /// Explore every reduction available to this version (or, with a target
    /// symbol, every reduction whose successor can consume the target).
    /// Returns whether some resulting state can shift the target.
    fn do_all_potential_reductions(
        &mut self,
        language: &Language,
        starting_version: StackVersion,
        lookahead_symbol: Symbol,
    ) -> bool {
        let initial_version_count = self.stack.version_count();

        let mut can_shift_lookahead_symbol = false;
        let mut version = starting_version;
        let mut i = 0;
        loop {
            let version_count = self.stack.version_count();
            if version >= version_count {
                break;
            }

            let mut merged = false;
            for j in initial_version_count..version {
                if self.stack.merge(j, version) {
                    merged = true;
                    break;
                }
            }
            if merged {
                i += 1;
                continue;
            }

            let state = self.stack.state(version);
            let mut has_shift_action = false;
            self.reduce_actions.clear();

            let (first_symbol, end_symbol) = if lookahead_symbol != 0 {
                (u32::from(lookahead_symbol), u32::from(lookahead_symbol) + 1)
            } else {
                (1, language.token_count())
            };

            for symbol in first_symbol..end_symbol {
                let symbol = symbol as Symbol;
                for action in language.actions(state, symbol) {
                    match *action {
                        ParseAction::Shift {
                            extra, repetition, ..
                        } => {
                            if !extra && !repetition {
                                has_shift_action = true;
                            }
                        }
                        ParseAction::Recover => {
                            has_shift_action = true;
                        }
                        ParseAction::Reduce {
                            symbol,
                            child_count,
                            dynamic_precedence,
                            production_id,
                        } => {
                            if child_count > 0 {
                                self.reduce_actions.add(ReduceAction {
                                    symbol,
                                    count: u32::from(child_count),
                                    dynamic_precedence,
                                    production_id,
                                });
                            }
                        }
                        ParseAction::Accept => {}
                    }
                }
            }

            let mut reduction_version = None;
            for action in self.reduce_actions.take() {
                reduction_version = self.reduce(
                    language,
                    version,
                    action.symbol,
                    action.count,
                    action.dynamic_precedence,
                    action.production_id,
                    true,
                    false,
                );
            }

            if has_shift_action {
                can_shift_lookahead_symbol = true;
            } else if let Some(reduction_version) = reduction_version {
                if i < MAX_VERSION_COUNT {
                    self.stack.renumber_version(reduction_version, version);
                    i += 1;
                    continue;
                } else if lookahead_symbol != 0 {
                    self.stack.remove_version(version);
                }
            } else if lookahead_symbol != 0 {
                self.stack.remove_version(version);
            }

            if version == starting_version {
                version = version_count;
            } else {
                version += 1;
            }
            i += 1;
        }

        can_shift_lookahead_symbol
    }

    /// Snap back to an earlier state recorded in the version's summary,
    /// wrapping everything popped on the way into an ERROR node.
    fn recover_to_state(
        &mut self,
        language: &Language,
        version: StackVersion,
        depth: u32,
        goal_state: StateId,
    ) -> bool {
        let mut pop = self.stack.pop_count(version, depth);
        let mut previous_version = None;

        let mut i = 0;
        while i < pop.len() {
            if Some(pop[i].version) == previous_version {
                pop.remove(i);
                continue;
            }
            if self.stack.state(pop[i].version) != goal_state {
                self.stack.halt(pop[i].version);
                pop.remove(i);
                continue;
            }

            let slice_version = pop[i].version;

            // Merge a pre-existing error on the stack into this one.
            let error_trees = self.stack.pop_error(slice_version);
            if let Some(error_tree) = error_trees.first() {
                debug_assert!(error_trees.len() == 1);
                let mut merged: Vec<Subtree> = error_tree.children().to_vec();
                merged.append(&mut pop[i].subtrees);
                pop[i].subtrees = merged;
            }

            let mut subtrees = std::mem::take(&mut pop[i].subtrees);
            let trailing_extras = remove_trailing_extras(&mut subtrees);

            if !subtrees.is_empty() {
                let error = self.pool.new_error_node(subtrees, true, language);
                self.stack.push(slice_version, Some(error), false, goal_state);
            }

            for extra in trailing_extras {
                self.stack.push(slice_version, Some(extra), false, goal_state);
            }

            previous_version = Some(slice_version);
            i += 1;
        }

        previous_version.is_some()
    }

    fn recover(&mut self, language: &Language, version: StackVersion, lookahead: Subtree) {
        let mut lookahead = lookahead;
        let mut did_recover = false;
        let previous_version_count = self.stack.version_count();
        let position = self.stack.position(version);
        let summary = self.stack.summary(version).cloned();
        let node_count_since_error = self.stack.node_count_since_error(version);
        let current_error_cost = self.stack.error_cost(version);

        // Strategy 1: return to a previous state where the lookahead would
        // have been valid.
        if let Some(summary) = summary {
            if !lookahead.is_error() {
                for entry in summary {
                    if entry.state == ERROR_STATE {
                        continue;
                    }
                    if entry.position.bytes == position.bytes {
                        continue;
                    }
                    let mut depth = entry.depth;
                    if node_count_since_error > 0 {
                        depth += 1;
                    }

                    // Don't create a version that would immediately collapse
                    // into an existing one.
                    let mut would_merge = false;
                    for j in 0..previous_version_count {
                        if self.stack.state(j) == entry.state
                            && self.stack.position(j).bytes == position.bytes
                        {
                            would_merge = true;
                            break;
                        }
                    }
                    if would_merge {
                        continue;
                    }

                    let new_cost = current_error_cost
                        + entry.depth * ERROR_COST_PER_SKIPPED_TREE
                        + (position.bytes - entry.position.bytes) * ERROR_COST_PER_SKIPPED_CHAR
                        + (position.extent.row - entry.position.extent.row)
                            * ERROR_COST_PER_SKIPPED_LINE;
                    if self.better_version_exists(version, false, new_cost) {
                        break;
                    }

                    if language.has_actions(entry.state, lookahead.symbol())
                        && self.recover_to_state(language, version, depth, entry.state)
                    {
                        did_recover = true;
                        log!(
                            self,
                            "recover_to_previous state:{}, depth:{}",
                            entry.state,
                            depth
                        );
                        self.log_stack(language);
                        break;
                    }
                }
            }
        }

        // Drop versions that stalled during the recovery attempts.
        let mut i = previous_version_count;
        while i < self.stack.version_count() {
            if !self.stack.is_active(i) {
                log!(self, "removed paused version:{}", i);
                self.stack.remove_version(i);
                self.log_stack(language);
            } else {
                i += 1;
            }
        }

        // At end of input, wrap whatever remains and finish.
        if lookahead.is_eof() {
            log!(self, "recover_eof");
            let parent = self.pool.new_error_node(Vec::new(), false, language);
            self.stack.push(version, Some(parent), false, 1);
            self.accept(language, version, lookahead);
            return;
        }

        if did_recover && self.stack.version_count() > MAX_VERSION_COUNT {
            self.stack.halt(version);
            return;
        }
        if did_recover && lookahead.has_external_scanner_state_change() {
            self.stack.halt(version);
            return;
        }

        // Strategy 2: skip the lookahead, unless a better branch exists.
        let new_cost = current_error_cost
            + ERROR_COST_PER_SKIPPED_TREE
            + lookahead.total_bytes() * ERROR_COST_PER_SKIPPED_CHAR
            + lookahead.total_size().extent.row * ERROR_COST_PER_SKIPPED_LINE;
        if self.better_version_exists(version, false, new_cost) {
            self.stack.halt(version);
            return;
        }

        // Tokens the grammar allows as extras keep that role inside errors.
        if let Some(ParseAction::Shift { extra: true, .. }) =
            language.actions(1, lookahead.symbol()).last()
        {
            lookahead.make_mut().extra = true;
        }

        log!(
            self,
            "skip_token symbol:{}",
            language.symbol_name(lookahead.symbol())
        );
        let has_external_tokens = lookahead.has_external_tokens();
        let last_external_token = lookahead.last_external_token();
        let mut error_repeat =
            self.pool
                .new_node(ERROR_REPEAT_SYMBOL, vec![lookahead], 0, language);

        // Fold into the error already on top of the stack, if any.
        if node_count_since_error > 0 {
            let mut pop = self.stack.pop_count(version, 1);
            if pop.len() > 1 {
                while self.stack.version_count() > pop[0].version + 1 {
                    self.stack.remove_version(pop[0].version + 1);
                }
            }
            if let Some(first) = pop.first_mut() {
                let first_version = first.version;
                let mut subtrees = std::mem::take(&mut first.subtrees);
                self.stack.renumber_version(first_version, version);
                subtrees.push(error_repeat);
                error_repeat = self.pool.new_node(ERROR_REPEAT_SYMBOL, subtrees, 0, language);
            }
        }

        self.stack
            .push(version, Some(error_repeat), false, ERROR_STATE);
        if has_external_tokens {
            self.stack
                .set_last_external_token(version, last_external_token);
        }

        let mut all_in_error = true;
        for i in 0..self.stack.version_count() {
            if !self.version_status(i).is_in_error {
                all_in_error = false;
                break;
            }
        }
        self.has_error = all_in_error;
    }

    fn handle_error(&mut self, language: &Language, version: StackVersion, lookahead: Subtree) {
        let previous_version_count = self.stack.version_count();

        // Perform any reductions that can happen in this state, regardless
        // of the lookahead: after skipping invalid tokens the parser might
        // find one that would have permitted a reduction.
        self.do_all_potential_reductions(language, version, 0);
        let version_count = self.stack.version_count();
        let position = self.stack.position(version);

        // Push a discontinuity onto each version; on the first, also try to
        // recover by pretending a single missing token was present.
        let mut did_insert_missing_token = false;
        let mut v = version;
        while v < version_count {
            if !did_insert_missing_token {
                let state = self.stack.state(v);
                for missing_symbol in 1..language.token_count() {
                    let missing_symbol = missing_symbol as Symbol;
                    let state_after_missing = language.next_state(state, missing_symbol);
                    if state_after_missing == 0 || state_after_missing == state {
                        continue;
                    }
                    if !language.has_reduce_action(state_after_missing, lookahead.leaf_symbol()) {
                        continue;
                    }

                    // The missing token's padding positions it inside the
                    // next included range, where the lexer will resume.
                    self.lexer.reset(position);
                    self.lexer.mark_end();
                    let padding = self.lexer.token_end_position - position;
                    let lookahead_bytes = lookahead.total_bytes() + lookahead.lookahead_bytes();

                    let version_with_missing_tree = self.stack.copy_version(v);
                    let missing_tree = self.pool.new_missing_leaf(
                        missing_symbol,
                        padding,
                        lookahead_bytes,
                        language,
                    );
                    self.stack.push(
                        version_with_missing_tree,
                        Some(missing_tree),
                        false,
                        state_after_missing,
                    );

                    if self.do_all_potential_reductions(
                        language,
                        version_with_missing_tree,
                        lookahead.leaf_symbol(),
                    ) {
                        log!(
                            self,
                            "recover_with_missing symbol:{}, state:{}",
                            language.symbol_name(missing_symbol),
                            self.stack.state(version_with_missing_tree)
                        );
                        did_insert_missing_token = true;
                        break;
                    }
                }
            }

            self.stack.push(v, None, false, ERROR_STATE);
            v = if v == version {
                previous_version_count
            } else {
                v + 1
            };
        }

        // Fold the versions created above back into one.
        for _ in previous_version_count..version_count {
            let did_merge = self.stack.merge(version, previous_version_count);
            debug_assert!(did_merge);
            let _ = did_merge;
        }

        self.stack.record_summary(version, MAX_SUMMARY_DEPTH);

        // Begin recovery with this lookahead immediately so the tree
        // accounts for its lookahead bytes.
        let mut lookahead = lookahead;
        if lookahead.child_count() > 0 {
            self.breakdown_lookahead(language, &mut lookahead, ERROR_STATE);
        }
        self.recover(language, version, lookahead);

        self.log_stack(language);
    }

    // -- the advance step ----------------------------------------------------

    fn advance(
        &mut self,
        session: &mut ParseSession<'_, '_, '_>,
        language: &Language,
        version: StackVersion,
        allow_node_reuse: bool,
    ) -> Result<(), Interrupted> {
        let mut state = self.stack.state(version);
        let position = self.stack.position(version).bytes;
        let last_external_token = self.stack.last_external_token(version);

        let mut did_reuse = true;
        let mut lookahead: Option<Subtree> = None;

        // If possible, reuse a node from the previous syntax tree.
        if allow_node_reuse {
            lookahead = self.reuse_node(
                language,
                version,
                &mut state,
                position,
                last_external_token.as_ref(),
            );
        }

        // Otherwise, try the token most recently returned by the lexer.
        if lookahead.is_none() {
            did_reuse = false;
            lookahead =
                self.get_cached_token(language, state, position, last_external_token.as_ref());
        }

        let mut needs_lex = lookahead.is_none();
        loop {
            if needs_lex {
                needs_lex = false;
                lookahead = self.lex(session, language, version, state)?;
                if let Some(token) = &lookahead {
                    self.set_cached_token(
                        position,
                        last_external_token.clone(),
                        Some(token.clone()),
                    );
                }
            }

            if !self.check_progress(session, Some(position), 1) {
                return Err(Interrupted::Cancelled);
            }

            // With no lookahead (the end of a non-terminal extra), the fixed
            // reduction is stored at the EOF entry.
            let entry_symbol = match &lookahead {
                Some(token) => token.leaf_symbol(),
                None => EOF_SYMBOL,
            };
            let entry = language.table_entry(state, entry_symbol);

            // Process each action for this lookahead in table order. REDUCE
            // actions fork new versions; SHIFT, ACCEPT, and RECOVER all
            // finish this version's step.
            let mut did_reduce = false;
            let mut last_reduction_version: Option<StackVersion> = None;
            for action in entry.actions {
                match *action {
                    ParseAction::Shift {
                        state: shift_state,
                        extra,
                        repetition,
                    } => {
                        if repetition {
                            break;
                        }
                        let mut next_state = if extra {
                            log!(self, "shift_extra");
                            state
                        } else {
                            log!(self, "shift state:{}", shift_state);
                            shift_state
                        };

                        let Some(mut lookahead_tree) = lookahead.take() else {
                            break;
                        };
                        if lookahead_tree.child_count() > 0 {
                            self.breakdown_lookahead(language, &mut lookahead_tree, state);
                            next_state = language.next_state(state, lookahead_tree.symbol());
                        }
                        self.shift(version, next_state, lookahead_tree, extra);
                        if did_reuse {
                            self.reusable_node.advance();
                        }
                        return Ok(());
                    }

                    ParseAction::Reduce {
                        symbol,
                        child_count,
                        dynamic_precedence,
                        production_id,
                    } => {
                        let is_fragile = entry.actions.len() > 1;
                        let end_of_non_terminal_extra = lookahead.is_none();
                        log!(
                            self,
                            "reduce sym:{}, child_count:{}",
                            language.symbol_name(symbol),
                            child_count
                        );
                        let reduction_version = self.reduce(
                            language,
                            version,
                            symbol,
                            u32::from(child_count),
                            dynamic_precedence,
                            production_id,
                            is_fragile,
                            end_of_non_terminal_extra,
                        );
                        did_reduce = true;
                        if let Some(reduction_version) = reduction_version {
                            last_reduction_version = Some(reduction_version);
                        }
                    }

                    ParseAction::Accept => {
                        log!(self, "accept");
                        let Some(lookahead_tree) = lookahead.take() else {
                            break;
                        };
                        self.accept(language, version, lookahead_tree);
                        return Ok(());
                    }

                    ParseAction::Recover => {
                        let Some(mut lookahead_tree) = lookahead.take() else {
                            break;
                        };
                        if lookahead_tree.child_count() > 0 {
                            self.breakdown_lookahead(language, &mut lookahead_tree, ERROR_STATE);
                        }
                        self.recover(language, version, lookahead_tree);
                        if did_reuse {
                            self.reusable_node.advance();
                        }
                        return Ok(());
                    }
                }
            }

            // Continue with one of the versions the reductions produced.
            if let Some(last_reduction_version) = last_reduction_version {
                self.stack.renumber_version(last_reduction_version, version);
                self.log_stack(language);
                state = self.stack.state(version);

                // After the fixed reduction that ends a non-terminal extra,
                // the lexer must run again in the new state.
                if lookahead.is_none() {
                    needs_lex = true;
                }
                continue;
            }

            // The reduction was merged into an existing version; this one is
            // finished.
            if did_reduce {
                self.stack.halt(version);
                return Ok(());
            }

            // Keyword fallback: an invalid keyword whose word token is valid
            // here is reinterpreted as the word token.
            if let (Some(lookahead_tree), Some(keyword_capture)) =
                (&mut lookahead, language.keyword_capture_token())
            {
                if lookahead_tree.is_keyword()
                    && lookahead_tree.symbol() != keyword_capture
                    && !language.is_reserved_word(state, lookahead_tree.symbol())
                    && language.has_actions(state, keyword_capture)
                {
                    log!(
                        self,
                        "switch from_keyword:{}, to_word_token:{}",
                        language.symbol_name(lookahead_tree.symbol()),
                        language.symbol_name(keyword_capture)
                    );
                    lookahead_tree.set_symbol(keyword_capture, language);
                    continue;
                }
            }

            // A reused subtree on the stack may have made this lookahead
            // invalid; replace it with its children and retry.
            if self.breakdown_top_of_stack(language, version) {
                state = self.stack.state(version);
                lookahead = None;
                needs_lex = true;
                continue;
            }

            // A genuine parse error. Pause this version; if every version
            // ends up paused, condensation will start error recovery.
            let Some(lookahead_tree) = lookahead.take() else {
                self.stack.halt(version);
                return Ok(());
            };
            log!(
                self,
                "detect_error lookahead:{}",
                language.symbol_name(lookahead_tree.symbol())
            );
            self.stack.pause(version, lookahead_tree);
            return Ok(());
        }
    }

    // -- condensation -------------------------------------------------------

    /// Prune and merge versions after a full sweep. Returns the minimum
    /// error cost among active versions that are not in an error state.
    fn condense_stack(&mut self, language: &Language) -> u32 {
        let mut made_changes = false;
        let mut min_error_cost = u32::MAX;

        let mut i = 0;
        while i < self.stack.version_count() {
            if self.stack.is_halted(i) {
                self.stack.remove_version(i);
                continue;
            }

            let status_i = self.version_status(i);
            if !status_i.is_in_error && status_i.cost < min_error_cost {
                min_error_cost = status_i.cost;
            }

            let mut removed_i = false;
            let mut j = 0;
            while j < i {
                let status_j = self.version_status(j);
                match compare_versions(status_j, status_i) {
                    ErrorComparison::TakeLeft => {
                        made_changes = true;
                        self.stack.remove_version(i);
                        removed_i = true;
                        break;
                    }
                    ErrorComparison::PreferLeft | ErrorComparison::None => {
                        if self.stack.merge(j, i) {
                            made_changes = true;
                            removed_i = true;
                            break;
                        }
                        j += 1;
                    }
                    ErrorComparison::PreferRight => {
                        made_changes = true;
                        if self.stack.merge(j, i) {
                            removed_i = true;
                            break;
                        }
                        self.stack.swap_versions(i, j);
                        j += 1;
                    }
                    ErrorComparison::TakeRight => {
                        made_changes = true;
                        self.stack.remove_version(j);
                        i -= 1;
                    }
                }
            }
            if !removed_i {
                i += 1;
            }
        }

        while self.stack.version_count() > MAX_VERSION_COUNT {
            self.stack.remove_version(MAX_VERSION_COUNT);
            made_changes = true;
        }

        // If the best-performing version is paused, resume it and begin
        // error recovery; drop any other paused versions.
        if self.stack.version_count() > 0 {
            let mut has_unpaused_version = false;
            let mut n = self.stack.version_count();
            let mut i = 0;
            while i < n {
                if self.stack.is_paused(i) {
                    if !has_unpaused_version && self.accept_count < MAX_VERSION_COUNT {
                        log!(self, "resume version:{}", i);
                        min_error_cost = self.stack.error_cost(i);
                        if let Some(lookahead) = self.stack.resume(i) {
                            self.handle_error(language, i, lookahead);
                        }
                        has_unpaused_version = true;
                    } else {
                        self.stack.remove_version(i);
                        made_changes = true;
                        n -= 1;
                        continue;
                    }
                } else {
                    has_unpaused_version = true;
                }
                i += 1;
            }
        }

        if made_changes {
            log!(self, "condense");
            self.log_stack(language);
        }

        min_error_cost
    }

    // -- rebalancing --------------------------------------------------------

    /// Iteratively flatten right-skewed repetition chains in the finished
    /// tree. The worklist stores child-index paths from the root and lives
    /// on the parser, so a cancelled pass resumes on the next `parse`.
    fn balance_subtree(&mut self, session: &mut ParseSession<'_, '_, '_>) -> Result<(), Interrupted> {
        let Some(mut tree) = self.finished_tree.take() else {
            return Ok(());
        };
        if !self.canceled_balancing {
            self.balance_worklist.clear();
            if tree.child_count() > 0 && tree.ref_count() == 1 {
                self.balance_worklist.push(Vec::new());
            }
        }
        let result = self.run_balance(&mut tree, session);
        self.finished_tree = Some(tree);
        result
    }

    fn run_balance(
        &mut self,
        root: &mut Subtree,
        session: &mut ParseSession<'_, '_, '_>,
    ) -> Result<(), Interrupted> {
        while let Some(path) = self.balance_worklist.last().cloned() {
            if !self.check_progress(session, None, 1) {
                return Err(Interrupted::Cancelled);
            }

            let Some(node) = node_at_path(root, &path) else {
                self.balance_worklist.pop();
                continue;
            };

            if node.repeat_depth() > 0 {
                let children = node.children();
                let first_depth = children[0].repeat_depth();
                let last_depth = children[children.len() - 1].repeat_depth();
                if first_depth > last_depth {
                    let mut remaining = first_depth - last_depth;
                    let mut step = remaining / 2;
                    while step > 0 {
                        subtree::compress(node, step, &self.pool);
                        remaining -= step;

                        // Larger compressions cost proportionally more work;
                        // scale the operation count so cancellation checks
                        // stay evenly spaced.
                        let operations = if step >> 4 > 0 { step >> 4 } else { 1 };
                        if !self.check_progress(session, None, operations) {
                            return Err(Interrupted::Cancelled);
                        }
                        step /= 2;
                    }
                }
            }

            self.balance_worklist.pop();
            let Some(node) = node_at_path(root, &path) else {
                continue;
            };
            for (index, child) in node.children().iter().enumerate() {
                if child.child_count() > 0 && child.ref_count() == 1 {
                    let mut child_path = path.clone();
                    child_path.push(index as u32);
                    self.balance_worklist.push(child_path);
                }
            }
        }
        Ok(())
    }
}

fn node_at_path<'a>(root: &'a mut Subtree, path: &[u32]) -> Option<&'a mut Subtree> {
    let mut current = root;
    for &index in path {
        current = current.child_mut(index as usize)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(cost: u32, node_count: u32, is_in_error: bool) -> ErrorStatus {
        ErrorStatus {
            cost,
            node_count,
            dynamic_precedence: 0,
            is_in_error,
        }
    }

    #[test]
    fn error_free_version_beats_erroring_one() {
        assert_eq!(
            compare_versions(status(10, 1, false), status(5, 1, true)),
            ErrorComparison::PreferLeft
        );
        assert_eq!(
            compare_versions(status(4, 1, false), status(5, 1, true)),
            ErrorComparison::TakeLeft
        );
        assert_eq!(
            compare_versions(status(500, 1, true), status(5, 1, false)),
            ErrorComparison::TakeRight
        );
    }

    #[test]
    fn large_cost_gaps_take_small_ones_prefer() {
        // Gap of 100 with 20 nodes parsed: decisive.
        assert_eq!(
            compare_versions(status(100, 20, true), status(200, 3, true)),
            ErrorComparison::TakeLeft
        );
        // Tiny gap with little parsed since: keep both.
        assert_eq!(
            compare_versions(status(100, 2, true), status(130, 3, true)),
            ErrorComparison::PreferLeft
        );
    }

    #[test]
    fn ties_break_on_dynamic_precedence() {
        let mut a = status(10, 1, false);
        let b = status(10, 1, false);
        assert_eq!(compare_versions(a, b), ErrorComparison::None);
        a.dynamic_precedence = 3;
        assert_eq!(compare_versions(a, b), ErrorComparison::PreferLeft);
        assert_eq!(compare_versions(b, a), ErrorComparison::PreferRight);
    }
}
