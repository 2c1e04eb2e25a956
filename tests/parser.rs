mod fixtures;

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arbor::error_costs::{ERROR_COST_PER_MISSING_TREE, ERROR_COST_PER_RECOVERY};
use arbor::{InputEdit, LogType, ParseError, ParseOptions, Parser, Point, Range, Subtree};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use fixtures::*;

fn parser_for(language: &arbor::Language) -> Parser {
    // Route the engine's tracing events to stderr when RUST_LOG asks for
    // them; handy when a scenario goes sideways.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let mut parser = Parser::new();
    parser
        .set_language(language)
        .expect("fixture languages are version-compatible");
    parser
}

#[test]
fn test_parse_plain_sequence() {
    let PairGrammar {
        language, a, b, rule, ..
    } = pair_language();
    let mut parser = parser_for(&language);

    let tree = parser.parse("ab", None).unwrap();
    let root = tree.root();
    assert_eq!(root.symbol(), rule);
    assert_eq!(root.total_bytes(), 2);
    assert_eq!(root.error_cost(), 0);
    assert_eq!(tree.to_sexp(), "(pair (a) (b))");

    let symbols: Vec<_> = root.children().iter().map(Subtree::symbol).collect();
    assert_eq!(&symbols[..2], &[a, b]);
    assert_eq!(root.children()[0].total_bytes(), 1);
    assert_eq!(root.children()[1].padding().bytes, 0);
    assert_eq!(root.children()[1].size().bytes, 1);
}

#[test]
fn test_error_skip_preserves_all_bytes() {
    let PairGrammar { language, rule, .. } = pair_language();
    let mut parser = parser_for(&language);

    let tree = parser.parse("aXb", None).unwrap();
    let root = tree.root();
    assert_eq!(root.symbol(), rule);
    assert_eq!(root.total_bytes(), 3);
    assert!(root.error_cost() > 0);

    // The unrecognized byte is wrapped in an ERROR node spanning exactly it.
    let error = find_node(root, |node| node.is_error() && node.total_bytes() == 1)
        .expect("the skipped byte is wrapped in an ERROR node");
    assert!(error.is_error());

    // The b token still follows the error.
    let leaf_symbols: Vec<_> = leaves(root)
        .iter()
        .filter(|leaf| !leaf.is_eof())
        .map(Subtree::symbol)
        .collect();
    assert_eq!(leaf_symbols.first().copied(), Some(1));
    assert_eq!(leaf_symbols.last().copied(), Some(2));
}

#[test]
fn test_missing_token_insertion() {
    let TripleGrammar { language, .. } = triple_language();
    let mut parser = parser_for(&language);

    let tree = parser.parse("ac", None).unwrap();
    assert_eq!(tree.to_sexp(), "(S (A (a)) (B (MISSING b)) (C (c)))");

    let missing = find_node(tree.root(), |node| node.is_missing())
        .expect("a zero-width missing leaf was inserted");
    assert_eq!(missing.size().bytes, 0);

    // The final error cost is exactly one missing-leaf penalty.
    assert_eq!(
        tree.root().error_cost(),
        ERROR_COST_PER_MISSING_TREE + ERROR_COST_PER_RECOVERY
    );
}

#[test]
fn test_ambiguity_resolved_by_dynamic_precedence() {
    let AmbigGrammar { language, expr, .. } = ambig_language();
    let mut parser = parser_for(&language);

    let tree = parser.parse("x", None).unwrap();
    let root = tree.root();
    assert_eq!(root.symbol(), expr);
    assert_eq!(root.error_cost(), 0);
    // The production with dynamic precedence 5 wins over the one with 0.
    assert_eq!(root.production_id(), 2);
}

#[test]
fn test_incremental_reuse_shares_unchanged_leaves() {
    let RepeatGrammar { language, a, s, .. } = repeat_language();
    let mut parser = parser_for(&language);

    let mut old_tree = parser.parse("aaaaa", None).unwrap();
    assert_eq!(old_tree.root().symbol(), s);
    assert_eq!(old_tree.root().error_cost(), 0);
    let old_leaves: Vec<_> = leaves(old_tree.root())
        .into_iter()
        .filter(|leaf| leaf.symbol() == a)
        .collect();
    assert_eq!(old_leaves.len(), 5);

    // Append a byte the grammar does not recognize.
    old_tree.edit(&InputEdit {
        start_byte: 5,
        old_end_byte: 5,
        new_end_byte: 6,
        start_point: Point::new(0, 5),
        old_end_point: Point::new(0, 5),
        new_end_point: Point::new(0, 6),
    });

    let new_tree = parser.parse("aaaaab", Some(&old_tree)).unwrap();
    assert_eq!(new_tree.root().total_bytes(), 6);
    assert!(new_tree.root().error_cost() > 0);

    let new_leaves: Vec<_> = leaves(new_tree.root())
        .into_iter()
        .filter(|leaf| leaf.symbol() == a)
        .collect();
    assert_eq!(new_leaves.len(), 5);

    // Leaves the edit could not have affected (their span plus lookahead
    // ends before the insertion point) are the same refcounted nodes.
    for i in 0..3 {
        assert!(
            new_leaves[i].ptr_eq(&old_leaves[i]),
            "leaf {i} should be reused from the previous tree"
        );
    }
}

#[test]
fn test_cancellation_preserves_state_for_resume() {
    let RepeatGrammar { language, .. } = repeat_language();
    let text = "a".repeat(1 << 20);

    // A progress callback that cancels on its first invocation.
    let mut parser = parser_for(&language);
    let mut input: &[u8] = text.as_bytes();
    let result = parser.parse_with_options(
        &mut input,
        None,
        ParseOptions {
            progress_callback: Some(&mut |_| true),
        },
    );
    assert_eq!(result.unwrap_err(), ParseError::Cancelled);

    // Re-invoking with cancellation disabled resumes and completes.
    let resumed = parser.parse(&text, None).unwrap();

    let mut fresh_parser = parser_for(&language);
    let fresh = fresh_parser.parse(&text, None).unwrap();

    assert_eq!(resumed.root().total_bytes() as usize, text.len());
    assert!(resumed.root().structure_eq(fresh.root()));
}

#[test]
fn test_cancellation_flag() {
    let RepeatGrammar { language, .. } = repeat_language();
    let text = "a".repeat(2000);

    let mut parser = parser_for(&language);
    let flag = Arc::new(AtomicUsize::new(1));
    parser.set_cancellation_flag(Some(Arc::clone(&flag)));
    assert_eq!(
        parser.parse(&text, None).unwrap_err(),
        ParseError::Cancelled
    );

    flag.store(0, Ordering::Relaxed);
    let resumed = parser.parse(&text, None).unwrap();

    let mut fresh_parser = parser_for(&language);
    let fresh = fresh_parser.parse(&text, None).unwrap();
    assert!(resumed.root().structure_eq(fresh.root()));
}

#[test]
fn test_idempotent_reparse() {
    let PairGrammar { language, .. } = pair_language();
    let mut parser = parser_for(&language);

    let first = parser.parse("ab", None).unwrap();
    let second = parser.parse("ab", Some(&first)).unwrap();
    assert!(first.root().structure_eq(second.root()));
}

#[test]
fn test_edit_and_revert_round_trip() {
    let PairGrammar { language, .. } = pair_language();
    let mut parser = parser_for(&language);

    let original = parser.parse("ab", None).unwrap();

    // Insert a junk byte, then remove it again.
    let mut edited = parser.parse("ab", None).unwrap();
    edited.edit(&InputEdit {
        start_byte: 1,
        old_end_byte: 1,
        new_end_byte: 2,
        start_point: Point::new(0, 1),
        old_end_point: Point::new(0, 1),
        new_end_point: Point::new(0, 2),
    });
    let mut with_error = parser.parse("aXb", Some(&edited)).unwrap();
    assert!(with_error.root().error_cost() > 0);

    with_error.edit(&InputEdit {
        start_byte: 1,
        old_end_byte: 2,
        new_end_byte: 1,
        start_point: Point::new(0, 1),
        old_end_point: Point::new(0, 2),
        new_end_point: Point::new(0, 1),
    });
    let reverted = parser.parse("ab", Some(&with_error)).unwrap();
    assert!(reverted.root().structure_eq(original.root()));
}

#[test]
fn test_recovery_across_merged_stack_versions() {
    let ConflictGrammar { language, s, .. } = conflict_language();

    // Without junk, the fork exercises the multi-path reduce: two pop paths
    // reach the same version and the selection rule picks one arrangement.
    let mut parser = parser_for(&language);
    let clean = parser.parse("xy", None).unwrap();
    assert_eq!(clean.root().symbol(), s);
    assert_eq!(clean.root().total_bytes(), 2);
    assert_eq!(clean.root().error_cost(), 0);

    // With junk after the merge point, recovery has to operate on a stack
    // whose top node has two incoming links.
    let noisy = parser.parse("xyZ", None).unwrap();
    assert_eq!(noisy.root().total_bytes(), 3);
    assert!(noisy.root().error_cost() > 0);
}

#[test]
fn test_parsing_with_logging() {
    let PairGrammar { language, .. } = pair_language();
    let mut parser = parser_for(&language);

    let messages = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&messages);
    parser.set_logger(Some(Box::new(move |log_type, message| {
        sink.borrow_mut().push((log_type, message.to_string()));
    })));

    parser.parse("ab", None).unwrap();

    let messages = messages.borrow();
    assert!(messages.contains(&(LogType::Parse, "shift state:2".to_string())));
    assert!(messages.contains(&(LogType::Parse, "reduce sym:pair, child_count:2".to_string())));
    assert!(messages.contains(&(LogType::Parse, "done".to_string())));
    assert!(messages.contains(&(LogType::Lex, "consume character:'a'".to_string())));
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_parsing_with_dot_graphs() {
    let PairGrammar { language, .. } = pair_language();
    let mut parser = parser_for(&language);

    let buffer = SharedBuffer::default();
    parser.print_dot_graphs(Some(Box::new(buffer.clone())));
    parser.parse("ab", None).unwrap();

    let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains("digraph stack"));
    assert!(output.contains("digraph tree"));
}

#[test]
fn test_included_ranges_skip_excluded_bytes() {
    let PairGrammar { language, a, b, .. } = pair_language();
    let mut parser = parser_for(&language);
    parser
        .set_included_ranges(&[
            Range {
                start_byte: 0,
                end_byte: 1,
                start_point: Point::new(0, 0),
                end_point: Point::new(0, 1),
            },
            Range {
                start_byte: 2,
                end_byte: 3,
                start_point: Point::new(0, 2),
                end_point: Point::new(0, 3),
            },
        ])
        .unwrap();

    let tree = parser.parse("a;b", None).unwrap();
    let root = tree.root();
    assert_eq!(root.error_cost(), 0);
    assert_eq!(root.children()[0].symbol(), a);

    // The excluded byte becomes padding on the following token.
    let b_leaf = find_node(root, |node| node.symbol() == b).unwrap();
    assert_eq!(b_leaf.padding().bytes, 1);
    assert_eq!(b_leaf.size().bytes, 1);

    // Reparsing with unchanged ranges leaves the structure untouched.
    let again = parser.parse("a;b", Some(&tree)).unwrap();
    assert!(tree.root().structure_eq(again.root()));
}

#[test]
fn test_external_scanner_tokens() {
    let HashGrammar {
        language, hashes, s, ..
    } = hash_language(false);
    let mut parser = parser_for(&language);

    let tree = parser.parse("##a", None).unwrap();
    let root = tree.root();
    assert_eq!(root.symbol(), s);
    assert_eq!(root.error_cost(), 0);

    let hash_leaf = find_node(root, |node| node.symbol() == hashes).unwrap();
    assert_eq!(hash_leaf.total_bytes(), 2);
    assert!(hash_leaf.has_external_tokens());

    // Deterministic scanner: reparsing yields an identical structure.
    let again = parser.parse("##a", None).unwrap();
    assert!(tree.root().structure_eq(again.root()));
}

#[test]
fn test_external_scanner_failure_is_fatal() {
    let HashGrammar { language, .. } = hash_language(true);
    let mut parser = parser_for(&language);

    let result = parser.parse("##a", None);
    assert!(matches!(result, Err(ParseError::Scanner(_))));

    // The failure released the partial state; a healthy language parses.
    let HashGrammar {
        language: healthy, ..
    } = hash_language(false);
    parser.set_language(&healthy).unwrap();
    assert!(parser.parse("#a", None).is_ok());
}

#[test]
fn test_keyword_extraction() {
    let KeywordGrammar {
        language,
        word,
        keyword,
        ..
    } = keyword_language();
    let mut parser = parser_for(&language);

    // The first "if" is adopted as the keyword token; the second occurs
    // where only the word token is valid and stays a word.
    let tree = parser.parse("if if", None).unwrap();
    let root = tree.root();
    assert_eq!(root.error_cost(), 0);
    let symbols: Vec<_> = root.children().iter().map(Subtree::symbol).collect();
    assert_eq!(&symbols[..2], &[keyword, word]);
}

#[test]
fn test_no_language_is_rejected() {
    let mut parser = Parser::new();
    assert_eq!(
        parser.parse("ab", None).unwrap_err(),
        ParseError::NoLanguage
    );
}

proptest! {
    // Every input is covered exactly: the root's footprint equals the input
    // length and the in-order leaves partition it, malformed bytes included.
    #[test]
    fn parse_covers_arbitrary_input(input in "[abx]{0,12}") {
        let PairGrammar { language, .. } = pair_language();
        let mut parser = parser_for(&language);
        let tree = parser.parse(&input, None).unwrap();
        prop_assert_eq!(tree.root().total_bytes() as usize, input.len());

        let mut covered = 0;
        for leaf in leaves(tree.root()) {
            covered += leaf.total_bytes();
        }
        prop_assert_eq!(covered as usize, input.len());
    }
}
