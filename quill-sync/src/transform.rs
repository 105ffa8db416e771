//! Operational transformation over normalized spans.
//!
//! The single entry point is [`transform`]: rewrite a later-sequenced span
//! against an earlier-sequenced one so that applying the earlier span and
//! then the rewritten later span reaches the state both authors intended.
//! The sequencer folds this function over every log entry appended since
//! an operation's base position ([`rebase`]).
//!
//! ```text
//!         client base ──► op ────────────┐
//!                                        ▼
//!  log: [e₁][e₂][e₃] ──► transform(op,e₁) ► transform(·,e₂) ► … ► op'
//! ```
//!
//! Rules, in the order they compose:
//!
//! 1. Offsets left of the earlier span are untouched; offsets past its
//!    deleted range shift by `insert_len − deleted_len`; offsets at or
//!    inside the deleted range collapse to just after the earlier op's
//!    inserted text. The collapse direction is the insert tie-break: the
//!    earlier-sequenced insert keeps its position, the later one lands to
//!    its right.
//! 2. A delete keeps only the part of its range the earlier delete did not
//!    already consume. A fully consumed delete becomes an empty-range
//!    no-op, never an error.
//! 3. If the earlier op's replaced region sits strictly inside the later
//!    delete's range, the later delete swallows the earlier op's inserted
//!    text as well; mirroring that, a later op whose whole span sits
//!    strictly inside the earlier op's deleted range loses its insert.
//!    The two rules are duals — exactly one fires for a given geometry —
//!    which is what keeps single-range operations convergent.
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use crate::operation::{LogEntry, Span};

/// Rewrite `later` against `earlier`, where `earlier` was sequenced first.
///
/// Produces a new span; neither input is mutated. The result may be a
/// no-op (empty range, empty insert) when `later` was entirely consumed.
pub fn transform(later: &Span, earlier: &Span) -> Span {
    let (b0, b1) = (earlier.start, earlier.end);
    let lb = earlier.insert_len();
    let (a0, a1) = (later.start, later.end);

    // Whole span strictly inside the earlier deleted range: the content
    // and the context the insert targeted are both gone.
    let dropped = b0 < a0 && a1 < b1;

    let start = if a0 < b0 {
        a0
    } else if a0 > b1 {
        a0 - (b1 - b0) + lb
    } else {
        b0 + lb
    };

    let overlap = a1.min(b1).saturating_sub(a0.max(b0));
    let surviving = (a1 - a0) - overlap;

    // Earlier op's replacement strictly inside the later delete: the later
    // delete covers the replacement text too.
    let swallow = a0 < b0 && b1 < a1;
    let end = start + surviving + if swallow { lb } else { 0 };

    let insert = if dropped {
        String::new()
    } else {
        later.insert.clone()
    };

    Span { start, end, insert }
}

/// Fold [`transform`] over a run of log entries, oldest first.
///
/// This is the rebase step: `span` was authored at the position just
/// before `entries[0]`, and the result is valid at the position just
/// after the last entry.
pub fn rebase<'a, I>(span: &Span, entries: I) -> Span
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    entries
        .into_iter()
        .fold(span.clone(), |acc, entry| transform(&acc, &entry.span))
}

/// Map a single char offset through an applied span.
///
/// Used to shift cursors and selections when a remote entry lands: a
/// caret inside the deleted range collapses to the end of the replacement
/// text.
pub fn map_offset(offset: usize, applied: &Span) -> usize {
    let inserted = applied.insert_len();
    if offset < applied.start {
        offset
    } else if offset > applied.end {
        offset - applied.deleted_len() + inserted
    } else {
        applied.start + inserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::apply;

    fn ins(at: usize, text: &str) -> Span {
        Span::new(at, at, text)
    }

    fn del(start: usize, end: usize) -> Span {
        Span::new(start, end, "")
    }

    fn rep(start: usize, end: usize, text: &str) -> Span {
        Span::new(start, end, text)
    }

    /// Apply `first` then `second` rebased against it.
    fn sequenced(doc: &str, first: &Span, second: &Span) -> String {
        let after_first = apply(doc, first);
        apply(&after_first, &transform(second, first))
    }

    // ── Insert / insert ──────────────────────────────────────────────

    #[test]
    fn test_insert_insert_same_offset_earlier_wins() {
        // "foo" sequenced first, "baz" shifts right by 3.
        let x = ins(0, "foo");
        let y = ins(0, "baz");
        assert_eq!(sequenced("bar", &x, &y), "foobazbar");
    }

    #[test]
    fn test_insert_insert_same_offset_other_order() {
        let x = ins(0, "foo");
        let y = ins(0, "baz");
        assert_eq!(sequenced("bar", &y, &x), "bazfoobar");
    }

    #[test]
    fn test_insert_insert_disjoint_converges() {
        let a = ins(1, "P");
        let b = ins(3, "Q");
        assert_eq!(sequenced("abcdef", &a, &b), sequenced("abcdef", &b, &a));
        assert_eq!(sequenced("abcdef", &a, &b), "aPbcQdef");
    }

    // ── Insert / delete ──────────────────────────────────────────────

    #[test]
    fn test_insert_before_delete_unchanged() {
        let d = del(3, 5);
        let i = ins(1, "XY");
        let t = transform(&i, &d);
        assert_eq!(t, ins(1, "XY"));
    }

    #[test]
    fn test_insert_after_delete_shifts_left() {
        let d = del(1, 3);
        let i = ins(5, "XY");
        assert_eq!(transform(&i, &d), ins(3, "XY"));
    }

    #[test]
    fn test_insert_inside_deleted_region_is_dropped() {
        // The context the insert targeted no longer exists.
        let d = del(1, 5);
        let i = ins(3, "XY");
        let t = transform(&i, &d);
        assert!(t.is_noop());
    }

    #[test]
    fn test_insert_at_delete_boundaries_survives() {
        let d = del(1, 5);
        assert_eq!(transform(&ins(1, "X"), &d), ins(1, "X"));
        assert_eq!(transform(&ins(5, "X"), &d), ins(1, "X"));
    }

    #[test]
    fn test_delete_spanning_insert_swallows_it() {
        // Both orders agree: the insert inside the deleted region is gone.
        let d = del(1, 5);
        let i = ins(3, "XY");
        let doc = "abcdef";
        assert_eq!(sequenced(doc, &d, &i), "af");
        assert_eq!(sequenced(doc, &i, &d), "af");
    }

    #[test]
    fn test_delete_starting_at_insert_point_keeps_insert() {
        let d = del(1, 5);
        let i = ins(1, "XY");
        let doc = "abcdef";
        assert_eq!(sequenced(doc, &d, &i), "aXYf");
        assert_eq!(sequenced(doc, &i, &d), "aXYf");
    }

    // ── Delete / delete ──────────────────────────────────────────────

    #[test]
    fn test_delete_delete_partial_overlap() {
        // Scenario: X deletes [2,6) of "abcdefgh", Y deletes [4,8).
        let x = del(2, 6);
        let y = del(4, 8);
        let t = transform(&y, &x);
        assert_eq!(t, del(2, 4));
        assert_eq!(sequenced("abcdefgh", &x, &y), "ab");
        assert_eq!(sequenced("abcdefgh", &y, &x), "ab");
    }

    #[test]
    fn test_delete_fully_consumed_is_noop() {
        let big = del(2, 6);
        let small = del(3, 5);
        let t = transform(&small, &big);
        assert_eq!(t.deleted_len(), 0);
        assert!(t.is_noop());
    }

    #[test]
    fn test_noop_delete_does_not_shift_later_offsets() {
        let noop = transform(&del(3, 5), &del(2, 6));
        let i = ins(4, "Z");
        assert_eq!(transform(&i, &noop), ins(4, "Z"));
    }

    #[test]
    fn test_delete_containing_delete() {
        let outer = del(1, 6);
        let inner = del(2, 4);
        assert_eq!(transform(&outer, &inner), del(1, 4));
        assert_eq!(sequenced("abcdefg", &inner, &outer), "ag");
        assert_eq!(sequenced("abcdefg", &outer, &inner), "ag");
    }

    #[test]
    fn test_identical_deletes_converge() {
        let a = del(1, 4);
        let b = del(1, 4);
        assert!(transform(&a, &b).is_noop());
        assert_eq!(sequenced("abcdef", &a, &b), "aef");
    }

    #[test]
    fn test_disjoint_deletes() {
        let a = del(0, 2);
        let b = del(4, 6);
        assert_eq!(transform(&b, &a), del(2, 4));
        assert_eq!(transform(&a, &b), del(0, 2));
        assert_eq!(sequenced("abcdef", &a, &b), "cd");
        assert_eq!(sequenced("abcdef", &b, &a), "cd");
    }

    // ── Replace interactions ─────────────────────────────────────────

    #[test]
    fn test_replace_partial_overlap_keeps_payload() {
        // The surviving part of the replace still deletes; the payload is
        // retained in full.
        let d = del(1, 4);
        let r = rep(3, 6, "QQ");
        let t = transform(&r, &d);
        assert_eq!(t, rep(1, 3, "QQ"));
        assert_eq!(sequenced("abcdefgh", &d, &r), "aQQgh");
        assert_eq!(sequenced("abcdefgh", &r, &d), "aQQgh");
    }

    #[test]
    fn test_replace_strictly_contained_loses_payload() {
        // Its entire span was deleted around it, so the replacement text
        // has nowhere to live.
        let outer = del(2, 6);
        let r = rep(3, 5, "ZZ");
        assert!(transform(&r, &outer).is_noop());
        assert_eq!(sequenced("abcdefgh", &outer, &r), "abgh");
        assert_eq!(sequenced("abcdefgh", &r, &outer), "abgh");
    }

    #[test]
    fn test_replace_sharing_edge_keeps_payload() {
        // Shares the right edge with the delete — not strictly contained.
        let outer = del(2, 6);
        let r = rep(3, 6, "QQ");
        let t = transform(&r, &outer);
        assert_eq!(t, rep(2, 2, "QQ"));
        assert_eq!(sequenced("abcdefgh", &outer, &r), "abQQgh");
        assert_eq!(sequenced("abcdefgh", &r, &outer), "abQQgh");
    }

    #[test]
    fn test_delete_swallows_contained_replace() {
        let outer = del(1, 5);
        let r = rep(2, 4, "QQ");
        let t = transform(&outer, &r);
        // Swallows the two replacement chars as well.
        assert_eq!(t, del(1, 5));
        assert_eq!(sequenced("abcdef", &r, &outer), "af");
        assert_eq!(sequenced("abcdef", &outer, &r), "af");
    }

    #[test]
    fn test_replace_replace_partial_overlap_converges() {
        let a = rep(1, 4, "P");
        let b = rep(2, 6, "Q");
        assert_eq!(sequenced("abcdefg", &a, &b), "aPQg");
        assert_eq!(sequenced("abcdefg", &b, &a), "aPQg");
    }

    #[test]
    fn test_identical_replaces_earlier_payload_first() {
        let a = rep(1, 4, "A");
        let b = rep(1, 4, "B");
        // Earlier-sequenced payload ends up leftmost, both survive.
        assert_eq!(sequenced("abcdef", &a, &b), "aABef");
        assert_eq!(sequenced("abcdef", &b, &a), "aBAef");
    }

    // ── Convergence sweep ────────────────────────────────────────────

    /// Exhaustive convergence check over a small offset grid.
    ///
    /// Whenever at most one of the two spans carries an insert payload,
    /// both sequencing orders must yield identical text. (When both carry
    /// payloads that land on the same point, relative payload order is
    /// decided by sequencing — covered by the tie-break tests above.)
    #[test]
    fn test_convergence_grid() {
        let doc = "abcdefgh";
        let n = doc.chars().count();

        let mut spans: Vec<Span> = Vec::new();
        for start in 0..=n {
            for end in start..=n {
                spans.push(Span::new(start, end, ""));
                if start == end {
                    spans.push(Span::new(start, end, "XY"));
                } else {
                    spans.push(Span::new(start, end, "R"));
                }
            }
        }

        let mut checked = 0usize;
        for a in &spans {
            for b in &spans {
                if !a.insert.is_empty() && !b.insert.is_empty() {
                    continue;
                }
                let ab = sequenced(doc, a, b);
                let ba = sequenced(doc, b, a);
                assert_eq!(
                    ab, ba,
                    "divergence for a={a:?} b={b:?}: {ab:?} vs {ba:?}"
                );
                checked += 1;
            }
        }
        assert!(checked > 1000, "grid should exercise a real case count");
    }

    // ── Rebase ───────────────────────────────────────────────────────

    #[test]
    fn test_rebase_folds_in_order() {
        use uuid::Uuid;

        let entries = vec![
            LogEntry {
                position: 0,
                origin: Uuid::new_v4(),
                client_op_id: Uuid::new_v4(),
                span: ins(0, "abc"),
            },
            LogEntry {
                position: 1,
                origin: Uuid::new_v4(),
                client_op_id: Uuid::new_v4(),
                span: del(1, 2),
            },
        ];

        // Authored against the empty document: insert at 0.
        let op = ins(0, "Z");
        let rebased = rebase(&op, &entries);
        // Shifted past "abc" (3), then pulled back by the delete of one char.
        assert_eq!(rebased, ins(2, "Z"));
    }

    #[test]
    fn test_rebase_empty_log_is_identity() {
        let op = rep(1, 3, "Q");
        assert_eq!(rebase(&op, []), op);
    }

    // ── Cursor mapping ───────────────────────────────────────────────

    #[test]
    fn test_map_offset_before_span() {
        assert_eq!(map_offset(1, &del(3, 5)), 1);
    }

    #[test]
    fn test_map_offset_after_span() {
        assert_eq!(map_offset(7, &del(3, 5)), 5);
        assert_eq!(map_offset(7, &rep(3, 5, "WXYZ")), 9);
    }

    #[test]
    fn test_map_offset_inside_deleted_region() {
        assert_eq!(map_offset(4, &del(3, 5)), 3);
        assert_eq!(map_offset(4, &rep(3, 5, "AB")), 5);
    }

    #[test]
    fn test_map_offset_at_insert_point() {
        // Caret at the insert point ends up after the inserted text.
        assert_eq!(map_offset(3, &ins(3, "hi")), 5);
    }
}
