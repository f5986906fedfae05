use crate::keyspan::{coalesce_range_keys, defragment, find_containing, fragment};
use crate::*;
use anyhow::Result;

// -------------------- Helpers --------------------

fn rangedel(start: &str, end: &str, seq: u64) -> Span {
    Span::new(
        start.as_bytes().to_vec(),
        end.as_bytes().to_vec(),
        vec![SpanKey::new(
            make_trailer(seq, InternalKeyKind::RangeDelete),
            &b""[..],
            &b""[..],
        )],
    )
}

fn rk(kind: InternalKeyKind, seq: u64, suffix: &str, value: &str) -> SpanKey {
    SpanKey::new(make_trailer(seq, kind), suffix.as_bytes(), value.as_bytes())
}

fn bounds(spans: &[Span]) -> Vec<(String, String)> {
    spans
        .iter()
        .map(|s| {
            (
                String::from_utf8_lossy(&s.start).into_owned(),
                String::from_utf8_lossy(&s.end).into_owned(),
            )
        })
        .collect()
}

// -------------------- Fragmentation --------------------

#[test]
fn fragment_splits_overlapping_spans() {
    let cmp = &DEFAULT_COMPARER;
    let frags = fragment(cmp, vec![rangedel("a", "e", 5), rangedel("c", "g", 7)]);
    assert_eq!(
        bounds(&frags),
        vec![
            ("a".into(), "c".into()),
            ("c".into(), "e".into()),
            ("e".into(), "g".into())
        ]
    );
    let seqs: Vec<u64> = frags[1].keys.iter().map(SpanKey::seq).collect();
    assert_eq!(seqs, vec![7, 5]);
}

#[test]
fn fragment_skips_gaps_and_empty_spans() {
    let cmp = &DEFAULT_COMPARER;
    let frags = fragment(
        cmp,
        vec![
            rangedel("a", "b", 1),
            rangedel("x", "z", 2),
            rangedel("m", "m", 3),
        ],
    );
    assert_eq!(
        bounds(&frags),
        vec![("a".into(), "b".into()), ("x".into(), "z".into())]
    );
}

#[test]
fn deletes_respects_snapshot_and_seq() {
    let span = rangedel("a", "z", 10);
    assert!(span.deletes(5, 20));
    assert!(!span.deletes(10, 20));
    assert!(!span.deletes(5, 9));
}

#[test]
fn find_containing_uses_half_open_bounds() {
    let cmp = &DEFAULT_COMPARER;
    let spans = vec![rangedel("b", "d", 1), rangedel("f", "h", 1)];
    assert_eq!(find_containing(cmp, &spans, b"a"), None);
    assert_eq!(find_containing(cmp, &spans, b"b"), Some(0));
    assert_eq!(find_containing(cmp, &spans, b"d"), None);
    assert_eq!(find_containing(cmp, &spans, b"g"), Some(1));
}

// -------------------- Encoding --------------------

#[test]
fn span_value_round_trip() -> Result<()> {
    let span = Span::new(
        b"a".to_vec(),
        b"c".to_vec(),
        vec![
            rk(InternalKeyKind::RangeKeySet, 4, "@2", "foo"),
            rk(InternalKeyKind::RangeKeyUnset, 6, "@1", ""),
        ],
    );
    let decoded = Span::decode(&span.start, &span.encode_value())?;
    assert_eq!(decoded, span);
    assert_eq!(decoded.largest_seq(), 6);
    Ok(())
}

#[test]
fn span_decode_rejects_trailing_garbage() {
    let span = rangedel("a", "b", 1);
    let mut value = span.encode_value();
    value.push(0xff);
    let err = Span::decode(&span.start, &value).unwrap_err();
    assert!(matches!(classify(&err), Some(Error::Corruption(_))));
}

// -------------------- Range key coalescing --------------------

#[test]
fn coalesce_newest_per_suffix_wins_and_unset_hides() {
    let cmp = &VERSIONED_COMPARER;
    let keys = vec![
        rk(InternalKeyKind::RangeKeySet, 9, "@1", "new"),
        rk(InternalKeyKind::RangeKeyUnset, 8, "@2", ""),
        rk(InternalKeyKind::RangeKeySet, 7, "@2", "gone"),
        rk(InternalKeyKind::RangeKeySet, 6, "@1", "old"),
        rk(InternalKeyKind::RangeKeySet, 5, "@3", "kept"),
    ];
    let out = coalesce_range_keys(cmp, &keys);
    let pairs: Vec<(&[u8], &[u8])> = out
        .iter()
        .map(|k| (k.suffix.as_slice(), k.value.as_slice()))
        .collect();
    assert_eq!(pairs, vec![(&b"@3"[..], &b"kept"[..]), (&b"@1"[..], &b"new"[..])]);
}

#[test]
fn coalesce_stops_at_range_key_delete() {
    let cmp = &VERSIONED_COMPARER;
    let keys = vec![
        rk(InternalKeyKind::RangeKeySet, 9, "@4", "v"),
        rk(InternalKeyKind::RangeKeyDelete, 8, "", ""),
        rk(InternalKeyKind::RangeKeySet, 7, "@2", "hidden"),
    ];
    let out = coalesce_range_keys(cmp, &keys);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].suffix, b"@4");
}

// -------------------- Defragmentation --------------------

#[test]
fn defragment_merges_abutting_equal_spans() {
    let cmp = &DEFAULT_COMPARER;
    let k = rk(InternalKeyKind::RangeKeySet, 3, "@1", "v");
    let spans = vec![
        Span::new(b"a".to_vec(), b"b".to_vec(), vec![k.clone()]),
        Span::new(b"b".to_vec(), b"d".to_vec(), vec![k.clone()]),
        Span::new(b"e".to_vec(), b"f".to_vec(), vec![k]),
    ];
    let out = defragment(cmp, spans, |a, b| a.keys == b.keys);
    assert_eq!(
        bounds(&out),
        vec![("a".into(), "d".into()), ("e".into(), "f".into())]
    );
}
