use std::collections::BTreeMap;

use htpages::{align_tables, AlignError, AlignOptions, CollisionPolicy, PageTable, Side};

fn table(cols: &[&str], rows: &[&[&str]]) -> PageTable {
    let mut t = PageTable::new(cols.iter().copied());
    for r in rows {
        t.push_row(r.iter().map(|v| if v.is_empty() { None } else { Some(v.to_string()) }).collect());
    }
    t
}

fn keyed(column: &str, keys: &[&str]) -> PageTable {
    let mut t = PageTable::new(["page", column]);
    for k in keys {
        t.push_row(vec![Some(k.to_string()), Some("x".to_string())]);
    }
    t
}

fn pages(t: &PageTable) -> Vec<&str> {
    t.column_values("page").into_iter().map(|v| v.unwrap_or("")).collect()
}

fn row_set(t: &PageTable) -> Vec<BTreeMap<String, Option<String>>> {
    let mut rows: Vec<BTreeMap<String, Option<String>>> = t
        .rows
        .iter()
        .map(|r| t.columns.iter().cloned().zip(r.iter().cloned()).collect())
        .collect();
    rows.sort();
    rows
}

#[test]
fn outer_join_clears_sentinels_and_sorts() {
    let primary = table(&["page", "text"], &[&["1", "a"], &["2", "b"]]);
    let secondary = table(&["page", "words"], &[&["2", "5"], &["3", "No body data"]]);
    let out = align_tables(&primary, &secondary, &AlignOptions::default()).unwrap();

    assert_eq!(out.table.columns, vec!["page", "text", "words"]);
    assert_eq!(pages(&out.table), vec!["1", "2", "3"]);
    assert_eq!(out.table.column_values("words"), vec![None, Some("5"), None]);
    assert_eq!(out.table.column_values("text"), vec![Some("a"), Some("b"), None]);
    assert_eq!(out.sentinels_cleared, 1);
    assert!(out.sorted_numerically);
    assert!(out.renamed.is_empty());
}

#[test]
fn legacy_sentinel_is_cleared_but_primary_values_are_kept() {
    let primary = table(&["page", "text"], &[&["1", "No body data"]]);
    let secondary = table(&["page", "words"], &[&["1", "No page data"]]);
    let out = align_tables(&primary, &secondary, &AlignOptions::default()).unwrap();
    assert_eq!(out.table.value(0, "text"), Some("No body data"));
    assert_eq!(out.table.value(0, "words"), None);
}

#[test]
fn row_count_stays_within_bounds() {
    let cases: Vec<(Vec<&str>, Vec<&str>)> = vec![
        (vec!["1", "2", "3"], vec!["2", "3"]),
        (vec!["1", "2"], vec!["3", "4", "5"]),
        (vec!["1"], vec!["1"]),
        (vec![], vec!["7"]),
    ];
    for (a, b) in cases {
        let primary = keyed("text", &a);
        let secondary = keyed("words", &b);
        let n = align_tables(&primary, &secondary, &AlignOptions::default()).unwrap().table.len();
        assert!(n >= a.len().max(b.len()));
        assert!(n <= a.len() + b.len());
        let disjoint = a.iter().all(|k| !b.contains(k));
        assert_eq!(n == a.len() + b.len(), disjoint);
    }
}

#[test]
fn zero_padded_feature_seqs_match_plain_pages() {
    let primary = table(&["page", "text"], &[&["1", "a"], &["2", "b"]]);
    let secondary = table(&["page", "words_pos"], &[&["00000001", "{}"], &["00000002", "{}"], &["00000003", "{}"]]);
    let out = align_tables(&primary, &secondary, &AlignOptions::default()).unwrap();
    // keys match numerically but keep their own text
    assert_eq!(pages(&out.table), vec!["1", "2", "00000003"]);
    assert!(out.sorted_numerically);
    assert_eq!(out.table.value(0, "words_pos"), Some("{}"));
}

#[test]
fn joined_content_does_not_depend_on_argument_order() {
    let a = table(&["page", "text"], &[&["1", "a"], &["2", "b"], &["4", "d"]]);
    let b = table(&["page", "words"], &[&["2", "5"], &["3", "6"]]);
    let ab = align_tables(&a, &b, &AlignOptions::default()).unwrap();
    let ba = align_tables(&b, &a, &AlignOptions::default()).unwrap();
    assert_eq!(ab.table.columns, vec!["page", "text", "words"]);
    assert_eq!(ba.table.columns, vec!["page", "words", "text"]);
    assert_eq!(row_set(&ab.table), row_set(&ba.table));
    assert_eq!(pages(&ab.table), pages(&ba.table));
}

#[test]
fn collision_renaming_depends_on_argument_order() {
    let a = table(&["page", "text", "words"], &[&["1", "a", "3"]]);
    let b = table(&["page", "words", "extra"], &[&["1", "4", "x"]]);

    let ab = align_tables(&a, &b, &AlignOptions::default()).unwrap();
    assert_eq!(ab.table.columns, vec!["page", "file1_text", "words", "file2_words", "extra"]);

    let ba = align_tables(&b, &a, &AlignOptions::default()).unwrap();
    assert_eq!(ba.table.columns, vec!["page", "file1_words", "extra", "file2_text", "words"]);

    assert_ne!(ab.renamed, ba.renamed);
    assert_eq!(ab.renamed[0].side, Side::Primary);
    assert_eq!(ab.renamed[0].from, "text");
    assert_eq!(ab.table.value(0, "words"), Some("3"));
    assert_eq!(ab.table.value(0, "file2_words"), Some("4"));
}

#[test]
fn first_column_policy_leaves_later_collisions_suffixed() {
    let a = table(&["page", "text", "clean_text"], &[&["1", "t", "c1"]]);
    let b = table(&["page", "words", "clean_text"], &[&["1", "9", "c2"]]);
    let out = align_tables(&a, &b, &AlignOptions::default()).unwrap();
    assert_eq!(
        out.table.columns,
        vec!["page", "file1_text", "clean_text_x", "file2_words", "clean_text_y"]
    );
    assert_eq!(out.residual_collisions, vec!["clean_text"]);
    assert_eq!(out.table.value(0, "clean_text_x"), Some("c1"));
    assert_eq!(out.table.value(0, "clean_text_y"), Some("c2"));
}

#[test]
fn all_colliding_policy_renames_only_shared_columns() {
    let a = table(&["page", "text", "clean_text"], &[&["1", "t", "c1"]]);
    let b = table(&["page", "words", "clean_text"], &[&["1", "9", "c2"]]);
    let opts = AlignOptions { collision: CollisionPolicy::AllColliding, ..AlignOptions::default() };
    let out = align_tables(&a, &b, &opts).unwrap();
    assert_eq!(
        out.table.columns,
        vec!["page", "text", "file1_clean_text", "words", "file2_clean_text"]
    );
    assert_eq!(out.renamed.len(), 2);
    assert!(out.residual_collisions.is_empty());
}

#[test]
fn non_numeric_key_keeps_join_order() {
    let primary = table(&["page", "text"], &[&["3", "c"], &["ii", "preface"], &["1", "a"]]);
    let secondary = table(&["page", "words"], &[&["1", "10"], &["4", "40"]]);
    let out = align_tables(&primary, &secondary, &AlignOptions::default()).unwrap();
    assert!(!out.sorted_numerically);
    assert_eq!(pages(&out.table), vec!["3", "ii", "1", "4"]);
    assert_eq!(out.table.value(2, "words"), Some("10"));
}

#[test]
fn page_text_is_kept_when_sort_falls_back() {
    let primary = table(&["page", "text"], &[&["ii", "a"], &["007", "b"], &["12345678901234567", "c"]]);
    let secondary = table(&["page", "words"], &[&["7", "70"]]);
    let out = align_tables(&primary, &secondary, &AlignOptions::default()).unwrap();
    assert!(!out.sorted_numerically);
    assert_eq!(pages(&out.table), vec!["ii", "007", "12345678901234567"]);
    assert_eq!(out.table.value(1, "words"), Some("70"));
}

#[test]
fn long_integer_keys_match_and_sort_exactly() {
    let primary = table(&["page", "text"], &[&["12345678901234567", "b"], &["12345678901234566", "a"]]);
    let secondary = table(&["page", "words"], &[&["012345678901234567", "9"]]);
    let out = align_tables(&primary, &secondary, &AlignOptions::default()).unwrap();
    assert!(out.sorted_numerically);
    assert_eq!(out.table.len(), 2);
    assert_eq!(pages(&out.table), vec!["12345678901234566", "12345678901234567"]);
    assert_eq!(out.table.column_values("words"), vec![None, Some("9")]);
}

#[test]
fn numeric_sort_is_stable_for_duplicate_pages() {
    let primary = table(&["page", "text"], &[&["2", "a"], &["1", "b"], &["2", "c"]]);
    let secondary = table(&["page", "words"], &[]);
    let out = align_tables(&primary, &secondary, &AlignOptions::default()).unwrap();
    assert_eq!(pages(&out.table), vec!["1", "2", "2"]);
    assert_eq!(out.table.column_values("text"), vec![Some("b"), Some("a"), Some("c")]);
    assert_eq!(out.duplicate_keys, vec!["2"]);
}

#[test]
fn duplicate_secondary_keys_match_every_row() {
    let primary = table(&["page", "text"], &[&["1", "a"]]);
    let secondary = table(&["page", "words"], &[&["1", "x"], &["1", "y"]]);
    let out = align_tables(&primary, &secondary, &AlignOptions::default()).unwrap();
    assert_eq!(out.table.len(), 2);
    assert_eq!(out.table.column_values("words"), vec![Some("x"), Some("y")]);
}

#[test]
fn key_column_moves_to_front() {
    let primary = table(&["text", "page", "clean_text"], &[&["a", "1", "A"]]);
    let secondary = table(&["words", "page"], &[&["5", "1"]]);
    let out = align_tables(&primary, &secondary, &AlignOptions::default()).unwrap();
    assert_eq!(out.table.columns, vec!["page", "text", "clean_text", "words"]);
    assert_eq!(out.table.rows[0], vec![Some("1".to_string()), Some("a".to_string()), Some("A".to_string()), Some("5".to_string())]);
}

#[test]
fn missing_key_column_is_reported_per_side() {
    let good = table(&["page", "text"], &[&["1", "a"]]);
    let bad = table(&["seq", "words"], &[&["1", "5"]]);
    assert_eq!(
        align_tables(&bad, &good, &AlignOptions::default()).unwrap_err(),
        AlignError::MissingKeyColumn { table: "primary".into(), column: "page".into() }
    );
    assert_eq!(
        align_tables(&good, &bad, &AlignOptions::default()).unwrap_err(),
        AlignError::MissingKeyColumn { table: "secondary".into(), column: "page".into() }
    );
}
