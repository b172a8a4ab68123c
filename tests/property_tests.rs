//! Property-based tests for statement synthesis and conversion using proptest

use proptest::prelude::*;
use rust_async_pg::core::statement::{scan_placeholders, shift_placeholders};
use rust_async_pg::prelude::*;

fn column_names(width: usize) -> Vec<String> {
    (0..width).map(|c| format!("col_{}", c)).collect()
}

fn row_of(names: &[String], seed: i64) -> RowData {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), DatabaseValue::from(seed + i as i64)))
        .collect()
}

// ============================================================================
// INSERT Synthesis
// ============================================================================

proptest! {
    /// Rows x columns placeholders, each referenced exactly once, in row-major order
    #[test]
    fn test_insert_numbering(rows in 1usize..8, width in 1usize..8) {
        let names = column_names(width);
        let data = (0..rows)
            .map(|r| row_of(&names, (r * 100) as i64))
            .collect::<Vec<_>>();

        let stmt = InsertSpec::new("t").build_many(&data).unwrap();
        let indexes = scan_placeholders(&stmt.sql)
            .into_iter()
            .map(|p| p.index)
            .collect::<Vec<_>>();

        prop_assert_eq!(indexes, (1..=rows * width).collect::<Vec<_>>());
        prop_assert_eq!(stmt.params.len(), rows * width);
        prop_assert!(stmt.check_placeholders().is_ok());

        // $(r*k+c+1) carries row r, column c
        for r in 0..rows {
            for c in 0..width {
                prop_assert_eq!(
                    &stmt.params[r * width + c],
                    &DatabaseValue::Long((r * 100 + c) as i64)
                );
            }
        }
    }

    /// Any row that disagrees with the first row's columns is rejected
    #[test]
    fn test_insert_rejects_column_mismatch(width in 2usize..6, bad_row in 1usize..4) {
        let names = column_names(width);
        let mut swapped = names.clone();
        swapped.swap(0, 1);

        let mut data = (0..4).map(|r| row_of(&names, r)).collect::<Vec<_>>();
        data[bad_row] = row_of(&swapped, 0);

        let err = InsertSpec::new("t").build_many(&data).unwrap_err();
        prop_assert!(matches!(err, DatabaseError::MalformedStatementSpec(_)), "unexpected error: {}", err);
    }
}

// ============================================================================
// UPDATE Synthesis
// ============================================================================

proptest! {
    /// WHERE placeholders are shifted past the SET placeholders
    #[test]
    fn test_update_where_shift(width in 1usize..8, filters in 1usize..6) {
        let names = column_names(width);
        let row = row_of(&names, 0);

        let mut filter = Statement::new(
            (1..=filters)
                .map(|i| format!("key_{} = ${}", i, i))
                .collect::<Vec<_>>()
                .join(" AND "),
        );
        for i in 1..=filters {
            filter = filter.bind(format!("k{}", i));
        }

        let stmt = UpdateSpec::new("t", filter).build(&row).unwrap();
        prop_assert!(stmt.check_placeholders().is_ok());
        prop_assert_eq!(stmt.params.len(), width + filters);

        let (set, filter_sql) = stmt.sql.split_once(" WHERE ").unwrap();
        let set_indexes = scan_placeholders(set).into_iter().map(|p| p.index).collect::<Vec<_>>();
        let where_indexes = scan_placeholders(filter_sql).into_iter().map(|p| p.index).collect::<Vec<_>>();
        prop_assert_eq!(set_indexes, (1..=width).collect::<Vec<_>>());
        prop_assert_eq!(where_indexes, (width + 1..=width + filters).collect::<Vec<_>>());

        // SET values come first, then the filter's own parameters
        prop_assert_eq!(&stmt.params[width], &DatabaseValue::from("k1"));
    }

    /// Literal text inside quotes is never renumbered
    #[test]
    fn test_shift_ignores_string_literals(
        text in "[a-z $0-9]{0,20}",
        offset in 1usize..50,
    ) {
        let sql = format!("name = '{}' AND id = $1", text);
        let shifted = shift_placeholders(&sql, offset);

        prop_assert_eq!(shifted, format!("name = '{}' AND id = ${}", text, offset + 1));
    }

    /// Backslash-escaped quotes do not end an escape string
    #[test]
    fn test_shift_ignores_escape_strings(
        text in "[a-z $0-9'\\\\]{0,20}",
        offset in 1usize..50,
    ) {
        let escaped = text.replace('\\', "\\\\").replace('\'', "\\'");
        let sql = format!("note = E'{}' AND id = $1", escaped);
        let shifted = shift_placeholders(&sql, offset);

        prop_assert_eq!(shifted, format!("note = E'{}' AND id = ${}", escaped, offset + 1));
    }

    /// Shifting moves every placeholder by the same amount
    #[test]
    fn test_shift_is_uniform(indexes in prop::collection::vec(1usize..40, 1..10), offset in 0usize..100) {
        let sql = indexes
            .iter()
            .map(|i| format!("c = ${}", i))
            .collect::<Vec<_>>()
            .join(" OR ");

        let shifted = scan_placeholders(&shift_placeholders(&sql, offset))
            .into_iter()
            .map(|p| p.index)
            .collect::<Vec<_>>();
        let expected = indexes.iter().map(|i| i + offset).collect::<Vec<_>>();
        prop_assert_eq!(shifted, expected);
    }
}

// ============================================================================
// Conversion Bridge
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Cents(i64);

fn cents_registry() -> ConverterRegistry {
    ConverterRegistry::new()
        .with_writer(
            |v| v.as_custom::<Cents>().is_some(),
            |v| {
                v.as_custom::<Cents>()
                    .map(|c| DatabaseValue::Long(c.0))
                    .ok_or_else(|| DatabaseError::type_mismatch("Cents", v.type_name()))
            },
        )
        .with_reader(WireType::Int8, |raw| {
            raw.as_long()
                .map(|c| DatabaseValue::custom(Cents(c)))
                .ok_or_else(|| DatabaseError::type_mismatch("bigint", raw.type_name()))
        })
}

proptest! {
    /// A registered writer and reader pair is the identity on domain values
    #[test]
    fn test_custom_value_round_trip(cents in any::<i64>()) {
        let registry = cents_registry();
        let value = DatabaseValue::custom(Cents(cents));

        let wire = registry.write(&value).unwrap();
        prop_assert_eq!(&wire, &DatabaseValue::Long(cents));

        let read = registry.read(WireType::Int8, wire).unwrap();
        prop_assert_eq!(read.as_custom::<Cents>(), Some(&Cents(cents)));
    }

    /// Values without a matching writer pass through untouched
    #[test]
    fn test_plain_values_pass_through(value in any::<i32>(), text in ".*") {
        let registry = cents_registry();
        let params = vec![DatabaseValue::from(value), DatabaseValue::from(text.clone())];

        prop_assert_eq!(registry.write_all(&params).unwrap(), params);
    }

    /// Columns without a reader come back as the raw driver value
    #[test]
    fn test_unregistered_reader_is_identity(value in any::<i32>()) {
        let registry = cents_registry();
        let read = registry.read(WireType::Int4, DatabaseValue::Int(value)).unwrap();
        prop_assert_eq!(read, DatabaseValue::Int(value));
    }
}

// ============================================================================
// Edge Cases
// ============================================================================

#[test]
fn test_null_skips_reader() {
    let registry = cents_registry();
    let read = registry.read(WireType::Int8, DatabaseValue::Null).unwrap();
    assert!(read.is_null());
}

#[test]
fn test_unknown_custom_value_is_rejected() {
    #[derive(Debug, PartialEq)]
    struct Unregistered;

    let err = cents_registry()
        .write(&DatabaseValue::custom(Unregistered))
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Conversion(_)));
}

#[test]
fn test_dollar_quoted_body_not_renumbered() {
    let sql = "body = $tag$ keep $1 $tag$ AND id = $1";
    assert_eq!(
        shift_placeholders(sql, 3),
        "body = $tag$ keep $1 $tag$ AND id = $4"
    );
}
