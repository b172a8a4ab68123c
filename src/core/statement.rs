//! Statements and INSERT/UPDATE synthesis
//!
//! Synthesized statements use PostgreSQL positional placeholders (`$1`, `$2`, ...).
//! Parameters are always sent separately from the SQL text; only table names,
//! column names and the `RETURNING` fragment are spliced in verbatim, so those must
//! come from trusted code, never from user input.

use super::error::{DatabaseError, Result};
use super::value::DatabaseValue;
use std::collections::{BTreeSet, HashSet};

/// SQL text plus its positional parameters
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<DatabaseValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append the value for the next placeholder
    #[must_use]
    pub fn bind(mut self, value: impl Into<DatabaseValue>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Distinct placeholder indexes referenced by the SQL text, ascending
    pub fn placeholders(&self) -> Vec<usize> {
        scan_placeholders(&self.sql)
            .into_iter()
            .map(|p| p.index)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Check that the text references exactly `$1..$n` for `n` parameters
    pub fn check_placeholders(&self) -> Result<()> {
        let found = scan_placeholders(&self.sql)
            .into_iter()
            .map(|p| p.index)
            .collect::<BTreeSet<_>>();
        let expected = (1..=self.params.len()).collect::<BTreeSet<_>>();
        if found == expected {
            Ok(())
        } else {
            Err(DatabaseError::malformed(format!(
                "statement references placeholders {:?} but binds {} parameter(s)",
                found,
                self.params.len()
            )))
        }
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

/// Ordered `(column, value)` pairs for one row
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowData {
    columns: Vec<(String, DatabaseValue)>,
}

impl RowData {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<DatabaseValue>) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<DatabaseValue>) {
        self.columns.push((column.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &DatabaseValue> {
        self.columns.iter().map(|(_, value)| value)
    }

    fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(DatabaseError::malformed("row data is empty"));
        }
        let mut seen = HashSet::with_capacity(self.columns.len());
        for (name, _) in &self.columns {
            if name.trim().is_empty() {
                return Err(DatabaseError::malformed("column name is empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(DatabaseError::malformed(format!(
                    "column {} appears more than once",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for RowData
where
    K: Into<String>,
    V: Into<DatabaseValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            columns: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<K, V> From<Vec<(K, V)>> for RowData
where
    K: Into<String>,
    V: Into<DatabaseValue>,
{
    fn from(pairs: Vec<(K, V)>) -> Self {
        pairs.into_iter().collect()
    }
}

/// Target table and optional `RETURNING` fragment of an INSERT
#[derive(Debug, Clone, PartialEq)]
pub struct InsertSpec {
    table: String,
    returning: Option<String>,
}

impl InsertSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            returning: None,
        }
    }

    #[must_use]
    pub fn returning(mut self, fragment: impl Into<String>) -> Self {
        self.returning = Some(fragment.into());
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Single-row INSERT
    pub fn build(&self, row: &RowData) -> Result<Statement> {
        self.build_many(std::slice::from_ref(row))
    }

    /// Multi-row INSERT
    ///
    /// The column list comes from the first row. Every other row must name the
    /// same columns in the same order. Placeholders are numbered across rows, so
    /// row `r` of `k` columns uses `$(r*k+1)..$(r*k+k)`.
    pub fn build_many(&self, rows: &[RowData]) -> Result<Statement> {
        check_table(&self.table)?;
        let first = rows
            .first()
            .ok_or_else(|| DatabaseError::malformed("no rows to insert"))?;
        first.validate()?;

        for (i, row) in rows.iter().enumerate().skip(1) {
            if !row.column_names().eq(first.column_names()) {
                return Err(DatabaseError::malformed(format!(
                    "row {} does not match the columns of row 1 in name and order",
                    i + 1
                )));
            }
        }

        let width = first.len();
        let columns = first.column_names().collect::<Vec<_>>().join(",");
        let groups = (0..rows.len())
            .map(|r| {
                let slots = (1..=width)
                    .map(|c| format!("${}", r * width + c))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("({})", slots)
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!("INSERT INTO {} ({}) VALUES {}", self.table, columns, groups);
        push_returning(&mut sql, self.returning.as_deref())?;

        Ok(Statement {
            sql,
            params: rows.iter().flat_map(|row| row.values().cloned()).collect(),
        })
    }
}

/// Target table, filter and optional `RETURNING` fragment of an UPDATE
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSpec {
    table: String,
    filter: Option<Statement>,
    returning: Option<String>,
}

impl UpdateSpec {
    /// UPDATE restricted by a WHERE fragment
    ///
    /// The fragment numbers its own placeholders from `$1`; they are shifted past
    /// the SET placeholders when the statement is built.
    pub fn new(table: impl Into<String>, filter: impl Into<Statement>) -> Self {
        Self {
            table: table.into(),
            filter: Some(filter.into()),
            returning: None,
        }
    }

    /// UPDATE without a WHERE clause, touching every row of the table
    pub fn all_rows(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            returning: None,
        }
    }

    #[must_use]
    pub fn returning(mut self, fragment: impl Into<String>) -> Self {
        self.returning = Some(fragment.into());
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Build `UPDATE t SET c1=$1, .. WHERE <filter> [RETURNING ..]`
    ///
    /// With `k` SET columns, the filter's `$i` becomes `$(k+i)` and its parameters
    /// follow the SET values.
    pub fn build(&self, row: &RowData) -> Result<Statement> {
        check_table(&self.table)?;
        row.validate()?;

        let width = row.len();
        let assignments = row
            .column_names()
            .enumerate()
            .map(|(i, name)| format!("{}=${}", name, i + 1))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!("UPDATE {} SET {}", self.table, assignments);
        let mut params = row.values().cloned().collect::<Vec<_>>();

        if let Some(filter) = &self.filter {
            if filter.sql.trim().is_empty() {
                return Err(DatabaseError::malformed(
                    "WHERE fragment is empty; use UpdateSpec::all_rows to update every row",
                ));
            }
            filter.check_placeholders()?;
            sql.push_str(" WHERE ");
            sql.push_str(&shift_placeholders(&filter.sql, width));
            params.extend(filter.params.iter().cloned());
        }

        push_returning(&mut sql, self.returning.as_deref())?;
        Ok(Statement { sql, params })
    }
}

fn check_table(table: &str) -> Result<()> {
    if table.trim().is_empty() {
        Err(DatabaseError::malformed("table name is missing"))
    } else {
        Ok(())
    }
}

fn push_returning(sql: &mut String, returning: Option<&str>) -> Result<()> {
    if let Some(fragment) = returning {
        if fragment.trim().is_empty() {
            return Err(DatabaseError::malformed("RETURNING fragment is empty"));
        }
        sql.push_str(" RETURNING ");
        sql.push_str(fragment);
    }
    Ok(())
}

/// A `$n` reference found in SQL text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder {
    /// Byte range of the whole `$n` token
    pub start: usize,
    pub end: usize,
    pub index: usize,
}

/// Find `$n` placeholders outside literals, quoted identifiers, dollar-quoted
/// bodies and comments
pub fn scan_placeholders(sql: &str) -> Vec<Placeholder> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                let escapes = quote == b'\'' && is_escape_prefix(bytes, i);
                i = skip_quoted(bytes, i + 1, quote, escapes);
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_block_comment(bytes, i + 2);
            }
            b'$' => {
                let after = bytes.get(i + 1).copied();
                match after {
                    Some(d) if d.is_ascii_digit() && !continues_identifier(bytes, i) => {
                        let digits_end = bytes[i + 1..]
                            .iter()
                            .position(|b| !b.is_ascii_digit())
                            .map_or(bytes.len(), |p| i + 1 + p);
                        if let Ok(index) = sql[i + 1..digits_end].parse::<usize>() {
                            found.push(Placeholder {
                                start: i,
                                end: digits_end,
                                index,
                            });
                        }
                        i = digits_end;
                    }
                    _ => match dollar_tag(bytes, i) {
                        Some(tag_end) => {
                            i = skip_dollar_body(bytes, &bytes[i..tag_end], tag_end);
                        }
                        None => i += 1,
                    },
                }
            }
            _ => i += 1,
        }
    }

    found
}

/// Add `offset` to every placeholder index in `sql`
pub fn shift_placeholders(sql: &str, offset: usize) -> String {
    if offset == 0 {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut last = 0;
    for p in scan_placeholders(sql) {
        out.push_str(&sql[last..p.start]);
        out.push('$');
        out.push_str(&(p.index + offset).to_string());
        last = p.end;
    }
    out.push_str(&sql[last..]);
    out
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

// `abc$1` is an identifier, not a placeholder
fn continues_identifier(bytes: &[u8], dollar: usize) -> bool {
    dollar > 0 && (is_ident_byte(bytes[dollar - 1]) || bytes[dollar - 1] == b'$')
}

// `E'..'` or `e'..'`, but not `name'..'`
fn is_escape_prefix(bytes: &[u8], quote: usize) -> bool {
    quote > 0
        && matches!(bytes[quote - 1], b'E' | b'e')
        && (quote < 2 || !(is_ident_byte(bytes[quote - 2]) || bytes[quote - 2] == b'$'))
}

fn skip_quoted(bytes: &[u8], mut i: usize, quote: u8, escapes: bool) -> usize {
    // A doubled quote re-enters the literal on the next pass
    while i < bytes.len() {
        if escapes && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_block_comment(bytes: &[u8], mut i: usize) -> usize {
    let mut depth = 1;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

/// End (exclusive) of a `$tag$` opener starting at `start`
fn dollar_tag(bytes: &[u8], start: usize) -> Option<usize> {
    if continues_identifier(bytes, start) {
        return None;
    }
    let mut i = start + 1;
    if let Some(&first) = bytes.get(i) {
        if first.is_ascii_digit() {
            return None;
        }
    }
    while let Some(&b) = bytes.get(i) {
        if b == b'$' {
            return Some(i + 1);
        }
        if !is_ident_byte(b) {
            return None;
        }
        i += 1;
    }
    None
}

fn skip_dollar_body(bytes: &[u8], tag: &[u8], from: usize) -> usize {
    bytes[from..]
        .windows(tag.len())
        .position(|w| w == tag)
        .map_or(bytes.len(), |p| from + p + tag.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_row_insert() {
        let row = RowData::new().with("name", "screwdriver").with("price", 15);
        let stmt = InsertSpec::new("products").build(&row).unwrap();

        assert_eq!(stmt.sql, "INSERT INTO products (name,price) VALUES ($1,$2)");
        assert_eq!(
            stmt.params,
            vec![DatabaseValue::from("screwdriver"), DatabaseValue::Int(15)]
        );
    }

    #[test]
    fn test_multi_row_insert_numbers_globally() {
        let rows = vec![
            RowData::from(vec![("name", "hammer")]).with("price", 20),
            RowData::from(vec![("name", "wrench")]).with("price", 12),
        ];
        let stmt = InsertSpec::new("products")
            .returning("id")
            .build_many(&rows)
            .unwrap();

        assert_eq!(
            stmt.sql,
            "INSERT INTO products (name,price) VALUES ($1,$2), ($3,$4) RETURNING id"
        );
        assert_eq!(stmt.params.len(), 4);
        assert_eq!(stmt.params[2], DatabaseValue::from("wrench"));
    }

    #[test]
    fn test_update_shifts_where_placeholders() {
        let stmt = UpdateSpec::new("users", Statement::new("id = $1").bind(1001))
            .build(&RowData::new().with("price", 6))
            .unwrap();

        assert_eq!(stmt.sql, "UPDATE users SET price=$1 WHERE id = $2");
        assert_eq!(
            stmt.params,
            vec![DatabaseValue::Int(6), DatabaseValue::Int(1001)]
        );
    }

    #[test]
    fn test_update_with_several_columns_and_returning() {
        let filter = Statement::new("id = $1 OR parent = $2 OR id = $1")
            .bind(1)
            .bind(2);
        let row = RowData::new().with("a", 1).with("b", 2).with("c", 3);
        let stmt = UpdateSpec::new("t", filter)
            .returning("*")
            .build(&row)
            .unwrap();

        assert_eq!(
            stmt.sql,
            "UPDATE t SET a=$1, b=$2, c=$3 WHERE id = $4 OR parent = $5 OR id = $4 RETURNING *"
        );
        assert_eq!(stmt.params.len(), 5);
    }

    #[test]
    fn test_update_all_rows_is_explicit() {
        let stmt = UpdateSpec::all_rows("flags")
            .build(&RowData::new().with("enabled", false))
            .unwrap();
        assert_eq!(stmt.sql, "UPDATE flags SET enabled=$1");

        let err = UpdateSpec::new("flags", "  ")
            .build(&RowData::new().with("enabled", false))
            .unwrap_err();
        assert!(matches!(err, DatabaseError::MalformedStatementSpec(_)));
    }

    #[test]
    fn test_malformed_specs_are_rejected() {
        let row = RowData::new().with("a", 1);

        let cases = vec![
            InsertSpec::new("").build(&row),
            InsertSpec::new("t").build(&RowData::new()),
            InsertSpec::new("t").build_many(&[]),
            InsertSpec::new("t").build(&RowData::new().with("a", 1).with("a", 2)),
            InsertSpec::new("t").build_many(&[row.clone(), RowData::new().with("b", 1)]),
            InsertSpec::new("t").build_many(&[
                RowData::new().with("a", 1).with("b", 2),
                RowData::new().with("b", 2).with("a", 1),
            ]),
            InsertSpec::new("t").returning("").build(&row),
            UpdateSpec::new("t", Statement::new("id = $2").bind(1)).build(&row),
            UpdateSpec::new("t", Statement::new("id = $1")).build(&row),
            UpdateSpec::all_rows(" ").build(&row),
        ];

        for (i, case) in cases.into_iter().enumerate() {
            assert!(
                matches!(case, Err(DatabaseError::MalformedStatementSpec(_))),
                "case {} was accepted",
                i
            );
        }
    }

    #[test]
    fn test_scanner_ignores_quoted_and_commented_text() {
        let sql = "a = $1 AND b = '$2' AND \"c$3\" = $2 -- $9\n AND d = $$ $7 $$ /* $8 /* $6 */ */";
        let indexes = scan_placeholders(sql)
            .into_iter()
            .map(|p| p.index)
            .collect::<Vec<_>>();
        assert_eq!(indexes, vec![1, 2]);

        assert_eq!(
            shift_placeholders("x = $1 AND y = 'it''s $1' AND z = $body$ $1 $body$", 3),
            "x = $4 AND y = 'it''s $1' AND z = $body$ $1 $body$"
        );
    }

    #[test]
    fn test_scanner_handles_multi_digit_and_identifiers() {
        let stmt = Statement::new("col$1 = $10 AND x = $2");
        assert_eq!(stmt.placeholders(), vec![2, 10]);
        assert_eq!(shift_placeholders("$10,$2", 5), "$15,$7");
    }

    #[test]
    fn test_escape_string_keeps_backslash_quote_inside() {
        let stmt = UpdateSpec::new(
            "users",
            Statement::new(r"note = E'it\'s $1' AND id = $1").bind(1001),
        )
        .build(&RowData::new().with("price", 6))
        .unwrap();

        assert_eq!(
            stmt.sql,
            r"UPDATE users SET price=$1 WHERE note = E'it\'s $1' AND id = $2"
        );
        assert_eq!(
            stmt.params,
            vec![DatabaseValue::Int(6), DatabaseValue::Int(1001)]
        );

        let filter = Statement::new(r"note = e'it\'s' AND id = $1").bind(1);
        assert!(filter.check_placeholders().is_ok());
    }

    #[test]
    fn test_backslash_is_literal_outside_escape_strings() {
        // Standard strings end at the first quote; `name'..'` is no escape prefix
        assert_eq!(
            shift_placeholders(r"a = 'x\' AND b = $1 AND typename'\' = $2", 1),
            r"a = 'x\' AND b = $2 AND typename'\' = $3"
        );
    }
}
