//! Owned result tables.
//!
//! A `ResultTable` is a snapshot of a statement's result set that no longer
//! depends on the connection or the prepared statement that produced it. Each
//! row owns one contiguous buffer; every field of a row is either NULL (no
//! data) or a span of exact bytes inside that buffer. A present empty string
//! is a zero-length span, distinct from NULL.

use crate::config::Backend;
use crate::db::types::{FieldKind, classify};
use crate::error::{DbError, DbResult};

/// Metadata of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Type name as reported by the driver
    pub type_name: String,
    pub kind: FieldKind,
    /// Longest non-NULL cell seen in this column, in bytes
    pub max_length: usize,
}

impl Column {
    /// Create column metadata, classifying the driver type name.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, backend: Backend) -> Self {
        let type_name = type_name.into();
        Self {
            name: name.into(),
            kind: classify(&type_name, backend),
            type_name,
            max_length: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    offset: usize,
    len: usize,
}

#[derive(Debug)]
struct StoredRow {
    data: Box<[u8]>,
    cells: Box<[Option<Span>]>,
}

/// Incrementally builds a `ResultTable`, one cell at a time.
///
/// Cells are pushed in field order; `finish_row` seals the current row and
/// fails if it does not hold exactly one cell per column.
#[derive(Debug)]
pub struct ResultTableBuilder {
    columns: Vec<Column>,
    rows: Vec<StoredRow>,
    data: Vec<u8>,
    cells: Vec<Option<Span>>,
}

impl ResultTableBuilder {
    pub fn new(columns: Vec<Column>) -> Self {
        let field_count = columns.len();
        Self {
            columns,
            rows: Vec::new(),
            data: Vec::new(),
            cells: Vec::with_capacity(field_count),
        }
    }

    /// Number of columns each row must have.
    pub fn field_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows sealed so far.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn push_null(&mut self) {
        self.cells.push(None);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let field = self.cells.len();
        if let Some(column) = self.columns.get_mut(field) {
            column.max_length = column.max_length.max(bytes.len());
        }
        self.cells.push(Some(Span {
            offset: self.data.len(),
            len: bytes.len(),
        }));
        self.data.extend_from_slice(bytes);
    }

    pub fn push_str(&mut self, text: &str) {
        self.push_bytes(text.as_bytes());
    }

    /// Seal the current row.
    pub fn finish_row(&mut self) -> DbResult<()> {
        if self.cells.len() != self.columns.len() {
            let got = self.cells.len();
            self.cells.clear();
            self.data.clear();
            return Err(DbError::corruption(format!(
                "row {} has {} cells, table has {} fields",
                self.rows.len(),
                got,
                self.columns.len()
            )));
        }
        let data = std::mem::take(&mut self.data).into_boxed_slice();
        let cells = std::mem::replace(&mut self.cells, Vec::with_capacity(self.columns.len()))
            .into_boxed_slice();
        self.rows.push(StoredRow { data, cells });
        Ok(())
    }

    /// Finish the table. A partially pushed row is an error.
    pub fn finish(self) -> DbResult<ResultTable> {
        if !self.cells.is_empty() {
            return Err(DbError::corruption(format!(
                "unfinished row with {} cells",
                self.cells.len()
            )));
        }
        Ok(ResultTable {
            columns: self.columns,
            rows: self.rows,
            cursor: 0,
        })
    }
}

/// An owned, driver-independent result set with a read cursor.
#[derive(Debug)]
pub struct ResultTable {
    columns: Vec<Column>,
    rows: Vec<StoredRow>,
    cursor: usize,
}

impl ResultTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn field_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Index of the first column with the given name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Random access to row `index`.
    pub fn get_row(&self, index: usize) -> DbResult<Row<'_>> {
        self.rows
            .get(index)
            .map(|row| Row::new(&self.columns, row, index))
            .ok_or(DbError::RowIndex {
                index,
                row_count: self.rows.len(),
            })
    }

    /// Return the row under the cursor and advance, or `None` at the end.
    ///
    /// Reading never consumes rows; `set_cursor(0)` restarts the scan.
    pub fn fetch_next(&mut self) -> Option<Row<'_>> {
        let index = self.cursor;
        let row = self.rows.get(index)?;
        self.cursor += 1;
        Some(Row::new(&self.columns, row, index))
    }

    /// Reposition the cursor; `row_count()` puts it past the last row.
    pub fn set_cursor(&mut self, index: usize) -> DbResult<()> {
        if index > self.rows.len() {
            return Err(DbError::RowIndex {
                index,
                row_count: self.rows.len(),
            });
        }
        self.cursor = index;
        Ok(())
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Iterate over all rows without touching the cursor.
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> + '_ {
        self.rows
            .iter()
            .enumerate()
            .map(|(index, row)| Row::new(&self.columns, row, index))
    }
}

/// A view of one row of a `ResultTable`.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [Column],
    row: &'a StoredRow,
    index: usize,
}

macro_rules! fixed_accessors {
    ($($(#[$doc:meta])* $name:ident => $ty:ty),+ $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name(&self, field: usize) -> DbResult<Option<$ty>> {
                Ok(self
                    .fixed::<{ std::mem::size_of::<$ty>() }>(field, stringify!($ty))?
                    .map(<$ty>::from_le_bytes))
            }
        )+
    };
}

impl<'a> Row<'a> {
    fn new(columns: &'a [Column], row: &'a StoredRow, index: usize) -> Self {
        Self {
            columns,
            row,
            index,
        }
    }

    /// Position of this row in its table.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn field_count(&self) -> usize {
        self.row.cells.len()
    }

    pub fn column(&self, field: usize) -> DbResult<&'a Column> {
        self.columns.get(field).ok_or(DbError::FieldIndex {
            field,
            field_count: self.columns.len(),
        })
    }

    /// Raw cell bytes, `None` for NULL.
    pub fn raw(&self, field: usize) -> DbResult<Option<&'a [u8]>> {
        let cell = self.row.cells.get(field).ok_or(DbError::FieldIndex {
            field,
            field_count: self.row.cells.len(),
        })?;
        match cell {
            None => Ok(None),
            Some(span) => span
                .offset
                .checked_add(span.len)
                .and_then(|end| self.row.data.get(span.offset..end))
                .map(Some)
                .ok_or_else(|| {
                    DbError::corruption(format!(
                        "field {} of row {} points outside the row buffer",
                        field, self.index
                    ))
                }),
        }
    }

    pub fn is_null(&self, field: usize) -> DbResult<bool> {
        Ok(self.raw(field)?.is_none())
    }

    /// Cell length in bytes, `None` for NULL.
    pub fn cell_len(&self, field: usize) -> DbResult<Option<usize>> {
        Ok(self.raw(field)?.map(<[u8]>::len))
    }

    fn fixed<const N: usize>(
        &self,
        field: usize,
        expected: &'static str,
    ) -> DbResult<Option<[u8; N]>> {
        match self.raw(field)? {
            None => Ok(None),
            Some(bytes) => <[u8; N]>::try_from(bytes)
                .map(Some)
                .map_err(|_| DbError::FieldType {
                    field,
                    expected,
                    width: N,
                    actual: bytes.len(),
                }),
        }
    }

    pub fn get_bool(&self, field: usize) -> DbResult<Option<bool>> {
        Ok(self.fixed::<1>(field, "bool")?.map(|b| b[0] != 0))
    }

    fixed_accessors! {
        get_i8 => i8,
        get_u8 => u8,
        get_i16 => i16,
        get_u16 => u16,
        get_i32 => i32,
        get_u32 => u32,
        /// 64-bit signed integer; SQLite integers are always this width.
        get_i64 => i64,
        get_u64 => u64,
        get_f32 => f32,
        get_f64 => f64,
    }

    /// Text cell, checked to be UTF-8.
    pub fn get_str(&self, field: usize) -> DbResult<Option<&'a str>> {
        match self.raw(field)? {
            None => Ok(None),
            Some(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|e| DbError::decode(field, e.to_string())),
        }
    }

    pub fn get_blob(&self, field: usize) -> DbResult<Option<&'a [u8]>> {
        self.raw(field)
    }
}
