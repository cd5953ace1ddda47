//! Raw rows as returned by the store.

/// One versioned value of a `family:qualifier` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
    pub timestamp: i64,
    pub value: Vec<u8>,
}

impl Cell {
    pub fn new(
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        timestamp: i64,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp,
            value: value.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.family.len() + self.qualifier.len() + self.value.len() + 8
    }
}

/// A row key with its cells, ordered by family, qualifier, then newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub row_key: Vec<u8>,
    pub cells: Vec<Cell>,
}

impl RawRow {
    pub fn new(row_key: impl Into<Vec<u8>>, mut cells: Vec<Cell>) -> Self {
        sort_cells(&mut cells);
        Self {
            row_key: row_key.into(),
            cells,
        }
    }

    /// Newest cell of a column, if present.
    pub fn latest(&self, family: &[u8], qualifier: &[u8]) -> Option<&Cell> {
        self.cells
            .iter()
            .filter(|cell| cell.family == family && cell.qualifier == qualifier)
            .max_by_key(|cell| cell.timestamp)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        self.row_key.len() + self.cells.iter().map(Cell::encoded_len).sum::<usize>()
    }
}

fn sort_cells(cells: &mut [Cell]) {
    cells.sort_by(|left, right| {
        left.family
            .cmp(&right.family)
            .then_with(|| left.qualifier.cmp(&right.qualifier))
            .then_with(|| right.timestamp.cmp(&left.timestamp))
    });
}
